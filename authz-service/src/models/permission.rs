//! Permission catalog names and resolved permission sets.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Member of a [`PermissionSet`] that matches every check.
pub const WILDCARD_PERMISSION: &str = "*";

/// A validated permission name of the form `resource:action`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PermissionName(String);

impl PermissionName {
    /// Parse and validate a `resource:action` name.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        let (resource, action) = raw
            .split_once(':')
            .ok_or_else(|| format!("Permission '{}' must have the form resource:action", raw))?;

        let valid_part = |part: &str| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        };
        if !valid_part(resource) || !valid_part(action) {
            return Err(format!("Permission '{}' has an invalid resource or action", raw));
        }

        Ok(Self(raw.to_string()))
    }

    pub fn resource(&self) -> &str {
        self.0.split_once(':').map(|(r, _)| r).unwrap_or_default()
    }

    pub fn action(&self) -> &str {
        self.0.split_once(':').map(|(_, a)| a).unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PermissionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PermissionName {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PermissionName> for String {
    fn from(name: PermissionName) -> Self {
        name.0
    }
}

/// Immutable union of the permissions granted to a principal.
///
/// Built once per resolution and never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(BTreeSet<String>);

impl PermissionSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The superadmin set: matches every permission.
    pub fn wildcard() -> Self {
        Self(BTreeSet::from([WILDCARD_PERMISSION.to_string()]))
    }

    pub fn is_wildcard(&self) -> bool {
        self.0.contains(WILDCARD_PERMISSION)
    }

    pub fn contains(&self, permission: &str) -> bool {
        self.is_wildcard() || self.0.contains(permission)
    }

    pub fn contains_any<'a>(&self, permissions: impl IntoIterator<Item = &'a str>) -> bool {
        permissions.into_iter().any(|p| self.contains(p))
    }

    pub fn contains_all<'a>(&self, permissions: impl IntoIterator<Item = &'a str>) -> bool {
        permissions.into_iter().all(|p| self.contains(p))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl FromIterator<String> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> FromIterator<&'a str> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        Self(iter.into_iter().map(str::to_string).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_permission_name() {
        let name = PermissionName::parse("posts:create").unwrap();
        assert_eq!(name.resource(), "posts");
        assert_eq!(name.action(), "create");
        assert_eq!(name.to_string(), "posts:create");
    }

    #[test]
    fn parse_rejects_malformed_names() {
        assert!(PermissionName::parse("posts").is_err());
        assert!(PermissionName::parse(":create").is_err());
        assert!(PermissionName::parse("posts:").is_err());
        assert!(PermissionName::parse("posts:cre ate").is_err());
    }

    #[test]
    fn wildcard_matches_everything() {
        let set = PermissionSet::wildcard();
        assert!(set.contains("posts:delete"));
        assert!(set.contains_all(["a:b", "c:d"]));
    }

    #[test]
    fn membership_helpers() {
        let set: PermissionSet = ["posts:create", "posts:read"].into_iter().collect();
        assert!(set.contains("posts:read"));
        assert!(!set.contains("posts:delete"));
        assert!(set.contains_any(["posts:delete", "posts:read"]));
        assert!(!set.contains_all(["posts:delete", "posts:read"]));
        assert!(!set.contains_any(std::iter::empty()));
    }

    #[test]
    fn set_serializes_as_plain_array() {
        let set: PermissionSet = ["b:x", "a:y"].into_iter().collect();
        assert_eq!(serde_json::to_string(&set).unwrap(), r#"["a:y","b:x"]"#);
    }
}
