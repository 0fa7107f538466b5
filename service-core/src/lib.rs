//! service-core: Shared infrastructure for the authorization workspace.
pub mod clock;
pub mod config;
pub mod error;
pub mod observability;
pub mod store;

pub use async_trait;
pub use chrono;
pub use serde;
pub use serde_json;
pub use tokio;
pub use tracing;
