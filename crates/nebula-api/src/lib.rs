//! NebulaDB Data API Library
//!
//! Schema-driven REST access to tenant databases: a per-database connection
//! pool, a generic CRUD dispatcher, identity-keyed rate limiting, and
//! asynchronous usage recording.

pub mod api_keys;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod health;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod rate_limiting;
pub mod request_id;
pub mod routes;
pub mod state;
pub mod usage;

pub use config::ApiConfig;
pub use error::ApiError;
pub use routes::router;
pub use state::AppState;
