//! Shared types, identifiers, and configuration resolution for Memory Crystal.

#![deny(unsafe_code)]

pub mod config;
pub mod ids;
pub mod relay;
pub mod types;

pub use config::{Config, ConfigError, EmbeddingProvider};
pub use ids::{new_uuid, next_monotonic_id, now_iso8601, now_utc};
pub use types::*;
