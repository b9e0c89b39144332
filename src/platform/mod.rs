//! Client for the crowdsourcing platform's REST API.

pub mod api;
pub mod types;

pub use api::{ApiError, PlatformClient, RetryConfig};
