pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod downstream;
pub mod error;
pub mod handlers;
pub mod health;
pub mod identity;
pub mod metrics;
pub mod middleware;
pub mod quota;
pub mod rate_limiter;
pub mod redis;
pub mod server;

pub use config::Config;
pub use error::{GatewayError, Result};
pub use server::{create_app, AppState, Server};
