//! Live sync broker
//!
//! Pushes catalog changes from the portal's REST layer to connected
//! dashboards over WebSocket.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod websocket;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
