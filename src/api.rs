//! HTTP surface: telephony webhooks and the dashboard JSON API.

mod auth;
mod communications;
mod server;
mod state;
mod strategic;
mod webhooks;

pub use server::{build_router, start_http_server};
pub use state::{ApiError, ApiState};
