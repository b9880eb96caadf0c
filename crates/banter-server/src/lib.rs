//! Axum HTTP + WebSocket front for the banter hub.

pub mod config;
pub mod health;
pub mod server;
pub mod websocket;

pub use config::ServerConfig;
pub use server::{build_router, start, AppState, ServerHandle};
