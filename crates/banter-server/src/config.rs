//! Server configuration.

use serde::{Deserialize, Serialize};

/// Configuration for the banter server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (`0` = auto-assign).
    pub port: u16,
    /// Capacity of each session's outbound queue. A session whose queue
    /// fills up is disconnected on the next broadcast.
    pub send_queue_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            send_queue_size: 256,
        }
    }
}
