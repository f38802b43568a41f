//! HTTP/2 session tuning

/// Knobs passed to the `h2` client handshake.
#[derive(Debug, Clone)]
pub struct H2SessionConfig {
    /// Per-stream flow-control window, bytes.
    pub initial_window_size: u32,
    /// Connection-wide flow-control window, bytes.
    pub initial_connection_window_size: u32,
    /// Largest frame we accept, bytes.
    pub max_frame_size: u32,
}

impl Default for H2SessionConfig {
    fn default() -> Self {
        Self {
            initial_window_size: 1024 * 1024,
            initial_connection_window_size: 4 * 1024 * 1024,
            max_frame_size: 16 * 1024,
        }
    }
}
