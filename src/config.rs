//! Client configuration.

use serde::Deserialize;

pub const DEFAULT_WATCHMAN_BINARY: &str = "watchman";

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Path to the watchman CLI used for socket discovery. Surrounding
    /// whitespace is ignored; `None` or blank resolves via `PATH`.
    #[serde(default)]
    pub watchman_binary_path: Option<String>,

    /// Socket read size per syscall in the inbound loop.
    #[serde(default = "default_read_chunk_bytes")]
    pub read_chunk_bytes: usize,

    /// Log a warning when this many commands are waiting. 0 disables.
    #[serde(default = "default_queue_warn_depth")]
    pub queue_warn_depth: usize,
}

fn default_read_chunk_bytes() -> usize {
    1024
}

fn default_queue_warn_depth() -> usize {
    128
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            watchman_binary_path: None,
            read_chunk_bytes: default_read_chunk_bytes(),
            queue_warn_depth: default_queue_warn_depth(),
        }
    }
}

impl ClientConfig {
    /// The binary to spawn for discovery, trimmed of surrounding whitespace.
    pub fn binary_path(&self) -> String {
        self.watchman_binary_path
            .as_deref()
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .unwrap_or(DEFAULT_WATCHMAN_BINARY)
            .to_string()
    }
}
