//! Socket path discovery.
//!
//! The daemon advertises its socket through the `WATCHMAN_SOCK` environment
//! variable when a parent process has already resolved it; otherwise we ask
//! the CLI itself via `watchman --no-pretty get-sockname`, which starts the
//! daemon on demand and prints the path as JSON on stdout.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use thiserror::Error;

use crate::config::ClientConfig;

pub const SOCK_ENV_VAR: &str = "WATCHMAN_SOCK";

const INSTALL_DOCS_URL: &str = "https://facebook.github.io/watchman/docs/install.html";

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DiscoveryError {
    /// Contractual message: tooling matches on this text.
    #[error(
        "Watchman was not found in PATH. See {INSTALL_DOCS_URL} for installation instructions"
    )]
    BinaryNotFound,

    /// Contractual message: tooling matches on this text.
    #[error("The Watchman CLI is installed but cannot be spawned because of a permission problem")]
    BinaryNotExecutable,

    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: io::Error,
    },

    #[error(
        "watchman {argv:?} exited with code {code:?} signal {signal:?}: {stderr}"
    )]
    CliFailed {
        argv: Vec<String>,
        code: Option<i32>,
        signal: Option<i32>,
        stderr: String,
    },

    #[error("unable to parse get-sockname response: {source}")]
    Parse {
        #[from]
        source: serde_json::Error,
    },

    #[error("{message}")]
    Service {
        message: String,
        response: serde_json::Value,
    },

    #[error("get-sockname response has no sockname field")]
    MissingSockname { response: serde_json::Value },
}

/// Resolve the daemon socket path, spawning the CLI when the environment
/// does not pre-advertise one.
pub fn resolve_socket_path(config: &ClientConfig) -> Result<PathBuf, DiscoveryError> {
    if let Some(path) = std::env::var_os(SOCK_ENV_VAR) {
        return Ok(PathBuf::from(path));
    }
    query_cli_sockname(config)
}

fn query_cli_sockname(config: &ClientConfig) -> Result<PathBuf, DiscoveryError> {
    let binary = config.binary_path();
    let args = ["--no-pretty", "get-sockname"];
    tracing::debug!(binary = %binary, "resolving socket path via cli");

    let output = Command::new(&binary)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => DiscoveryError::BinaryNotFound,
            io::ErrorKind::PermissionDenied => DiscoveryError::BinaryNotExecutable,
            _ => DiscoveryError::Spawn { binary: binary.clone(), source },
        })?;

    if !output.status.success() {
        let mut argv = vec![binary];
        argv.extend(args.iter().map(|arg| arg.to_string()));
        return Err(DiscoveryError::CliFailed {
            argv,
            code: output.status.code(),
            signal: output.status.signal(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    let response: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    if let Some(message) = response.get("error").and_then(|v| v.as_str()) {
        return Err(DiscoveryError::Service {
            message: message.to_string(),
            response,
        });
    }
    match response.get("sockname").and_then(|v| v.as_str()) {
        Some(sockname) => Ok(PathBuf::from(sockname)),
        None => Err(DiscoveryError::MissingSockname { response }),
    }
}
