#![forbid(unsafe_code)]

//! Client library for the watchman file-watching service.
//!
//! Speaks watchman's native BSER framing over a Unix-domain socket: the
//! [`bser`] module holds the codec, [`client`] the framed command client
//! with unilateral event demultiplexing and CLI-based socket discovery.

pub mod bser;
pub mod client;
pub mod config;
pub mod error;
pub mod telemetry;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the working set at the crate root for convenience.
pub use crate::bser::{Int64, Object, StreamDecoder, Value, encode, from_slice};
pub use crate::client::{
    CapabilityCheckResult, CapabilityQuery, Client, ClientError, ClientPhase, DiscoveryError,
};
pub use crate::config::ClientConfig;
