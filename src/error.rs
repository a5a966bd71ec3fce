use thiserror::Error;

use crate::bser::{DecodeError, EncodeError};
use crate::client::{ClientError, DiscoveryError};

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// What we know about side effects when an error is returned.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Effect {
    /// Definitely no side effects occurred.
    None,
    /// Side effects definitely occurred.
    Some,
    /// We don't know if side effects occurred.
    Unknown,
}

/// Crate-level convenience error.
///
/// A thin wrapper over the subsystem errors; match on the inner types for
/// structured handling.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Decode(_) | Error::Encode(_) => Transience::Permanent,
            Error::Client(e) => e.transience(),
            Error::Discovery(_) => Transience::Retryable,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            Error::Decode(_) => Effect::Unknown,
            Error::Encode(_) | Error::Discovery(_) => Effect::None,
            Error::Client(e) => e.effect(),
        }
    }
}
