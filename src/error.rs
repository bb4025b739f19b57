//! High-level network errors.

use std::error::Error;

use crate::exchange::PeerId;

/// Represents all possible network-related errors.
#[derive(Debug)]
pub enum NetError {
    /// Error originating from standard I/O operations.
    ///
    /// This variant wraps a [`std::io::Error`] to provide details about I/O failures.
    IO(std::io::Error),

    /// Error related to CBOR (Concise Binary Object Representation) serialization or deserialization.
    ///
    /// This variant wraps a [`serde_cbor::Error`] to provide details about the issue.
    Cbor(serde_cbor::Error),

    /// The transport doesn't know how to reach this peer.
    UnknownPeer(PeerId),

    /// The transport has been shut down.
    Disconnected,
}

impl std::fmt::Display for NetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Error for NetError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::IO(e) => Some(e),
            Self::Cbor(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for NetError {
    fn from(value: std::io::Error) -> Self {
        Self::IO(value)
    }
}

impl From<serde_cbor::Error> for NetError {
    fn from(value: serde_cbor::Error) -> Self {
        Self::Cbor(value)
    }
}
