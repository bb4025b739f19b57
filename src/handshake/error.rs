//! All handshake related errors.
//!
//! These only cover the handshake's own resources. A handshake that fails on the
//! protocol level reports a [super::api::FailureCause] to its listener instead.

use std::sync::{MutexGuard, PoisonError};

use crate::exchange::ExchangeId;

/// Errors of the recovery checkpoint storage.
#[derive(Debug)]
pub enum RecoveryError {
    IO(std::io::Error),
    Cbor(serde_cbor::Error),
    /// A checkpoint is written once and never replaced.
    AlreadyPersisted(ExchangeId),
    /// The exchange id can't be used as a storage key.
    InvalidExchangeId(String),
    MutexPossion,
}

impl std::fmt::Display for RecoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IO(e) => write!(f, "recovery io error: {}", e),
            Self::Cbor(e) => write!(f, "recovery encoding error: {}", e),
            Self::AlreadyPersisted(id) => write!(f, "checkpoint of {} already persisted", id),
            Self::InvalidExchangeId(id) => write!(f, "invalid exchange id {:?}", id),
            Self::MutexPossion => write!(f, "recovery log mutex poisoned"),
        }
    }
}

impl std::error::Error for RecoveryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::IO(e) => Some(e),
            Self::Cbor(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for RecoveryError {
    fn from(value: std::io::Error) -> Self {
        Self::IO(value)
    }
}

impl From<serde_cbor::Error> for RecoveryError {
    fn from(value: serde_cbor::Error) -> Self {
        Self::Cbor(value)
    }
}

impl<'a, T> From<PoisonError<MutexGuard<'a, T>>> for RecoveryError {
    fn from(_: PoisonError<MutexGuard<'a, T>>) -> Self {
        Self::MutexPossion
    }
}

/// Errors starting a handshake.
#[derive(Debug)]
pub enum HandshakeError {
    IO(std::io::Error),
    Recovery(RecoveryError),
    /// The identity's secret key doesn't belong to the exchange's own bitcoin key.
    IdentityMismatch,
    General(&'static str),
}

impl std::fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for HandshakeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::IO(e) => Some(e),
            Self::Recovery(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for HandshakeError {
    fn from(value: std::io::Error) -> Self {
        Self::IO(value)
    }
}

impl From<RecoveryError> for HandshakeError {
    fn from(value: RecoveryError) -> Self {
        Self::Recovery(value)
    }
}
