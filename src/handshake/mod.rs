//! The exchange handshake.
//!
//! Before an exchange can proceed, both parties fund a 2-of-2 multisig deposit and each
//! obtains the counterpart's signature on a refund of its own deposit. Only then the
//! deposits are handed to the broker, which publishes both. The handshake succeeds once
//! both published deposits are confirmed deep enough.
//!
//! A handshake is started with [start_handshake] and reports progress and exactly one
//! [HandshakeResult] to its [crate::collaborators::HandshakeListener].
//!
//! The module is split into:
//! - [state]: the pure state machine.
//! - [engine]: the thread executing it.
//! - [forwarder]: resubmission of unanswered messages and timers.
//! - [signer]: signing the counterpart's refund.
//! - [confirmations]: tracking both commitments to the required depth.
//! - [recovery]: the durable checkpoint to resume from after a restart.

pub mod api;
pub mod config;
pub mod confirmations;
pub mod engine;
pub mod error;
pub mod forwarder;
pub mod recovery;
pub mod signer;
pub mod state;

pub use api::{FailureCause, Handshake, HandshakeResult};
pub use config::HandshakeConfig;
pub use engine::{start_handshake, Collaborators, HandshakeHandle};
pub use error::{HandshakeError, RecoveryError};
pub use recovery::{FileRecoveryLog, MemoryRecoveryLog, RecoveryLog};
pub use state::Event;
