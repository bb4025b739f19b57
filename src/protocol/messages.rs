//! Handshake Protocol Messages.
//!
//! Messages are exchanged between the two parties of an exchange, and between each party and the broker.
//! The two parties never talk to the broker on each other's behalf. Every message carries the
//! [ExchangeId] it belongs to, so one transport can multiplex many concurrent handshakes.
//!
//! The happy path of one party's handshake is shown below. The counterpart runs the mirror image.
//!
//! ```shell
//! ********* Peer Handshake *********
//! Party -> Counterpart: [WireMessage::PeerHandshake] (resent until the counterpart's arrives)
//! Counterpart -> Party: [WireMessage::PeerHandshake]
//! Party creates its deposit through the wallet.
//!
//! ********* Refund Signatures *********
//! Party -> Counterpart: [WireMessage::RefundSignatureRequest] (resent until a valid signature arrives)
//! Counterpart -> Party: [WireMessage::RefundSignatureResponse]
//!
//! ********* Commitment *********
//! Party -> Broker: [WireMessage::ExchangeCommitment] (resent until the broker publishes both deposits)
//! Broker -> Party: [WireMessage::CommitmentNotification]
//! Party -> Broker: [WireMessage::CommitmentNotificationAck] (sent once, repeated per duplicate notification)
//!
//! ********* Failure *********
//! Party -> Broker: [WireMessage::ExchangeRejection] (refund signature deadline expired)
//! Broker -> Party: [WireMessage::ExchangeAborted]
//! ```

use std::fmt::Display;

use bitcoin::{secp256k1::ecdsa::Signature, PublicKey, Transaction, Txid};
use serde::{Deserialize, Serialize};

use crate::{
    error::NetError,
    exchange::{Both, ExchangeId},
};

/// Introduces one party to the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerHandshake {
    pub exchange_id: ExchangeId,
    pub public_key: PublicKey,
    pub payment_account: String,
}

/// Asks the counterpart to sign our refund.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundSignatureRequest {
    pub exchange_id: ExchangeId,
    pub refund_tx: Transaction,
}

/// The counterpart's signature for our refund.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundSignatureResponse {
    pub exchange_id: ExchangeId,
    pub signature: Signature,
}

/// Hands our deposit to the broker for publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeCommitment {
    pub exchange_id: ExchangeId,
    pub public_key: PublicKey,
    pub deposit_tx: Transaction,
}

/// The broker published both deposits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitmentNotification {
    pub exchange_id: ExchangeId,
    pub commitment_ids: Both<Txid>,
}

/// All messages of the handshake protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Party to counterpart, both directions.
    PeerHandshake(PeerHandshake),
    /// Party to counterpart.
    RefundSignatureRequest(RefundSignatureRequest),
    /// Counterpart to party.
    RefundSignatureResponse(RefundSignatureResponse),
    /// Party to broker.
    ExchangeCommitment(ExchangeCommitment),
    /// Broker to party.
    CommitmentNotification(CommitmentNotification),
    /// Party to broker. Never retried.
    CommitmentNotificationAck { exchange_id: ExchangeId },
    /// Party to broker.
    ExchangeRejection {
        exchange_id: ExchangeId,
        reason: String,
    },
    /// Broker to party.
    ExchangeAborted {
        exchange_id: ExchangeId,
        reason: String,
    },
}

impl WireMessage {
    pub fn exchange_id(&self) -> &ExchangeId {
        match self {
            Self::PeerHandshake(m) => &m.exchange_id,
            Self::RefundSignatureRequest(m) => &m.exchange_id,
            Self::RefundSignatureResponse(m) => &m.exchange_id,
            Self::ExchangeCommitment(m) => &m.exchange_id,
            Self::CommitmentNotification(m) => &m.exchange_id,
            Self::CommitmentNotificationAck { exchange_id }
            | Self::ExchangeRejection { exchange_id, .. }
            | Self::ExchangeAborted { exchange_id, .. } => exchange_id,
        }
    }

    /// Encode for the wire.
    pub fn to_cbor(&self) -> Result<Vec<u8>, NetError> {
        Ok(serde_cbor::to_vec(self)?)
    }

    /// Decode from the wire.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, NetError> {
        Ok(serde_cbor::from_slice(bytes)?)
    }
}

impl Display for WireMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PeerHandshake(_) => write!(f, "PeerHandshake"),
            Self::RefundSignatureRequest(_) => write!(f, "RefundSignatureRequest"),
            Self::RefundSignatureResponse(_) => write!(f, "RefundSignatureResponse"),
            Self::ExchangeCommitment(_) => write!(f, "ExchangeCommitment"),
            Self::CommitmentNotification(_) => write!(f, "CommitmentNotification"),
            Self::CommitmentNotificationAck { .. } => write!(f, "CommitmentNotificationAck"),
            Self::ExchangeRejection { reason, .. } => write!(f, "ExchangeRejection({})", reason),
            Self::ExchangeAborted { reason, .. } => write!(f, "ExchangeAborted({})", reason),
        }
    }
}
