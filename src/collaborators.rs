//! Interfaces of the systems a handshake depends on but doesn't own.
//!
//! All requests are non-blocking. Replies and notifications travel back through the
//! [EventSender] handed over with the request, and are processed by the handshake
//! in the same serial queue as every network message.

use std::sync::mpsc::Sender;

use bitcoin::{Amount, PublicKey, Transaction, Txid};

use crate::{
    error::NetError,
    exchange::{Exchange, ExchangeId, PeerId},
    handshake::{api::HandshakeResult, Event},
    protocol::messages::WireMessage,
};

/// Queue handle of one running handshake.
///
/// Sending after the handshake terminated is silently ignored.
#[derive(Debug, Clone)]
pub struct EventSender(Sender<Event>);

impl EventSender {
    pub(crate) fn new(sender: Sender<Event>) -> Self {
        Self(sender)
    }

    /// Queue an event. Returns false if the handshake no longer accepts events.
    pub fn send(&self, event: impl Into<Event>) -> bool {
        self.0.send(event.into()).is_ok()
    }

    /// Queue a message received from the network.
    pub fn deliver(&self, from: PeerId, message: WireMessage) -> bool {
        self.send(Event::Inbound { from, message })
    }
}

/// Request for the wallet to fund our multisig deposit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositRequest {
    pub exchange_id: ExchangeId,
    pub required_signing_keys: Vec<PublicKey>,
    pub output_amount: Amount,
    pub fee: Amount,
}

/// Replies of [Wallet::create_deposit].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletReply {
    DepositCreated(Transaction),
    DepositCreationError(String),
}

/// Replies and notifications of the [Blockchain].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockchainNotification {
    /// The transaction is buried under `depth` blocks.
    Confirmed { txid: Txid, depth: u32 },
    /// The transaction can never confirm. Sent at most once per watched txid.
    Rejected { txid: Txid },
    TransactionFound(Transaction),
    TransactionNotFound(Txid),
}

pub trait Wallet: Send + Sync {
    /// Create, sign and durably store a deposit paying `output_amount` to the multisig
    /// of `required_signing_keys`. Replies with a [WalletReply].
    fn create_deposit(&self, request: DepositRequest, reply_to: EventSender);
}

pub trait Blockchain: Send + Sync {
    /// Start tracking transactions involving the multisig of these keys. Idempotent.
    fn watch_multisig_keys(&self, keys: Vec<PublicKey>);

    /// Notify confirmation depth updates of `txid` until `required_depth` is reached,
    /// or its rejection.
    fn watch_transaction_confirmation(&self, txid: Txid, required_depth: u32, notify: EventSender);

    /// Replies with [BlockchainNotification::TransactionFound] or
    /// [BlockchainNotification::TransactionNotFound].
    fn retrieve_transaction(&self, txid: Txid, reply_to: EventSender);
}

/// The message transport.
pub trait MessageGateway: Send + Sync {
    fn send(&self, to: &PeerId, message: WireMessage) -> Result<(), NetError>;

    /// Route every inbound message of this exchange to `inbox`.
    fn subscribe(&self, exchange_id: &ExchangeId, inbox: EventSender);

    fn unsubscribe(&self, exchange_id: &ExchangeId);
}

/// Receives the progress of a handshake, and exactly one result.
pub trait HandshakeListener: Send + Sync {
    fn on_progress(&self, exchange: &Exchange);

    fn on_result(&self, result: HandshakeResult);
}
