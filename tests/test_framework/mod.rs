//! A Framework to write functional tests for the exchange handshake.
//!
//! Runs one real handshake (the buyer's) against mock collaborators. The test plays the
//! seller and the broker by delivering their messages through the [MockGateway], and
//! drives the chain through the [MockBlockchain].
//!
//! Every wait is a bounded poll, so a stalled handshake fails the test instead of hanging it.
#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use bitcoin::{
    absolute::LockTime,
    hashes::Hash,
    secp256k1::{ecdsa::Signature, SecretKey},
    transaction::Version,
    Amount, OutPoint, PublicKey, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use exchange_handshake::{
    collaborators::{
        Blockchain, BlockchainNotification, DepositRequest, EventSender, HandshakeListener,
        MessageGateway, Wallet, WalletReply,
    },
    error::NetError,
    exchange::{Both, Exchange, ExchangeAmounts, ExchangeId, OwnIdentity, PeerId, Role},
    handshake::{
        start_handshake, Collaborators, Handshake, HandshakeConfig, HandshakeHandle,
        HandshakeResult, MemoryRecoveryLog, RecoveryLog,
    },
    protocol::{
        contract::{
            create_multisig_redeemscript, redeemscript_to_scriptpubkey, sign_counterpart_refund,
        },
        messages::{
            CommitmentNotification, PeerHandshake, RefundSignatureRequest,
            RefundSignatureResponse, WireMessage,
        },
    },
    utill::setup_logger,
};

pub const EXCHANGE_ID: &str = "exchange-1";
pub const LOCK_TIME: u32 = 800_000;
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn exchange_id() -> ExchangeId {
    ExchangeId::new(EXCHANGE_ID)
}

pub fn buyer() -> PeerId {
    PeerId::new("buyer")
}

pub fn seller() -> PeerId {
    PeerId::new("seller")
}

pub fn broker() -> PeerId {
    PeerId::new("broker")
}

pub fn buyer_identity() -> OwnIdentity {
    OwnIdentity::new("buyer-account", SecretKey::from_slice(&[0x11; 32]).unwrap())
}

pub fn seller_identity() -> OwnIdentity {
    OwnIdentity::new("seller-account", SecretKey::from_slice(&[0x22; 32]).unwrap())
}

pub fn amounts() -> ExchangeAmounts {
    ExchangeAmounts {
        deposits: Both::new(Amount::from_sat(200_000), Amount::from_sat(1_100_000)),
        refunds: Both::new(Amount::from_sat(100_000), Amount::from_sat(1_000_000)),
        transaction_fee: Amount::from_sat(1_000),
    }
}

/// The exchange as the buyer starts it.
pub fn buyer_exchange() -> Exchange {
    Exchange::new(
        exchange_id(),
        Role::Buyer,
        seller(),
        buyer_identity().peer,
        amounts(),
        LOCK_TIME,
    )
}

/// The exchange as the seller sees it after the peer handshake.
pub fn seller_exchange() -> Exchange {
    Exchange::new(
        exchange_id(),
        Role::Seller,
        buyer(),
        seller_identity().peer,
        amounts(),
        LOCK_TIME,
    )
    .handshaking(buyer_identity().peer)
}

/// A funded deposit paying `amount` to the multisig of `keys`.
pub fn deposit_tx(keys: &[PublicKey], amount: Amount, vout: u32) -> Transaction {
    let redeemscript = create_multisig_redeemscript(&keys[0], &keys[1]);
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: Txid::all_zeros(),
                vout,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: amount,
            script_pubkey: redeemscript_to_scriptpubkey(&redeemscript),
        }],
    }
}

/// The seller's deposit, as the broker would publish it.
pub fn seller_deposit() -> Transaction {
    let exchange = seller_exchange();
    deposit_tx(
        &exchange.required_signing_keys().unwrap(),
        exchange.own_deposit_amount(),
        99,
    )
}

/// Config with fast resubmissions and confirmation depth 2.
pub fn test_config() -> HandshakeConfig {
    HandshakeConfig {
        resubmit_interval_millis: 20,
        refund_signature_timeout_millis: 10_000,
        required_confirmations: 2,
        broker_address: broker().to_string(),
    }
}

/// Poll `condition` until it holds. Panics after a while.
pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let started = Instant::now();
    while !condition() {
        if started.elapsed() > WAIT_TIMEOUT {
            panic!("timed out waiting for {}", what);
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// Records everything sent, and routes deliveries to subscribed handshakes.
#[derive(Default)]
pub struct MockGateway {
    sent: Mutex<Vec<(PeerId, WireMessage)>>,
    subscribers: Mutex<HashMap<ExchangeId, EventSender>>,
}

impl MockGateway {
    /// Deliver a message to the handshake subscribed to its exchange id.
    pub fn deliver(&self, from: PeerId, message: WireMessage) -> bool {
        let inbox = self
            .subscribers
            .lock()
            .unwrap()
            .get(message.exchange_id())
            .cloned();
        match inbox {
            Some(inbox) => inbox.deliver(from, message),
            None => false,
        }
    }

    pub fn is_subscribed(&self, exchange_id: &ExchangeId) -> bool {
        self.subscribers.lock().unwrap().contains_key(exchange_id)
    }

    pub fn sent(&self) -> Vec<(PeerId, WireMessage)> {
        self.sent.lock().unwrap().clone()
    }

    /// Messages sent to `to` that satisfy `filter`.
    pub fn sent_to<T>(&self, to: &PeerId, filter: impl Fn(&WireMessage) -> Option<T>) -> Vec<T> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(peer, _)| peer == to)
            .filter_map(|(_, message)| filter(message))
            .collect()
    }

    pub fn count_to(&self, to: &PeerId, name: &str) -> usize {
        self.sent_to(to, |m| (m.to_string().starts_with(name)).then_some(()))
            .len()
    }

    /// Wait for a message to `to` that satisfies `filter`. Returns the latest one.
    pub fn await_sent<T>(
        &self,
        to: &PeerId,
        filter: impl Fn(&WireMessage) -> Option<T>,
    ) -> T {
        let mut found = None;
        wait_until("an outbound message", || {
            found = self.sent_to(to, &filter).pop();
            found.is_some()
        });
        found.unwrap()
    }
}

impl MessageGateway for MockGateway {
    fn send(&self, to: &PeerId, message: WireMessage) -> Result<(), NetError> {
        self.sent.lock().unwrap().push((to.clone(), message));
        Ok(())
    }

    fn subscribe(&self, exchange_id: &ExchangeId, inbox: EventSender) {
        self.subscribers
            .lock()
            .unwrap()
            .insert(exchange_id.clone(), inbox);
    }

    fn unsubscribe(&self, exchange_id: &ExchangeId) {
        self.subscribers.lock().unwrap().remove(exchange_id);
    }
}

/// Creates deposits on request, or fails every request.
#[derive(Default)]
pub struct MockWallet {
    failure: Option<String>,
    requests: Mutex<Vec<DepositRequest>>,
}

impl MockWallet {
    pub fn failing(error: &str) -> Self {
        Self {
            failure: Some(error.to_string()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<DepositRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Wallet for MockWallet {
    fn create_deposit(&self, request: DepositRequest, reply_to: EventSender) {
        self.requests.lock().unwrap().push(request.clone());
        let reply = match &self.failure {
            Some(error) => WalletReply::DepositCreationError(error.clone()),
            None => WalletReply::DepositCreated(deposit_tx(
                &request.required_signing_keys,
                request.output_amount,
                0,
            )),
        };
        reply_to.send(reply);
    }
}

/// A chain the test moves forward by hand.
#[derive(Default)]
pub struct MockBlockchain {
    watched_keys: Mutex<Vec<Vec<PublicKey>>>,
    watchers: Mutex<HashMap<Txid, EventSender>>,
    transactions: Mutex<HashMap<Txid, Transaction>>,
}

impl MockBlockchain {
    pub fn watched_keys(&self) -> Vec<Vec<PublicKey>> {
        self.watched_keys.lock().unwrap().clone()
    }

    pub fn is_watching(&self, txid: &Txid) -> bool {
        self.watchers.lock().unwrap().contains_key(txid)
    }

    /// Make a transaction retrievable.
    pub fn add_transaction(&self, tx: Transaction) {
        self.transactions
            .lock()
            .unwrap()
            .insert(tx.compute_txid(), tx);
    }

    pub fn confirm(&self, txid: Txid, depth: u32) {
        self.notify(&txid, BlockchainNotification::Confirmed { txid, depth });
    }

    pub fn reject(&self, txid: Txid) {
        self.notify(&txid, BlockchainNotification::Rejected { txid });
    }

    fn notify(&self, txid: &Txid, notification: BlockchainNotification) {
        wait_until("a confirmation watch", || self.is_watching(txid));
        let watcher = self.watchers.lock().unwrap().get(txid).cloned();
        if let Some(watcher) = watcher {
            watcher.send(notification);
        }
    }
}

impl Blockchain for MockBlockchain {
    fn watch_multisig_keys(&self, keys: Vec<PublicKey>) {
        self.watched_keys.lock().unwrap().push(keys);
    }

    fn watch_transaction_confirmation(&self, txid: Txid, _: u32, notify: EventSender) {
        self.watchers.lock().unwrap().insert(txid, notify);
    }

    fn retrieve_transaction(&self, txid: Txid, reply_to: EventSender) {
        let found = self.transactions.lock().unwrap().get(&txid).cloned();
        match found {
            Some(tx) => reply_to.send(BlockchainNotification::TransactionFound(tx)),
            None => reply_to.send(BlockchainNotification::TransactionNotFound(txid)),
        };
    }
}

#[derive(Default)]
pub struct RecordingListener {
    progress: Mutex<Vec<Exchange>>,
    results: Mutex<Vec<HandshakeResult>>,
}

impl RecordingListener {
    pub fn progress(&self) -> Vec<Exchange> {
        self.progress.lock().unwrap().clone()
    }

    pub fn results(&self) -> Vec<HandshakeResult> {
        self.results.lock().unwrap().clone()
    }

    pub fn await_result(&self) -> HandshakeResult {
        wait_until("the handshake result", || !self.results().is_empty());
        self.results()[0].clone()
    }
}

impl HandshakeListener for RecordingListener {
    fn on_progress(&self, exchange: &Exchange) {
        self.progress.lock().unwrap().push(exchange.clone());
    }

    fn on_result(&self, result: HandshakeResult) {
        self.results.lock().unwrap().push(result);
    }
}

/// The buyer's collaborators, plus the seller and broker played by the test.
pub struct Harness {
    pub config: HandshakeConfig,
    pub gateway: Arc<MockGateway>,
    pub wallet: Arc<MockWallet>,
    pub blockchain: Arc<MockBlockchain>,
    pub listener: Arc<RecordingListener>,
    pub recovery: Arc<dyn RecoveryLog>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(MockWallet::default(), Arc::new(MemoryRecoveryLog::default()))
    }

    pub fn with(wallet: MockWallet, recovery: Arc<dyn RecoveryLog>) -> Self {
        setup_logger(log::LevelFilter::Info, Some(std::env::temp_dir()));
        Self {
            config: test_config(),
            gateway: Arc::new(MockGateway::default()),
            wallet: Arc::new(wallet),
            blockchain: Arc::new(MockBlockchain::default()),
            listener: Arc::new(RecordingListener::default()),
            recovery,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            wallet: self.wallet.clone(),
            blockchain: self.blockchain.clone(),
            gateway: self.gateway.clone(),
            listener: self.listener.clone(),
            recovery: self.recovery.clone(),
        }
    }

    /// Start the buyer's handshake.
    pub fn start(&self) -> HandshakeHandle {
        start_handshake(
            buyer_exchange(),
            buyer_identity(),
            &self.config,
            self.collaborators(),
        )
        .unwrap()
    }

    /// The seller answers the buyer's peer handshake.
    pub fn complete_peer_handshake(&self) {
        self.gateway.await_sent(&seller(), |m| match m {
            WireMessage::PeerHandshake(_) => Some(()),
            _ => None,
        });
        let seller = seller_identity().peer;
        self.gateway.deliver(
            self::seller(),
            WireMessage::PeerHandshake(PeerHandshake {
                exchange_id: exchange_id(),
                public_key: seller.bitcoin_key,
                payment_account: seller.payment_account,
            }),
        );
    }

    /// Wait for the buyer to ask for a refund signature. Returns the refund template.
    pub fn await_refund_request(&self) -> Transaction {
        self.gateway.await_sent(&seller(), |m| match m {
            WireMessage::RefundSignatureRequest(request) => Some(request.refund_tx.clone()),
            _ => None,
        })
    }

    /// The seller signs the buyer's refund.
    pub fn sign_refund(&self, refund_tx: &Transaction) {
        let signature = sign_counterpart_refund(
            &seller_exchange(),
            None,
            &seller_identity().multisig_key,
            refund_tx,
        )
        .unwrap();
        self.send_refund_signature(signature);
    }

    pub fn send_refund_signature(&self, signature: Signature) {
        self.gateway.deliver(
            seller(),
            WireMessage::RefundSignatureResponse(RefundSignatureResponse {
                exchange_id: exchange_id(),
                signature,
            }),
        );
    }

    /// The seller asks the buyer to sign the seller's refund.
    pub fn request_seller_refund_signature(&self) -> Transaction {
        let handshake = Handshake::new(seller_exchange(), seller_deposit()).unwrap();
        self.gateway.deliver(
            seller(),
            WireMessage::RefundSignatureRequest(RefundSignatureRequest {
                exchange_id: exchange_id(),
                refund_tx: handshake.unsigned_refund.clone(),
            }),
        );
        handshake.unsigned_refund
    }

    /// Wait for the buyer's commitment at the broker. Returns the buyer's deposit.
    pub fn await_commitment(&self) -> Transaction {
        self.gateway.await_sent(&broker(), |m| match m {
            WireMessage::ExchangeCommitment(commitment) => Some(commitment.deposit_tx.clone()),
            _ => None,
        })
    }

    /// The broker announces both published commitments.
    pub fn notify_commitments(&self, commitments: &Both<Transaction>) {
        self.gateway.deliver(
            broker(),
            WireMessage::CommitmentNotification(CommitmentNotification {
                exchange_id: exchange_id(),
                commitment_ids: Both::new(
                    commitments.buyer.compute_txid(),
                    commitments.seller.compute_txid(),
                ),
            }),
        );
    }

    pub fn abort(&self, reason: &str) {
        self.gateway.deliver(
            broker(),
            WireMessage::ExchangeAborted {
                exchange_id: exchange_id(),
                reason: reason.to_string(),
            },
        );
    }

    /// Run a handshake up to the point where both commitments are published.
    pub fn publish_commitments(&self) -> Both<Transaction> {
        self.complete_peer_handshake();
        let refund = self.await_refund_request();
        self.sign_refund(&refund);
        let commitments = Both::new(self.await_commitment(), seller_deposit());
        self.notify_commitments(&commitments);
        self.gateway.await_sent(&broker(), |m| match m {
            WireMessage::CommitmentNotificationAck { .. } => Some(()),
            _ => None,
        });
        commitments
    }
}
