//! The handshake state machine.
//!
//! Transitions are pure: [HandshakeState::step] consumes the current state and one [Event]
//! and returns the next state together with the [Effect]s the engine must carry out.
//! Nothing in here touches the network, the wallet, the blockchain or a clock.
//!
//! ```shell
//! AwaitingPeerHandshake -> CreatingDeposit -> AwaitingRefundSignature
//!     -> AwaitingCommitmentPublication -> AwaitingConfirmations -> Terminated
//! ```
//!
//! A broker abort terminates every non-terminal state. The refund signature deadline
//! terminates every state before AwaitingConfirmations.

use bitcoin::{secp256k1::SecretKey, PublicKey, Transaction, Txid};

use crate::{
    collaborators::{BlockchainNotification, DepositRequest, WalletReply},
    exchange::{Both, Exchange, ExchangeId, PeerId, PeerInfo, Role},
    protocol::messages::{ExchangeCommitment, PeerHandshake, RefundSignatureRequest, WireMessage},
};

use super::{
    api::{FailureCause, Handshake, HandshakeResult},
    confirmations::{ConfirmationTracker, Progress},
};

/// Immutable inputs of one handshake instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    pub exchange_id: ExchangeId,
    pub role: Role,
    pub own: PeerInfo,
    pub counterpart_id: PeerId,
    pub broker: PeerId,
    pub required_confirmations: u32,
}

impl Context {
    fn own_peer_handshake(&self) -> WireMessage {
        WireMessage::PeerHandshake(PeerHandshake {
            exchange_id: self.exchange_id.clone(),
            public_key: self.own.bitcoin_key,
            payment_account: self.own.payment_account.clone(),
        })
    }

    fn commitment_ack(&self) -> Effect {
        Effect::Send {
            to: self.broker.clone(),
            message: WireMessage::CommitmentNotificationAck {
                exchange_id: self.exchange_id.clone(),
            },
        }
    }
}

/// Everything that can happen to a handshake. All of it goes through one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::large_enum_variant)]
pub enum Event {
    /// A message from the network, not claimed by the active resubmission.
    Inbound { from: PeerId, message: WireMessage },
    /// The counterpart answered our peer handshake.
    PeerHandshakeReceived(PeerInfo),
    /// The counterpart sent a valid signature. Carries our fully signed refund.
    RefundSigned(Transaction),
    /// The broker published both commitments.
    CommitmentsPublished(Both<Txid>),
    Wallet(WalletReply),
    Blockchain(BlockchainNotification),
    RefundSignatureDeadline,
    CheckpointFailed(String),
    /// The queue lost every sender.
    Interrupted,
}

impl From<WalletReply> for Event {
    fn from(value: WalletReply) -> Self {
        Self::Wallet(value)
    }
}

impl From<BlockchainNotification> for Event {
    fn from(value: BlockchainNotification) -> Self {
        Self::Blockchain(value)
    }
}

/// Which reply ends a resubmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expectation {
    PeerHandshake,
    /// A signature that completes this handshake's refund.
    RefundSignature(Box<Handshake>),
    CommitmentNotification,
}

/// A message resent to `to` until an acceptable reply comes back from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forwarding {
    pub to: PeerId,
    pub message: WireMessage,
    pub expect: Expectation,
}

impl Forwarding {
    /// Turn an inbound message into the event it stands for, if it is the expected reply.
    pub fn accept(&self, own_key: &SecretKey, from: &PeerId, message: &WireMessage) -> Option<Event> {
        if *from != self.to || message.exchange_id() != self.message.exchange_id() {
            return None;
        }
        match (&self.expect, message) {
            (Expectation::PeerHandshake, WireMessage::PeerHandshake(m)) => {
                Some(Event::PeerHandshakeReceived(PeerInfo {
                    payment_account: m.payment_account.clone(),
                    bitcoin_key: m.public_key,
                }))
            }
            (Expectation::RefundSignature(handshake), WireMessage::RefundSignatureResponse(m)) => {
                handshake
                    .sign_own_refund(own_key, &m.signature)
                    .ok()
                    .map(Event::RefundSigned)
            }
            (Expectation::CommitmentNotification, WireMessage::CommitmentNotification(m)) => {
                Some(Event::CommitmentsPublished(m.commitment_ids))
            }
            _ => None,
        }
    }
}

/// Side effects requested by a transition, in execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::large_enum_variant)]
pub enum Effect {
    /// Report a new exchange snapshot to the listener.
    Notify(Exchange),
    /// Replace the active resubmission.
    Forward(Forwarding),
    /// Send once, never retried.
    Send { to: PeerId, message: WireMessage },
    ArmDeadline,
    CancelDeadline,
    /// Arm the refund counter-signer, refusing refunds that spend `own_deposit`.
    ArmCounterSigner {
        exchange: Exchange,
        own_deposit: Option<Txid>,
    },
    CounterSign(Transaction),
    StopCounterSigner,
    CreateDeposit(DepositRequest),
    Persist(Handshake),
    WatchMultisigKeys(Vec<PublicKey>),
    WatchConfirmation { txid: Txid, required_depth: u32 },
    RetrieveTransaction(Txid),
    /// Report the result and tear everything down.
    Finish(HandshakeResult),
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::large_enum_variant)]
pub enum HandshakeState {
    AwaitingPeerHandshake {
        exchange: Exchange,
    },
    CreatingDeposit {
        exchange: Exchange,
    },
    AwaitingRefundSignature {
        handshake: Handshake,
    },
    AwaitingCommitmentPublication {
        handshake: Handshake,
        refund: Transaction,
    },
    AwaitingConfirmations {
        handshake: Handshake,
        refund: Transaction,
        tracker: ConfirmationTracker,
    },
    Terminated {
        success: bool,
    },
}

impl HandshakeState {
    /// Initial state and effects. A recovery checkpoint resumes at the refund signature exchange.
    pub fn start(
        ctx: &Context,
        exchange: Exchange,
        checkpoint: Option<Handshake>,
    ) -> (Self, Vec<Effect>) {
        match checkpoint {
            Some(handshake) => {
                let mut effects = vec![
                    Effect::Notify(handshake.exchange.clone()),
                    Effect::ArmDeadline,
                    Effect::ArmCounterSigner {
                        exchange: handshake.exchange.clone(),
                        own_deposit: Some(handshake.own_deposit.compute_txid()),
                    },
                ];
                if let Some(keys) = handshake.exchange.required_signing_keys() {
                    effects.push(Effect::WatchMultisigKeys(keys));
                }
                effects.push(request_refund_signature(ctx, &handshake));
                (Self::AwaitingRefundSignature { handshake }, effects)
            }
            None => {
                let effects = vec![
                    Effect::Notify(exchange.clone()),
                    Effect::ArmDeadline,
                    Effect::Forward(Forwarding {
                        to: ctx.counterpart_id.clone(),
                        message: ctx.own_peer_handshake(),
                        expect: Expectation::PeerHandshake,
                    }),
                ];
                (Self::AwaitingPeerHandshake { exchange }, effects)
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::AwaitingPeerHandshake { .. } => "AwaitingPeerHandshake",
            Self::CreatingDeposit { .. } => "CreatingDeposit",
            Self::AwaitingRefundSignature { .. } => "AwaitingRefundSignature",
            Self::AwaitingCommitmentPublication { .. } => "AwaitingCommitmentPublication",
            Self::AwaitingConfirmations { .. } => "AwaitingConfirmations",
            Self::Terminated { .. } => "Terminated",
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated { .. })
    }

    /// Counterpart refunds may only be signed while no commitment is broadcastable.
    fn signs_refunds(&self) -> bool {
        matches!(
            self,
            Self::CreatingDeposit { .. }
                | Self::AwaitingRefundSignature { .. }
                | Self::AwaitingCommitmentPublication { .. }
        )
    }

    /// Apply one event.
    pub fn step(self, ctx: &Context, event: Event) -> (Self, Vec<Effect>) {
        if self.is_terminated() {
            return (self, vec![]);
        }
        if let Event::Inbound { from, message } = &event {
            if message.exchange_id() != &ctx.exchange_id {
                log::debug!(
                    "[{}] Ignoring {} from {} for exchange {}",
                    ctx.exchange_id,
                    message,
                    from,
                    message.exchange_id()
                );
                return (self, vec![]);
            }
        }

        match &event {
            Event::Inbound {
                from,
                message: WireMessage::ExchangeAborted { reason, .. },
            } if *from == ctx.broker => {
                return fail(FailureCause::Aborted(reason.clone()), vec![]);
            }
            Event::RefundSignatureDeadline
                if !matches!(self, Self::AwaitingConfirmations { .. }) =>
            {
                let cause = FailureCause::RefundSignatureTimeout;
                let rejection = Effect::Send {
                    to: ctx.broker.clone(),
                    message: WireMessage::ExchangeRejection {
                        exchange_id: ctx.exchange_id.clone(),
                        reason: cause.to_string(),
                    },
                };
                return fail(cause, vec![rejection]);
            }
            Event::Interrupted => return fail(FailureCause::Interrupted, vec![]),
            _ => {}
        }

        match (self, event) {
            (Self::AwaitingPeerHandshake { exchange }, Event::PeerHandshakeReceived(counterpart)) => {
                let exchange = exchange.handshaking(counterpart);
                let keys = exchange.required_signing_keys().unwrap_or_default();
                let effects = vec![
                    Effect::Notify(exchange.clone()),
                    Effect::ArmCounterSigner {
                        exchange: exchange.clone(),
                        own_deposit: None,
                    },
                    Effect::WatchMultisigKeys(keys.clone()),
                    Effect::CreateDeposit(DepositRequest {
                        exchange_id: ctx.exchange_id.clone(),
                        required_signing_keys: keys,
                        output_amount: exchange.own_deposit_amount(),
                        fee: exchange.amounts.transaction_fee,
                    }),
                ];
                (Self::CreatingDeposit { exchange }, effects)
            }

            (Self::CreatingDeposit { exchange }, Event::Wallet(WalletReply::DepositCreated(tx))) => {
                match Handshake::new(exchange, tx) {
                    Ok(handshake) => {
                        let effects = vec![
                            Effect::Persist(handshake.clone()),
                            Effect::ArmCounterSigner {
                                exchange: handshake.exchange.clone(),
                                own_deposit: Some(handshake.own_deposit.compute_txid()),
                            },
                            request_refund_signature(ctx, &handshake),
                        ];
                        (Self::AwaitingRefundSignature { handshake }, effects)
                    }
                    Err(e) => fail(FailureCause::InvalidDeposit(e.to_string()), vec![]),
                }
            }
            (Self::CreatingDeposit { .. }, Event::Wallet(WalletReply::DepositCreationError(e))) => {
                fail(FailureCause::DepositCreation(e), vec![])
            }

            (Self::AwaitingRefundSignature { .. }, Event::CheckpointFailed(e)) => {
                fail(FailureCause::Checkpoint(e), vec![])
            }
            (Self::AwaitingRefundSignature { handshake }, Event::RefundSigned(refund)) => {
                let commitment = WireMessage::ExchangeCommitment(ExchangeCommitment {
                    exchange_id: ctx.exchange_id.clone(),
                    public_key: ctx.own.bitcoin_key,
                    deposit_tx: handshake.own_deposit.clone(),
                });
                let effects = vec![Effect::Forward(Forwarding {
                    to: ctx.broker.clone(),
                    message: commitment,
                    expect: Expectation::CommitmentNotification,
                })];
                (
                    Self::AwaitingCommitmentPublication { handshake, refund },
                    effects,
                )
            }

            (
                Self::AwaitingCommitmentPublication { handshake, refund },
                Event::CommitmentsPublished(ids),
            ) => {
                let tracker = ConfirmationTracker::new(ids, ctx.required_confirmations);
                let mut effects = vec![
                    Effect::StopCounterSigner,
                    Effect::CancelDeadline,
                    ctx.commitment_ack(),
                ];
                effects.extend(tracker.watched().into_iter().map(|txid| {
                    Effect::WatchConfirmation {
                        txid,
                        required_depth: tracker.required_depth(),
                    }
                }));
                (
                    Self::AwaitingConfirmations {
                        handshake,
                        refund,
                        tracker,
                    },
                    effects,
                )
            }

            (
                Self::AwaitingConfirmations {
                    handshake,
                    refund,
                    tracker,
                },
                Event::Inbound {
                    from,
                    message: WireMessage::CommitmentNotification(notification),
                },
            ) if from == ctx.broker => {
                // The broker missed our acknowledgement.
                let effects = if notification.commitment_ids == *tracker.commitment_ids() {
                    vec![ctx.commitment_ack()]
                } else {
                    log::warn!(
                        "[{}] Broker renotified different commitments, not acknowledged",
                        ctx.exchange_id
                    );
                    vec![]
                };
                let state = Self::AwaitingConfirmations {
                    handshake,
                    refund,
                    tracker,
                };
                (state, effects)
            }
            (
                Self::AwaitingConfirmations {
                    handshake,
                    refund,
                    tracker,
                },
                Event::Blockchain(notification),
            ) => on_blockchain_notification(ctx, handshake, refund, tracker, notification),

            (
                state,
                Event::Inbound {
                    from,
                    message: WireMessage::PeerHandshake(_),
                },
            ) if from == ctx.counterpart_id => {
                // The counterpart may have started after we stopped resending ours.
                let reply = Effect::Send {
                    to: ctx.counterpart_id.clone(),
                    message: ctx.own_peer_handshake(),
                };
                (state, vec![reply])
            }
            (
                state,
                Event::Inbound {
                    from,
                    message: WireMessage::RefundSignatureRequest(request),
                },
            ) if from == ctx.counterpart_id && state.signs_refunds() => {
                (state, vec![Effect::CounterSign(request.refund_tx)])
            }

            (state, _) => (state, vec![]),
        }
    }
}

fn on_blockchain_notification(
    ctx: &Context,
    handshake: Handshake,
    refund: Transaction,
    mut tracker: ConfirmationTracker,
    notification: BlockchainNotification,
) -> (HandshakeState, Vec<Effect>) {
    let effects = match notification {
        BlockchainNotification::Confirmed { txid, depth } => {
            match tracker.on_confirmed(&txid, depth) {
                Progress::Confirmed(ids) => {
                    ids.into_iter().map(Effect::RetrieveTransaction).collect()
                }
                _ => vec![],
            }
        }
        BlockchainNotification::Rejected { txid } if tracker.is_commitment(&txid) => {
            let own = tracker.belongs_to(&txid, ctx.role);
            return fail_with_commitment(
                handshake,
                refund,
                FailureCause::CommitmentRejected { txid, own },
            );
        }
        BlockchainNotification::TransactionNotFound(txid) if tracker.is_commitment(&txid) => {
            return fail_with_commitment(handshake, refund, FailureCause::CommitmentNotFound(txid));
        }
        BlockchainNotification::TransactionFound(tx) => match tracker.on_found(tx) {
            Progress::Retrieved(commitments) => {
                let result = HandshakeResult::Success {
                    exchange: handshake.exchange,
                    commitments,
                    refund,
                };
                return (
                    HandshakeState::Terminated { success: true },
                    vec![Effect::Finish(result)],
                );
            }
            _ => vec![],
        },
        _ => vec![],
    };
    (
        HandshakeState::AwaitingConfirmations {
            handshake,
            refund,
            tracker,
        },
        effects,
    )
}

fn request_refund_signature(ctx: &Context, handshake: &Handshake) -> Effect {
    Effect::Forward(Forwarding {
        to: ctx.counterpart_id.clone(),
        message: WireMessage::RefundSignatureRequest(RefundSignatureRequest {
            exchange_id: ctx.exchange_id.clone(),
            refund_tx: handshake.unsigned_refund.clone(),
        }),
        expect: Expectation::RefundSignature(Box::new(handshake.clone())),
    })
}

fn fail(cause: FailureCause, mut effects: Vec<Effect>) -> (HandshakeState, Vec<Effect>) {
    effects.push(Effect::Finish(HandshakeResult::Failure { cause }));
    (HandshakeState::Terminated { success: false }, effects)
}

fn fail_with_commitment(
    handshake: Handshake,
    refund: Transaction,
    cause: FailureCause,
) -> (HandshakeState, Vec<Effect>) {
    let result = HandshakeResult::FailureWithCommitment {
        exchange: handshake.exchange,
        cause,
        own_deposit: Some(handshake.own_deposit),
        refund,
    };
    (
        HandshakeState::Terminated { success: false },
        vec![Effect::Finish(result)],
    )
}
