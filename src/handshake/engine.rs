//! The handshake runtime.
//!
//! Each handshake runs on its own thread and processes one event at a time from its
//! inbox. The state machine decides, the engine executes: it owns the resubmission
//! timer, the refund deadline and the refund counter-signer, and talks to the
//! collaborators on behalf of the state machine.

use std::{
    collections::VecDeque,
    sync::{
        mpsc::{self, Receiver},
        Arc,
    },
    thread::{self, JoinHandle},
};

use bitcoin::{
    secp256k1::{self, Secp256k1, SecretKey},
    PublicKey,
};

use crate::{
    collaborators::{Blockchain, EventSender, HandshakeListener, MessageGateway, Wallet},
    exchange::{Exchange, ExchangeId, OwnIdentity},
};

use super::{
    api::{FailureCause, HandshakeResult},
    config::HandshakeConfig,
    error::HandshakeError,
    forwarder::{RetryForwarder, Timer},
    recovery::RecoveryLog,
    signer::RefundCounterSigner,
    state::{Context, Effect, Event, Forwarding, HandshakeState},
};

/// Everything a handshake talks to. Shared by all handshakes of a node.
#[derive(Clone)]
pub struct Collaborators {
    pub wallet: Arc<dyn Wallet>,
    pub blockchain: Arc<dyn Blockchain>,
    pub gateway: Arc<dyn MessageGateway>,
    pub listener: Arc<dyn HandshakeListener>,
    pub recovery: Arc<dyn RecoveryLog>,
}

/// Handle of a running handshake.
///
/// Dropping the handle detaches the handshake. It keeps running until it terminates.
pub struct HandshakeHandle {
    exchange_id: ExchangeId,
    inbox: EventSender,
    thread: Option<JoinHandle<()>>,
}

impl HandshakeHandle {
    pub fn exchange_id(&self) -> &ExchangeId {
        &self.exchange_id
    }

    /// Queue handle of the handshake, for transports that don't use subscriptions.
    pub fn inbox(&self) -> EventSender {
        self.inbox.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Stop the handshake. It terminates with [FailureCause::Interrupted] unless
    /// it already reached a result.
    pub fn interrupt(&self) {
        self.inbox.send(Event::Interrupted);
    }

    /// Wait until the handshake terminated.
    pub fn join(mut self) -> Result<(), HandshakeError> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| HandshakeError::General("handshake thread panicked")),
            None => Ok(()),
        }
    }
}

/// Start the handshake of `exchange`.
///
/// If the recovery log holds a checkpoint for this exchange, the handshake resumes
/// at the refund signature exchange without creating a new deposit.
pub fn start_handshake(
    exchange: Exchange,
    identity: OwnIdentity,
    config: &HandshakeConfig,
    collaborators: Collaborators,
) -> Result<HandshakeHandle, HandshakeError> {
    let secp = Secp256k1::new();
    let derived_key = PublicKey::new(secp256k1::PublicKey::from_secret_key(
        &secp,
        &identity.multisig_key,
    ));
    if identity.peer != exchange.own || derived_key != exchange.own.bitcoin_key {
        return Err(HandshakeError::IdentityMismatch);
    }

    let exchange_id = exchange.id.clone();
    let checkpoint = collaborators.recovery.load(&exchange_id)?;
    if checkpoint.is_some() {
        log::info!("[{}] Resuming from recovery checkpoint", exchange_id);
    }

    let ctx = Context {
        exchange_id: exchange_id.clone(),
        role: exchange.role,
        own: exchange.own.clone(),
        counterpart_id: exchange.counterpart_id.clone(),
        broker: config.broker(),
        required_confirmations: config.required_confirmations,
    };

    let (sender, receiver) = mpsc::channel();
    let inbox = EventSender::new(sender);

    let signer = RefundCounterSigner::spawn(
        exchange_id.clone(),
        identity.multisig_key,
        exchange.counterpart_id.clone(),
        collaborators.gateway.clone(),
    )?;

    log::info!(
        "[{}] Starting handshake as {} with {}",
        exchange_id,
        exchange.role,
        exchange.counterpart_id
    );
    let (state, effects) = HandshakeState::start(&ctx, exchange, checkpoint);

    let gateway = collaborators.gateway.clone();
    gateway.subscribe(&exchange_id, inbox.clone());

    let engine = Engine {
        ctx,
        own_key: identity.multisig_key,
        config: config.clone(),
        collaborators,
        inbox: inbox.clone(),
        forwarder: None,
        deadline: None,
        signer,
        finished: false,
    };
    let thread = thread::Builder::new()
        .name(format!("handshake {}", exchange_id))
        .spawn(move || engine.run(state, effects, receiver))
        .map_err(|e| {
            gateway.unsubscribe(&exchange_id);
            HandshakeError::IO(e)
        })?;

    Ok(HandshakeHandle {
        exchange_id,
        inbox,
        thread: Some(thread),
    })
}

struct Engine {
    ctx: Context,
    own_key: SecretKey,
    config: HandshakeConfig,
    collaborators: Collaborators,
    inbox: EventSender,
    forwarder: Option<RetryForwarder<Event>>,
    deadline: Option<Timer>,
    signer: RefundCounterSigner,
    finished: bool,
}

impl Engine {
    fn run(mut self, mut state: HandshakeState, effects: Vec<Effect>, inbox: Receiver<Event>) {
        let mut queued = self.execute(effects);

        while !self.finished {
            let event = match queued.pop_front() {
                Some(event) => event,
                None => match inbox.recv() {
                    Ok(event) => event,
                    Err(_) => break,
                },
            };
            let event = self.route(event);

            let before = state.name();
            let (next, effects) = state.step(&self.ctx, event);
            if next.name() != before {
                log::info!("[{}] {} -> {}", self.ctx.exchange_id, before, next.name());
            }
            state = next;
            queued.extend(self.execute(effects));
        }

        if !self.finished {
            log::error!("[{}] Handshake inbox disconnected", self.ctx.exchange_id);
            self.finish(HandshakeResult::Failure {
                cause: FailureCause::Interrupted,
            });
        }
    }

    /// Let the active resubmission claim an inbound message.
    fn route(&mut self, event: Event) -> Event {
        if let Event::Inbound { from, message } = &event {
            log::info!("[{}] <=== {} from {}", self.ctx.exchange_id, message, from);
            if let Some(forwarder) = self.forwarder.as_mut() {
                if let Some(accepted) = forwarder.offer(from, message) {
                    self.forwarder = None;
                    return accepted;
                }
            }
        }
        event
    }

    /// Carry out effects in order. Returns the events they raised on the spot.
    fn execute(&mut self, effects: Vec<Effect>) -> VecDeque<Event> {
        let mut raised = VecDeque::new();
        let id = self.ctx.exchange_id.clone();

        for effect in effects {
            match effect {
                Effect::Notify(exchange) => self.collaborators.listener.on_progress(&exchange),
                Effect::Forward(forwarding) => {
                    // One resubmission at a time.
                    self.forwarder = None;
                    match self.forward(forwarding) {
                        Ok(forwarder) => self.forwarder = Some(forwarder),
                        Err(e) => {
                            log::error!("[{}] Cannot start resubmission: {}", id, e);
                            raised.push_back(Event::Interrupted);
                            break;
                        }
                    }
                }
                Effect::Send { to, message } => {
                    log::info!("[{}] ===> {} to {}", id, message, to);
                    if let Err(e) = self.collaborators.gateway.send(&to, message) {
                        log::warn!("[{}] Failed sending to {}: {}", id, to, e);
                    }
                }
                Effect::ArmDeadline => {
                    let inbox = self.inbox.clone();
                    match Timer::once(
                        format!("deadline {}", id),
                        self.config.refund_signature_timeout(),
                        move || {
                            inbox.send(Event::RefundSignatureDeadline);
                        },
                    ) {
                        Ok(timer) => self.deadline = Some(timer),
                        Err(e) => {
                            log::error!("[{}] Cannot arm refund deadline: {}", id, e);
                            raised.push_back(Event::Interrupted);
                            break;
                        }
                    }
                }
                Effect::CancelDeadline => self.deadline = None,
                Effect::ArmCounterSigner {
                    exchange,
                    own_deposit,
                } => self.signer.arm(exchange, own_deposit),
                Effect::CounterSign(refund_tx) => self.signer.sign(refund_tx),
                Effect::StopCounterSigner => self.signer.stop(),
                Effect::CreateDeposit(request) => {
                    log::info!(
                        "[{}] Requesting deposit of {} with fee {}",
                        id,
                        request.output_amount,
                        request.fee
                    );
                    self.collaborators
                        .wallet
                        .create_deposit(request, self.inbox.clone());
                }
                Effect::Persist(handshake) => {
                    if let Err(e) = self.collaborators.recovery.persist(&handshake) {
                        log::error!("[{}] Failed persisting recovery checkpoint: {}", id, e);
                        raised.push_back(Event::CheckpointFailed(e.to_string()));
                        break;
                    }
                }
                Effect::WatchMultisigKeys(keys) => {
                    self.collaborators.blockchain.watch_multisig_keys(keys)
                }
                Effect::WatchConfirmation {
                    txid,
                    required_depth,
                } => {
                    log::info!("[{}] Watching commitment {}", id, txid);
                    self.collaborators.blockchain.watch_transaction_confirmation(
                        txid,
                        required_depth,
                        self.inbox.clone(),
                    );
                }
                Effect::RetrieveTransaction(txid) => self
                    .collaborators
                    .blockchain
                    .retrieve_transaction(txid, self.inbox.clone()),
                Effect::Finish(result) => self.finish(result),
            }
        }
        raised
    }

    fn forward(&self, forwarding: Forwarding) -> std::io::Result<RetryForwarder<Event>> {
        let own_key = self.own_key;
        let to = forwarding.to.clone();
        let message = forwarding.message.clone();
        RetryForwarder::start(
            self.collaborators.gateway.clone(),
            to,
            message,
            self.config.resubmit_interval(),
            move |from, message| forwarding.accept(&own_key, from, message),
        )
    }

    /// The single termination path.
    fn finish(&mut self, result: HandshakeResult) {
        if self.finished {
            return;
        }
        self.finished = true;

        self.forwarder = None;
        self.deadline = None;
        self.signer.stop();
        self.collaborators.gateway.unsubscribe(&self.ctx.exchange_id);

        match result.cause() {
            None => log::info!("[{}] Handshake succeeded", self.ctx.exchange_id),
            Some(cause) => log::warn!("[{}] Handshake failed: {}", self.ctx.exchange_id, cause),
        }
        self.collaborators.listener.on_result(result);
    }
}
