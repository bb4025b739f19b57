//! Signs the counterpart's refund requests while the handshake allows it.
//!
//! The signer runs on its own thread so that a request is answered without waiting
//! for whatever the handshake is busy with. It is armed with the handshaking exchange
//! once the counterpart keys are known, armed again with our own deposit once it exists,
//! and stopped for good before any commitment can be broadcast.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering::Relaxed},
        mpsc::{self, Sender},
        Arc,
    },
    thread::{self, JoinHandle},
};

use bitcoin::{secp256k1::SecretKey, Transaction, Txid};

use crate::{
    collaborators::MessageGateway,
    exchange::{Exchange, ExchangeId, PeerId},
    protocol::{
        contract::sign_counterpart_refund,
        messages::{RefundSignatureResponse, WireMessage},
    },
};

enum SignerCommand {
    Arm(Exchange, Option<Txid>),
    Sign(Transaction),
    Stop,
}

pub struct RefundCounterSigner {
    exchange_id: ExchangeId,
    commands: Option<Sender<SignerCommand>>,
    stopped: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl RefundCounterSigner {
    pub fn spawn(
        exchange_id: ExchangeId,
        own_key: SecretKey,
        counterpart: PeerId,
        gateway: Arc<dyn MessageGateway>,
    ) -> io::Result<Self> {
        let (commands, inbox) = mpsc::channel();
        let stopped = Arc::new(AtomicBool::new(false));

        let id = exchange_id.clone();
        let stopped_clone = stopped.clone();
        let thread = thread::Builder::new()
            .name(format!("refund signer {}", exchange_id))
            .spawn(move || {
                let mut exchange: Option<Exchange> = None;
                let mut own_deposit: Option<Txid> = None;
                while let Ok(command) = inbox.recv() {
                    match command {
                        SignerCommand::Arm(armed, deposit) => {
                            exchange = Some(armed);
                            own_deposit = deposit;
                        }
                        SignerCommand::Sign(_) if stopped_clone.load(Relaxed) => {
                            log::warn!("[{}] Refusing refund signature, signer stopped", id);
                        }
                        SignerCommand::Sign(refund_tx) => match &exchange {
                            Some(exchange) => answer(
                                gateway.as_ref(),
                                exchange,
                                own_deposit.as_ref(),
                                &own_key,
                                &counterpart,
                                &refund_tx,
                            ),
                            None => {
                                log::debug!("[{}] Refund request before peer handshake, ignored", id)
                            }
                        },
                        SignerCommand::Stop => break,
                    }
                }
                log::debug!("[{}] Refund signer stopped", id);
            })?;

        Ok(Self {
            exchange_id,
            commands: Some(commands),
            stopped,
            thread: Some(thread),
        })
    }

    /// Start answering requests for `exchange`. Refunds spending `own_deposit` are refused.
    pub fn arm(&self, exchange: Exchange, own_deposit: Option<Txid>) {
        self.command(SignerCommand::Arm(exchange, own_deposit));
    }

    pub fn sign(&self, refund_tx: Transaction) {
        self.command(SignerCommand::Sign(refund_tx));
    }

    pub fn is_running(&self) -> bool {
        !self.stopped.load(Relaxed)
    }

    /// Stop signing. Requests still queued are refused. Calling it again is a no-op.
    pub fn stop(&mut self) {
        self.stopped.store(true, Relaxed);
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(SignerCommand::Stop);
        }
        if let Some(thread) = self.thread.take() {
            if let Err(e) = thread.join() {
                log::error!("[{}] Error {:?} while joining refund signer", self.exchange_id, e);
            }
        }
    }

    fn command(&self, command: SignerCommand) {
        if let Some(commands) = &self.commands {
            let _ = commands.send(command);
        }
    }
}

impl Drop for RefundCounterSigner {
    fn drop(&mut self) {
        self.stop();
    }
}

fn answer(
    gateway: &dyn MessageGateway,
    exchange: &Exchange,
    own_deposit: Option<&Txid>,
    own_key: &SecretKey,
    counterpart: &PeerId,
    refund_tx: &Transaction,
) {
    let signature = match sign_counterpart_refund(exchange, own_deposit, own_key, refund_tx) {
        Ok(signature) => signature,
        Err(e) => {
            log::warn!("[{}] Refusing to sign counterpart refund: {}", exchange.id, e);
            return;
        }
    };
    let response = WireMessage::RefundSignatureResponse(RefundSignatureResponse {
        exchange_id: exchange.id.clone(),
        signature,
    });
    log::info!("[{}] ===> {} to {}", exchange.id, response, counterpart);
    if let Err(e) = gateway.send(counterpart, response) {
        log::warn!("[{}] Failed sending refund signature: {}", exchange.id, e);
    }
}
