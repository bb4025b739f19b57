//! The handshake value and the result of a handshake.

use std::fmt::Display;

use bitcoin::{
    secp256k1::{ecdsa::Signature, SecretKey},
    Transaction, Txid,
};
use serde::{Deserialize, Serialize};

use crate::{
    exchange::{Both, Exchange},
    protocol::{
        contract::{
            apply_two_signatures_to_2of2_multisig_spend, create_refund_tx,
            exchange_multisig_redeemscript, sign_refund_tx, verify_refund_sig,
        },
        error::ContractError,
    },
};

/// A handshaking exchange together with our funded deposit and its unsigned refund.
///
/// This is the recovery checkpoint: once it exists, the deposit is funded and the
/// handshake can resume at the refund signature exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub exchange: Exchange,
    pub own_deposit: Transaction,
    pub unsigned_refund: Transaction,
}

impl Handshake {
    /// Build the refund template for a freshly created deposit.
    pub fn new(exchange: Exchange, own_deposit: Transaction) -> Result<Self, ContractError> {
        let unsigned_refund = create_refund_tx(&exchange, &own_deposit)?;
        Ok(Self {
            exchange,
            own_deposit,
            unsigned_refund,
        })
    }

    /// Apply the counterpart's signature to our refund template.
    ///
    /// Fails if the signature doesn't sign this template with the counterpart's key.
    /// Otherwise returns the refund signed by both parties, ready for broadcast.
    pub fn sign_own_refund(
        &self,
        own_key: &SecretKey,
        counterpart_signature: &Signature,
    ) -> Result<Transaction, ContractError> {
        let counterpart_key = self
            .exchange
            .counterpart
            .as_ref()
            .map(|c| c.bitcoin_key)
            .ok_or(ContractError::Protocol("counterpart keys not known yet"))?;
        let redeemscript = exchange_multisig_redeemscript(&self.exchange)?;
        let deposit_value = self.exchange.own_deposit_amount();

        verify_refund_sig(
            &self.unsigned_refund,
            &redeemscript,
            deposit_value,
            &counterpart_key,
            counterpart_signature,
        )?;
        let own_signature =
            sign_refund_tx(&self.unsigned_refund, &redeemscript, deposit_value, own_key)?;

        let mut signed = self.unsigned_refund.clone();
        apply_two_signatures_to_2of2_multisig_spend(
            &self.exchange.own.bitcoin_key,
            &counterpart_key,
            &own_signature,
            counterpart_signature,
            &mut signed.input[0],
            &redeemscript,
        );
        Ok(signed)
    }
}

/// Why a handshake failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// No valid refund signature before the deadline.
    RefundSignatureTimeout,
    /// The broker aborted the exchange.
    Aborted(String),
    /// The wallet couldn't create our deposit.
    DepositCreation(String),
    /// The wallet created a deposit we can't build a refund for.
    InvalidDeposit(String),
    /// The recovery checkpoint couldn't be written.
    Checkpoint(String),
    /// A commitment transaction was rejected by the network.
    CommitmentRejected { txid: Txid, own: bool },
    /// A confirmed commitment couldn't be retrieved.
    CommitmentNotFound(Txid),
    /// The handshake stopped receiving events.
    Interrupted,
}

impl Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RefundSignatureTimeout => write!(f, "timeout waiting for refund signature"),
            Self::Aborted(reason) => write!(f, "exchange aborted by the broker: {}", reason),
            Self::DepositCreation(e) => write!(f, "cannot create deposit: {}", e),
            Self::InvalidDeposit(e) => write!(f, "invalid deposit: {}", e),
            Self::Checkpoint(e) => write!(f, "cannot persist recovery checkpoint: {}", e),
            Self::CommitmentRejected { txid, own: true } => {
                write!(f, "own commitment {} rejected", txid)
            }
            Self::CommitmentRejected { txid, own: false } => {
                write!(f, "counterpart commitment {} rejected", txid)
            }
            Self::CommitmentNotFound(txid) => write!(f, "commitment {} not found", txid),
            Self::Interrupted => write!(f, "handshake interrupted"),
        }
    }
}

/// Terminal result of a handshake, reported exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeResult {
    Success {
        exchange: Exchange,
        commitments: Both<Transaction>,
        refund: Transaction,
    },
    Failure {
        cause: FailureCause,
    },
    /// Failure once both deposits were published. The refund is fully signed.
    FailureWithCommitment {
        exchange: Exchange,
        cause: FailureCause,
        own_deposit: Option<Transaction>,
        refund: Transaction,
    },
}

impl HandshakeResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn cause(&self) -> Option<&FailureCause> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { cause } | Self::FailureWithCommitment { cause, .. } => Some(cause),
        }
    }
}
