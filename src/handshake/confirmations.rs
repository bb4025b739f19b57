//! Tracks both commitment transactions until they are buried deep enough.
//!
//! Progress is the set of commitment ids still pending, not a count of events, so
//! repeated or out of order confirmation updates can't complete the handshake early.

use std::collections::BTreeSet;

use bitcoin::{Transaction, Txid};

use crate::exchange::{Both, Role};

/// What the handshake must do after a blockchain update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Progress {
    /// Nothing changed, or some commitment still lacks depth.
    Pending,
    /// Both commitments reached depth. Their transactions must be retrieved.
    Confirmed(Vec<Txid>),
    /// Both confirmed transactions are at hand.
    Retrieved(Both<Transaction>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationTracker {
    commitment_ids: Both<Txid>,
    required_depth: u32,
    pending: BTreeSet<Txid>,
    retrieved: Both<Option<Transaction>>,
}

impl ConfirmationTracker {
    pub(crate) fn new(commitment_ids: Both<Txid>, required_depth: u32) -> Self {
        Self {
            commitment_ids,
            required_depth,
            pending: commitment_ids.into_vec().into_iter().collect(),
            retrieved: Both::new(None, None),
        }
    }

    /// Ids to watch, buyer first.
    pub(crate) fn watched(&self) -> Vec<Txid> {
        let mut ids = self.commitment_ids.into_vec();
        ids.dedup();
        ids
    }

    pub fn commitment_ids(&self) -> &Both<Txid> {
        &self.commitment_ids
    }

    pub(crate) fn required_depth(&self) -> u32 {
        self.required_depth
    }

    pub(crate) fn is_commitment(&self, txid: &Txid) -> bool {
        self.commitment_ids.buyer == *txid || self.commitment_ids.seller == *txid
    }

    /// Whether `txid` is the commitment of `role`.
    pub(crate) fn belongs_to(&self, txid: &Txid, role: Role) -> bool {
        self.commitment_ids.get(role) == txid
    }

    pub(crate) fn on_confirmed(&mut self, txid: &Txid, depth: u32) -> Progress {
        if depth < self.required_depth || !self.pending.remove(txid) {
            return Progress::Pending;
        }
        if self.pending.is_empty() {
            Progress::Confirmed(self.watched())
        } else {
            Progress::Pending
        }
    }

    /// A retrieved transaction. Only counts once every commitment is confirmed.
    pub(crate) fn on_found(&mut self, tx: Transaction) -> Progress {
        if !self.pending.is_empty() {
            return Progress::Pending;
        }
        let txid = tx.compute_txid();
        if txid == self.commitment_ids.buyer {
            self.retrieved.buyer = Some(tx.clone());
        }
        if txid == self.commitment_ids.seller {
            self.retrieved.seller = Some(tx);
        }
        match (&self.retrieved.buyer, &self.retrieved.seller) {
            (Some(buyer), Some(seller)) => {
                Progress::Retrieved(Both::new(buyer.clone(), seller.clone()))
            }
            _ => Progress::Pending,
        }
    }
}
