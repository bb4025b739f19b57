//! Exchange data model shared by the handshake, the wire messages and the collaborators.
//!
//! An [Exchange] is an immutable snapshot. Progressing the exchange (learning the
//! counterpart's keys) produces a new snapshot rather than mutating the old one.

use std::fmt::Display;

use bitcoin::{
    secp256k1::{self, Secp256k1, SecretKey},
    Amount, PublicKey,
};
use serde::{Deserialize, Serialize};

/// Unique identifier of one exchange. At most one live handshake exists per id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExchangeId(String);

impl ExchangeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ExchangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Network identity of a party or of the broker, as understood by the message gateway.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Side of the exchange. Fixed for the whole lifetime of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Buyer,
    Seller,
}

impl Role {
    pub fn counterpart(self) -> Role {
        match self {
            Role::Buyer => Role::Seller,
            Role::Seller => Role::Buyer,
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Buyer => write!(f, "buyer"),
            Role::Seller => write!(f, "seller"),
        }
    }
}

/// A pair of values keyed by [Role].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Both<T> {
    pub buyer: T,
    pub seller: T,
}

impl<T> Both<T> {
    pub fn new(buyer: T, seller: T) -> Self {
        Self { buyer, seller }
    }

    /// Builds the pair from the point of view of `role`.
    pub fn from_perspective(role: Role, own: T, counterpart: T) -> Self {
        match role {
            Role::Buyer => Self::new(own, counterpart),
            Role::Seller => Self::new(counterpart, own),
        }
    }

    pub fn get(&self, role: Role) -> &T {
        match role {
            Role::Buyer => &self.buyer,
            Role::Seller => &self.seller,
        }
    }

    pub fn map<U>(self, mut f: impl FnMut(T) -> U) -> Both<U> {
        Both {
            buyer: f(self.buyer),
            seller: f(self.seller),
        }
    }

    /// Buyer first, then seller.
    pub fn into_vec(self) -> Vec<T> {
        vec![self.buyer, self.seller]
    }
}

/// Public information of one party.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Account used by the payment processor for the value transfer phase.
    pub payment_account: String,
    /// Key used in the 2-of-2 deposit multisig.
    pub bitcoin_key: PublicKey,
}

/// Amounts agreed for the exchange, before any network interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeAmounts {
    /// Value locked in each party's multisig deposit output.
    pub deposits: Both<Amount>,
    /// Value each party gets back through its refund transaction.
    pub refunds: Both<Amount>,
    /// Mining fee paid by each deposit transaction.
    pub transaction_fee: Amount,
}

/// Snapshot of an exchange as seen from one party.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    pub id: ExchangeId,
    pub role: Role,
    pub counterpart_id: PeerId,
    pub own: PeerInfo,
    /// Known once the peer handshake has completed.
    pub counterpart: Option<PeerInfo>,
    pub amounts: ExchangeAmounts,
    /// Absolute block height after which refunds become valid.
    pub refund_lock_time: u32,
}

impl Exchange {
    pub fn new(
        id: ExchangeId,
        role: Role,
        counterpart_id: PeerId,
        own: PeerInfo,
        amounts: ExchangeAmounts,
        refund_lock_time: u32,
    ) -> Self {
        Self {
            id,
            role,
            counterpart_id,
            own,
            counterpart: None,
            amounts,
            refund_lock_time,
        }
    }

    /// New snapshot, with the counterpart's information merged in.
    pub fn handshaking(&self, counterpart: PeerInfo) -> Self {
        Self {
            counterpart: Some(counterpart),
            ..self.clone()
        }
    }

    pub fn is_handshaking(&self) -> bool {
        self.counterpart.is_some()
    }

    /// Both parties' information, keyed by role.
    pub fn participants(&self) -> Option<Both<&PeerInfo>> {
        self.counterpart
            .as_ref()
            .map(|counterpart| Both::from_perspective(self.role, &self.own, counterpart))
    }

    /// Keys that must sign any spend of a deposit. Buyer first.
    pub fn required_signing_keys(&self) -> Option<Vec<PublicKey>> {
        self.participants()
            .map(|p| p.map(|info| info.bitcoin_key).into_vec())
    }

    pub fn own_deposit_amount(&self) -> Amount {
        *self.amounts.deposits.get(self.role)
    }

    pub fn own_refund_amount(&self) -> Amount {
        *self.amounts.refunds.get(self.role)
    }
}

/// Own identity of the party running a handshake. Never persisted.
#[derive(Debug, Clone)]
pub struct OwnIdentity {
    pub peer: PeerInfo,
    pub multisig_key: SecretKey,
}

impl OwnIdentity {
    /// Builds the identity, deriving the public key from `multisig_key`.
    pub fn new(payment_account: impl Into<String>, multisig_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let bitcoin_key = PublicKey::new(secp256k1::PublicKey::from_secret_key(
            &secp,
            &multisig_key,
        ));
        Self {
            peer: PeerInfo {
                payment_account: payment_account.into(),
                bitcoin_key,
            },
            multisig_key,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::{fixtures::*, *};

    #[test]
    fn test_both_from_perspective() {
        let both = Both::from_perspective(Role::Seller, "own", "other");
        assert_eq!(both.buyer, "other");
        assert_eq!(both.seller, "own");
        assert_eq!(*both.get(Role::Seller), "own");
    }

    #[test]
    fn test_handshaking_merges_counterpart() {
        let exchange = buyer_exchange();
        assert!(!exchange.is_handshaking());
        assert!(exchange.required_signing_keys().is_none());

        let handshaking = exchange.handshaking(seller_identity().peer);
        assert!(handshaking.is_handshaking());
        // The old snapshot is untouched.
        assert!(!exchange.is_handshaking());

        let keys = handshaking.required_signing_keys().unwrap();
        assert_eq!(
            keys,
            vec![
                buyer_identity().peer.bitcoin_key,
                seller_identity().peer.bitcoin_key
            ]
        );
        // Same ordering from the other side.
        assert_eq!(
            handshaking_seller_exchange().required_signing_keys().unwrap(),
            keys
        );
    }

    #[test]
    fn test_role_amounts() {
        let buyer = buyer_exchange();
        let seller = seller_exchange();
        assert_eq!(buyer.own_deposit_amount(), Amount::from_sat(200_000));
        assert_eq!(seller.own_deposit_amount(), Amount::from_sat(1_100_000));
        assert_eq!(seller.own_refund_amount(), Amount::from_sat(1_000_000));
        assert_eq!(Role::Buyer.counterpart(), Role::Seller);
    }
}
