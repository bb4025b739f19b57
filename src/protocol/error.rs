//! Errors raised while building, validating or signing exchange transactions.

use bitcoin::secp256k1;

#[derive(Debug)]
pub enum ContractError {
    Secp(secp256k1::Error),
    Protocol(&'static str),
    Sighash(String),
}

impl std::fmt::Display for ContractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Secp(e) => write!(f, "secp256k1 error: {}", e),
            Self::Protocol(msg) => write!(f, "{}", msg),
            Self::Sighash(msg) => write!(f, "sighash error: {}", msg),
        }
    }
}

impl std::error::Error for ContractError {}

impl From<secp256k1::Error> for ContractError {
    fn from(value: secp256k1::Error) -> Self {
        Self::Secp(value)
    }
}
