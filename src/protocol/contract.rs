//! Deposit and refund transaction scripts.
//!
//! Each party funds its own deposit into a 2-of-2 multisig of both parties' keys.
//! The matching refund spends that output back to its owner after the refund lock time,
//! and needs a signature from both keys to be valid.

use bitcoin::{
    absolute::LockTime,
    hashes::Hash,
    opcodes::all,
    script::{Builder, Script},
    secp256k1::{ecdsa::Signature, Message, Secp256k1, SecretKey},
    sighash::{EcdsaSighashType, SighashCache},
    transaction::Version,
    Amount, OutPoint, PublicKey, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};

use crate::exchange::Exchange;

use super::error::ContractError;

pub fn create_multisig_redeemscript(key1: &PublicKey, key2: &PublicKey) -> ScriptBuf {
    let builder = Builder::new().push_opcode(all::OP_PUSHNUM_2);
    if key1.inner.serialize()[..] < key2.inner.serialize()[..] {
        builder.push_key(key1).push_key(key2)
    } else {
        builder.push_key(key2).push_key(key1)
    }
    .push_opcode(all::OP_PUSHNUM_2)
    .push_opcode(all::OP_CHECKMULTISIG)
    .into_script()
}

/// Convert a redeemscript into p2wsh scriptpubkey.
pub fn redeemscript_to_scriptpubkey(redeemscript: &Script) -> ScriptBuf {
    ScriptBuf::new_p2wsh(&redeemscript.wscript_hash())
}

/// The deposit multisig redeemscript of a handshaking exchange.
pub fn exchange_multisig_redeemscript(exchange: &Exchange) -> Result<ScriptBuf, ContractError> {
    let participants = exchange
        .participants()
        .ok_or(ContractError::Protocol("counterpart keys not known yet"))?;
    Ok(create_multisig_redeemscript(
        &participants.buyer.bitcoin_key,
        &participants.seller.bitcoin_key,
    ))
}

/// Index of the output paying to the given multisig.
pub fn find_deposit_output_index(
    deposit: &Transaction,
    multisig_redeemscript: &Script,
) -> Result<u32, ContractError> {
    let multisig_spk = redeemscript_to_scriptpubkey(multisig_redeemscript);
    deposit
        .output
        .iter()
        .position(|o| o.script_pubkey == multisig_spk)
        .map(|index| index as u32)
        .ok_or(ContractError::Protocol(
            "deposit doesn't pay to the exchange multisig",
        ))
}

/// Build the unsigned refund of our own deposit.
pub fn create_refund_tx(
    exchange: &Exchange,
    deposit: &Transaction,
) -> Result<Transaction, ContractError> {
    let redeemscript = exchange_multisig_redeemscript(exchange)?;
    let vout = find_deposit_output_index(deposit, &redeemscript)?;
    let deposit_value = deposit.output[vout as usize].value;
    if deposit_value != exchange.own_deposit_amount() {
        return Err(ContractError::Protocol(
            "deposit output doesn't lock the agreed amount",
        ));
    }
    if exchange.own_refund_amount() > deposit_value {
        return Err(ContractError::Protocol("refund exceeds the deposit"));
    }

    Ok(Transaction {
        version: Version::TWO,
        lock_time: LockTime::from_consensus(exchange.refund_lock_time),
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: deposit.compute_txid(),
                vout,
            },
            script_sig: ScriptBuf::new(),
            // Non final, so the lock time is enforced.
            sequence: Sequence::ENABLE_LOCKTIME_NO_RBF,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: exchange.own_refund_amount(),
            script_pubkey: ScriptBuf::new_p2pkh(&exchange.own.bitcoin_key.pubkey_hash()),
        }],
    })
}

fn refund_sighash(
    refund_tx: &Transaction,
    multisig_redeemscript: &Script,
    deposit_value: Amount,
) -> Result<Message, ContractError> {
    let input_index = 0;
    let sighash = SighashCache::new(refund_tx)
        .p2wsh_signature_hash(
            input_index,
            multisig_redeemscript,
            deposit_value,
            EcdsaSighashType::All,
        )
        .map_err(|e| ContractError::Sighash(e.to_string()))?;
    Ok(Message::from_digest(sighash.to_byte_array()))
}

pub fn sign_refund_tx(
    refund_tx: &Transaction,
    multisig_redeemscript: &Script,
    deposit_value: Amount,
    privkey: &SecretKey,
) -> Result<Signature, ContractError> {
    let sighash = refund_sighash(refund_tx, multisig_redeemscript, deposit_value)?;
    let secp = Secp256k1::new();
    Ok(secp.sign_ecdsa(&sighash, privkey))
}

pub fn verify_refund_sig(
    refund_tx: &Transaction,
    multisig_redeemscript: &Script,
    deposit_value: Amount,
    pubkey: &PublicKey,
    sig: &Signature,
) -> Result<(), ContractError> {
    let sighash = refund_sighash(refund_tx, multisig_redeemscript, deposit_value)?;
    let secp = Secp256k1::new();
    Ok(secp.verify_ecdsa(&sighash, sig, &pubkey.inner)?)
}

pub fn apply_two_signatures_to_2of2_multisig_spend(
    key1: &PublicKey,
    key2: &PublicKey,
    sig1: &Signature,
    sig2: &Signature,
    input: &mut TxIn,
    redeemscript: &Script,
) {
    // Signatures go in the same order as the keys in the redeemscript.
    let (sig_first, sig_second) = if key1.inner.serialize()[..] < key2.inner.serialize()[..] {
        (sig1, sig2)
    } else {
        (sig2, sig1)
    };

    let mut sig1_with_sighash = sig_first.serialize_der().to_vec();
    sig1_with_sighash.push(EcdsaSighashType::All as u8);

    let mut sig2_with_sighash = sig_second.serialize_der().to_vec();
    sig2_with_sighash.push(EcdsaSighashType::All as u8);

    input.witness = Witness::new();
    input.witness.push(Vec::new()); //first is multisig dummy
    input.witness.push(sig1_with_sighash);
    input.witness.push(sig2_with_sighash);
    input.witness.push(redeemscript.to_bytes());
}

/// Checks that a refund the counterpart asks us to sign belongs to this exchange.
///
/// Both deposits lock into the same multisig, so a refund is also refused when it spends
/// `own_deposit`, once we know it.
pub fn validate_counterpart_refund(
    exchange: &Exchange,
    own_deposit: Option<&Txid>,
    refund_tx: &Transaction,
) -> Result<(), ContractError> {
    let counterpart = exchange
        .counterpart
        .as_ref()
        .ok_or(ContractError::Protocol("exchange is not handshaking yet"))?;
    if refund_tx.input.len() != 1 || refund_tx.output.len() != 1 {
        return Err(ContractError::Protocol(
            "invalid number of inputs or outputs in refund transaction",
        ));
    }
    if Some(&refund_tx.input[0].previous_output.txid) == own_deposit {
        return Err(ContractError::Protocol("refund spends our own deposit"));
    }
    if refund_tx.lock_time != LockTime::from_consensus(exchange.refund_lock_time) {
        return Err(ContractError::Protocol("refund lock time doesn't match"));
    }
    let expected = *exchange.amounts.refunds.get(exchange.role.counterpart());
    if refund_tx.output[0].value != expected {
        return Err(ContractError::Protocol("refund amount doesn't match"));
    }
    let counterpart_spk = ScriptBuf::new_p2pkh(&counterpart.bitcoin_key.pubkey_hash());
    if refund_tx.output[0].script_pubkey != counterpart_spk {
        return Err(ContractError::Protocol("refund doesn't pay to the counterpart"));
    }
    Ok(())
}

/// Validate the counterpart's refund and produce our signature for it.
pub fn sign_counterpart_refund(
    exchange: &Exchange,
    own_deposit: Option<&Txid>,
    own_key: &SecretKey,
    refund_tx: &Transaction,
) -> Result<Signature, ContractError> {
    validate_counterpart_refund(exchange, own_deposit, refund_tx)?;
    let redeemscript = exchange_multisig_redeemscript(exchange)?;
    let counterpart_deposit = *exchange.amounts.deposits.get(exchange.role.counterpart());
    sign_refund_tx(refund_tx, &redeemscript, counterpart_deposit, own_key)
}
