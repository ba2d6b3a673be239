use crate::domain::{Pledge, Project};
use crate::foundation::constants::MAX_PLEDGE_DEPENDENCIES;
use crate::foundation::{BackendError, Result};
use bitcoin::blockdata::script::Instruction;
use bitcoin::hashes::{hash160, sha256, Hash};
use bitcoin::sighash::EcdsaSighashType;
use bitcoin::{Amount, OutPoint, Script, ScriptBuf, TxIn};
use std::collections::{HashMap, HashSet};

/// One entry of a UTXO snapshot, as reported by the quorum of peers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UtxoEntry {
    pub value: Amount,
    pub script_pubkey: ScriptBuf,
}

/// Outpoint -> entry; an absent key means spent or never existed.
pub type UtxoSnapshot = HashMap<OutPoint, UtxoEntry>;

/// Stateless structural checks: cheap enough to run on any thread, strict
/// enough that a pledge passing them can be priced by its UTXO lookups.
pub fn fast_sanity_check(pledge: &Pledge) -> Result<()> {
    if pledge.dependencies().len() > MAX_PLEDGE_DEPENDENCIES {
        return Err(BackendError::TooManyDependencies { count: pledge.dependencies().len(), max: MAX_PLEDGE_DEPENDENCIES });
    }
    if pledge.pledge_tx().input.is_empty() {
        return Err(BackendError::BadFormat("pledge transaction has no inputs".to_string()));
    }

    let mut seen = HashSet::new();
    for tx in pledge.transactions() {
        for input in &tx.input {
            if !seen.insert(input.previous_output) {
                return Err(BackendError::DuplicatedOutPoint { outpoint: input.previous_output });
            }
        }
    }

    // Every dependency must be consumed by the pledge tx or a later
    // dependency; anything else is dead weight a submitter should not ship.
    let deps = pledge.dependencies();
    for (index, dep) in deps.iter().enumerate() {
        let dep_id = dep.compute_txid();
        let spent = pledge
            .pledge_tx()
            .input
            .iter()
            .chain(deps[index + 1..].iter().flat_map(|tx| tx.input.iter()))
            .any(|input| input.previous_output.txid == dep_id);
        if !spent {
            return Err(BackendError::BadFormat(format!("dependency {dep_id} is not spent by the pledge")));
        }
    }

    for (index, input) in pledge.pledge_tx().input.iter().enumerate() {
        let flags = signature_flags(input);
        if flags.is_empty() {
            return Err(BackendError::BadFormat(format!("pledge input {index} carries no signature")));
        }
        let expected = EcdsaSighashType::AllPlusAnyoneCanPay.to_u32() as u8;
        for flag in flags {
            if flag != expected {
                return Err(BackendError::BadFormat(format!(
                    "pledge input {index} signed with sighash 0x{flag:02x}, expected ALL|ANYONECANPAY"
                )));
            }
        }
    }

    Ok(())
}

/// Full verification of a pledge against a UTXO snapshot and the project's
/// rules. An `UnknownUtxo` result means revoked-or-never-existed, which is
/// a normal pledge exit rather than a check failure.
pub fn verify_pledge(project: &Project, pledge: &Pledge, snapshot: &UtxoSnapshot) -> Result<()> {
    fast_sanity_check(pledge)?;

    let mut total = Amount::ZERO;
    for input in &pledge.pledge_tx().input {
        let outpoint = input.previous_output;
        let entry = snapshot.get(&outpoint).ok_or(BackendError::UnknownUtxo { outpoint })?;
        if let Some(details) = spender_script_mismatch(input, &entry.script_pubkey) {
            return Err(BackendError::ScriptMismatch { outpoint, details });
        }
        total = total
            .checked_add(entry.value)
            .ok_or_else(|| BackendError::BadFormat("input values overflow".to_string()))?;
    }

    if total != pledge.total_input_value() {
        return Err(BackendError::ValueMismatch { claimed: pledge.total_input_value().to_sat(), actual: total.to_sat() });
    }
    if pledge.total_input_value() > project.goal_amount() {
        return Err(BackendError::GoalExceeded { pledged: pledge.total_input_value().to_sat(), goal: project.goal_amount().to_sat() });
    }

    Ok(())
}

/// Sighash flags of every signature-shaped blob carried by the input, from
/// both the script-sig pushes and the witness stack.
fn signature_flags(input: &TxIn) -> Vec<u8> {
    let mut flags = Vec::new();
    for push in script_pushes(&input.script_sig) {
        if let Some(flag) = der_signature_flag(&push) {
            flags.push(flag);
        }
    }
    for item in input.witness.iter() {
        if let Some(flag) = der_signature_flag(item) {
            flags.push(flag);
        }
    }
    flags
}

// DER ECDSA signature plus one sighash byte: 0x30 sequence tag, plausible
// total length.
fn der_signature_flag(blob: &[u8]) -> Option<u8> {
    if blob.len() < 9 || blob.len() > 73 || blob[0] != 0x30 {
        return None;
    }
    blob.last().copied()
}

fn script_pushes(script: &Script) -> Vec<Vec<u8>> {
    let mut pushes = Vec::new();
    for instruction in script.instructions() {
        if let Ok(Instruction::PushBytes(bytes)) = instruction {
            pushes.push(bytes.as_bytes().to_vec());
        }
    }
    pushes
}

/// Structural check that the input plausibly spends the given UTXO script.
/// Returns a description of the mismatch, or `None` when the shapes line
/// up (or the script kind is one we cannot check without executing it).
fn spender_script_mismatch(input: &TxIn, script: &Script) -> Option<String> {
    let bytes = script.as_bytes();
    if script.is_p2pkh() {
        let pushes = script_pushes(&input.script_sig);
        let Some(pubkey) = pushes.last() else {
            return Some("script-sig has no pushes for a p2pkh output".to_string());
        };
        if hash160::Hash::hash(pubkey).to_byte_array() != bytes[3..23] {
            return Some("pubkey does not hash to the p2pkh output".to_string());
        }
    } else if script.is_p2sh() {
        let pushes = script_pushes(&input.script_sig);
        let Some(redeem) = pushes.last() else {
            return Some("script-sig has no pushes for a p2sh output".to_string());
        };
        if hash160::Hash::hash(redeem).to_byte_array() != bytes[2..22] {
            return Some("redeem script does not hash to the p2sh output".to_string());
        }
    } else if script.is_p2wpkh() {
        if input.witness.len() != 2 {
            return Some(format!("p2wpkh spend needs 2 witness items, found {}", input.witness.len()));
        }
        let pubkey = input.witness.iter().last().unwrap_or_default();
        if hash160::Hash::hash(pubkey).to_byte_array() != bytes[2..22] {
            return Some("witness pubkey does not hash to the p2wpkh program".to_string());
        }
    } else if script.is_p2wsh() {
        let Some(witness_script) = input.witness.iter().last() else {
            return Some("p2wsh spend has an empty witness".to_string());
        };
        if sha256::Hash::hash(witness_script).to_byte_array() != bytes[2..34] {
            return Some("witness script does not hash to the p2wsh program".to_string());
        }
    }
    None
}
