use crate::domain::Pledge;
use bitcoin::{OutPoint, Transaction, Txid};
use std::collections::HashSet;

/// Wallet-reported confidence of a transaction. Confidence can fall as
/// well as rise (double spend, reorg); callers must handle both ways.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxConfidence {
    Pending { broadcast_peers: usize },
    Building { depth: u64 },
    Dead { overridden_by: Option<Txid> },
    Unknown,
}

/// What a confidence reading means for a claim transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClaimSignal {
    /// Propagated widely enough or mined: treat the project as claimed.
    Claimed,
    /// Double spent or reorged out.
    Dead,
    /// Nothing to act on yet.
    Ignore,
}

pub fn evaluate_confidence(confidence: &TxConfidence, min_broadcast_peers: usize) -> ClaimSignal {
    match confidence {
        TxConfidence::Pending { broadcast_peers } => {
            if *broadcast_peers >= min_broadcast_peers {
                ClaimSignal::Claimed
            } else {
                ClaimSignal::Ignore
            }
        }
        TxConfidence::Building { .. } => ClaimSignal::Claimed,
        TxConfidence::Dead { .. } => ClaimSignal::Dead,
        TxConfidence::Unknown => ClaimSignal::Ignore,
    }
}

/// True when every outpoint the pledge contributes appears among the
/// claim's inputs.
pub fn pledge_appears_in_claim(pledge: &Pledge, claim: &Transaction) -> bool {
    let claim_inputs: HashSet<OutPoint> = claim.input.iter().map(|input| input.previous_output).collect();
    let mut outpoints = pledge.outpoints().peekable();
    if outpoints.peek().is_none() {
        return false;
    }
    outpoints.all(|outpoint| claim_inputs.contains(&outpoint))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::ProjectId;
    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, ScriptBuf, Sequence, TxIn, TxOut, Witness};

    fn outpoint(byte: u8) -> OutPoint {
        OutPoint::new(Txid::from_byte_array([byte; 32]), 0)
    }

    fn tx_spending(outpoints: &[OutPoint]) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: outpoints
                .iter()
                .map(|outpoint| TxIn {
                    previous_output: *outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                })
                .collect(),
            output: vec![TxOut { value: Amount::from_sat(1_000), script_pubkey: ScriptBuf::new() }],
        }
    }

    #[test]
    fn confidence_table() {
        assert_eq!(evaluate_confidence(&TxConfidence::Pending { broadcast_peers: 1 }, 2), ClaimSignal::Ignore);
        assert_eq!(evaluate_confidence(&TxConfidence::Pending { broadcast_peers: 2 }, 2), ClaimSignal::Claimed);
        assert_eq!(evaluate_confidence(&TxConfidence::Building { depth: 1 }, 2), ClaimSignal::Claimed);
        assert_eq!(evaluate_confidence(&TxConfidence::Dead { overridden_by: None }, 2), ClaimSignal::Dead);
        assert_eq!(evaluate_confidence(&TxConfidence::Unknown, 2), ClaimSignal::Ignore);
    }

    #[test]
    fn pledge_appears_when_all_inputs_are_claimed() {
        let pledge = Pledge::new(ProjectId::new([7; 32]), vec![], tx_spending(&[outpoint(1), outpoint(2)]), Amount::from_sat(1_000));
        let claim = tx_spending(&[outpoint(1), outpoint(2), outpoint(3)]);
        assert!(pledge_appears_in_claim(&pledge, &claim));

        let partial_claim = tx_spending(&[outpoint(1), outpoint(3)]);
        assert!(!pledge_appears_in_claim(&pledge, &partial_claim));
    }
}
