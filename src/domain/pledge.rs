use crate::foundation::{PledgeHash, ProjectId, Result};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::{Amount, OutPoint, Transaction};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A partial, off-chain signed contribution toward a project's goal.
///
/// The pledge transaction is signed so that further inputs and outputs can
/// be appended; `dependencies` are unconfirmed transactions it spends,
/// broadcast ahead of it. `orig_hash` is the pre-scrub fingerprint a server
/// attaches when it strips identifying metadata before republishing.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pledge {
    project_id: ProjectId,
    dependencies: Vec<Transaction>,
    pledge_tx: Transaction,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    total_input_value: Amount,
    timestamp_secs: u64,
    orig_hash: Option<PledgeHash>,
}

impl Pledge {
    pub fn new(project_id: ProjectId, dependencies: Vec<Transaction>, pledge_tx: Transaction, total_input_value: Amount) -> Self {
        Self { project_id, dependencies, pledge_tx, total_input_value, timestamp_secs: 0, orig_hash: None }
    }

    pub fn with_timestamp(mut self, timestamp_secs: u64) -> Self {
        self.timestamp_secs = timestamp_secs;
        self
    }

    pub fn with_orig_hash(mut self, orig_hash: PledgeHash) -> Self {
        self.orig_hash = Some(orig_hash);
        self
    }

    pub fn project_id(&self) -> ProjectId {
        self.project_id
    }

    pub fn pledge_tx(&self) -> &Transaction {
        &self.pledge_tx
    }

    pub fn dependencies(&self) -> &[Transaction] {
        &self.dependencies
    }

    /// All carried transactions, dependencies first.
    pub fn transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.dependencies.iter().chain(std::iter::once(&self.pledge_tx))
    }

    pub fn transaction_count(&self) -> usize {
        self.dependencies.len() + 1
    }

    pub fn total_input_value(&self) -> Amount {
        self.total_input_value
    }

    pub fn timestamp_secs(&self) -> u64 {
        self.timestamp_secs
    }

    pub fn orig_hash(&self) -> Option<PledgeHash> {
        self.orig_hash
    }

    /// Outpoints consumed by the pledge transaction itself.
    pub fn outpoints(&self) -> impl Iterator<Item = OutPoint> + '_ {
        self.pledge_tx.input.iter().map(|input| input.previous_output)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Fingerprint of the canonical pledge bytes. A scrubbed server copy of
    /// this pledge carries this value as its `orig_hash`.
    pub fn hash(&self) -> PledgeHash {
        let bytes = bincode::serialize(self).unwrap_or_default();
        PledgeHash::new(sha256::Hash::hash(&bytes).to_byte_array())
    }
}

impl fmt::Display for Pledge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pledge {} ({} sat, {} dep tx)",
            &self.hash().to_string()[..8],
            self.total_input_value.to_sat(),
            self.dependencies.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::{ScriptBuf, Sequence, TxIn, TxOut, Txid, Witness};

    fn tx_spending(txid_byte: u8, vout: u32) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::from_byte_array([txid_byte; 32]), vout),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut { value: Amount::from_sat(1_000), script_pubkey: ScriptBuf::new() }],
        }
    }

    fn pledge() -> Pledge {
        Pledge::new(ProjectId::new([9; 32]), vec![], tx_spending(1, 0), Amount::from_sat(1_000))
    }

    #[test]
    fn hash_is_stable_and_content_sensitive() {
        let a = pledge();
        let b = pledge();
        assert_eq!(a.hash(), b.hash());

        let c = pledge().with_timestamp(7);
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn serde_round_trip_preserves_hash() {
        let original = pledge().with_orig_hash(PledgeHash::new([3; 32]));
        let bytes = original.to_bytes().expect("serialize");
        let decoded = Pledge::from_bytes(&bytes).expect("deserialize");
        assert_eq!(decoded, original);
        assert_eq!(decoded.hash(), original.hash());
    }

    #[test]
    fn outpoints_come_from_the_pledge_tx_only() {
        let dep = tx_spending(1, 0);
        let main = tx_spending(2, 3);
        let pledge = Pledge::new(ProjectId::new([9; 32]), vec![dep], main, Amount::from_sat(1_000));
        let outpoints: Vec<OutPoint> = pledge.outpoints().collect();
        assert_eq!(outpoints, vec![OutPoint::new(Txid::from_byte_array([2; 32]), 3)]);
        assert_eq!(pledge.transaction_count(), 2);
    }
}
