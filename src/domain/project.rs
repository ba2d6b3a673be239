use crate::foundation::{ProjectId, Result};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::{Amount, Network, ScriptBuf, Transaction, TxOut};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// The serialized shape of a project: what a project file carries.
///
/// The project id is not part of it; it is derived from these bytes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProjectDetails {
    pub title: String,
    pub network: Network,
    /// The goal outputs. Funding is complete when a single transaction
    /// paying exactly these outputs can be assembled from pledges.
    pub outputs: Vec<TxOut>,
    pub payment_url: Option<Url>,
}

/// An assurance-contract project: a goal transaction shape plus metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(from = "ProjectDetails", into = "ProjectDetails")]
pub struct Project {
    id: ProjectId,
    details: ProjectDetails,
}

impl From<ProjectDetails> for Project {
    fn from(details: ProjectDetails) -> Self {
        let id = project_id(&details);
        Self { id, details }
    }
}

impl From<Project> for ProjectDetails {
    fn from(project: Project) -> Self {
        project.details
    }
}

fn project_id(details: &ProjectDetails) -> ProjectId {
    // Canonical bytes; a decode failure here means the type itself cannot
    // round-trip, which is unreachable for these fields.
    let bytes = bincode::serialize(details).unwrap_or_default();
    ProjectId::new(sha256::Hash::hash(&bytes).to_byte_array())
}

impl Project {
    pub fn new(title: impl Into<String>, network: Network, outputs: Vec<TxOut>, payment_url: Option<Url>) -> Self {
        Project::from(ProjectDetails { title: title.into(), network, outputs, payment_url })
    }

    pub fn id(&self) -> ProjectId {
        self.id
    }

    pub fn title(&self) -> &str {
        &self.details.title
    }

    pub fn network(&self) -> Network {
        self.details.network
    }

    pub fn outputs(&self) -> &[TxOut] {
        &self.details.outputs
    }

    pub fn payment_url(&self) -> Option<&Url> {
        self.details.payment_url.as_ref()
    }

    pub fn goal_amount(&self) -> Amount {
        self.details.outputs.iter().fold(Amount::ZERO, |acc, out| acc + out.value)
    }

    pub fn output_scripts(&self) -> Vec<ScriptBuf> {
        self.details.outputs.iter().map(|out| out.script_pubkey.clone()).collect()
    }

    /// Does `tx` look like this project's claim transaction? True when its
    /// outputs are structurally the project's goal outputs (order-free).
    pub fn is_claim(&self, tx: &Transaction) -> bool {
        if tx.output.len() != self.details.outputs.len() {
            return false;
        }
        let mut ours: Vec<&TxOut> = self.details.outputs.iter().collect();
        let mut theirs: Vec<&TxOut> = tx.output.iter().collect();
        let key = |out: &&TxOut| (out.value, out.script_pubkey.clone());
        ours.sort_by_key(key);
        theirs.sort_by_key(key);
        ours == theirs
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.details)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let details: ProjectDetails = bincode::deserialize(bytes)?;
        Ok(Project::from(details))
    }
}

impl PartialEq for Project {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Project {}

impl std::hash::Hash for Project {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.details.title, &self.id.to_string()[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::{OutPoint, Sequence, TxIn, Witness};

    fn goal_output(value_sat: u64, tag: u8) -> TxOut {
        TxOut { value: Amount::from_sat(value_sat), script_pubkey: ScriptBuf::from_bytes(vec![0x51, tag]) }
    }

    fn project_with_outputs(outputs: Vec<TxOut>) -> Project {
        Project::new("roof repair", Network::Regtest, outputs, None)
    }

    fn tx_with_outputs(outputs: Vec<TxOut>) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: outputs,
        }
    }

    #[test]
    fn id_is_stable_across_serde_round_trip() {
        let project = project_with_outputs(vec![goal_output(100_000_000, 1)]);
        let bytes = project.to_bytes().expect("serialize");
        let decoded = Project::from_bytes(&bytes).expect("deserialize");
        assert_eq!(decoded.id(), project.id());
        assert_eq!(decoded, project);
    }

    #[test]
    fn id_changes_with_content() {
        let a = project_with_outputs(vec![goal_output(100_000_000, 1)]);
        let b = project_with_outputs(vec![goal_output(100_000_001, 1)]);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn goal_amount_sums_outputs() {
        let project = project_with_outputs(vec![goal_output(60_000_000, 1), goal_output(40_000_000, 2)]);
        assert_eq!(project.goal_amount(), Amount::from_sat(100_000_000));
    }

    #[test]
    fn claim_matching_ignores_output_order() {
        let out_a = goal_output(60_000_000, 1);
        let out_b = goal_output(40_000_000, 2);
        let project = project_with_outputs(vec![out_a.clone(), out_b.clone()]);

        assert!(project.is_claim(&tx_with_outputs(vec![out_b.clone(), out_a.clone()])));
        assert!(!project.is_claim(&tx_with_outputs(vec![out_a.clone()])));
        assert!(!project.is_claim(&tx_with_outputs(vec![out_a, out_b, goal_output(1, 3)])));
    }
}
