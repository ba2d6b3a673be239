use bitcoin::OutPoint;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("pledge carries {count} dependency transactions (max {max})")]
    TooManyDependencies { count: usize, max: usize },

    #[error("outpoint {outpoint} not found in the UTXO set")]
    UnknownUtxo { outpoint: OutPoint },

    #[error("outpoint {outpoint} already consumed by another accepted pledge")]
    DuplicatedOutPoint { outpoint: OutPoint },

    #[error("malformed pledge: {0}")]
    BadFormat(String),

    #[error("input for {outpoint} does not match the UTXO script: {details}")]
    ScriptMismatch { outpoint: OutPoint, details: String },

    #[error("pledge claims {claimed} sat but inputs are worth {actual} sat")]
    ValueMismatch { claimed: u64, actual: u64 },

    #[error("pledge of {pledged} sat exceeds the project goal of {goal} sat")]
    GoalExceeded { pledged: u64, goal: u64 },

    #[error("only {available} of {required} required peers advertise UTXO lookup")]
    NoCapablePeers { required: usize, available: usize },

    #[error("peers disagree about outpoint {outpoint}")]
    PeerDisagreement { outpoint: OutPoint },

    #[error("no peer answered the UTXO query within {timeout_secs}s")]
    UtxoQueryTimedOut { timeout_secs: u64 },

    #[error("transport error during {operation}: {details}")]
    Transport { operation: String, details: String },

    #[error("{operation} timed out after {timeout_secs}s")]
    Timeout { operation: String, timeout_secs: u64 },

    #[error("failed to broadcast dependency {txid}: {details}")]
    Broadcast { txid: bitcoin::Txid, details: String },

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("{format} serialization error: {details}")]
    Serialization { format: String, details: String },

    #[error("engine is shut down")]
    EngineShutdown,

    #[error("{0}")]
    Message(String),
}

pub type Result<T> = std::result::Result<T, BackendError>;

impl BackendError {
    /// Revocation-equivalents are a normal pledge exit, not a check failure.
    pub fn is_revocation(&self) -> bool {
        matches!(self, BackendError::UnknownUtxo { .. } | BackendError::PeerDisagreement { .. })
    }
}

impl From<bincode::Error> for BackendError {
    fn from(err: bincode::Error) -> Self {
        BackendError::Serialization { format: "bincode".to_string(), details: err.to_string() }
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        BackendError::Serialization { format: "json".to_string(), details: err.to_string() }
    }
}

impl From<hex::FromHexError> for BackendError {
    fn from(err: hex::FromHexError) -> Self {
        BackendError::Serialization { format: "hex".to_string(), details: err.to_string() }
    }
}
