use crate::domain::Pledge;
use crate::foundation::BackendError;
use bitcoin::Txid;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Is the project currently open for pledges or did it complete? The disk
/// layer records this; the engine computes the transitions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectState {
    #[default]
    Open,
    Error,
    Claimed,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectStateInfo {
    pub state: ProjectState,
    pub claimed_by: Option<Txid>,
}

impl ProjectStateInfo {
    pub fn claimed(claimed_by: Txid) -> Self {
        Self { state: ProjectState::Claimed, claimed_by: Some(claimed_by) }
    }

    pub fn errored() -> Self {
        Self { state: ProjectState::Error, claimed_by: None }
    }
}

/// Present for a project exactly while a check is running or its last
/// check failed.
#[derive(Clone, Debug)]
pub enum CheckStatus {
    InProgress,
    Failed(Arc<BackendError>),
}

impl CheckStatus {
    pub fn is_in_progress(&self) -> bool {
        matches!(self, CheckStatus::InProgress)
    }

    pub fn error(&self) -> Option<&BackendError> {
        match self {
            CheckStatus::InProgress => None,
            CheckStatus::Failed(err) => Some(err),
        }
    }
}

/// What a project server reports for its project: the pledges it has
/// accepted, and the claim transaction id once the goal was reached.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProjectStatus {
    pub pledges: Vec<Pledge>,
    pub claimed_by: Option<Txid>,
}
