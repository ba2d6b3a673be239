pub mod claim;
pub mod pledge;
pub mod project;
pub mod status;
pub mod sync;
pub mod verify;

pub use claim::{evaluate_confidence, pledge_appears_in_claim, ClaimSignal, TxConfidence};
pub use pledge::Pledge;
pub use project::Project;
pub use status::{CheckStatus, ProjectState, ProjectStateInfo, ProjectStatus};
pub use verify::{fast_sanity_check, verify_pledge, UtxoEntry, UtxoSnapshot};
