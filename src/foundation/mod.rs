pub mod constants;
pub mod error;
pub mod types;
pub mod util;

pub use error::{BackendError, Result};
pub use types::{Hash32, PledgeHash, ProjectId};
