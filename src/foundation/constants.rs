//! System-wide constants for the pledge engine.

/// 90th percentile block propagation is roughly half of this; requeries
/// triggered by a new chain tip are smeared over this window at most.
pub const BLOCK_PROPAGATION_TIME_SECS: u64 = 30;

/// 90th percentile transaction propagation is ~3s. Pledges found on disk
/// wait at least this long before verification so dependency transactions
/// can spread.
pub const TX_PROPAGATION_TIME_SECS: u64 = 5;

/// Hard deadline for a single UTXO query round; peers that miss it are
/// dropped for the round.
pub const UTXO_QUERY_TIMEOUT_SECS: u64 = 10;

/// Per-transaction deadline when broadcasting pledge dependencies on
/// behalf of a submitting client.
pub const DEPENDENCY_BROADCAST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of dependency transactions accepted alongside a pledge.
pub const MAX_PLEDGE_DEPENDENCIES: usize = 5;

/// Peers that must advertise UTXO lookup before a query round starts.
pub const DEFAULT_MIN_UTXO_QUERY_PEERS: usize = 2;

/// Base delay before a chain-tip-triggered requery.
pub const REQUERY_BASE_DELAY_SECS: u64 = 15;

/// A chain tip within this many blocks of the most common peer height
/// counts as caught up.
pub const CHAIN_CATCHUP_MARGIN: u64 = 2;

/// Extension of persisted pledge files.
pub const PLEDGE_FILE_EXTENSION: &str = "pledge";
