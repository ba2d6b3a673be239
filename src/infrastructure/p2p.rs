use crate::domain::{UtxoEntry, UtxoSnapshot};
use crate::foundation::{BackendError, Result};
use bitcoin::{OutPoint, Transaction, Txid};
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// One peer's answer to a batched UTXO lookup. `None` per outpoint means
/// the peer reports it spent or never existed.
pub struct PeerUtxoReply {
    pub peer_id: String,
    pub result: Result<HashMap<OutPoint, Option<UtxoEntry>>>,
}

/// A connected peer able to answer UTXO queries. `begin_utxo_lookup` must
/// not block: implementations hand the request to their own I/O and send
/// the reply (or nothing, if the peer stalls) through the channel.
pub trait UtxoPeer: Send + Sync {
    fn peer_id(&self) -> String;
    fn supports_utxo_lookup(&self) -> bool;
    fn begin_utxo_lookup(&self, outpoints: Vec<OutPoint>, reply: Sender<PeerUtxoReply>);
}

/// The connected peer set and its broadcast facilities.
pub trait PeerGroup: Send + Sync {
    /// Blocks until at least `min_peers` candidates are connected. This is
    /// the engine's documented open-ended suspension point: no progress is
    /// possible until peers appear.
    fn wait_for_utxo_peers(&self, min_peers: usize) -> Vec<Arc<dyn UtxoPeer>>;
    fn min_broadcast_peers(&self) -> usize;
    fn most_common_chain_height(&self) -> u64;
    fn broadcast_transaction(&self, tx: &Transaction, timeout: Duration) -> Result<Txid>;
}

pub type ChainListener = Arc<dyn Fn(u64) + Send + Sync>;

/// Chain tip notifications from the wallet's blockchain sync.
pub trait Blockchain: Send + Sync {
    fn best_height(&self) -> u64;
    fn subscribe(&self, listener: ChainListener);
}

/// The agreed view after one query round. Outpoints every responder calls
/// absent are simply missing from `entries`; outpoints the responders
/// disagree about are additionally listed as untrusted.
#[derive(Debug, Default)]
pub struct QuorumSnapshot {
    pub entries: UtxoSnapshot,
    pub untrusted: HashSet<OutPoint>,
    pub responders: usize,
}

/// Serialises outbound UTXO queries: at most one round in flight
/// engine-wide, enforced by only ever running `query` on the engine
/// thread. One batched request carries the union of outpoints for all
/// pledges checked this round.
pub struct UtxoQueryCoordinator {
    peer_group: Arc<dyn PeerGroup>,
}

impl UtxoQueryCoordinator {
    pub fn new(peer_group: Arc<dyn PeerGroup>) -> Self {
        Self { peer_group }
    }

    pub fn query(&self, min_peers: usize, outpoints: Vec<OutPoint>, timeout: Duration) -> Result<QuorumSnapshot> {
        let mut peers = self.peer_group.wait_for_utxo_peers(min_peers);
        let candidates = peers.len();
        peers.retain(|peer| peer.supports_utxo_lookup());
        if peers.len() < candidates {
            info!("dropped {} peer(s) without UTXO lookup support, {} remain", candidates - peers.len(), peers.len());
        }
        if peers.is_empty() {
            return Err(BackendError::NoCapablePeers { required: min_peers, available: 0 });
        }

        debug!("querying {} peer(s) for {} outpoint(s)", peers.len(), outpoints.len());
        let (reply_tx, reply_rx) = mpsc::channel();
        for peer in &peers {
            peer.begin_utxo_lookup(outpoints.clone(), reply_tx.clone());
        }
        drop(reply_tx);

        let answers = collect_replies(reply_rx, peers.len(), timeout);
        if answers.is_empty() {
            return Err(BackendError::UtxoQueryTimedOut { timeout_secs: timeout.as_secs() });
        }

        Ok(cross_check(&outpoints, answers))
    }
}

fn collect_replies(
    reply_rx: Receiver<PeerUtxoReply>,
    expected: usize,
    timeout: Duration,
) -> Vec<HashMap<OutPoint, Option<UtxoEntry>>> {
    let deadline = Instant::now() + timeout;
    let mut answers = Vec::new();
    for _ in 0..expected {
        let now = Instant::now();
        if now >= deadline {
            warn!("UTXO query deadline passed with {} of {} replies", answers.len(), expected);
            break;
        }
        match reply_rx.recv_timeout(deadline - now) {
            Ok(reply) => match reply.result {
                Ok(answer) => answers.push(answer),
                Err(err) => warn!("peer {} failed the UTXO lookup: {}", reply.peer_id, err),
            },
            Err(_) => {
                // Timed out or all senders gone; either way the round ends.
                break;
            }
        }
    }
    answers
}

/// Peers are replicated consistency oracles: an outpoint enters the
/// snapshot only when every responder reports the identical entry.
fn cross_check(outpoints: &[OutPoint], answers: Vec<HashMap<OutPoint, Option<UtxoEntry>>>) -> QuorumSnapshot {
    let mut snapshot = QuorumSnapshot { responders: answers.len(), ..Default::default() };
    for outpoint in outpoints {
        let mut agreed: Option<&Option<UtxoEntry>> = None;
        let mut consistent = true;
        for answer in &answers {
            let reported = answer.get(outpoint).unwrap_or(&None);
            match agreed {
                None => agreed = Some(reported),
                Some(previous) if previous == reported => {}
                Some(_) => {
                    consistent = false;
                    break;
                }
            }
        }
        if !consistent {
            warn!("peers disagree about {outpoint}, dropping it for this round");
            snapshot.untrusted.insert(*outpoint);
            continue;
        }
        if let Some(Some(entry)) = agreed {
            snapshot.entries.insert(*outpoint, entry.clone());
        }
    }
    snapshot
}

/// A peer double answering from a fixed table. Peers can be marked silent
/// (never reply) or unsupported.
pub struct ScriptedPeer {
    peer_id: String,
    supports_lookup: AtomicBool,
    silent: AtomicBool,
    utxos: Mutex<HashMap<OutPoint, UtxoEntry>>,
}

impl ScriptedPeer {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            supports_lookup: AtomicBool::new(true),
            silent: AtomicBool::new(false),
            utxos: Mutex::new(HashMap::new()),
        }
    }

    fn lock_utxos(&self) -> MutexGuard<'_, HashMap<OutPoint, UtxoEntry>> {
        self.utxos.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_utxo(&self, outpoint: OutPoint, entry: UtxoEntry) {
        self.lock_utxos().insert(outpoint, entry);
    }

    pub fn remove_utxo(&self, outpoint: &OutPoint) {
        self.lock_utxos().remove(outpoint);
    }

    pub fn set_supports_lookup(&self, supports: bool) {
        self.supports_lookup.store(supports, Ordering::Relaxed);
    }

    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::Relaxed);
    }
}

impl UtxoPeer for ScriptedPeer {
    fn peer_id(&self) -> String {
        self.peer_id.clone()
    }

    fn supports_utxo_lookup(&self) -> bool {
        self.supports_lookup.load(Ordering::Relaxed)
    }

    fn begin_utxo_lookup(&self, outpoints: Vec<OutPoint>, reply: Sender<PeerUtxoReply>) {
        if self.silent.load(Ordering::Relaxed) {
            return;
        }
        let utxos = self.lock_utxos();
        let answer: HashMap<OutPoint, Option<UtxoEntry>> =
            outpoints.into_iter().map(|outpoint| (outpoint, utxos.get(&outpoint).cloned())).collect();
        let _ = reply.send(PeerUtxoReply { peer_id: self.peer_id.clone(), result: Ok(answer) });
    }
}

/// Peer group double with a fixed peer list and recorded broadcasts.
pub struct StaticPeerGroup {
    peers: Mutex<Vec<Arc<dyn UtxoPeer>>>,
    min_broadcast: AtomicUsize,
    chain_height: AtomicU64,
    broadcasts: Mutex<Vec<Transaction>>,
    fail_broadcasts: AtomicBool,
}

impl StaticPeerGroup {
    pub fn new() -> Self {
        Self {
            peers: Mutex::new(Vec::new()),
            min_broadcast: AtomicUsize::new(2),
            chain_height: AtomicU64::new(0),
            broadcasts: Mutex::new(Vec::new()),
            fail_broadcasts: AtomicBool::new(false),
        }
    }

    pub fn add_peer(&self, peer: Arc<dyn UtxoPeer>) {
        self.peers.lock().unwrap_or_else(|e| e.into_inner()).push(peer);
    }

    pub fn set_min_broadcast_peers(&self, min: usize) {
        self.min_broadcast.store(min, Ordering::Relaxed);
    }

    pub fn set_chain_height(&self, height: u64) {
        self.chain_height.store(height, Ordering::Relaxed);
    }

    pub fn set_fail_broadcasts(&self, fail: bool) {
        self.fail_broadcasts.store(fail, Ordering::Relaxed);
    }

    pub fn broadcast_transactions(&self) -> Vec<Transaction> {
        self.broadcasts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Default for StaticPeerGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerGroup for StaticPeerGroup {
    fn wait_for_utxo_peers(&self, _min_peers: usize) -> Vec<Arc<dyn UtxoPeer>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn min_broadcast_peers(&self) -> usize {
        self.min_broadcast.load(Ordering::Relaxed)
    }

    fn most_common_chain_height(&self) -> u64 {
        self.chain_height.load(Ordering::Relaxed)
    }

    fn broadcast_transaction(&self, tx: &Transaction, _timeout: Duration) -> Result<Txid> {
        let txid = tx.compute_txid();
        if self.fail_broadcasts.load(Ordering::Relaxed) {
            return Err(BackendError::Broadcast { txid, details: "scripted failure".to_string() });
        }
        self.broadcasts.lock().unwrap_or_else(|e| e.into_inner()).push(tx.clone());
        Ok(txid)
    }
}

/// Blockchain double: tests announce new tips explicitly.
pub struct StaticBlockchain {
    height: AtomicU64,
    listeners: Mutex<Vec<ChainListener>>,
}

impl StaticBlockchain {
    pub fn new(height: u64) -> Self {
        Self { height: AtomicU64::new(height), listeners: Mutex::new(Vec::new()) }
    }

    pub fn announce_height(&self, height: u64) {
        self.height.store(height, Ordering::Relaxed);
        let listeners: Vec<ChainListener> = self.listeners.lock().unwrap_or_else(|e| e.into_inner()).clone();
        for listener in listeners {
            listener(height);
        }
    }
}

impl Blockchain for StaticBlockchain {
    fn best_height(&self) -> u64 {
        self.height.load(Ordering::Relaxed)
    }

    fn subscribe(&self, listener: ChainListener) {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner()).push(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::{Amount, ScriptBuf};

    fn outpoint(byte: u8) -> OutPoint {
        OutPoint::new(Txid::from_byte_array([byte; 32]), 0)
    }

    fn entry(value_sat: u64) -> UtxoEntry {
        UtxoEntry { value: Amount::from_sat(value_sat), script_pubkey: ScriptBuf::from_bytes(vec![0x51]) }
    }

    fn group_with(peers: Vec<Arc<ScriptedPeer>>) -> UtxoQueryCoordinator {
        let group = StaticPeerGroup::new();
        for peer in peers {
            group.add_peer(peer);
        }
        UtxoQueryCoordinator::new(Arc::new(group))
    }

    #[test]
    fn consistent_answers_build_a_snapshot() {
        let a = Arc::new(ScriptedPeer::new("a"));
        let b = Arc::new(ScriptedPeer::new("b"));
        a.set_utxo(outpoint(1), entry(500));
        b.set_utxo(outpoint(1), entry(500));
        let coordinator = group_with(vec![a, b]);

        let snapshot = coordinator.query(2, vec![outpoint(1), outpoint(2)], Duration::from_secs(1)).expect("query");
        assert_eq!(snapshot.responders, 2);
        assert_eq!(snapshot.entries.get(&outpoint(1)), Some(&entry(500)));
        assert!(!snapshot.entries.contains_key(&outpoint(2)));
        assert!(snapshot.untrusted.is_empty());
    }

    #[test]
    fn disagreement_marks_outpoint_untrusted() {
        let a = Arc::new(ScriptedPeer::new("a"));
        let b = Arc::new(ScriptedPeer::new("b"));
        a.set_utxo(outpoint(1), entry(500));
        b.set_utxo(outpoint(1), entry(501));
        let coordinator = group_with(vec![a, b]);

        let snapshot = coordinator.query(2, vec![outpoint(1)], Duration::from_secs(1)).expect("query");
        assert!(snapshot.entries.is_empty());
        assert!(snapshot.untrusted.contains(&outpoint(1)));
    }

    #[test]
    fn one_peer_reporting_spent_is_a_disagreement() {
        let a = Arc::new(ScriptedPeer::new("a"));
        let b = Arc::new(ScriptedPeer::new("b"));
        a.set_utxo(outpoint(1), entry(500));
        let coordinator = group_with(vec![a, b]);

        let snapshot = coordinator.query(2, vec![outpoint(1)], Duration::from_secs(1)).expect("query");
        assert!(snapshot.entries.is_empty());
        assert!(snapshot.untrusted.contains(&outpoint(1)));
    }

    #[test]
    fn slow_peer_is_ignored() {
        let a = Arc::new(ScriptedPeer::new("a"));
        let b = Arc::new(ScriptedPeer::new("b"));
        a.set_utxo(outpoint(1), entry(500));
        b.set_silent(true);
        let coordinator = group_with(vec![a, b]);

        let snapshot = coordinator.query(2, vec![outpoint(1)], Duration::from_millis(50)).expect("query");
        assert_eq!(snapshot.responders, 1);
        assert_eq!(snapshot.entries.get(&outpoint(1)), Some(&entry(500)));
    }

    #[test]
    fn no_capable_peers_is_an_error() {
        let a = Arc::new(ScriptedPeer::new("a"));
        a.set_supports_lookup(false);
        let coordinator = group_with(vec![a]);

        let err = coordinator.query(1, vec![outpoint(1)], Duration::from_millis(50)).expect_err("no peers");
        assert!(matches!(err, BackendError::NoCapablePeers { .. }));
    }

    #[test]
    fn all_peers_silent_times_out() {
        let a = Arc::new(ScriptedPeer::new("a"));
        a.set_silent(true);
        let coordinator = group_with(vec![a]);

        let err = coordinator.query(1, vec![outpoint(1)], Duration::from_millis(50)).expect_err("timeout");
        assert!(matches!(err, BackendError::UtxoQueryTimedOut { .. }));
    }
}
