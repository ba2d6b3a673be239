use crate::domain::{Pledge, TxConfidence};
use crate::foundation::{PledgeHash, ProjectId};
use bitcoin::{Network, ScriptBuf, Transaction, Txid};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// Why the wallet holds a transaction, as far as the engine told it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TxPurpose {
    #[default]
    Unknown,
    AssuranceContractClaim,
}

#[derive(Clone, Debug)]
pub enum WalletEvent {
    PledgeCreated { pledge: Pledge },
    PledgeRevoked { pledge: Pledge },
    CoinsReceived { tx: Transaction },
    ConfidenceChanged { txid: Txid },
}

pub type WalletListener = Arc<dyn Fn(&WalletEvent) + Send + Sync>;

/// The pledging wallet, including its blockchain sync. Implementations are
/// concurrent; listeners may fire from any thread and callers marshal.
pub trait PledgeWallet: Send + Sync {
    fn network(&self) -> Network;
    /// Pledges this wallet authored and has not revoked.
    fn pledges(&self) -> Vec<Pledge>;
    fn pledge_for(&self, project_id: &ProjectId) -> Option<Pledge>;
    fn was_pledge_revoked(&self, pledge: &Pledge) -> bool;
    /// Track scripts so the wallet can spot claim transactions (it knows
    /// how to watch for double spends and chain depth).
    fn watch_scripts(&self, scripts: Vec<ScriptBuf>);
    fn transactions(&self) -> Vec<Transaction>;
    fn transaction(&self, txid: &Txid) -> Option<Transaction>;
    fn confidence(&self, txid: &Txid) -> TxConfidence;
    fn set_transaction_purpose(&self, txid: &Txid, purpose: TxPurpose);
    fn subscribe(&self, listener: WalletListener);
}

#[derive(Default)]
struct MemoryWalletInner {
    pledges: Vec<Pledge>,
    revoked: HashSet<PledgeHash>,
    watched: Vec<ScriptBuf>,
    transactions: HashMap<Txid, Transaction>,
    confidence: HashMap<Txid, TxConfidence>,
    purposes: HashMap<Txid, TxPurpose>,
    listeners: Vec<WalletListener>,
}

/// In-memory wallet double, scripted from tests.
pub struct MemoryWallet {
    network: Network,
    inner: Mutex<MemoryWalletInner>,
}

impl MemoryWallet {
    pub fn new(network: Network) -> Self {
        Self { network, inner: Mutex::new(MemoryWalletInner::default()) }
    }

    fn lock_inner(&self) -> MutexGuard<'_, MemoryWalletInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: WalletEvent) {
        let listeners: Vec<WalletListener> = self.lock_inner().listeners.clone();
        for listener in listeners {
            listener(&event);
        }
    }

    /// Record a freshly authored pledge and announce it.
    pub fn create_pledge(&self, pledge: Pledge) {
        self.lock_inner().pledges.push(pledge.clone());
        self.emit(WalletEvent::PledgeCreated { pledge });
    }

    /// Load a pledge without firing events (pre-start wallet contents).
    pub fn seed_pledge(&self, pledge: Pledge) {
        self.lock_inner().pledges.push(pledge);
    }

    pub fn revoke_pledge(&self, pledge: &Pledge) {
        {
            let mut inner = self.lock_inner();
            inner.revoked.insert(pledge.hash());
            inner.pledges.retain(|p| p != pledge);
        }
        self.emit(WalletEvent::PledgeRevoked { pledge: pledge.clone() });
    }

    /// Store an incoming transaction with its confidence and announce the
    /// coin receipt.
    pub fn receive_transaction(&self, tx: Transaction, confidence: TxConfidence) {
        let txid = tx.compute_txid();
        {
            let mut inner = self.lock_inner();
            inner.transactions.insert(txid, tx.clone());
            inner.confidence.insert(txid, confidence);
        }
        self.emit(WalletEvent::CoinsReceived { tx });
    }

    /// Seed a transaction without firing events.
    pub fn seed_transaction(&self, tx: Transaction, confidence: TxConfidence) {
        let txid = tx.compute_txid();
        let mut inner = self.lock_inner();
        inner.transactions.insert(txid, tx);
        inner.confidence.insert(txid, confidence);
    }

    pub fn set_confidence(&self, txid: Txid, confidence: TxConfidence) {
        self.lock_inner().confidence.insert(txid, confidence);
        self.emit(WalletEvent::ConfidenceChanged { txid });
    }

    pub fn watched_scripts(&self) -> Vec<ScriptBuf> {
        self.lock_inner().watched.clone()
    }

    pub fn purpose(&self, txid: &Txid) -> TxPurpose {
        self.lock_inner().purposes.get(txid).copied().unwrap_or_default()
    }
}

impl PledgeWallet for MemoryWallet {
    fn network(&self) -> Network {
        self.network
    }

    fn pledges(&self) -> Vec<Pledge> {
        self.lock_inner().pledges.clone()
    }

    fn pledge_for(&self, project_id: &ProjectId) -> Option<Pledge> {
        self.lock_inner().pledges.iter().find(|p| p.project_id() == *project_id).cloned()
    }

    fn was_pledge_revoked(&self, pledge: &Pledge) -> bool {
        self.lock_inner().revoked.contains(&pledge.hash())
    }

    fn watch_scripts(&self, scripts: Vec<ScriptBuf>) {
        self.lock_inner().watched.extend(scripts);
    }

    fn transactions(&self) -> Vec<Transaction> {
        self.lock_inner().transactions.values().cloned().collect()
    }

    fn transaction(&self, txid: &Txid) -> Option<Transaction> {
        self.lock_inner().transactions.get(txid).cloned()
    }

    fn confidence(&self, txid: &Txid) -> TxConfidence {
        self.lock_inner().confidence.get(txid).cloned().unwrap_or(TxConfidence::Unknown)
    }

    fn set_transaction_purpose(&self, txid: &Txid, purpose: TxPurpose) {
        self.lock_inner().purposes.insert(*txid, purpose);
    }

    fn subscribe(&self, listener: WalletListener) {
        self.lock_inner().listeners.push(listener);
    }
}
