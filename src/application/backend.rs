use crate::application::observable::SetMirror;
use crate::application::scheduler::{Executor, Scheduler};
use crate::application::observable::MapMirror;
use crate::application::store::{PledgeStore, TotalPledged};
use crate::domain::claim::{evaluate_confidence, pledge_appears_in_claim, ClaimSignal, TxConfidence};
use crate::domain::verify::fast_sanity_check;
use crate::domain::{sync, CheckStatus, Pledge, Project, ProjectState, ProjectStateInfo};
use crate::foundation::constants::{
    CHAIN_CATCHUP_MARGIN, DEFAULT_MIN_UTXO_QUERY_PEERS, DEPENDENCY_BROADCAST_TIMEOUT_SECS, REQUERY_BASE_DELAY_SECS,
    TX_PROPAGATION_TIME_SECS, UTXO_QUERY_TIMEOUT_SECS,
};
use crate::foundation::util::{jittered_delay, Completion};
use crate::foundation::{BackendError, ProjectId, Result};
use crate::infrastructure::disk::{DiskEvent, DiskManager};
use crate::infrastructure::p2p::{Blockchain, PeerGroup, UtxoQueryCoordinator};
use crate::infrastructure::persist;
use crate::infrastructure::server::{HttpStatusTransport, StatusTransport};
use crate::infrastructure::wallet::{PledgeWallet, TxPurpose, WalletEvent};
use bitcoin::{Network, Transaction, Txid};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use url::Url;

/// Whether this backend fronts a wallet-holding app or a project server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Wallet non-empty; trusts a project's server (if any) over local
    /// observation.
    Client,
    /// Wallet typically empty; watches the application data directory and
    /// indexes projects by payment-URL path.
    Server,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_min_peers")]
    pub min_peers_for_utxo_query: usize,
    #[serde(default = "default_max_jitter")]
    pub max_jitter_secs: u64,
    #[serde(default = "default_utxo_timeout")]
    pub utxo_query_timeout_secs: u64,
    #[serde(default = "default_broadcast_timeout")]
    pub dependency_broadcast_timeout_secs: u64,
}

fn default_min_peers() -> usize {
    DEFAULT_MIN_UTXO_QUERY_PEERS
}

fn default_max_jitter() -> u64 {
    crate::foundation::constants::BLOCK_PROPAGATION_TIME_SECS
}

fn default_utxo_timeout() -> u64 {
    UTXO_QUERY_TIMEOUT_SECS
}

fn default_broadcast_timeout() -> u64 {
    DEPENDENCY_BROADCAST_TIMEOUT_SECS
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            min_peers_for_utxo_query: default_min_peers(),
            max_jitter_secs: default_max_jitter(),
            utxo_query_timeout_secs: default_utxo_timeout(),
            dependency_broadcast_timeout_secs: default_broadcast_timeout(),
        }
    }
}

struct EngineState {
    store: PledgeStore,
    /// Claim transactions under confidence watch, by txid.
    claim_watch: HashMap<Txid, ProjectId>,
}

type RoundResult = std::result::Result<HashSet<Pledge>, Arc<BackendError>>;

/// The pledge lifecycle engine. Combines the wallet, the on-disk project
/// store and either a project server or the P2P network into one
/// observable, consistent view of every project's pledges.
///
/// Actor-shaped: an engine thread owns all pledge state, and work arriving
/// from other threads (wallet callbacks, disk watcher, HTTP submissions)
/// is marshalled onto it. Mirrors hand observers a read-only view updated
/// on an executor of their choosing.
pub struct Backend {
    mode: Mode,
    scheduler: Scheduler,
    peers: Arc<dyn PeerGroup>,
    chain: Arc<dyn Blockchain>,
    wallet: Arc<dyn PledgeWallet>,
    disk: Arc<dyn DiskManager>,
    status_transport: Arc<dyn StatusTransport>,
    coordinator: UtxoQueryCoordinator,
    state: Mutex<EngineState>,
    /// Payment-URL path -> project; the one map the HTTP server reads
    /// directly, guarded on its own.
    url_index: Mutex<HashMap<String, Arc<Project>>>,
    min_peers: AtomicUsize,
    max_jitter_secs: AtomicU64,
    utxo_query_timeout: Duration,
    dependency_broadcast_timeout: Duration,
    initialized: Completion<()>,
}

impl Backend {
    pub fn new(
        mode: Mode,
        peers: Arc<dyn PeerGroup>,
        chain: Arc<dyn Blockchain>,
        wallet: Arc<dyn PledgeWallet>,
        disk: Arc<dyn DiskManager>,
        config: BackendConfig,
    ) -> Arc<Self> {
        Self::with_status_transport(mode, peers, chain, wallet, disk, config, Arc::new(HttpStatusTransport::default()))
    }

    pub fn with_status_transport(
        mode: Mode,
        peers: Arc<dyn PeerGroup>,
        chain: Arc<dyn Blockchain>,
        wallet: Arc<dyn PledgeWallet>,
        disk: Arc<dyn DiskManager>,
        mut config: BackendConfig,
        status_transport: Arc<dyn StatusTransport>,
    ) -> Arc<Self> {
        if wallet.network() == Network::Regtest {
            debug!("regtest wallet: one peer suffices and jitter shrinks to a second");
            config.min_peers_for_utxo_query = 1;
            config.max_jitter_secs = 1;
        }

        let scheduler = Scheduler::new("pharos-engine");
        let backend = Arc::new(Self {
            mode,
            scheduler,
            coordinator: UtxoQueryCoordinator::new(peers.clone()),
            peers,
            chain,
            wallet,
            disk,
            status_transport,
            state: Mutex::new(EngineState { store: PledgeStore::new(), claim_watch: HashMap::new() }),
            url_index: Mutex::new(HashMap::new()),
            min_peers: AtomicUsize::new(config.min_peers_for_utxo_query),
            max_jitter_secs: AtomicU64::new(config.max_jitter_secs),
            utxo_query_timeout: Duration::from_secs(config.utxo_query_timeout_secs),
            dependency_broadcast_timeout: Duration::from_secs(config.dependency_broadcast_timeout_secs),
            initialized: Completion::new(),
        });

        {
            let weak = Arc::downgrade(&backend);
            backend.disk.subscribe(Arc::new(move |event| {
                if let Some(backend) = weak.upgrade() {
                    let event = event.clone();
                    let handler = backend.clone();
                    backend.scheduler.submit(Box::new(move || handler.on_disk_event(event)));
                }
            }));
        }

        if mode == Mode::Server {
            let data_dir = backend.disk.data_dir();
            backend.disk.add_projects_dir(&data_dir);
        }

        {
            let weak = Arc::downgrade(&backend);
            backend.chain.subscribe(Arc::new(move |height| {
                if let Some(backend) = weak.upgrade() {
                    let handler = backend.clone();
                    backend.scheduler.submit(Box::new(move || handler.on_new_best_block(height)));
                }
            }));
        }

        {
            let weak = Arc::downgrade(&backend);
            backend.wallet.subscribe(Arc::new(move |event| {
                if let Some(backend) = weak.upgrade() {
                    let event = event.clone();
                    let handler = backend.clone();
                    backend.scheduler.submit(Box::new(move || handler.on_wallet_event(event)));
                }
            }));
        }

        // Initialisation runs as a regular task, not ASAP: the disk layer
        // may still be loading, and handlers wired above must see whatever
        // it announces first.
        {
            let handler = backend.clone();
            backend.scheduler.submit(Box::new(move || handler.initialize()));
        }

        backend
    }

    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn initialize(self: &Arc<Self>) {
        self.scheduler.assert_on_thread();
        {
            let mut state = self.lock_state();
            for project in self.disk.projects() {
                self.handle_project_added(&mut state, project);
            }
            for pledge in self.wallet.pledges() {
                match self.disk.project_by_id(&pledge.project_id()) {
                    Some(project) => {
                        state.store.add_open(project.id(), pledge);
                    }
                    None => {
                        error!("found a pledge in the wallet but no matching project: {}", pledge.project_id());
                    }
                }
            }
            for tx in self.wallet.transactions() {
                if let Some(project) = self.disk.project_from_claim(&tx) {
                    state.claim_watch.insert(tx.compute_txid(), project.id());
                    self.move_claimed_pledges(&mut state, &tx, &project);
                }
            }
        }
        self.initialized.complete(());
        info!("backend initialized in {:?} mode", self.mode);
    }

    /// Blocks until the engine has loaded wallet pledges and existing
    /// projects.
    pub fn wait_for_init(&self) {
        self.initialized.wait_ready();
    }

    // === Disk events ===

    fn on_disk_event(self: &Arc<Self>, event: DiskEvent) {
        self.scheduler.assert_on_thread();
        match event {
            DiskEvent::ProjectAdded(project) => {
                let mut state = self.lock_state();
                self.handle_project_added(&mut state, project);
            }
            DiskEvent::ProjectUpdated(project) => {
                // Watcher noise: creating a sibling file reports the
                // project as updated.
                info!("project updated: {project}");
            }
            DiskEvent::ProjectRemoved(project) => {
                info!("project removed: {project}");
                self.lock_state().store.remove_project(&project.id());
                let mut index = self.url_index.lock().unwrap_or_else(|e| e.into_inner());
                index.retain(|_, indexed| indexed.id() != project.id());
            }
            DiskEvent::PledgeAdded { project_id, pledge } => self.handle_disk_pledge_added(project_id, pledge),
            DiskEvent::PledgeRemoved { project_id, pledge } => self.handle_disk_pledge_removed(project_id, pledge),
            DiskEvent::ProjectStateChanged { project_id, info } => {
                self.lock_state().store.set_state(project_id, info);
            }
        }
    }

    fn handle_project_added(self: &Arc<Self>, state: &mut EngineState, project: Arc<Project>) {
        if state.store.project(&project.id()).is_some() {
            return;
        }
        info!("new project found on disk: {project}");
        state.store.upsert_project(project.clone());
        state.store.set_state(project.id(), self.disk.project_state(&project.id()));

        if self.mode == Mode::Server {
            let Some(url) = project.payment_url() else {
                error!("project {project} has no payment URL: cannot serve it");
                return;
            };
            self.url_index.lock().unwrap_or_else(|e| e.into_inner()).insert(url.path().to_string(), project.clone());
        }

        // The wallet tracks the goal scripts so claim transactions are
        // spotted even when we never pledged ourselves.
        self.wallet.watch_scripts(project.output_scripts());

        if self.mode == Mode::Client && project.payment_url().is_some() {
            info!("checking project against server: {project}");
            self.start_server_lookup(state, project, Completion::new());
        } else {
            info!("checking newly found project against P2P network: {project}");
            let pledges: HashSet<Pledge> = self.disk.pledges_for(&project.id()).into_iter().collect();
            self.check_pledges_against_p2p(project, pledges, true);
        }
    }

    fn handle_disk_pledge_added(self: &Arc<Self>, project_id: ProjectId, pledge: Pledge) {
        let Some(project) = self.disk.project_by_id(&project_id) else {
            warn!("pledge file for unknown project {project_id}");
            return;
        };
        if self.mode == Mode::Client && project.payment_url().is_some() {
            debug!("pledge file for server-backed project {project}, the server is the truth");
            return;
        }
        if self.is_pledge_known(&pledge) {
            return;
        }
        info!("new pledge found on disk for {project}");
        // Give dependency transactions time to propagate in case our
        // pledge source outruns the network (shared drive, regtest).
        let delay = jittered_delay(TX_PROPAGATION_TIME_SECS, self.max_jitter_secs());
        debug!("scheduling pledge check in {delay:?}");
        let handler = self.clone();
        self.scheduler.schedule(
            Box::new(move || {
                let pledges: HashSet<Pledge> = std::iter::once(pledge).collect();
                handler.check_pledges_against_p2p(project, pledges, false);
            }),
            delay,
        );
    }

    fn handle_disk_pledge_removed(&self, project_id: ProjectId, pledge: Pledge) {
        if self.wallet.pledge_for(&project_id).as_ref() == Some(&pledge) {
            // The disk copy was redundant; the wallet still holds ours.
            info!("pledge in wallet was removed from disk, ignoring");
            return;
        }
        let mut state = self.lock_state();
        state.store.remove_open(project_id, &pledge);
        state.store.remove_claimed(project_id, &pledge);
    }

    fn is_pledge_known(&self, pledge: &Pledge) -> bool {
        if self.mode == Mode::Client && self.wallet.was_pledge_revoked(pledge) {
            return true;
        }
        self.lock_state().store.is_pledge_tracked(pledge)
    }

    // === Wallet events ===

    fn on_wallet_event(self: &Arc<Self>, event: WalletEvent) {
        self.scheduler.assert_on_thread();
        match event {
            WalletEvent::PledgeCreated { pledge } => match self.disk.project_by_id(&pledge.project_id()) {
                Some(project) => {
                    info!("wallet created {pledge} for {project}");
                    self.lock_state().store.add_open(project.id(), pledge);
                }
                None => error!("wallet pledge references an unknown project: {}", pledge.project_id()),
            },
            WalletEvent::PledgeRevoked { pledge } => match self.disk.project_by_id(&pledge.project_id()) {
                Some(project) => {
                    info!("wallet revoked {pledge} for {project}");
                    self.lock_state().store.remove_open(project.id(), &pledge);
                }
                None => error!("revoked pledge references an unknown project: {}", pledge.project_id()),
            },
            WalletEvent::CoinsReceived { tx } => self.check_possible_claim_tx(tx),
            WalletEvent::ConfidenceChanged { txid } => {
                let watched = self.lock_state().claim_watch.get(&txid).copied();
                let Some(project_id) = watched else {
                    return;
                };
                let (Some(project), Some(tx)) = (self.disk.project_by_id(&project_id), self.wallet.transaction(&txid)) else {
                    return;
                };
                info!("saw claim tx {txid} change confidence");
                self.check_claim_confidence(&tx, &project);
            }
        }
    }

    /// `tx` may or may not complete a project we know. We can never be
    /// sure, but when its outputs all match we presume a claim and surface
    /// it as early as its confidence allows.
    fn check_possible_claim_tx(self: &Arc<Self>, tx: Transaction) {
        self.scheduler.assert_on_thread();
        let Some(project) = self.disk.project_from_claim(&tx) else {
            return;
        };
        let txid = tx.compute_txid();
        info!("found claim tx {} with {} inputs for project {}", txid, tx.input.len(), project);
        self.wallet.set_transaction_purpose(&txid, TxPurpose::AssuranceContractClaim);
        // Confidence may go down as well as up (double spend, reorg), so
        // the claim stays watched either way.
        self.check_claim_confidence(&tx, &project);
        self.lock_state().claim_watch.insert(txid, project.id());
    }

    fn check_claim_confidence(self: &Arc<Self>, tx: &Transaction, project: &Arc<Project>) {
        let txid = tx.compute_txid();
        let confidence = self.wallet.confidence(&txid);
        if let TxConfidence::Pending { broadcast_peers } = &confidence {
            info!("claim seen by {broadcast_peers} peer(s)");
        }
        match evaluate_confidence(&confidence, self.peers.min_broadcast_peers()) {
            ClaimSignal::Claimed => {
                info!("claim propagated or mined");
                if project.payment_url().is_none() {
                    let mut state = self.lock_state();
                    self.move_claimed_pledges(&mut state, tx, project);
                } else {
                    self.refresh_project_status_from_server(project.clone());
                }
                self.disk.set_project_state(&project.id(), ProjectStateInfo::claimed(txid));
            }
            ClaimSignal::Dead => {
                warn!("claim {txid} was double spent or reorged out");
                self.disk.set_project_state(&project.id(), ProjectStateInfo::errored());
                let mut state = self.lock_state();
                for pledge in state.store.claimed_snapshot(&project.id()) {
                    state.store.remove_claimed(project.id(), &pledge);
                }
            }
            ClaimSignal::Ignore => {
                debug!("claim {txid} confidence not actionable yet");
            }
        }
    }

    fn move_claimed_pledges(&self, state: &mut EngineState, claim: &Transaction, project: &Arc<Project>) {
        let taken: Vec<Pledge> = state
            .store
            .open_snapshot(&project.id())
            .into_iter()
            .filter(|pledge| pledge_appears_in_claim(pledge, claim))
            .collect();
        if !taken.is_empty() {
            info!("{} pledge(s) consumed by claim {}", taken.len(), claim.compute_txid());
        }
        state.store.move_open_to_claimed(project.id(), &taken);
    }

    // === Chain events ===

    fn on_new_best_block(self: &Arc<Self>, height: u64) {
        self.scheduler.assert_on_thread();
        // Skip pointless recalculation until we are caught up with the tip.
        if height + CHAIN_CATCHUP_MARGIN <= self.peers.most_common_chain_height() {
            return;
        }
        info!("new block at height {height}, refreshing pledges");
        for project in self.disk.projects() {
            if self.mode == Mode::Client && project.payment_url().is_some() {
                self.schedule_jittered_server_requery(project);
            } else {
                self.schedule_jittered_p2p_requery(project);
            }
        }
    }

    fn schedule_jittered_p2p_requery(self: &Arc<Self>, project: Arc<Project>) {
        let delay = jittered_delay(REQUERY_BASE_DELAY_SECS, self.max_jitter_secs());
        debug!("scheduling P2P requery of {project} in {delay:?}");
        let handler = self.clone();
        self.scheduler.schedule(
            Box::new(move || {
                let pledges: HashSet<Pledge> = handler.disk.pledges_for(&project.id()).into_iter().collect();
                if !pledges.is_empty() {
                    handler.check_pledges_against_p2p(project, pledges, true);
                }
            }),
            delay,
        );
    }

    fn schedule_jittered_server_requery(self: &Arc<Self>, project: Arc<Project>) {
        let delay = jittered_delay(REQUERY_BASE_DELAY_SECS, self.max_jitter_secs());
        debug!("scheduling server requery of {project} in {delay:?}");
        let handler = self.clone();
        self.scheduler.schedule(
            Box::new(move || {
                handler.refresh_project_status_from_server(project);
            }),
            delay,
        );
    }

    // === P2P verification rounds ===

    /// Verify `pledges` against the UTXO set as one batched round.
    /// Completes with the verified subset; a failed round surfaces through
    /// the project's check status as well.
    pub fn check_pledges_against_p2p(
        self: &Arc<Self>,
        project: Arc<Project>,
        pledges: HashSet<Pledge>,
        checking_all: bool,
    ) -> Completion<HashSet<Pledge>> {
        let completion = Completion::new();
        if pledges.is_empty() {
            info!("no pledges to check");
            completion.complete(HashSet::new());
            return completion;
        }
        if self.mode == Mode::Client {
            // The app broadcasts and settles dependencies before writing a
            // pledge file, so a dependency here means the protocol was not
            // followed.
            for pledge in &pledges {
                if !pledge.dependencies().is_empty() {
                    completion.fail(BackendError::TooManyDependencies { count: pledge.dependencies().len(), max: 0 });
                    return completion;
                }
            }
        }
        let handler = self.clone();
        let remote = completion.clone();
        // ASAP so answers to submissions in flight beat queued requeries.
        self.scheduler.submit_asap(Box::new(move || {
            match handler.run_check_round(&project, &pledges, checking_all) {
                Ok(verified) => remote.complete(verified),
                Err(shared) => remote.fail(BackendError::Message(shared.to_string())),
            }
        }));
        completion
    }

    fn run_check_round(self: &Arc<Self>, project: &Arc<Project>, pledges: &HashSet<Pledge>, checking_all: bool) -> RoundResult {
        self.scheduler.assert_on_thread();
        info!("checking {} pledge(s) against P2P network for {}", pledges.len(), project);
        self.lock_state().store.set_check_in_progress(project.id());
        match self.do_utxo_lookups(project, pledges, checking_all) {
            Ok(verified) => {
                let mut state = self.lock_state();
                self.apply_sync(&mut state, project, pledges, &verified, checking_all);
                state.store.clear_check(&project.id());
                Ok(verified)
            }
            Err(err) => {
                error!("pledge check failed for {project}: {err}");
                let shared = Arc::new(err);
                self.lock_state().store.set_check_failed(project.id(), shared.clone());
                Err(shared)
            }
        }
    }

    fn do_utxo_lookups(&self, project: &Arc<Project>, pledges: &HashSet<Pledge>, checking_all: bool) -> Result<HashSet<Pledge>> {
        // Accepted pledges must not share an outpoint. When only new
        // pledges are checked, seed with what is already accepted.
        let mut consumed = HashSet::new();
        if !checking_all {
            let state = self.lock_state();
            for pledge in state.store.open_snapshot(&project.id()) {
                for outpoint in pledge.outpoints() {
                    if !consumed.insert(outpoint) {
                        return Err(BackendError::DuplicatedOutPoint { outpoint });
                    }
                }
            }
        }

        let mut wanted = HashSet::new();
        for pledge in pledges {
            wanted.extend(pledge.outpoints());
        }
        let request: Vec<_> = wanted.into_iter().collect();
        let snapshot = self.coordinator.query(self.min_peers_for_utxo_query(), request, self.utxo_query_timeout)?;
        debug!(
            "UTXO round: {} responder(s), {} live entries, {} untrusted outpoint(s)",
            snapshot.responders,
            snapshot.entries.len(),
            snapshot.untrusted.len()
        );

        let mut verified = HashSet::new();
        for pledge in pledges {
            match crate::domain::verify::verify_pledge(project, pledge, &snapshot.entries) {
                Ok(()) => {
                    for outpoint in pledge.outpoints() {
                        if !consumed.insert(outpoint) {
                            return Err(BackendError::DuplicatedOutPoint { outpoint });
                        }
                    }
                    verified.insert(pledge.clone());
                }
                Err(err) => {
                    // An outpoint the responders disagreed about comes back
                    // as unknown; name the disagreement before deciding.
                    let err = match err {
                        BackendError::UnknownUtxo { outpoint } if snapshot.untrusted.contains(&outpoint) => {
                            BackendError::PeerDisagreement { outpoint }
                        }
                        other => other,
                    };
                    if err.is_revocation() {
                        info!("dropping {pledge}: {err}");
                    } else {
                        return Err(err);
                    }
                }
            }
        }
        info!("{} of {} pledges verified (were not revoked/claimed)", verified.len(), pledges.len());
        Ok(verified)
    }

    fn apply_sync(
        &self,
        state: &mut EngineState,
        project: &Arc<Project>,
        tested: &HashSet<Pledge>,
        verified: &HashSet<Pledge>,
        checking_all: bool,
    ) {
        let current_open = state.store.open_snapshot(&project.id());
        let wallet = self.wallet.clone();
        let plan = sync::reconcile(&current_open, tested, verified, checking_all, self.mode == Mode::Client, &|pledge| {
            wallet.was_pledge_revoked(pledge)
        });
        for pledge in &plan.newly_open {
            state.store.add_open(project.id(), pledge.clone());
        }
        for pledge in &plan.newly_invalid {
            state.store.remove_open(project.id(), pledge);
        }
        // A pledge that went missing might have been claimed.
        if project.payment_url().is_none() && !plan.newly_invalid.is_empty() {
            if let Some(claim) = self.claim_for_project(project) {
                for pledge in &plan.newly_invalid {
                    if pledge_appears_in_claim(pledge, &claim) {
                        state.store.add_claimed(project.id(), pledge.clone());
                    }
                }
            }
        }
    }

    fn claim_for_project(&self, project: &Arc<Project>) -> Option<Transaction> {
        let info = self.disk.project_state(&project.id());
        if info.state == ProjectState::Claimed {
            info.claimed_by.and_then(|txid| self.wallet.transaction(&txid))
        } else {
            None
        }
    }

    // === Server refresh ===

    /// Manual refresh from the project server. Callable from any thread.
    pub fn refresh_project_status_from_server(self: &Arc<Self>, project: Arc<Project>) -> Completion<()> {
        let completion = Completion::new();
        let handler = self.clone();
        let remote = completion.clone();
        self.scheduler.submit(Box::new(move || {
            let mut state = handler.lock_state();
            handler.start_server_lookup(&mut state, project, remote);
        }));
        completion
    }

    fn start_server_lookup(self: &Arc<Self>, state: &mut EngineState, project: Arc<Project>, completion: Completion<()>) {
        self.scheduler.assert_on_thread();
        let Some(url) = project.payment_url().cloned() else {
            completion.fail(BackendError::Message(format!("project {project} has no payment URL")));
            return;
        };
        state.store.set_check_in_progress(project.id());
        let weak = Arc::downgrade(self);
        self.status_transport.fetch_status(
            &url,
            Box::new(move |result| {
                let Some(backend) = weak.upgrade() else {
                    return;
                };
                let handler = backend.clone();
                backend.scheduler.submit(Box::new(move || handler.finish_server_lookup(project, result, completion)));
            }),
        );
    }

    fn finish_server_lookup(self: &Arc<Self>, project: Arc<Project>, result: Result<crate::domain::ProjectStatus>, completion: Completion<()>) {
        self.scheduler.assert_on_thread();
        let mut state = self.lock_state();
        match result {
            Err(err) => {
                error!("server status lookup failed for {project}: {err}");
                let shared = Arc::new(err);
                state.store.set_check_failed(project.id(), shared.clone());
                completion.fail(BackendError::Message(shared.to_string()));
            }
            Ok(status) => {
                info!("processing server status for {}: {} pledge(s)", project, status.pledges.len());
                let pledges: HashSet<Pledge> = status.pledges.into_iter().collect();
                self.apply_sync(&mut state, &project, &pledges, &pledges, true);
                // The server's view of the claim overrides ours: we may
                // have imported the project post-claim and never seen the
                // transaction.
                if let Some(claimed_by) = status.claimed_by {
                    if self.disk.project_state(&project.id()).state != ProjectState::Claimed {
                        self.disk.set_project_state(&project.id(), ProjectStateInfo::claimed(claimed_by));
                    }
                }
                state.store.clear_check(&project.id());
                completion.complete(());
            }
        }
    }

    // === Server-mode pledge submission ===

    /// Submission pipeline for a pledge arriving over HTTP. Fast stateless
    /// checks run on the calling thread; the engine thread broadcasts the
    /// dependencies (each under its own deadline), runs the UTXO round and
    /// persists the pledge. Completes with `None` when the pledge was
    /// silently rejected (revoked or unknown UTXOs).
    pub fn submit_pledge(self: &Arc<Self>, project: Arc<Project>, pledge: Pledge) -> Completion<Option<Pledge>> {
        let completion = Completion::new();
        if let Err(err) = fast_sanity_check(&pledge) {
            completion.fail(err);
            return completion;
        }
        let handler = self.clone();
        let remote = completion.clone();
        self.scheduler.submit_asap(Box::new(move || {
            remote.finish(handler.run_submission(&project, pledge));
        }));
        completion
    }

    fn run_submission(self: &Arc<Self>, project: &Arc<Project>, pledge: Pledge) -> Result<Option<Pledge>> {
        self.scheduler.assert_on_thread();
        // Broadcasting on behalf of the submitter lets the HTTP answer
        // carry a real verdict; were the client to broadcast, the server
        // might verify before the dependencies arrive and bounce a good
        // pledge.
        let deps = pledge.dependencies();
        if !deps.is_empty() {
            info!("broadcasting {} provided pledge dependencies", deps.len());
            for tx in deps {
                self.peers.broadcast_transaction(tx, self.dependency_broadcast_timeout)?;
            }
        }
        let tested: HashSet<Pledge> = std::iter::once(pledge.clone()).collect();
        let verified = self
            .run_check_round(project, &tested, false)
            .map_err(|shared| BackendError::Message(shared.to_string()))?;
        if verified.is_empty() {
            info!("submitted pledge did not survive verification, not persisting");
            return Ok(None);
        }
        // The disk watcher will announce the new file; the engine then
        // recognises the pledge as already loaded and verified.
        persist::save_pledge(&self.disk.data_dir(), &pledge)?;
        Ok(Some(pledge))
    }

    // === Mirrors and lookups ===

    pub fn mirror_open_pledges(self: &Arc<Self>, project_id: ProjectId, executor: Arc<dyn Executor>) -> Result<SetMirror<Pledge>> {
        let backend = self.clone();
        self.scheduler.run_on_thread(move || backend.lock_state().store.mirror_open(project_id, executor))
    }

    pub fn mirror_claimed_pledges(self: &Arc<Self>, project_id: ProjectId, executor: Arc<dyn Executor>) -> Result<SetMirror<Pledge>> {
        let backend = self.clone();
        self.scheduler.run_on_thread(move || backend.lock_state().store.mirror_claimed(project_id, executor))
    }

    pub fn mirror_check_statuses(self: &Arc<Self>, executor: Arc<dyn Executor>) -> Result<MapMirror<ProjectId, CheckStatus>> {
        let backend = self.clone();
        self.scheduler.run_on_thread(move || backend.lock_state().store.mirror_check_statuses(executor))
    }

    pub fn mirror_projects(self: &Arc<Self>, executor: Arc<dyn Executor>) -> Result<MapMirror<ProjectId, Arc<Project>>> {
        let backend = self.clone();
        self.scheduler.run_on_thread(move || backend.lock_state().store.mirror_projects(executor))
    }

    pub fn mirror_project_states(self: &Arc<Self>, executor: Arc<dyn Executor>) -> Result<MapMirror<ProjectId, ProjectStateInfo>> {
        let backend = self.clone();
        self.scheduler.run_on_thread(move || backend.lock_state().store.mirror_states(executor))
    }

    /// Reactive sum of open plus claimed pledge values for a project.
    pub fn make_total_pledged(self: &Arc<Self>, project_id: ProjectId, executor: Arc<dyn Executor>) -> Result<TotalPledged> {
        let backend = self.clone();
        self.scheduler.run_on_thread(move || {
            let mut state = backend.lock_state();
            let open = state.store.mirror_open(project_id, executor.clone());
            let claimed = state.store.mirror_claimed(project_id, executor);
            TotalPledged::new(open, claimed)
        })
    }

    pub fn get_project_by_id(&self, project_id: &ProjectId) -> Option<Arc<Project>> {
        self.disk.project_by_id(project_id)
    }

    pub fn get_project_from_url(&self, url: &Url) -> Option<Arc<Project>> {
        self.url_index.lock().unwrap_or_else(|e| e.into_inner()).get(url.path()).cloned()
    }

    pub fn save_project(&self, project: Project) -> Result<Arc<Project>> {
        self.disk.save_project(project)
    }

    /// Adds the given file as a project; its directory will be watched for
    /// pledges.
    pub fn add_project_file(&self, path: &Path) -> Result<Arc<Project>> {
        self.disk.add_project_file(path)
    }

    // === Knobs ===

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn min_peers_for_utxo_query(&self) -> usize {
        self.min_peers.load(Ordering::Relaxed)
    }

    pub fn set_min_peers_for_utxo_query(&self, min_peers: usize) {
        self.min_peers.store(min_peers, Ordering::Relaxed);
    }

    pub fn max_jitter_secs(&self) -> u64 {
        self.max_jitter_secs.load(Ordering::Relaxed)
    }

    pub fn set_max_jitter_secs(&self, max_jitter_secs: u64) {
        self.max_jitter_secs.store(max_jitter_secs, Ordering::Relaxed);
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_match_the_protocol_constants() {
        let config = BackendConfig::default();
        assert_eq!(config.min_peers_for_utxo_query, 2);
        assert_eq!(config.max_jitter_secs, 30);
        assert_eq!(config.utxo_query_timeout_secs, 10);
        assert_eq!(config.dependency_broadcast_timeout_secs, 30);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: BackendConfig = serde_json::from_str("{}").expect("config");
        assert_eq!(config.min_peers_for_utxo_query, 2);
        let config: BackendConfig = serde_json::from_str(r#"{"min_peers_for_utxo_query": 4}"#).expect("config");
        assert_eq!(config.min_peers_for_utxo_query, 4);
        assert_eq!(config.max_jitter_secs, 30);
    }
}
