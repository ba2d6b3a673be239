use crate::application::observable::{MapMirror, ObservableMap, ObservableSet, SetMirror};
use crate::application::scheduler::Executor;
use crate::domain::{CheckStatus, Pledge, Project, ProjectStateInfo};
use crate::foundation::{BackendError, ProjectId};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Engine-owned observable state: per-project open and claimed pledge
/// sets, per-project check status, plus the project list and recorded
/// project states. Only the engine thread mutates it; everyone else reads
/// through mirrors.
#[derive(Default)]
pub struct PledgeStore {
    open: std::collections::HashMap<ProjectId, ObservableSet<Pledge>>,
    claimed: std::collections::HashMap<ProjectId, ObservableSet<Pledge>>,
    check: ObservableMap<ProjectId, CheckStatus>,
    projects: ObservableMap<ProjectId, Arc<Project>>,
    states: ObservableMap<ProjectId, ProjectStateInfo>,
}

impl PledgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_mut(&mut self, project_id: ProjectId) -> &mut ObservableSet<Pledge> {
        self.open.entry(project_id).or_default()
    }

    pub fn claimed_mut(&mut self, project_id: ProjectId) -> &mut ObservableSet<Pledge> {
        self.claimed.entry(project_id).or_default()
    }

    pub fn open_snapshot(&self, project_id: &ProjectId) -> HashSet<Pledge> {
        self.open.get(project_id).map(ObservableSet::snapshot).unwrap_or_default()
    }

    pub fn claimed_snapshot(&self, project_id: &ProjectId) -> HashSet<Pledge> {
        self.claimed.get(project_id).map(ObservableSet::snapshot).unwrap_or_default()
    }

    pub fn add_open(&mut self, project_id: ProjectId, pledge: Pledge) -> bool {
        self.open_mut(project_id).insert(pledge)
    }

    pub fn remove_open(&mut self, project_id: ProjectId, pledge: &Pledge) -> bool {
        self.open_mut(project_id).remove(pledge)
    }

    pub fn add_claimed(&mut self, project_id: ProjectId, pledge: Pledge) -> bool {
        self.claimed_mut(project_id).insert(pledge)
    }

    pub fn remove_claimed(&mut self, project_id: ProjectId, pledge: &Pledge) -> bool {
        self.claimed_mut(project_id).remove(pledge)
    }

    pub fn move_open_to_claimed(&mut self, project_id: ProjectId, pledges: &[Pledge]) {
        for pledge in pledges {
            self.open_mut(project_id).remove(pledge);
            self.claimed_mut(project_id).insert(pledge.clone());
        }
    }

    /// Anywhere a pledge is currently counted: open or claimed, any
    /// project.
    pub fn is_pledge_tracked(&self, pledge: &Pledge) -> bool {
        self.open.values().any(|set| set.contains(pledge)) || self.claimed.values().any(|set| set.contains(pledge))
    }

    pub fn set_check_in_progress(&mut self, project_id: ProjectId) {
        self.check.insert(project_id, CheckStatus::InProgress);
    }

    pub fn set_check_failed(&mut self, project_id: ProjectId, error: Arc<BackendError>) {
        self.check.insert(project_id, CheckStatus::Failed(error));
    }

    pub fn clear_check(&mut self, project_id: &ProjectId) {
        self.check.remove(project_id);
    }

    pub fn check_status(&self, project_id: &ProjectId) -> Option<&CheckStatus> {
        self.check.get(project_id)
    }

    pub fn upsert_project(&mut self, project: Arc<Project>) {
        self.projects.insert(project.id(), project);
    }

    pub fn remove_project(&mut self, project_id: &ProjectId) {
        self.projects.remove(project_id);
    }

    pub fn project(&self, project_id: &ProjectId) -> Option<&Arc<Project>> {
        self.projects.get(project_id)
    }

    pub fn set_state(&mut self, project_id: ProjectId, info: ProjectStateInfo) {
        self.states.insert(project_id, info);
    }

    pub fn mirror_open(&mut self, project_id: ProjectId, executor: Arc<dyn Executor>) -> SetMirror<Pledge> {
        SetMirror::mirror(self.open_mut(project_id), executor)
    }

    pub fn mirror_claimed(&mut self, project_id: ProjectId, executor: Arc<dyn Executor>) -> SetMirror<Pledge> {
        SetMirror::mirror(self.claimed_mut(project_id), executor)
    }

    pub fn mirror_check_statuses(&mut self, executor: Arc<dyn Executor>) -> MapMirror<ProjectId, CheckStatus> {
        MapMirror::mirror(&mut self.check, executor)
    }

    pub fn mirror_projects(&mut self, executor: Arc<dyn Executor>) -> MapMirror<ProjectId, Arc<Project>> {
        MapMirror::mirror(&mut self.projects, executor)
    }

    pub fn mirror_states(&mut self, executor: Arc<dyn Executor>) -> MapMirror<ProjectId, ProjectStateInfo> {
        MapMirror::mirror(&mut self.states, executor)
    }
}

/// Reactive sum of `total_input_value` across a project's open and claimed
/// pledges. Owns its input mirrors so the aggregate stays live for as long
/// as anyone holds it.
pub struct TotalPledged {
    total_sat: Arc<AtomicU64>,
    open: SetMirror<Pledge>,
    claimed: SetMirror<Pledge>,
}

impl TotalPledged {
    pub fn new(open: SetMirror<Pledge>, claimed: SetMirror<Pledge>) -> Self {
        let total_sat = Arc::new(AtomicU64::new(0));
        let aggregate = Self { total_sat: total_sat.clone(), open, claimed };
        let recompute = {
            let open = aggregate.open.clone();
            let claimed = aggregate.claimed.clone();
            let total_sat = total_sat.clone();
            move || {
                let sum: u64 = open
                    .snapshot()
                    .union(&claimed.snapshot())
                    .map(|pledge| pledge.total_input_value().to_sat())
                    .sum();
                total_sat.store(sum, Ordering::SeqCst);
            }
        };
        recompute();
        let on_open = recompute.clone();
        aggregate.open.on_change(move |_| on_open());
        aggregate.claimed.on_change(move |_| recompute());
        aggregate
    }

    pub fn get_sat(&self) -> u64 {
        self.total_sat.load(Ordering::SeqCst)
    }

    pub fn open_mirror(&self) -> &SetMirror<Pledge> {
        &self.open
    }

    pub fn claimed_mirror(&self) -> &SetMirror<Pledge> {
        &self.claimed
    }
}
