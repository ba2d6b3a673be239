use crate::domain::{Pledge, Project, ProjectStateInfo};
use crate::foundation::{ProjectId, Result};
use bitcoin::Transaction;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone, Debug)]
pub enum DiskEvent {
    ProjectAdded(Arc<Project>),
    /// Filesystem watchers report spurious updates (e.g. sibling file
    /// creation on Linux); consumers treat these as noise.
    ProjectUpdated(Arc<Project>),
    ProjectRemoved(Arc<Project>),
    PledgeAdded { project_id: ProjectId, pledge: Pledge },
    PledgeRemoved { project_id: ProjectId, pledge: Pledge },
    ProjectStateChanged { project_id: ProjectId, info: ProjectStateInfo },
}

pub type DiskListener = Arc<dyn Fn(&DiskEvent) + Send + Sync>;

/// The on-disk project/pledge watcher. It owns project files, per-project
/// pledge directories and the recorded project states; the engine only
/// observes and asks it to persist.
pub trait DiskManager: Send + Sync {
    fn projects(&self) -> Vec<Arc<Project>>;
    fn project_by_id(&self, id: &ProjectId) -> Option<Arc<Project>>;
    /// The project whose goal outputs `tx` pays, if any.
    fn project_from_claim(&self, tx: &Transaction) -> Option<Arc<Project>>;
    fn pledges_for(&self, id: &ProjectId) -> Vec<Pledge>;
    fn project_state(&self, id: &ProjectId) -> ProjectStateInfo;
    fn set_project_state(&self, id: &ProjectId, info: ProjectStateInfo);
    fn save_project(&self, project: Project) -> Result<Arc<Project>>;
    fn add_project_file(&self, path: &Path) -> Result<Arc<Project>>;
    fn add_projects_dir(&self, dir: &Path);
    /// Where submitted pledges are persisted.
    fn data_dir(&self) -> PathBuf;
    fn subscribe(&self, listener: DiskListener);
}

#[derive(Default)]
struct MemoryDiskInner {
    projects: HashMap<ProjectId, Arc<Project>>,
    pledges: HashMap<ProjectId, HashSet<Pledge>>,
    states: HashMap<ProjectId, ProjectStateInfo>,
    watched_dirs: Vec<PathBuf>,
    listeners: Vec<DiskListener>,
}

/// In-memory disk layer double. Project files written through it land in
/// `data_dir` as canonical bytes; watcher notifications are driven by the
/// test instead of the filesystem.
pub struct MemoryDiskManager {
    data_dir: PathBuf,
    inner: Mutex<MemoryDiskInner>,
}

impl MemoryDiskManager {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into(), inner: Mutex::new(MemoryDiskInner::default()) }
    }

    fn lock_inner(&self) -> MutexGuard<'_, MemoryDiskInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: DiskEvent) {
        let listeners: Vec<DiskListener> = self.lock_inner().listeners.clone();
        for listener in listeners {
            listener(&event);
        }
    }

    /// Register a project as if its file appeared in a watched directory.
    pub fn add_project(&self, project: Project) -> Arc<Project> {
        let project = Arc::new(project);
        self.lock_inner().projects.insert(project.id(), project.clone());
        self.emit(DiskEvent::ProjectAdded(project.clone()));
        project
    }

    pub fn remove_project(&self, id: &ProjectId) {
        let removed = self.lock_inner().projects.remove(id);
        if let Some(project) = removed {
            self.emit(DiskEvent::ProjectRemoved(project));
        }
    }

    /// A pledge file appeared next to the project.
    pub fn add_pledge(&self, project_id: ProjectId, pledge: Pledge) {
        self.lock_inner().pledges.entry(project_id).or_default().insert(pledge.clone());
        self.emit(DiskEvent::PledgeAdded { project_id, pledge });
    }

    /// A pledge file disappeared.
    pub fn remove_pledge(&self, project_id: ProjectId, pledge: &Pledge) {
        let removed = self.lock_inner().pledges.get_mut(&project_id).is_some_and(|set| set.remove(pledge));
        if removed {
            self.emit(DiskEvent::PledgeRemoved { project_id, pledge: pledge.clone() });
        }
    }

    pub fn watched_dirs(&self) -> Vec<PathBuf> {
        self.lock_inner().watched_dirs.clone()
    }
}

impl DiskManager for MemoryDiskManager {
    fn projects(&self) -> Vec<Arc<Project>> {
        self.lock_inner().projects.values().cloned().collect()
    }

    fn project_by_id(&self, id: &ProjectId) -> Option<Arc<Project>> {
        self.lock_inner().projects.get(id).cloned()
    }

    fn project_from_claim(&self, tx: &Transaction) -> Option<Arc<Project>> {
        self.lock_inner().projects.values().find(|project| project.is_claim(tx)).cloned()
    }

    fn pledges_for(&self, id: &ProjectId) -> Vec<Pledge> {
        self.lock_inner().pledges.get(id).map(|set| set.iter().cloned().collect()).unwrap_or_default()
    }

    fn project_state(&self, id: &ProjectId) -> ProjectStateInfo {
        self.lock_inner().states.get(id).cloned().unwrap_or_default()
    }

    fn set_project_state(&self, id: &ProjectId, info: ProjectStateInfo) {
        self.lock_inner().states.insert(*id, info.clone());
        self.emit(DiskEvent::ProjectStateChanged { project_id: *id, info });
    }

    fn save_project(&self, project: Project) -> Result<Arc<Project>> {
        let bytes = project.to_bytes()?;
        std::fs::create_dir_all(&self.data_dir)?;
        let path = self.data_dir.join(format!("{}.project", project.id()));
        std::fs::write(path, bytes)?;
        Ok(self.add_project(project))
    }

    fn add_project_file(&self, path: &Path) -> Result<Arc<Project>> {
        let bytes = std::fs::read(path)?;
        let project = Project::from_bytes(&bytes)?;
        Ok(self.add_project(project))
    }

    fn add_projects_dir(&self, dir: &Path) {
        self.lock_inner().watched_dirs.push(dir.to_path_buf());
    }

    fn data_dir(&self) -> PathBuf {
        self.data_dir.clone()
    }

    fn subscribe(&self, listener: DiskListener) {
        self.lock_inner().listeners.push(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::{Amount, Network, ScriptBuf, TxOut};

    fn project(title: &str) -> Project {
        let output = TxOut { value: Amount::from_sat(50_000_000), script_pubkey: ScriptBuf::from_bytes(vec![0x51]) };
        Project::new(title, Network::Regtest, vec![output], None)
    }

    #[test]
    fn saved_project_file_round_trips_through_another_manager() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = MemoryDiskManager::new(dir.path());
        let saved = writer.save_project(project("roof")).expect("save");

        let path = dir.path().join(format!("{}.project", saved.id()));
        assert!(path.exists());

        let reader = MemoryDiskManager::new(dir.path());
        let loaded = reader.add_project_file(&path).expect("load");
        assert_eq!(loaded.id(), saved.id());
        assert_eq!(reader.project_by_id(&saved.id()).map(|p| p.id()), Some(saved.id()));
    }

    #[test]
    fn state_changes_reach_subscribers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let disk = MemoryDiskManager::new(dir.path());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        disk.subscribe(Arc::new(move |event| {
            if let DiskEvent::ProjectStateChanged { project_id, info } = event {
                sink.lock().unwrap_or_else(|e| e.into_inner()).push((*project_id, info.clone()));
            }
        }));

        let added = disk.add_project(project("roof"));
        assert_eq!(disk.project_state(&added.id()), crate::domain::ProjectStateInfo::default());

        let info = crate::domain::ProjectStateInfo::errored();
        disk.set_project_state(&added.id(), info.clone());
        assert_eq!(disk.project_state(&added.id()), info);
        assert_eq!(seen.lock().unwrap_or_else(|e| e.into_inner()).as_slice(), &[(added.id(), info)]);
    }
}
