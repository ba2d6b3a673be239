use crate::application::scheduler::Executor;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, Mutex, RwLock, Weak};

/// A single element-level change to an observed set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SetChange<T> {
    Added(T),
    Removed(T),
}

/// A single entry-level change to an observed map. Overwrites arrive as
/// `Inserted` with the new value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MapChange<K, V> {
    Inserted(K, V),
    Removed(K),
}

type SetListener<T> = Box<dyn FnMut(&SetChange<T>) -> bool + Send>;
type MapListener<K, V> = Box<dyn FnMut(&MapChange<K, V>) -> bool + Send>;

/// A plain set owned by the engine thread that tells listeners about every
/// mutation. Listeners returning `false` are pruned.
pub struct ObservableSet<T> {
    items: HashSet<T>,
    listeners: Vec<SetListener<T>>,
}

impl<T: Clone + Eq + Hash> Default for ObservableSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Eq + Hash> ObservableSet<T> {
    pub fn new() -> Self {
        Self { items: HashSet::new(), listeners: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, item: &T) -> bool {
        self.items.contains(item)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn snapshot(&self) -> HashSet<T> {
        self.items.clone()
    }

    pub fn insert(&mut self, item: T) -> bool {
        if self.items.insert(item.clone()) {
            self.emit(SetChange::Added(item));
            true
        } else {
            false
        }
    }

    pub fn remove(&mut self, item: &T) -> bool {
        if self.items.remove(item) {
            self.emit(SetChange::Removed(item.clone()));
            true
        } else {
            false
        }
    }

    pub fn subscribe(&mut self, listener: SetListener<T>) {
        self.listeners.push(listener);
    }

    fn emit(&mut self, change: SetChange<T>) {
        self.listeners.retain_mut(|listener| listener(&change));
    }
}

/// A plain map owned by the engine thread that tells listeners about every
/// mutation.
pub struct ObservableMap<K, V> {
    items: HashMap<K, V>,
    listeners: Vec<MapListener<K, V>>,
}

impl<K: Clone + Eq + Hash, V: Clone> Default for ObservableMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone + Eq + Hash, V: Clone> ObservableMap<K, V> {
    pub fn new() -> Self {
        Self { items: HashMap::new(), listeners: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.items.get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.items.contains_key(key)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.items.values()
    }

    pub fn snapshot(&self) -> HashMap<K, V> {
        self.items.clone()
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.items.insert(key.clone(), value.clone());
        self.emit(MapChange::Inserted(key, value));
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let removed = self.items.remove(key);
        if removed.is_some() {
            self.emit(MapChange::Removed(key.clone()));
        }
        removed
    }

    pub fn subscribe(&mut self, listener: MapListener<K, V>) {
        self.listeners.push(listener);
    }

    fn emit(&mut self, change: MapChange<K, V>) {
        self.listeners.retain_mut(|listener| listener(&change));
    }
}

type ChangeCallbacks<C> = Mutex<Vec<Box<dyn Fn(&C) + Send + Sync>>>;

struct MirrorShared<S, C> {
    state: RwLock<S>,
    callbacks: ChangeCallbacks<C>,
}

impl<S, C> MirrorShared<S, C> {
    fn new(state: S) -> Arc<Self> {
        Arc::new(Self { state: RwLock::new(state), callbacks: Mutex::new(Vec::new()) })
    }

    fn notify(&self, change: &C) {
        let callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
        for callback in callbacks.iter() {
            callback(change);
        }
    }
}

/// Read-only snapshot of an observed set, updated by diffs the engine
/// posts to the mirror's executor. Change callbacks run there, after the
/// diff has been applied. Dropping every handle detaches the mirror from
/// its source.
pub struct SetMirror<T> {
    shared: Arc<MirrorShared<HashSet<T>, SetChange<T>>>,
}

impl<T> Clone for SetMirror<T> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<T: Clone + Eq + Hash + Send + Sync + 'static> SetMirror<T> {
    /// Snapshot `source` and subscribe to it. Must run on the engine
    /// thread so no change can slip between the copy and the listener
    /// registration.
    pub fn mirror(source: &mut ObservableSet<T>, executor: Arc<dyn Executor>) -> Self {
        let shared = MirrorShared::new(source.snapshot());
        let weak: Weak<MirrorShared<HashSet<T>, SetChange<T>>> = Arc::downgrade(&shared);
        source.subscribe(Box::new(move |change| {
            let Some(shared) = weak.upgrade() else {
                return false;
            };
            let change = change.clone();
            executor.execute(Box::new(move || {
                {
                    let mut state = shared.state.write().unwrap_or_else(|e| e.into_inner());
                    match &change {
                        SetChange::Added(item) => {
                            state.insert(item.clone());
                        }
                        SetChange::Removed(item) => {
                            state.remove(item);
                        }
                    }
                }
                shared.notify(&change);
            }));
            true
        }));
        Self { shared }
    }

    pub fn contains(&self, item: &T) -> bool {
        self.shared.state.read().unwrap_or_else(|e| e.into_inner()).contains(item)
    }

    pub fn len(&self) -> usize {
        self.shared.state.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> HashSet<T> {
        self.shared.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn on_change(&self, callback: impl Fn(&SetChange<T>) + Send + Sync + 'static) {
        self.shared.callbacks.lock().unwrap_or_else(|e| e.into_inner()).push(Box::new(callback));
    }
}

/// Read-only snapshot of an observed map; see [`SetMirror`].
pub struct MapMirror<K, V> {
    shared: Arc<MirrorShared<HashMap<K, V>, MapChange<K, V>>>,
}

impl<K, V> Clone for MapMirror<K, V> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<K, V> MapMirror<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn mirror(source: &mut ObservableMap<K, V>, executor: Arc<dyn Executor>) -> Self {
        let shared = MirrorShared::new(source.snapshot());
        let weak: Weak<MirrorShared<HashMap<K, V>, MapChange<K, V>>> = Arc::downgrade(&shared);
        source.subscribe(Box::new(move |change| {
            let Some(shared) = weak.upgrade() else {
                return false;
            };
            let change = change.clone();
            executor.execute(Box::new(move || {
                {
                    let mut state = shared.state.write().unwrap_or_else(|e| e.into_inner());
                    match &change {
                        MapChange::Inserted(key, value) => {
                            state.insert(key.clone(), value.clone());
                        }
                        MapChange::Removed(key) => {
                            state.remove(key);
                        }
                    }
                }
                shared.notify(&change);
            }));
            true
        }));
        Self { shared }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.shared.state.read().unwrap_or_else(|e| e.into_inner()).get(key).cloned()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.shared.state.read().unwrap_or_else(|e| e.into_inner()).contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.shared.state.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> HashMap<K, V> {
        self.shared.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn on_change(&self, callback: impl Fn(&MapChange<K, V>) + Send + Sync + 'static) {
        self.shared.callbacks.lock().unwrap_or_else(|e| e.into_inner()).push(Box::new(callback));
    }
}
