use crate::foundation::util::Completion;
use crate::foundation::{BackendError, Result};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

pub type Task = Box<dyn FnOnce() + Send>;

/// Anything that can run a task somewhere. Mirrors deliver their diffs
/// through one of these so observers pick the thread they are updated on.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Task);
}

/// Runs tasks immediately on the calling thread.
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, task: Task) {
        task();
    }
}

/// The engine thread: a single-threaded cooperative executor owning all
/// pledge state mutation. Ready tasks run FIFO; ASAP tasks jump the queue
/// (answers to in-flight queries beat requeries); timed tasks become ready
/// at their due instant.
///
/// Handles are cheap clones of one shared worker.
#[derive(Clone)]
pub struct Scheduler {
    state: Arc<SchedulerState>,
}

struct SchedulerState {
    queues: Mutex<Queues>,
    cvar: Condvar,
    engine_thread: Mutex<Option<ThreadId>>,
    shutdown: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct Queues {
    asap: VecDeque<Task>,
    ready: VecDeque<Task>,
    timed: BinaryHeap<TimedTask>,
    next_seq: u64,
}

struct TimedTask {
    due: Instant,
    seq: u64,
    task: Task,
}

// Min-heap on (due, seq): earliest deadline first, FIFO among equal
// deadlines.
impl Ord for TimedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.due.cmp(&self.due).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimedTask {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for TimedTask {}

impl Scheduler {
    pub fn new(thread_name: &str) -> Self {
        let state = Arc::new(SchedulerState {
            queues: Mutex::new(Queues::default()),
            cvar: Condvar::new(),
            engine_thread: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            worker: Mutex::new(None),
        });
        let worker_state = Arc::clone(&state);
        let handle = thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || SchedulerState::worker_loop(worker_state))
            .unwrap_or_else(|err| panic!("failed to spawn engine thread: {err}"));
        *state.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Self { state }
    }

    /// Enqueue behind other ready tasks.
    pub fn submit(&self, task: Task) {
        let mut queues = self.state.lock_queues();
        queues.ready.push_back(task);
        drop(queues);
        self.state.cvar.notify_one();
    }

    /// Enqueue ahead of regular tasks.
    pub fn submit_asap(&self, task: Task) {
        let mut queues = self.state.lock_queues();
        queues.asap.push_back(task);
        drop(queues);
        self.state.cvar.notify_one();
    }

    /// Run `task` once `delay` has elapsed.
    pub fn schedule(&self, task: Task, delay: Duration) {
        let mut queues = self.state.lock_queues();
        let seq = queues.next_seq;
        queues.next_seq += 1;
        queues.timed.push(TimedTask { due: Instant::now() + delay, seq, task });
        drop(queues);
        self.state.cvar.notify_one();
    }

    /// Run `f` on the engine thread and return its value; inline when
    /// already there.
    pub fn run_on_thread<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.is_on_thread() {
            return Ok(f());
        }
        if self.state.shutdown.load(Ordering::Acquire) {
            return Err(BackendError::EngineShutdown);
        }
        let completion: Completion<T> = Completion::new();
        let remote = completion.clone();
        self.submit(Box::new(move || remote.complete(f())));
        completion.wait()
    }

    pub fn is_on_thread(&self) -> bool {
        let engine = self.state.engine_thread.lock().unwrap_or_else(|e| e.into_inner());
        *engine == Some(thread::current().id())
    }

    /// Aborts when invoked off the engine thread. Called defensively by
    /// every state mutator.
    pub fn assert_on_thread(&self) {
        if !self.is_on_thread() {
            panic!("engine state touched from {:?}, not the engine thread", thread::current().name().unwrap_or("?"));
        }
    }

    /// Stop accepting work, drain already-ready tasks, and join. Pending
    /// timed tasks are dropped.
    pub fn shutdown(&self) {
        self.state.shutdown.store(true, Ordering::Release);
        self.state.cvar.notify_all();
        let handle = self.state.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if thread::current().id() != handle.thread().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Executor for Scheduler {
    fn execute(&self, task: Task) {
        self.submit(task);
    }
}

impl SchedulerState {
    fn lock_queues(&self) -> std::sync::MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn worker_loop(state: Arc<Self>) {
        *state.engine_thread.lock().unwrap_or_else(|e| e.into_inner()) = Some(thread::current().id());
        loop {
            let task = {
                let mut queues = state.lock_queues();
                loop {
                    let now = Instant::now();
                    while queues.timed.peek().is_some_and(|timed| timed.due <= now) {
                        if let Some(timed) = queues.timed.pop() {
                            queues.ready.push_back(timed.task);
                        }
                    }
                    if let Some(task) = queues.asap.pop_front() {
                        break Some(task);
                    }
                    if let Some(task) = queues.ready.pop_front() {
                        break Some(task);
                    }
                    if state.shutdown.load(Ordering::Acquire) {
                        break None;
                    }
                    match queues.timed.peek().map(|timed| timed.due) {
                        Some(due) => {
                            let now = Instant::now();
                            if due > now {
                                let (guard, _) = state.cvar.wait_timeout(queues, due - now).unwrap_or_else(|e| e.into_inner());
                                queues = guard;
                            }
                        }
                        None => {
                            queues = state.cvar.wait(queues).unwrap_or_else(|e| e.into_inner());
                        }
                    }
                }
            };
            match task {
                Some(task) => task(),
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn tasks_run_fifo() {
        let scheduler = Scheduler::new("test-engine");
        let order = Arc::new(Mutex::new(Vec::new()));
        for value in 0..4 {
            let order = order.clone();
            scheduler.submit(Box::new(move || order.lock().unwrap_or_else(|e| e.into_inner()).push(value)));
        }
        scheduler.run_on_thread(|| ()).expect("flush");
        assert_eq!(*order.lock().unwrap_or_else(|e| e.into_inner()), vec![0, 1, 2, 3]);
        scheduler.shutdown();
    }

    #[test]
    fn asap_tasks_jump_the_queue() {
        let scheduler = Scheduler::new("test-engine");
        let order = Arc::new(Mutex::new(Vec::new()));

        // Park the worker so the queues fill before anything runs.
        let gate: Completion<()> = Completion::new();
        let gate_remote = gate.clone();
        scheduler.submit(Box::new(move || gate_remote.wait_ready()));

        for value in [1, 2] {
            let order = order.clone();
            scheduler.submit(Box::new(move || order.lock().unwrap_or_else(|e| e.into_inner()).push(value)));
        }
        let asap_order = order.clone();
        scheduler.submit_asap(Box::new(move || asap_order.lock().unwrap_or_else(|e| e.into_inner()).push(0)));

        gate.complete(());
        scheduler.run_on_thread(|| ()).expect("flush");
        assert_eq!(*order.lock().unwrap_or_else(|e| e.into_inner()), vec![0, 1, 2]);
        scheduler.shutdown();
    }

    #[test]
    fn scheduled_tasks_run_after_their_delay() {
        let scheduler = Scheduler::new("test-engine");
        let counter = Arc::new(AtomicUsize::new(0));
        let start = Instant::now();
        let remote = counter.clone();
        let done: Completion<Duration> = Completion::new();
        let done_remote = done.clone();
        scheduler.schedule(
            Box::new(move || {
                remote.fetch_add(1, Ordering::SeqCst);
                done_remote.complete(start.elapsed());
            }),
            Duration::from_millis(50),
        );
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        let elapsed = done.wait_timeout(Duration::from_secs(5)).expect("scheduled task");
        assert!(elapsed >= Duration::from_millis(50));
        scheduler.shutdown();
    }

    #[test]
    fn run_on_thread_is_inline_on_the_engine_thread() {
        let scheduler = Scheduler::new("test-engine");
        let inner = scheduler.clone();
        let nested = scheduler
            .run_on_thread(move || {
                assert!(inner.is_on_thread());
                inner.run_on_thread(|| 7).expect("inline")
            })
            .expect("outer");
        assert_eq!(nested, 7);
        assert!(!scheduler.is_on_thread());
        scheduler.shutdown();
    }

    #[test]
    #[should_panic(expected = "engine thread")]
    fn assert_on_thread_panics_elsewhere() {
        let scheduler = Scheduler::new("test-engine");
        scheduler.assert_on_thread();
    }
}
