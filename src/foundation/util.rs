use crate::foundation::{BackendError, Result};
use rand::Rng;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// One-shot waitable result, handed across threads by cloning.
///
/// First completion wins; later completions are dropped. `wait` takes the
/// value out, so only one waiter receives it.
pub struct Completion<T> {
    inner: Arc<CompletionInner<T>>,
}

struct CompletionInner<T> {
    slot: Mutex<CompletionSlot<T>>,
    cvar: Condvar,
}

enum CompletionSlot<T> {
    Pending,
    Done(Result<T>),
    Taken,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Completion<T> {
    pub fn new() -> Self {
        Self { inner: Arc::new(CompletionInner { slot: Mutex::new(CompletionSlot::Pending), cvar: Condvar::new() }) }
    }

    pub fn complete(&self, value: T) {
        self.finish(Ok(value));
    }

    pub fn fail(&self, err: BackendError) {
        self.finish(Err(err));
    }

    pub fn finish(&self, result: Result<T>) {
        let mut slot = self.inner.slot.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(*slot, CompletionSlot::Pending) {
            *slot = CompletionSlot::Done(result);
            self.inner.cvar.notify_all();
        }
    }

    pub fn is_done(&self) -> bool {
        let slot = self.inner.slot.lock().unwrap_or_else(|e| e.into_inner());
        !matches!(*slot, CompletionSlot::Pending)
    }

    /// Blocks until completed, taking the result.
    pub fn wait(&self) -> Result<T> {
        let mut slot = self.inner.slot.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            match std::mem::replace(&mut *slot, CompletionSlot::Taken) {
                CompletionSlot::Done(result) => return result,
                CompletionSlot::Taken => {
                    return Err(BackendError::Message("completion already consumed".to_string()));
                }
                CompletionSlot::Pending => {
                    *slot = CompletionSlot::Pending;
                    slot = self.inner.cvar.wait(slot).unwrap_or_else(|e| e.into_inner());
                }
            }
        }
    }

    /// Blocks until completed without consuming the result. Usable by any
    /// number of waiters.
    pub fn wait_ready(&self) {
        let mut slot = self.inner.slot.lock().unwrap_or_else(|e| e.into_inner());
        while matches!(*slot, CompletionSlot::Pending) {
            slot = self.inner.cvar.wait(slot).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Blocks until completed or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.inner.slot.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            match std::mem::replace(&mut *slot, CompletionSlot::Taken) {
                CompletionSlot::Done(result) => return result,
                CompletionSlot::Taken => {
                    return Err(BackendError::Message("completion already consumed".to_string()));
                }
                CompletionSlot::Pending => {
                    *slot = CompletionSlot::Pending;
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(BackendError::Timeout { operation: "completion wait".to_string(), timeout_secs: timeout.as_secs() });
                    }
                    let (guard, _) = self
                        .inner
                        .cvar
                        .wait_timeout(slot, deadline - now)
                        .unwrap_or_else(|e| e.into_inner());
                    slot = guard;
                }
            }
        }
    }
}

/// Always wait at least `base_secs`, then smear over another `base_secs`,
/// clamped to `max_jitter_secs`. A zero clamp yields an immediate run.
pub fn jittered_delay(base_secs: u64, max_jitter_secs: u64) -> Duration {
    let base_ms = base_secs.saturating_mul(1000);
    let smear_ms = if base_ms == 0 { 0 } else { rand::thread_rng().gen_range(0..base_ms) };
    let delay_ms = (base_ms + smear_ms).min(max_jitter_secs.saturating_mul(1000));
    Duration::from_millis(delay_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn completion_delivers_value_across_threads() {
        let completion: Completion<u32> = Completion::new();
        let remote = completion.clone();
        let handle = thread::spawn(move || {
            remote.complete(42);
        });
        let value = completion.wait_timeout(Duration::from_secs(5)).expect("completion");
        assert_eq!(value, 42);
        handle.join().expect("join");
    }

    #[test]
    fn completion_first_result_wins() {
        let completion: Completion<u32> = Completion::new();
        completion.complete(1);
        completion.complete(2);
        completion.fail(BackendError::EngineShutdown);
        assert_eq!(completion.wait_timeout(Duration::from_millis(10)).expect("completion"), 1);
    }

    #[test]
    fn completion_times_out_when_pending() {
        let completion: Completion<u32> = Completion::new();
        let err = completion.wait_timeout(Duration::from_millis(20)).expect_err("timeout");
        assert!(matches!(err, BackendError::Timeout { .. }));
    }

    #[test]
    fn jitter_respects_clamp() {
        assert_eq!(jittered_delay(15, 0), Duration::ZERO);
        for _ in 0..32 {
            let delay = jittered_delay(15, 30);
            assert!(delay >= Duration::from_secs(15));
            assert!(delay <= Duration::from_secs(30));
        }
        assert_eq!(jittered_delay(15, 1), Duration::from_secs(1));
    }
}
