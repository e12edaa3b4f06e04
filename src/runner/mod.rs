//! Per-engine task runner
//!
//! Each hosted-engine instance gets one runner thread that executes
//! engine-scheduled tasks at the engine's requested timestamps, measured on
//! the *engine's* monotonic clock. The thread doubles as a strand: every
//! embedder-originated engine call (platform messages, locale updates) is
//! funneled through it, so the engine never observes concurrent calls from
//! this runner.

use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use tokio::sync::oneshot;

use crate::engine::{Engine, EngineResult, EngineTask};

/// A serialized call executed on the runner thread with the engine handle
pub type EngineCall = Box<dyn FnOnce(&dyn Engine) + Send>;

/// Heap entry ordering tasks by target time, earliest first.
///
/// Ordering is by timestamp only: among equal timestamps the pop order is
/// whatever the binary heap produces. No FIFO guarantee exists or is
/// implied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ScheduledTask(EngineTask);

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed so the max-heap pops the earliest deadline
        other.0.target_time.cmp(&self.0.target_time)
    }
}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct RunnerState {
    queue: BinaryHeap<ScheduledTask>,
    /// Tokens currently sitting in the queue. A token is removed when its
    /// task is popped for execution, so the heap never holds an expired
    /// duplicate of an already-executed token.
    queued_tokens: HashSet<u64>,
    immediates: VecDeque<EngineCall>,
    running: bool,
}

struct RunnerShared {
    state: Mutex<RunnerState>,
    cond: Condvar,
}

/// Single-threaded, strictly-ordered scheduler for one engine instance
pub struct TaskRunner {
    shared: Arc<RunnerShared>,
    handle: Option<JoinHandle<()>>,
}

impl TaskRunner {
    /// Spawns the runner thread for the given engine instance
    pub fn new(engine: Arc<dyn Engine>, instance: usize) -> Result<Self> {
        let shared = Arc::new(RunnerShared {
            state: Mutex::new(RunnerState {
                queue: BinaryHeap::new(),
                queued_tokens: HashSet::new(),
                immediates: VecDeque::new(),
                running: true,
            }),
            cond: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("perch-runner-{}", instance))
            .spawn(move || runner_loop(thread_shared, engine))
            .context("Failed to spawn task runner thread")?;

        info!("⏱️ Task runner started for engine instance {}", instance);

        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Queues an engine task for execution at its target time.
    ///
    /// Callable from any thread, including the engine's own. A token that is
    /// already queued is dropped rather than duplicated.
    pub fn post_task(&self, task: EngineTask) {
        let mut state = self.shared.state.lock();
        if !state.running {
            debug!("Dropping task {} posted after shutdown", task.token);
            return;
        }
        if !state.queued_tokens.insert(task.token) {
            debug!("Dropping duplicate task token {}", task.token);
            return;
        }
        state.queue.push(ScheduledTask(task));
        drop(state);
        self.shared.cond.notify_one();
    }

    /// Runs a closure on the runner thread with the engine handle
    pub fn post<F>(&self, call: F)
    where
        F: FnOnce(&dyn Engine) + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if !state.running {
            debug!("Dropping call posted after shutdown");
            return;
        }
        state.immediates.push_back(Box::new(call));
        drop(state);
        self.shared.cond.notify_one();
    }

    /// Sends a platform message through the strand; the returned future
    /// resolves once the serialized call has completed
    pub fn send_platform_message(
        &self,
        channel: &str,
        payload: Vec<u8>,
    ) -> oneshot::Receiver<EngineResult> {
        let (tx, rx) = oneshot::channel();
        let channel = channel.to_string();
        self.post(move |engine| {
            let _ = tx.send(engine.send_platform_message(&channel, &payload));
        });
        rx
    }

    /// Updates the engine locale through the strand
    pub fn update_locale(&self, locale: &str) -> oneshot::Receiver<EngineResult> {
        let (tx, rx) = oneshot::channel();
        let locale = locale.to_string();
        self.post(move |engine| {
            let _ = tx.send(engine.update_locale(&locale));
        });
        rx
    }

    /// Stops the runner: pending immediates are drained, unexpired tasks
    /// are abandoned, and the thread is joined
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.running = false;
        }
        self.shared.cond.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn runner_loop(shared: Arc<RunnerShared>, engine: Arc<dyn Engine>) {
    loop {
        let mut calls: Vec<EngineCall> = Vec::new();
        let mut due: Vec<EngineTask> = Vec::new();

        {
            let mut state = shared.state.lock();

            // Drain all immediately-runnable work first
            while let Some(call) = state.immediates.pop_front() {
                calls.push(call);
            }

            // Then every task whose target time has arrived on the engine
            // clock
            let now = engine.current_time();
            while state.queue.peek().is_some_and(|t| t.0.target_time <= now) {
                if let Some(task) = state.queue.pop().map(|t| t.0) {
                    state.queued_tokens.remove(&task.token);
                    due.push(task);
                }
            }

            if calls.is_empty() && due.is_empty() {
                if !state.running {
                    break;
                }
                match state.queue.peek() {
                    Some(next) => {
                        let wait = next.0.target_time.saturating_sub(now);
                        shared.cond.wait_for(&mut state, wait);
                    }
                    None => shared.cond.wait(&mut state),
                }
                continue;
            }
        }

        // Engine calls happen outside the lock; this thread is the strand
        for call in calls {
            call(engine.as_ref());
        }
        for task in due {
            if let Err(e) = engine.run_task(&task) {
                warn!("⚠️ Engine task {} failed: {}", task.token, e);
            }
        }
    }

    debug!("Task runner thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        EngineError, KeyEvent, PointerEvent, WindowMetrics,
    };
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    /// Engine fake with a manually advanced clock and a run log
    struct FakeEngine {
        clock: Mutex<Duration>,
        ran: Mutex<Vec<u64>>,
        shut_down: AtomicBool,
    }

    impl FakeEngine {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                clock: Mutex::new(Duration::from_secs(100)),
                ran: Mutex::new(Vec::new()),
                shut_down: AtomicBool::new(false),
            })
        }

        fn advance(&self, by: Duration) {
            *self.clock.lock() += by;
        }

        fn ran(&self) -> Vec<u64> {
            self.ran.lock().clone()
        }
    }

    impl Engine for FakeEngine {
        fn notify_window_metrics(&self, _metrics: WindowMetrics) -> EngineResult {
            Ok(())
        }
        fn send_pointer_event(&self, _event: PointerEvent) -> EngineResult {
            Ok(())
        }
        fn send_key_event(&self, _event: KeyEvent) -> EngineResult {
            Ok(())
        }
        fn run_task(&self, task: &EngineTask) -> EngineResult {
            self.ran.lock().push(task.token);
            Ok(())
        }
        fn current_time(&self) -> Duration {
            *self.clock.lock()
        }
        fn send_platform_message(&self, channel: &str, _payload: &[u8]) -> EngineResult {
            if channel == "closed" {
                return Err(EngineError::Shutdown);
            }
            Ok(())
        }
        fn update_locale(&self, _locale: &str) -> EngineResult {
            Ok(())
        }
        fn shutdown(&self) -> EngineResult {
            self.shut_down.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn wait_until(deadline: Duration, mut probe: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if probe() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        probe()
    }

    #[test]
    fn test_due_task_executes_promptly() {
        let engine = FakeEngine::new();
        let runner = TaskRunner::new(engine.clone(), 0).unwrap();

        let now = engine.current_time();
        runner.post_task(EngineTask {
            token: 1,
            target_time: now,
        });

        assert!(wait_until(Duration::from_secs(1), || engine.ran() == vec![1]));
        runner.shutdown();
    }

    #[test]
    fn test_future_task_waits_for_engine_clock() {
        let engine = FakeEngine::new();
        let runner = TaskRunner::new(engine.clone(), 0).unwrap();

        let now = engine.current_time();
        runner.post_task(EngineTask {
            token: 7,
            target_time: now + Duration::from_secs(60),
        });

        thread::sleep(Duration::from_millis(50));
        assert!(engine.ran().is_empty(), "task ran before its target time");

        engine.advance(Duration::from_secs(61));
        // Nudge the runner awake; a real engine's clock advances while the
        // runner sleeps toward the deadline anyway.
        runner.post(|_| {});

        assert!(wait_until(Duration::from_secs(1), || engine.ran() == vec![7]));
        runner.shutdown();
    }

    #[test]
    fn test_tasks_pop_in_timestamp_order() {
        let engine = FakeEngine::new();
        let runner = TaskRunner::new(engine.clone(), 0).unwrap();

        let base = Duration::from_secs(200);
        for (token, offset) in [(5u64, 50u64), (1, 10), (3, 30)] {
            runner.post_task(EngineTask {
                token,
                target_time: base + Duration::from_millis(offset),
            });
        }

        engine.advance(Duration::from_secs(200));
        runner.post(|_| {});

        assert!(wait_until(Duration::from_secs(1), || engine.ran().len() == 3));
        assert_eq!(engine.ran(), vec![1, 3, 5]);
        runner.shutdown();
    }

    #[test]
    fn test_duplicate_token_dropped_while_queued() {
        let engine = FakeEngine::new();
        let runner = TaskRunner::new(engine.clone(), 0).unwrap();

        let far = engine.current_time() + Duration::from_secs(60);
        runner.post_task(EngineTask {
            token: 9,
            target_time: far,
        });
        runner.post_task(EngineTask {
            token: 9,
            target_time: far,
        });

        engine.advance(Duration::from_secs(61));
        runner.post(|_| {});

        assert!(wait_until(Duration::from_secs(1), || !engine.ran().is_empty()));
        assert_eq!(engine.ran(), vec![9]);
        runner.shutdown();
    }

    #[test]
    fn test_platform_message_promise_resolves() {
        let engine = FakeEngine::new();
        let runner = TaskRunner::new(engine.clone(), 0).unwrap();

        let rx = runner.send_platform_message("perch/platform", b"{}".to_vec());
        assert_eq!(rx.blocking_recv().unwrap(), Ok(()));

        let rx = runner.send_platform_message("closed", Vec::new());
        assert_eq!(rx.blocking_recv().unwrap(), Err(EngineError::Shutdown));
        runner.shutdown();
    }

    #[test]
    fn test_locale_update_through_strand() {
        let engine = FakeEngine::new();
        let runner = TaskRunner::new(engine.clone(), 0).unwrap();

        let rx = runner.update_locale("en_US");
        assert_eq!(rx.blocking_recv().unwrap(), Ok(()));
        runner.shutdown();
    }

    #[test]
    fn test_shutdown_drains_immediates() {
        let engine = FakeEngine::new();
        let runner = TaskRunner::new(engine.clone(), 0).unwrap();

        let (tx, rx) = oneshot::channel();
        runner.post(move |_| {
            let _ = tx.send(());
        });
        runner.shutdown();

        assert!(rx.blocking_recv().is_ok());
    }
}
