//! Integration tests for the task runner
//!
//! Scheduling is checked against a fake engine whose clock only moves when
//! the test advances it: tasks must run at-or-after their target timestamp
//! on that clock, never on wall clock.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use perch::engine::{
    Engine, EngineResult, EngineTask, KeyEvent, PointerEvent, WindowMetrics,
};
use perch::runner::TaskRunner;

#[derive(Default)]
struct ClockedEngine {
    clock: Mutex<Duration>,
    ran: Mutex<Vec<u64>>,
    locales: Mutex<Vec<String>>,
}

impl ClockedEngine {
    fn advance(&self, by: Duration) {
        *self.clock.lock() += by;
    }

    fn ran(&self) -> Vec<u64> {
        self.ran.lock().clone()
    }
}

impl Engine for ClockedEngine {
    fn notify_window_metrics(&self, _m: WindowMetrics) -> EngineResult {
        Ok(())
    }
    fn send_pointer_event(&self, _e: PointerEvent) -> EngineResult {
        Ok(())
    }
    fn send_key_event(&self, _e: KeyEvent) -> EngineResult {
        Ok(())
    }
    fn run_task(&self, task: &EngineTask) -> EngineResult {
        self.ran.lock().push(task.token);
        Ok(())
    }
    fn current_time(&self) -> Duration {
        *self.clock.lock()
    }
    fn send_platform_message(&self, _c: &str, _p: &[u8]) -> EngineResult {
        Ok(())
    }
    fn update_locale(&self, locale: &str) -> EngineResult {
        self.locales.lock().push(locale.to_string());
        Ok(())
    }
    fn shutdown(&self) -> EngineResult {
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
fn due_task_runs_within_the_current_iteration() {
    let engine = Arc::new(ClockedEngine::default());
    engine.advance(Duration::from_secs(10));
    let runner = TaskRunner::new(engine.clone(), 0).unwrap();

    runner.post_task(EngineTask {
        token: 1,
        target_time: Duration::from_secs(5), // already past on the engine clock
    });

    assert!(wait_until(Duration::from_secs(1), || engine.ran() == vec![1]));
    runner.shutdown();
}

#[test]
fn future_task_does_not_run_until_engine_time_arrives() {
    let engine = Arc::new(ClockedEngine::default());
    engine.advance(Duration::from_secs(10));
    let runner = TaskRunner::new(engine.clone(), 0).unwrap();

    runner.post_task(EngineTask {
        token: 2,
        target_time: Duration::from_secs(3600),
    });

    thread::sleep(Duration::from_millis(60));
    assert!(
        engine.ran().is_empty(),
        "task executed although the engine clock never reached its target"
    );

    engine.advance(Duration::from_secs(3600));
    runner.post(|_| {}); // wake the runner so it re-reads the clock

    assert!(wait_until(Duration::from_secs(1), || engine.ran() == vec![2]));
    runner.shutdown();
}

#[test]
fn tasks_run_in_timestamp_order_regardless_of_submission_order() {
    let engine = Arc::new(ClockedEngine::default());
    let runner = TaskRunner::new(engine.clone(), 0).unwrap();

    for (token, millis) in [(30u64, 300u64), (10, 100), (20, 200)] {
        runner.post_task(EngineTask {
            token,
            target_time: Duration::from_millis(millis),
        });
    }

    engine.advance(Duration::from_secs(1));
    runner.post(|_| {});

    assert!(wait_until(Duration::from_secs(1), || engine.ran().len() == 3));
    assert_eq!(engine.ran(), vec![10, 20, 30]);
    runner.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn strand_promises_resolve_for_the_caller() {
    let engine = Arc::new(ClockedEngine::default());
    let runner = TaskRunner::new(engine.clone(), 0).unwrap();

    let message = runner.send_platform_message("perch/platform", b"{\"method\":\"ping\"}".to_vec());
    assert_eq!(message.await.unwrap(), Ok(()));

    let locale = runner.update_locale("de_DE");
    assert_eq!(locale.await.unwrap(), Ok(()));
    assert_eq!(engine.locales.lock().as_slice(), ["de_DE"]);

    runner.shutdown();
}
