//! Process liveness watchdog
//!
//! A background thread holds a monotonic deadline that the event pump must
//! keep pushing forward by calling [`Watchdog::pet`]. A missed deadline is
//! fatal: the watchdog notifies the service supervisor when one is attached
//! (systemd-style `NOTIFY_SOCKET`) and aborts the process. There is no
//! automatic recovery: a wedged embedder must be restarted from outside.

use std::os::unix::net::UnixDatagram;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, error, info};
use parking_lot::Mutex;

/// Floor for the deadline check cadence
const MIN_CHECK_GRANULARITY: Duration = Duration::from_millis(10);

struct WatchdogInner {
    deadline: Mutex<Instant>,
    interval: Duration,
    running: AtomicBool,
}

/// Liveness watchdog with a dedicated checker thread
pub struct Watchdog {
    inner: Arc<WatchdogInner>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Starts the watchdog thread. The first deadline is one full interval
    /// from now; callers should begin petting immediately.
    pub fn start(interval: Duration) -> Result<Self> {
        let inner = Arc::new(WatchdogInner {
            deadline: Mutex::new(Instant::now() + interval),
            interval,
            running: AtomicBool::new(true),
        });

        notify_supervisor("READY=1");
        info!("🐕 Watchdog armed (interval {:?})", interval);

        let thread_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("perch-watchdog".to_string())
            .spawn(move || watchdog_loop(thread_inner))
            .context("Failed to spawn watchdog thread")?;

        Ok(Self {
            inner,
            handle: Some(handle),
        })
    }

    /// Signals liveness, pushing the deadline one interval forward.
    /// Callable from any thread.
    pub fn pet(&self) {
        let mut deadline = self.inner.deadline.lock();
        *deadline = Instant::now() + self.inner.interval;
    }

    /// Stops the checker thread for a graceful shutdown
    pub fn stop(mut self) {
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        debug!("🐕 Watchdog stopped");
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn watchdog_loop(inner: Arc<WatchdogInner>) {
    let granularity = (inner.interval / 10).max(MIN_CHECK_GRANULARITY);

    while inner.running.load(Ordering::SeqCst) {
        thread::sleep(granularity);

        let deadline = *inner.deadline.lock();
        if Instant::now() >= deadline && inner.running.load(Ordering::SeqCst) {
            error!(
                "💀 Watchdog deadline missed (interval {:?}); aborting",
                inner.interval
            );
            notify_supervisor("WATCHDOG=trigger");
            notify_supervisor("STATUS=event pump unresponsive, aborting");
            std::process::abort();
        }
    }
}

/// Best-effort datagram to the supervisor's notify socket, if one is set.
///
/// Implements the systemd notification protocol: `NOTIFY_SOCKET` names a
/// filesystem or abstract (`@`-prefixed) unix datagram socket.
fn notify_supervisor(message: &str) {
    let Ok(socket_path) = std::env::var("NOTIFY_SOCKET") else {
        return;
    };
    if socket_path.is_empty() {
        return;
    }

    let address = if let Some(rest) = socket_path.strip_prefix('@') {
        format!("\0{}", rest)
    } else {
        socket_path
    };

    match UnixDatagram::unbound() {
        Ok(socket) => {
            if let Err(e) = socket.send_to(message.as_bytes(), &address) {
                debug!("Supervisor notification failed: {}", e);
            }
        }
        Err(e) => debug!("Could not open supervisor socket: {}", e),
    }
}
