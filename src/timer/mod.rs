//! Kernel-backed event timers
//!
//! One [`EventTimer`] wraps one timerfd. All timers created from a
//! [`TimerSet`] share that set's epoll descriptor, so the display event pump
//! can multiplex every timer through a single readable fd. Used for the
//! keyboard auto-repeat cadence and reusable for any periodic callback.

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::trace;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};

/// Callback invoked when a timer expires (once per poll step, regardless of
/// how many expirations were coalesced)
pub type TimerCallback = Box<dyn FnMut()>;

struct TimerEntry {
    timer: TimerFd,
    // Taken out of the entry while its callback runs so the callback may
    // re-arm or disarm the timer it belongs to.
    callback: Option<TimerCallback>,
}

struct TimerSetInner {
    epoll: Epoll,
    entries: HashMap<u64, TimerEntry>,
    next_token: u64,
}

/// A shared epoll set multiplexing any number of [`EventTimer`]s
///
/// Single-threaded by design: it lives on the display event-pump thread and
/// its epoll fd is registered as one source in that pump's loop.
pub struct TimerSet {
    inner: Rc<RefCell<TimerSetInner>>,
}

impl TimerSet {
    pub fn new() -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .context("Failed to create timer epoll set")?;
        Ok(Self {
            inner: Rc::new(RefCell::new(TimerSetInner {
                epoll,
                entries: HashMap::new(),
                next_token: 1,
            })),
        })
    }

    /// Creates a new disarmed timer registered in this set
    pub fn add_timer(&self, callback: TimerCallback) -> Result<EventTimer> {
        let mut inner = self.inner.borrow_mut();

        let timer = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )
        .context("Failed to create timerfd")?;

        let token = inner.next_token;
        inner.next_token += 1;

        inner
            .epoll
            .add(
                timer.as_fd(),
                EpollEvent::new(EpollFlags::EPOLLIN, token),
            )
            .context("Failed to register timerfd in epoll set")?;

        inner.entries.insert(
            token,
            TimerEntry {
                timer,
                callback: Some(callback),
            },
        );

        Ok(EventTimer {
            token,
            inner: Rc::clone(&self.inner),
        })
    }

    /// The epoll descriptor, for registration in an outer event loop
    pub fn poll_fd(&self) -> RawFd {
        self.inner.borrow().epoll.0.as_raw_fd()
    }

    /// Duplicate of the epoll descriptor with its own lifetime, for event
    /// loops that take ownership of their sources
    pub fn poll_fd_dup(&self) -> Result<OwnedFd> {
        self.inner
            .borrow()
            .epoll
            .0
            .try_clone()
            .context("Failed to duplicate the timer epoll fd")
    }

    /// Drains every ready timer and invokes its callback.
    ///
    /// Returns the number of timers that fired. A `timeout` of zero makes
    /// this a non-blocking step, which is how the display pump calls it when
    /// the epoll fd polls readable.
    pub fn poll_dispatch(&self, timeout: Duration) -> Result<usize> {
        let mut events = [EpollEvent::empty(); 16];
        let ready = {
            let inner = self.inner.borrow();
            let timeout_ms = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
            inner
                .epoll
                .wait(&mut events, EpollTimeout::from(timeout_ms))
                .context("epoll wait on timer set failed")?
        };

        let tokens: Vec<u64> = events[..ready].iter().map(|ev| ev.data()).collect();

        let mut fired = 0;
        for token in tokens {
            let mut callback = {
                let mut inner = self.inner.borrow_mut();
                let Some(entry) = inner.entries.get_mut(&token) else {
                    continue;
                };
                drain_expirations(&entry.timer);
                entry.callback.take()
            };

            if let Some(cb) = callback.as_mut() {
                trace!("timer {} fired", token);
                cb();
                fired += 1;
            }

            // Give the callback back unless the timer was dropped meanwhile
            let mut inner = self.inner.borrow_mut();
            if let Some(entry) = inner.entries.get_mut(&token) {
                entry.callback = callback;
            }
        }

        Ok(fired)
    }
}

/// Consume the timerfd's expiration counter so level-triggered polling
/// settles
fn drain_expirations(timer: &TimerFd) {
    let mut buf = [0u8; 8];
    let _ = nix::unistd::read(timer.as_fd().as_raw_fd(), &mut buf);
}

/// Handle to one timer in a [`TimerSet`]
///
/// Dropping the handle unregisters and closes the underlying timerfd.
pub struct EventTimer {
    token: u64,
    inner: Rc<RefCell<TimerSetInner>>,
}

impl EventTimer {
    /// Arms the timer: first expiry after `delay`, then every `rate`
    pub fn arm(&self, rate: Duration, delay: Duration) -> Result<()> {
        let inner = self.inner.borrow();
        let entry = inner
            .entries
            .get(&self.token)
            .context("Timer no longer registered")?;
        entry
            .timer
            .set(
                Expiration::IntervalDelayed(
                    TimeSpec::from_duration(delay),
                    TimeSpec::from_duration(rate),
                ),
                TimerSetTimeFlags::empty(),
            )
            .context("Failed to arm timerfd")?;
        Ok(())
    }

    /// Disarms the timer without destroying it
    pub fn disarm(&self) -> Result<()> {
        let inner = self.inner.borrow();
        let entry = inner
            .entries
            .get(&self.token)
            .context("Timer no longer registered")?;
        entry.timer.unset().context("Failed to disarm timerfd")?;
        Ok(())
    }

    /// Reads back (repeat interval, time until next expiry) from the
    /// kernel. A disarmed timer reports a pair of zeros.
    pub fn remaining(&self) -> Result<(Duration, Duration)> {
        let inner = self.inner.borrow();
        let entry = inner
            .entries
            .get(&self.token)
            .context("Timer no longer registered")?;
        let state = entry
            .timer
            .get()
            .context("Failed to query timerfd state")?;
        Ok(match state {
            Some(Expiration::IntervalDelayed(value, interval)) => {
                (timespec_to_duration(interval), timespec_to_duration(value))
            }
            Some(Expiration::Interval(interval)) => {
                let d = timespec_to_duration(interval);
                (d, d)
            }
            Some(Expiration::OneShot(value)) => {
                (Duration::ZERO, timespec_to_duration(value))
            }
            None => (Duration::ZERO, Duration::ZERO),
        })
    }
}

impl Drop for EventTimer {
    fn drop(&mut self) {
        let mut inner = self.inner.borrow_mut();
        if let Some(entry) = inner.entries.remove(&self.token) {
            let _ = inner.epoll.delete(entry.timer.as_fd());
        }
    }
}

fn timespec_to_duration(ts: TimeSpec) -> Duration {
    Duration::new(ts.tv_sec() as u64, ts.tv_nsec() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_arm_reports_interval_and_decreasing_expiry() {
        let set = TimerSet::new().unwrap();
        let timer = set.add_timer(Box::new(|| {})).unwrap();

        timer
            .arm(Duration::from_millis(40), Duration::from_millis(400))
            .unwrap();

        let (interval, value) = timer.remaining().unwrap();
        assert_eq!(interval, Duration::from_millis(40));
        assert!(value <= Duration::from_millis(400));
        assert!(value > Duration::ZERO);
    }

    #[test]
    fn test_disarm_reports_zeros() {
        let set = TimerSet::new().unwrap();
        let timer = set.add_timer(Box::new(|| {})).unwrap();

        timer
            .arm(Duration::from_millis(40), Duration::from_millis(400))
            .unwrap();
        timer.disarm().unwrap();

        let (interval, value) = timer.remaining().unwrap();
        assert_eq!(interval, Duration::ZERO);
        assert_eq!(value, Duration::ZERO);
    }

    #[test]
    fn test_poll_dispatch_invokes_callback() {
        let fired = Rc::new(Cell::new(0u32));
        let set = TimerSet::new().unwrap();

        let fired_in_cb = Rc::clone(&fired);
        let timer = set
            .add_timer(Box::new(move || {
                fired_in_cb.set(fired_in_cb.get() + 1);
            }))
            .unwrap();

        timer
            .arm(Duration::from_millis(5), Duration::from_millis(5))
            .unwrap();

        let count = set.poll_dispatch(Duration::from_millis(500)).unwrap();
        assert_eq!(count, 1);
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn test_unarmed_timer_does_not_fire() {
        let set = TimerSet::new().unwrap();
        let _timer = set.add_timer(Box::new(|| panic!("must not fire"))).unwrap();

        let count = set.poll_dispatch(Duration::from_millis(20)).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_dropped_timer_is_unregistered() {
        let set = TimerSet::new().unwrap();
        let timer = set.add_timer(Box::new(|| panic!("must not fire"))).unwrap();
        timer
            .arm(Duration::from_millis(1), Duration::from_millis(1))
            .unwrap();
        drop(timer);

        let count = set.poll_dispatch(Duration::from_millis(20)).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_callback_may_rearm_its_own_timer() {
        let set = TimerSet::new().unwrap();
        let set_inner = Rc::clone(&set.inner);
        // The callback disarms its own timer through the shared set; this
        // must not deadlock on the RefCell.
        let timer = set
            .add_timer(Box::new(move || {
                let inner = set_inner.borrow();
                let entry = inner.entries.values().next().unwrap();
                let _ = entry.timer.unset();
            }))
            .unwrap();
        timer
            .arm(Duration::from_millis(5), Duration::from_millis(5))
            .unwrap();

        assert_eq!(set.poll_dispatch(Duration::from_millis(500)).unwrap(), 1);
        let (interval, value) = timer.remaining().unwrap();
        assert_eq!((interval, value), (Duration::ZERO, Duration::ZERO));
    }
}
