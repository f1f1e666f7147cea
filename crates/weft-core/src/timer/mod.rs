//! The timer service behind timed waits.
//!
//! One background thread runs scheduled callbacks at absolute wall-clock
//! deadlines. The contract the butex relies on:
//!
//! - [`TimerThread::schedule`] returns a nonzero id, or 0 once the service is
//!   shut down;
//! - [`TimerThread::unschedule`] returns 0 when the entry was removed (or had
//!   already finished) and 1 while the callback is running right now — the
//!   caller spins on that 1 before invalidating the callback's argument.

use crate::time::{gettimeofday_us, Timespec};
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::ffi::c_void;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Handle of a scheduled callback. 0 is never issued.
pub type TimerId = u64;

/// A timer callback. The argument is whatever was passed to `schedule`.
pub type TimerFn = unsafe fn(*mut c_void);

struct SendPtr(*mut c_void);
// SAFETY: the pointer is only passed back to the callback the scheduling
// party provided; validity across threads is part of `schedule`'s contract.
unsafe impl Send for SendPtr {}

struct PendingTimer {
    f: TimerFn,
    arg: SendPtr,
}

#[derive(Default)]
struct TimerInner {
    /// Pending callbacks keyed by (deadline, id); the id breaks ties between
    /// callbacks due in the same microsecond.
    queue: BTreeMap<(i64, TimerId), PendingTimer>,
    /// id -> deadline, so unschedule is a lookup rather than a scan.
    index: HashMap<TimerId, i64>,
    next_id: TimerId,
    /// Id of the callback executing right now, 0 if none.
    running: TimerId,
    stopped: bool,
}

struct TimerShared {
    inner: Mutex<TimerInner>,
    wakeup: Condvar,
}

/// The timer service. Cheap to clone-share via the global accessor.
pub struct TimerThread {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerThread {
    /// Start a service with its own background thread.
    pub fn start() -> TimerThread {
        let shared = Arc::new(TimerShared {
            inner: Mutex::new(TimerInner::default()),
            wakeup: Condvar::new(),
        });
        let worker = shared.clone();
        let handle = std::thread::Builder::new()
            .name("weft-timer".into())
            .spawn(move || run_timer(&worker))
            .expect("failed to spawn the timer thread");
        TimerThread {
            shared,
            thread: Mutex::new(Some(handle)),
        }
    }

    /// Schedule `f(arg)` to run at the absolute wall-clock time `abstime`.
    /// A deadline in the past fires as soon as the thread gets to it.
    ///
    /// Returns the entry's id, or 0 when the service has been shut down.
    ///
    /// # Safety
    ///
    /// `arg` must remain valid until the callback has finished or
    /// `unschedule` has returned 0 for the returned id.
    pub unsafe fn schedule(&self, f: TimerFn, arg: *mut c_void, abstime: Timespec) -> TimerId {
        let mut inner = self.shared.inner.lock();
        if inner.stopped {
            return 0;
        }
        inner.next_id += 1;
        let id = inner.next_id;
        let run_at = abstime.as_microseconds();
        inner.queue.insert((run_at, id), PendingTimer { f, arg: SendPtr(arg) });
        inner.index.insert(id, run_at);
        self.shared.wakeup.notify_one();
        id
    }

    /// Cancel a scheduled callback.
    ///
    /// Returns 0 when the entry is gone (cancelled here, or already finished,
    /// or never existed) and 1 while the callback is executing concurrently.
    pub fn unschedule(&self, id: TimerId) -> i32 {
        let mut inner = self.shared.inner.lock();
        if let Some(run_at) = inner.index.remove(&id) {
            inner.queue.remove(&(run_at, id));
            return 0;
        }
        if inner.running == id {
            1
        } else {
            0
        }
    }

    /// Stop the service. Pending callbacks are dropped without running;
    /// subsequent `schedule` calls return 0.
    pub fn shutdown(&self) {
        {
            let mut inner = self.shared.inner.lock();
            if inner.stopped {
                return;
            }
            inner.stopped = true;
            inner.queue.clear();
            inner.index.clear();
        }
        self.shared.wakeup.notify_all();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

fn run_timer(shared: &TimerShared) {
    loop {
        let mut due: Option<(TimerFn, SendPtr)> = None;
        {
            let mut inner = shared.inner.lock();
            loop {
                if inner.stopped {
                    return;
                }
                let now = gettimeofday_us();
                if let Some((&key, _)) = inner.queue.first_key_value() {
                    let (run_at, id) = key;
                    if run_at <= now {
                        if let Some(task) = inner.queue.remove(&key) {
                            inner.index.remove(&id);
                            inner.running = id;
                            due = Some((task.f, task.arg));
                        }
                        break;
                    }
                    let timeout = Duration::from_micros((run_at - now) as u64);
                    let _ = shared.wakeup.wait_for(&mut inner, timeout);
                } else {
                    shared.wakeup.wait(&mut inner);
                }
            }
        }
        if let Some((f, arg)) = due {
            // SAFETY: schedule's contract keeps arg valid until the caller
            // has observed this callback finish through unschedule.
            unsafe { f(arg.0) };
            shared.inner.lock().running = 0;
        }
    }
}

static GLOBAL_TIMER: Lazy<TimerThread> = Lazy::new(TimerThread::start);

/// The process-global timer service, started on first use.
pub fn global_timer_thread() -> &'static TimerThread {
    &GLOBAL_TIMER
}
