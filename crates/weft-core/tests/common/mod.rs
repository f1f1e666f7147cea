//! A thread-backed stand-in for the fiber scheduler.
//!
//! Each simulated fiber runs on its own OS thread with a worker bound to it:
//! `sched` runs the installed remained action and then parks the thread until
//! some wake path hands the fiber's id back through `ready_to_run`,
//! `ready_to_run_nosignal` or `exchange`. That is exactly the slice of the
//! scheduler contract the butex consumes, so the fiber wait/wake/stop paths
//! run end-to-end without a real context-switching runtime.

#![allow(dead_code)]

use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use weft_core::fiber::{self, FiberId, FiberMeta};
use weft_core::sched::{self, Control, RemainedFn, Worker};

/// Token-counting parker; an unpark before the park is not lost.
pub struct Parker {
    tokens: Mutex<u32>,
    cv: Condvar,
}

impl Parker {
    fn new() -> Parker {
        Parker {
            tokens: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    fn park(&self) {
        let mut tokens = self.tokens.lock();
        while *tokens == 0 {
            self.cv.wait(&mut tokens);
        }
        *tokens -= 1;
    }

    fn unpark(&self) {
        *self.tokens.lock() += 1;
        self.cv.notify_one();
    }
}

/// A barrier the test can slide between `sched` and the remained action, to
/// pin down races that are otherwise a microsecond wide.
pub struct Gate {
    state: Mutex<(bool, u32)>,
    cv: Condvar,
}

impl Gate {
    pub fn new() -> Arc<Gate> {
        Arc::new(Gate {
            state: Mutex::new((false, 0)),
            cv: Condvar::new(),
        })
    }

    /// Block until opened; called from the fiber thread.
    pub fn wait(&self) {
        let mut state = self.state.lock();
        state.1 += 1;
        self.cv.notify_all();
        while !state.0 {
            self.cv.wait(&mut state);
        }
    }

    /// Block until `n` fibers have arrived at the gate.
    pub fn await_arrivals(&self, n: u32) {
        let mut state = self.state.lock();
        while state.1 < n {
            self.cv.wait(&mut state);
        }
    }

    pub fn open(&self) {
        self.state.lock().0 = true;
        self.cv.notify_all();
    }
}

/// What the wake paths asked the scheduler to do, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Ready(FiberId),
    ReadyNosignal(FiberId),
    Exchange(FiberId),
    Flush,
}

#[derive(Default)]
pub struct EventLog(Mutex<Vec<Event>>);

impl EventLog {
    fn push(&self, e: Event) {
        self.0.lock().push(e);
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.0.lock().clone()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

pub struct SimRuntime {
    parkers: Mutex<HashMap<FiberId, Arc<Parker>>>,
    next_tid: AtomicU64,
    pub events: EventLog,
    service: OnceCell<&'static SimWorker>,
}

impl SimRuntime {
    fn unpark(&self, tid: FiberId) {
        let parker = self
            .parkers
            .lock()
            .get(&tid)
            .cloned()
            .expect("unpark of an unknown fiber");
        parker.unpark();
    }
}

impl Control for SimRuntime {
    fn choose_one_group(&self) -> &'static dyn Worker {
        *self.service.get().expect("service worker installed")
    }
}

pub struct SimWorker {
    rt: &'static SimRuntime,
    tid: FiberId,
    meta: *mut FiberMeta,
    remained: Mutex<Option<(RemainedFn, usize)>>,
    gate: Option<Arc<Gate>>,
}

// SAFETY: meta is only handed out as a raw pointer; the pointee is all
// atomics and outlives the runtime (leaked).
unsafe impl Send for SimWorker {}
unsafe impl Sync for SimWorker {}

impl Worker for SimWorker {
    fn current_tid(&self) -> FiberId {
        self.tid
    }

    fn current_task(&self) -> *mut FiberMeta {
        self.meta
    }

    fn is_current_kthread_task(&self) -> bool {
        false
    }

    fn set_remained(&self, f: RemainedFn, arg: *mut c_void) {
        *self.remained.lock() = Some((f, arg as usize));
    }

    fn sched(&self) {
        let remained = self.remained.lock().take();
        if let Some((f, arg)) = remained {
            if let Some(gate) = &self.gate {
                gate.wait();
            }
            // SAFETY: the butex installed this action together with its
            // argument one call earlier on this same thread.
            unsafe { f(arg as *mut c_void) };
        }
        let parker = self
            .rt
            .parkers
            .lock()
            .get(&self.tid)
            .cloned()
            .expect("scheduled fiber has a parker");
        parker.park();
    }

    fn exchange(&self, tid: FiberId) {
        self.rt.events.push(Event::Exchange(tid));
        self.rt.unpark(tid);
    }

    fn ready_to_run(&self, tid: FiberId) {
        self.rt.events.push(Event::Ready(tid));
        self.rt.unpark(tid);
    }

    fn ready_to_run_nosignal(&self, tid: FiberId) {
        self.rt.events.push(Event::ReadyNosignal(tid));
        self.rt.unpark(tid);
    }

    fn flush_nosignal_tasks(&self) {
        self.rt.events.push(Event::Flush);
    }

    fn control(&self) -> &'static dyn Control {
        self.rt
    }
}

/// Build a runtime with its service worker (the one `choose_one_group`
/// returns for callers that are not workers themselves).
pub fn new_runtime() -> &'static SimRuntime {
    let rt: &'static SimRuntime = Box::leak(Box::new(SimRuntime {
        parkers: Mutex::new(HashMap::new()),
        next_tid: AtomicU64::new(1),
        events: EventLog::default(),
        service: OnceCell::new(),
    }));
    let service: &'static SimWorker = Box::leak(Box::new(SimWorker {
        rt,
        tid: 0,
        meta: std::ptr::null_mut(),
        remained: Mutex::new(None),
        gate: None,
    }));
    rt.service.set(service).ok().expect("fresh runtime");
    rt
}

pub struct FiberHandle {
    pub tid: FiberId,
    join: JoinHandle<()>,
}

impl FiberHandle {
    pub fn join(self) {
        self.join.join().expect("fiber thread panicked");
    }
}

/// Run `body` as a simulated fiber, optionally gating its remained actions.
pub fn spawn_fiber_gated(
    rt: &'static SimRuntime,
    gate: Option<Arc<Gate>>,
    body: impl FnOnce(FiberId) + Send + 'static,
) -> FiberHandle {
    let tid = rt.next_tid.fetch_add(1, Ordering::SeqCst);
    let meta = Box::into_raw(Box::new(FiberMeta::new(tid)));
    // SAFETY: meta is leaked and so valid forever; tids are unique.
    unsafe { fiber::register_fiber(meta) };
    rt.parkers.lock().insert(tid, Arc::new(Parker::new()));
    let worker: &'static SimWorker = Box::leak(Box::new(SimWorker {
        rt,
        tid,
        meta,
        remained: Mutex::new(None),
        gate,
    }));
    let join = std::thread::spawn(move || {
        sched::set_current_worker(Some(worker as &'static dyn Worker));
        body(tid);
        sched::set_current_worker(None);
        fiber::unregister_fiber(tid);
    });
    FiberHandle { tid, join }
}

pub fn spawn_fiber(
    rt: &'static SimRuntime,
    body: impl FnOnce(FiberId) + Send + 'static,
) -> FiberHandle {
    spawn_fiber_gated(rt, None, body)
}

/// Poll `pred` until it holds or `timeout` passes.
pub fn eventually(timeout: Duration, pred: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if pred() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}
