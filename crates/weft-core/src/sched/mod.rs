//! The scheduler surface the butex consumes.
//!
//! The fiber scheduler (context switching, run queues, work stealing) lives
//! outside this crate. The wait and wake paths only need the narrow contract
//! below: who is running, a way to defer work until after the current fiber's
//! context has been saved, and ways to make fibers runnable again.

use crate::fiber::{FiberId, FiberMeta};
use std::cell::Cell;
use std::ffi::c_void;

/// A deferred action installed with [`Worker::set_remained`]. Runs in the
/// outgoing fiber's worker immediately after its context has been saved,
/// before any other fiber resumes.
pub type RemainedFn = unsafe fn(*mut c_void);

/// One scheduler worker: an OS thread running fibers, at most one at a time.
///
/// Implementations must tolerate `exchange`, `ready_to_run`,
/// `ready_to_run_nosignal` and `flush_nosignal_tasks` being called from
/// threads other than the worker's own; the remaining methods are only ever
/// called from the worker thread itself while it is the current worker.
pub trait Worker: Sync {
    /// Id of the fiber currently running on this worker.
    fn current_tid(&self) -> FiberId;

    /// Task record of the fiber currently running on this worker. Never null
    /// while the worker is current; the record outlives the fiber's run.
    fn current_task(&self) -> *mut FiberMeta;

    /// True when the current fiber is pinned to its thread (running in
    /// native-thread mode), so suspension must go through the kernel futex
    /// rather than a context switch.
    fn is_current_kthread_task(&self) -> bool;

    /// Install the remained action for the next `sched` call.
    fn set_remained(&self, f: RemainedFn, arg: *mut c_void);

    /// Save the current fiber's context, run the remained action, and switch
    /// to another runnable fiber. Returns when the suspended fiber is next
    /// scheduled (possibly on a different worker).
    fn sched(&self);

    /// Switch directly to `tid`, pushing the current fiber onto the ready
    /// queue. The symmetric-transfer fast path of the wake side.
    fn exchange(&self, tid: FiberId);

    /// Make `tid` runnable and signal a worker to pick it up.
    fn ready_to_run(&self, tid: FiberId);

    /// Make `tid` runnable without signalling; paired with
    /// [`Worker::flush_nosignal_tasks`] to batch cross-worker signals.
    fn ready_to_run_nosignal(&self, tid: FiberId);

    /// Publish every task queued with `ready_to_run_nosignal` in one signal.
    fn flush_nosignal_tasks(&self);

    /// The control plane this worker belongs to.
    fn control(&self) -> &'static dyn Control;
}

/// The runtime-wide control plane.
pub trait Control: Sync {
    /// Pick a worker to take on ready fibers when the caller is not a worker.
    fn choose_one_group(&self) -> &'static dyn Worker;
}

thread_local! {
    static CURRENT_WORKER: Cell<Option<&'static dyn Worker>> = const { Cell::new(None) };
}

/// The worker owning the calling thread, if the calling thread is a worker.
pub fn current_worker() -> Option<&'static dyn Worker> {
    CURRENT_WORKER.with(Cell::get)
}

/// Bind or unbind the calling thread as a worker. Called by the scheduler
/// when a worker thread starts and stops.
pub fn set_current_worker(worker: Option<&'static dyn Worker>) {
    CURRENT_WORKER.with(|cell| cell.set(worker));
}

/// Two workers are the same worker iff they are the same object.
pub(crate) fn same_worker(a: &'static dyn Worker, b: &'static dyn Worker) -> bool {
    std::ptr::addr_eq(a as *const dyn Worker, b as *const dyn Worker)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NopControl;
    impl Control for NopControl {
        fn choose_one_group(&self) -> &'static dyn Worker {
            unreachable!("not used in this test")
        }
    }

    struct NopWorker;
    impl Worker for NopWorker {
        fn current_tid(&self) -> FiberId {
            1
        }
        fn current_task(&self) -> *mut FiberMeta {
            std::ptr::null_mut()
        }
        fn is_current_kthread_task(&self) -> bool {
            false
        }
        fn set_remained(&self, _f: RemainedFn, _arg: *mut c_void) {}
        fn sched(&self) {}
        fn exchange(&self, _tid: FiberId) {}
        fn ready_to_run(&self, _tid: FiberId) {}
        fn ready_to_run_nosignal(&self, _tid: FiberId) {}
        fn flush_nosignal_tasks(&self) {}
        fn control(&self) -> &'static dyn Control {
            &NopControl
        }
    }

    #[test]
    fn current_worker_slot() {
        static W: NopWorker = NopWorker;
        assert!(current_worker().is_none());
        set_current_worker(Some(&W as &'static dyn Worker));
        let got = current_worker().expect("worker just bound");
        assert_eq!(got.current_tid(), 1);
        assert!(same_worker(got, &W));
        set_current_worker(None);
        assert!(current_worker().is_none());
    }

    #[test]
    fn slot_is_per_thread() {
        static W: NopWorker = NopWorker;
        set_current_worker(Some(&W as &'static dyn Worker));
        std::thread::spawn(|| {
            assert!(current_worker().is_none());
        })
        .join()
        .unwrap();
        set_current_worker(None);
    }
}
