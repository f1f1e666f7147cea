//! Per-fiber task records and the registry that makes external interruption
//! possible.
//!
//! A waiting fiber publishes its on-stack butex waiter into its
//! [`FiberMeta`]; a stopper resolves the fiber's id through the registry,
//! atomically consumes that waiter, and hands it to the butex erase path.
//! The registry is keyed by [`FiberId`]; id 0 is reserved and never
//! registered — it tags native-thread waiters throughout the runtime.

use crate::butex::waiter::ButexWaiter;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

/// Fiber id. 0 means "not a fiber".
pub type FiberId = u64;

/// The slice of a fiber's task record the butex cares about.
pub struct FiberMeta {
    tid: FiberId,
    /// Set when another thread asks this fiber to stop.
    pub stop: AtomicBool,
    /// While false, a stop request leaves any in-flight wait untouched; the
    /// wait still reports the stop after it finishes normally.
    pub interruptible: AtomicBool,
    /// The fiber's in-flight butex waiter, published for stoppers. Null when
    /// not waiting, and briefly null while a stopper has borrowed the waiter.
    pub(crate) current_waiter: AtomicPtr<ButexWaiter>,
}

impl FiberMeta {
    /// A fresh record for `tid`: not stopped, interruptible, not waiting.
    pub fn new(tid: FiberId) -> FiberMeta {
        assert_ne!(tid, 0, "fiber id 0 is reserved for native threads");
        FiberMeta {
            tid,
            stop: AtomicBool::new(false),
            interruptible: AtomicBool::new(true),
            current_waiter: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// The id this record was created with.
    pub fn tid(&self) -> FiberId {
        self.tid
    }
}

struct MetaPtr(*mut FiberMeta);
// SAFETY: the registry only stores and hands out the pointer; all access to
// the pointee goes through its atomic fields.
unsafe impl Send for MetaPtr {}
unsafe impl Sync for MetaPtr {}

static REGISTRY: Lazy<RwLock<HashMap<FiberId, MetaPtr>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Make `meta` discoverable by stoppers.
///
/// # Safety
///
/// `meta` must stay valid until [`unregister_fiber`] is called for its id,
/// and at most one record may be registered per id at a time.
pub unsafe fn register_fiber(meta: *mut FiberMeta) {
    // SAFETY: caller guarantees meta is valid.
    let tid = unsafe { (*meta).tid };
    let prev = REGISTRY.write().insert(tid, MetaPtr(meta));
    debug_assert!(prev.is_none(), "fiber id registered twice");
}

/// Remove a fiber's record from the registry.
pub fn unregister_fiber(tid: FiberId) {
    REGISTRY.write().remove(&tid);
}

fn lookup(tid: FiberId) -> Option<*mut FiberMeta> {
    REGISTRY.read().get(&tid).map(|p| p.0)
}

/// Mark `tid` as stopping and take exclusive use of its published waiter.
///
/// Returns the waiter (null when the fiber is not interruptibly waiting), or
/// an errno when no such fiber exists. The acquire exchange pairs with the
/// release publish in the wait paths so the consumer sees a fully-built
/// waiter record.
pub(crate) fn stop_and_consume_butex_waiter(tid: FiberId) -> Result<*mut ButexWaiter, i32> {
    let meta = lookup(tid).ok_or(libc::ESRCH)?;
    // SAFETY: registered metas stay valid until unregistered, and a waiting
    // fiber cannot unregister while its waiter may still be consumed.
    let meta = unsafe { &*meta };
    meta.stop.store(true, Ordering::Release);
    if !meta.interruptible.load(Ordering::Acquire) {
        return Ok(ptr::null_mut());
    }
    Ok(meta.current_waiter.swap(ptr::null_mut(), Ordering::Acquire))
}

/// Hand a consumed waiter back so its owner can observe the stop and clear it.
pub(crate) fn set_butex_waiter(tid: FiberId, waiter: *mut ButexWaiter) -> Result<(), i32> {
    let meta = lookup(tid).ok_or(libc::ESRCH)?;
    // SAFETY: as in stop_and_consume_butex_waiter; the owner spins in the
    // wait path until this store lands, keeping the record alive.
    unsafe { (*meta).current_waiter.store(waiter, Ordering::Release) };
    Ok(())
}
