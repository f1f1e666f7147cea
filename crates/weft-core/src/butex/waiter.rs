//! Waiter records and the intrusive waiter queue.
//!
//! Every blocked `butex_wait` call owns exactly one record, allocated in its
//! own frame and threaded into the butex's queue. Removing a node from the
//! middle of a doubly-linked list is O(1), which is what lets timers and
//! stoppers pull an arbitrary waiter out; whether a node is in a list at all
//! is tagged by its `container` field, not by its links.
//!
//! Fields that other threads touch while the record is published (links,
//! `container`, `sig`, `sleep_id`, `waiter_state`) are atomics: the waiter
//! lock sequences the interesting transitions, the atomics keep shared
//! references to the on-frame record race-free.

use crate::fiber::{FiberId, FiberMeta};
use crate::sched::Control;
use crate::timer::TimerId;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU64, AtomicU8, Ordering};

use super::Butex;

/// `sig` values of a thread waiter.
pub(crate) const NOT_SIGNALLED: i32 = 0;
/// Reserved intermediate state; wake paths go straight to SAFE_TO_DESTROY.
#[allow(dead_code)]
pub(crate) const SIGNALLED: i32 = 1;
pub(crate) const SAFE_TO_DESTROY: i32 = 2;

/// Progress of a timed fiber wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum WaiterState {
    None = 0,
    Timed = 1,
    Cancelled = 2,
    TimedOut = 3,
}

/// `WaiterState` behind an atomic. Plain relaxed accesses: every transition
/// is sequenced by the waiter lock or by the spin handshakes on the return
/// path, the atomic only rules out torn or racing plain writes.
pub(crate) struct AtomicWaiterState(AtomicU8);

impl AtomicWaiterState {
    pub(crate) fn new(s: WaiterState) -> AtomicWaiterState {
        AtomicWaiterState(AtomicU8::new(s as u8))
    }

    pub(crate) fn load(&self) -> WaiterState {
        match self.0.load(Ordering::Relaxed) {
            0 => WaiterState::None,
            1 => WaiterState::Timed,
            2 => WaiterState::Cancelled,
            _ => WaiterState::TimedOut,
        }
    }

    pub(crate) fn store(&self, s: WaiterState) {
        self.0.store(s as u8, Ordering::Relaxed);
    }
}

/// Common head of every waiter record. Always the first field of a variant,
/// so a `*mut ButexWaiter` converts to the variant by a plain cast; `tid`
/// discriminates (0 means thread waiter).
#[repr(C)]
pub struct ButexWaiter {
    pub(crate) prev: AtomicPtr<ButexWaiter>,
    pub(crate) next: AtomicPtr<ButexWaiter>,
    pub(crate) tid: FiberId,
    /// The butex whose queue holds this record, or null. Transitions only
    /// under that butex's waiter lock; a null makes every outside remover a
    /// no-op.
    pub(crate) container: AtomicPtr<Butex>,
}

impl ButexWaiter {
    pub(crate) fn new(tid: FiberId) -> ButexWaiter {
        ButexWaiter {
            prev: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
            tid,
            container: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

/// A fiber's waiter record.
#[repr(C)]
pub(crate) struct ButexFiberWaiter {
    pub(crate) base: ButexWaiter,
    pub(crate) task_meta: *mut FiberMeta,
    /// Timer entry armed for the deadline, 0 when none.
    pub(crate) sleep_id: AtomicU64,
    pub(crate) waiter_state: AtomicWaiterState,
    /// Set once the deferred enqueue has linked the record, under the
    /// initial butex's lock. A null `container` together with a clear flag
    /// means the deadline beat the enqueue; with the flag set it means a
    /// waker already dequeued the record.
    pub(crate) ever_queued: AtomicBool,
    pub(crate) expected_value: i32,
    /// The butex this wait was issued on; requeue may move the record away
    /// from it, but the deferred enqueue and the pre-enqueue timeout mark
    /// both go through this one.
    pub(crate) initial_butex: *mut Butex,
    pub(crate) control: &'static dyn Control,
}

impl ButexFiberWaiter {
    pub(crate) fn new(
        tid: FiberId,
        task_meta: *mut FiberMeta,
        expected_value: i32,
        initial_butex: *mut Butex,
        control: &'static dyn Control,
    ) -> ButexFiberWaiter {
        ButexFiberWaiter {
            base: ButexWaiter::new(tid),
            task_meta,
            sleep_id: AtomicU64::new(0),
            waiter_state: AtomicWaiterState::new(WaiterState::None),
            ever_queued: AtomicBool::new(false),
            expected_value,
            initial_butex,
            control,
        }
    }

    pub(crate) fn sleep_id(&self) -> TimerId {
        self.sleep_id.load(Ordering::Relaxed)
    }
}

/// A native thread's waiter record.
#[repr(C)]
pub(crate) struct ButexThreadWaiter {
    pub(crate) base: ButexWaiter,
    /// NOT_SIGNALLED until a waker releases this thread by storing
    /// SAFE_TO_DESTROY.
    pub(crate) sig: AtomicI32,
}

impl ButexThreadWaiter {
    pub(crate) fn new() -> ButexThreadWaiter {
        ButexThreadWaiter {
            base: ButexWaiter::new(0),
            sig: AtomicI32::new(NOT_SIGNALLED),
        }
    }
}

/// Intrusive doubly-linked queue of waiters. Insertion at the tail, removal
/// from any position in O(1). Link updates are relaxed atomic stores; the
/// list as a whole is always manipulated under a lock (or thread-locally
/// while draining into wake batches).
pub(crate) struct WaiterList {
    head: *mut ButexWaiter,
    tail: *mut ButexWaiter,
}

// SAFETY: the raw node pointers are only followed by whoever holds the lock
// guarding the list (or owns it outright as a local drain batch).
unsafe impl Send for WaiterList {}

impl WaiterList {
    pub(crate) const fn new() -> WaiterList {
        WaiterList {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// First waiter without removing it, null when empty.
    pub(crate) fn front(&self) -> *mut ButexWaiter {
        self.head
    }

    /// Append `w` at the tail.
    ///
    /// # Safety
    ///
    /// `w` must be a valid record that is not in any list.
    pub(crate) unsafe fn push_back(&mut self, w: *mut ButexWaiter) {
        // SAFETY: caller guarantees w is valid and unlinked.
        unsafe {
            (*w).prev.store(self.tail, Ordering::Relaxed);
            (*w).next.store(ptr::null_mut(), Ordering::Relaxed);
            if self.tail.is_null() {
                self.head = w;
            } else {
                (*self.tail).next.store(w, Ordering::Relaxed);
            }
        }
        self.tail = w;
    }

    /// Detach and return the head, null when empty.
    ///
    /// # Safety
    ///
    /// Every node in the list must still be valid.
    pub(crate) unsafe fn pop_front(&mut self) -> *mut ButexWaiter {
        let w = self.head;
        if w.is_null() {
            return w;
        }
        // SAFETY: w is the live head; its links are only touched under the
        // lock the caller holds.
        unsafe {
            let next = (*w).next.load(Ordering::Relaxed);
            self.head = next;
            if next.is_null() {
                self.tail = ptr::null_mut();
            } else {
                (*next).prev.store(ptr::null_mut(), Ordering::Relaxed);
            }
            (*w).prev.store(ptr::null_mut(), Ordering::Relaxed);
            (*w).next.store(ptr::null_mut(), Ordering::Relaxed);
        }
        w
    }

    /// Detach and return the tail, null when empty.
    ///
    /// # Safety
    ///
    /// Every node in the list must still be valid.
    pub(crate) unsafe fn pop_back(&mut self) -> *mut ButexWaiter {
        let w = self.tail;
        if w.is_null() {
            return w;
        }
        // SAFETY: as in pop_front.
        unsafe {
            let prev = (*w).prev.load(Ordering::Relaxed);
            self.tail = prev;
            if prev.is_null() {
                self.head = ptr::null_mut();
            } else {
                (*prev).next.store(ptr::null_mut(), Ordering::Relaxed);
            }
            (*w).prev.store(ptr::null_mut(), Ordering::Relaxed);
            (*w).next.store(ptr::null_mut(), Ordering::Relaxed);
        }
        w
    }

    /// Unlink `w` from wherever it sits in this list.
    ///
    /// # Safety
    ///
    /// `w` must currently be linked into this list.
    pub(crate) unsafe fn remove(&mut self, w: *mut ButexWaiter) {
        // SAFETY: caller guarantees membership; neighbours are live nodes of
        // the same list.
        unsafe {
            let prev = (*w).prev.load(Ordering::Relaxed);
            let next = (*w).next.load(Ordering::Relaxed);
            if prev.is_null() {
                self.head = next;
            } else {
                (*prev).next.store(next, Ordering::Relaxed);
            }
            if next.is_null() {
                self.tail = prev;
            } else {
                (*next).prev.store(prev, Ordering::Relaxed);
            }
            (*w).prev.store(ptr::null_mut(), Ordering::Relaxed);
            (*w).next.store(ptr::null_mut(), Ordering::Relaxed);
        }
    }
}
