//! The butex: a futex-like wait/wake object for fibers and native threads.
//!
//! The essence of futex semantics is sequenced wait and wake operations with
//! guaranteed visibility.
//!
//! If wait is sequenced before wake:
//!
//! ```text
//!    thread1               thread2
//!    -------               -------
//!    wait()                value = new_value
//!                          wake()
//! ```
//!
//! wait() sees the unmatched value (fails to wait), or wake() sees the
//! waiter.
//!
//! If wait is sequenced after wake:
//!
//! ```text
//!    thread1               thread2
//!    -------               -------
//!                          value = new_value
//!                          wake()
//!    wait()
//! ```
//!
//! wake() must provide memory fencing so the value assignment cannot be
//! reordered after it, making the value visible to wait() as well.
//!
//! The public handle of a butex is the address of its 32-bit value word,
//! which users may load, store and CAS directly; `butex_*` operations convert
//! between the handle and the object by pointer arithmetic (the value word is
//! at offset 0).
//!
//! A blocked call parks either as a fiber (the waiter queues after the
//! scheduler has saved the fiber's context, then another fiber runs) or as a
//! native thread (the waiter queues, then the thread sleeps on a kernel
//! futex). Wakes, timer callbacks and stoppers dequeue concurrently; the
//! per-waiter `container` tag decides who wins, and every loser is a no-op.

pub(crate) mod waiter;

use crate::errno::WaitError;
use crate::fiber::{self, FiberId, FiberMeta};
use crate::sched::{self, Control, Worker};
use crate::sys;
use crate::time::{gettimeofday_us, Timespec};
use crate::timer::{global_timer_thread, TimerThread};
use parking_lot::Mutex;
use std::ffi::c_void;
use std::mem::offset_of;
use std::ptr;
use std::sync::atomic::{fence, AtomicI32, AtomicI64, Ordering};
use self::waiter::{
    ButexFiberWaiter, ButexThreadWaiter, ButexWaiter, WaiterList, WaiterState, NOT_SIGNALLED,
    SAFE_TO_DESTROY,
};

/// Suspending for less than this is inefficient and useless; such deadlines
/// time out immediately.
const LEAST_SLEEP_US: i64 = 1;

/// The butex object. Users hold the address of `value`, never the object.
#[repr(C, align(64))]
pub struct Butex {
    value: AtomicI32,
    /// Announced in-flight wakes; teardown waits these out so a waker may
    /// drop its reference on an embedding object before the wake lands.
    unlock_nref: AtomicI32,
    /// Guards the queue and every queued waiter's `container` transition.
    waiters: Mutex<WaiterList>,
}

// The handle conversion in butex_locate relies on this layout.
const _: () = assert!(offset_of!(Butex, value) == 0);
const _: () = assert!(std::mem::align_of::<Butex>() >= 64);

impl Butex {
    fn new() -> Butex {
        Butex {
            value: AtomicI32::new(0),
            unlock_nref: AtomicI32::new(0),
            waiters: Mutex::new(WaiterList::new()),
        }
    }
}

impl Drop for Butex {
    fn drop(&mut self) {
        let mut first_time = true;
        while self.unlock_nref.load(Ordering::Relaxed) != 0 {
            if first_time {
                first_time = false;
                tracing::warn!("butex teardown is racing with butex_wake");
            }
            sys::cpu_relax();
        }
        fence(Ordering::Acquire);
    }
}

static BUTEX_WAITER_COUNT: AtomicI64 = AtomicI64::new(0);

/// Number of waiters currently blocked on any butex, fibers and threads both.
pub fn butex_waiter_count() -> i64 {
    BUTEX_WAITER_COUNT.load(Ordering::Relaxed)
}

#[inline]
fn butex_locate(handle: *mut i32) -> *mut Butex {
    handle.cast::<Butex>()
}

/// Allocate a fresh zero-valued butex. The returned handle is the address of
/// its value word. Release it with [`butex_destroy`].
pub fn butex_create() -> *mut i32 {
    let b = Box::into_raw(Box::new(Butex::new()));
    // SAFETY: b is a fresh allocation; value sits at offset 0.
    unsafe { ptr::addr_of_mut!((*b).value) }.cast::<i32>()
}

/// Free a butex created by [`butex_create`].
///
/// Waits out announced in-flight wakes first; the caller must ensure no new
/// wait or wake begins.
///
/// # Safety
///
/// `handle` must come from [`butex_create`] and not be used afterwards.
pub unsafe fn butex_destroy(handle: *mut i32) {
    if handle.is_null() {
        return;
    }
    // SAFETY: per contract the handle is the value word of a heap butex.
    drop(unsafe { Box::from_raw(butex_locate(handle)) });
}

/// In-place variant of [`butex_create`] for caller-owned storage.
///
/// # Safety
///
/// `mem` must be valid, suitably aligned for [`Butex`] and uninitialized.
pub unsafe fn butex_construct(mem: *mut Butex) -> *mut i32 {
    // SAFETY: caller provides the storage.
    unsafe { ptr::write(mem, Butex::new()) };
    // SAFETY: mem is now a live butex.
    unsafe { ptr::addr_of_mut!((*mem).value) }.cast::<i32>()
}

/// In-place variant of [`butex_destroy`]; storage itself is not freed.
///
/// # Safety
///
/// `mem` must have been initialized by [`butex_construct`] and not be used
/// afterwards.
pub unsafe fn butex_destruct(mem: *mut Butex) {
    if mem.is_null() {
        return;
    }
    // SAFETY: per contract mem is a live butex; drop glue drains in-flight
    // wakes.
    unsafe { ptr::drop_in_place(mem) };
}

/// View a handle as the atomic value word, for direct loads/stores/CAS.
///
/// # Safety
///
/// `handle` must be a live butex handle for the chosen lifetime.
pub unsafe fn butex_value<'a>(handle: *mut i32) -> &'a AtomicI32 {
    // SAFETY: the value word is an AtomicI32 at offset 0.
    unsafe { &*handle.cast::<AtomicI32>() }
}

/// Announce a wake that will drop the reference itself, see
/// [`butex_wake_and_remove_ref`].
///
/// # Safety
///
/// `handle` must be a live butex handle.
pub unsafe fn butex_add_ref_before_wake(handle: *mut i32) {
    let b = butex_locate(handle);
    // SAFETY: handle is live per contract.
    unsafe { &(*b).unlock_nref }.fetch_add(1, Ordering::Relaxed);
}

/// Drop an announced reference without waking.
///
/// # Safety
///
/// `handle` must be a live butex handle with a previously added reference.
pub unsafe fn butex_remove_ref(handle: *mut i32) {
    let b = butex_locate(handle);
    // SAFETY: handle is live per contract.
    unsafe { &(*b).unlock_nref }.fetch_sub(1, Ordering::Release);
}

/// Wake the thread waiter: after the release store of SAFE_TO_DESTROY the
/// record may already be gone (the waiter returns as soon as it observes the
/// new sig); the kernel answers EFAULT for a vanished word and the wake is a
/// no-op. A thread-local, never-freed signal page would close that window if
/// it ever mattered.
unsafe fn wakeup_thread_waiter(pw: *mut ButexThreadWaiter) {
    // SAFETY: pw is valid at least until the store below lands.
    let sig = unsafe { &(*pw).sig }.as_ptr();
    // Release so the woken thread sees prior writes when it sees the new sig.
    unsafe { &(*pw).sig }.store(SAFE_TO_DESTROY, Ordering::Release);
    // SAFETY: sig may dangle here; that is the documented crash window.
    unsafe { sys::futex_wake_private(sig, 1) };
}

/// Kernel-sleep until the waiter's sig leaves NOT_SIGNALLED or the relative
/// timeout expires.
unsafe fn wait_thread(
    pw: *mut ButexThreadWaiter,
    timeout: Option<&Timespec>,
) -> Result<(), WaitError> {
    loop {
        // SAFETY: pw lives in the calling frame.
        let rc = unsafe { sys::futex_wait_private((*pw).sig.as_ptr(), NOT_SIGNALLED, timeout) };
        // Acquire so this thread sees the waker's prior writes when it sees
        // the new sig.
        if unsafe { &(*pw).sig }.load(Ordering::Acquire) != NOT_SIGNALLED {
            // The waker has delivered and will not touch the queue on our
            // behalf again; this frame may be torn down after return.
            return Ok(());
        }
        if rc == Err(libc::ETIMEDOUT) {
            // Leave the queue so nobody can wake this frame after return.
            let base = unsafe { ptr::addr_of_mut!((*pw).base) };
            // SAFETY: the record is still published; erase is safe from any
            // thread.
            if !unsafe { erase_from_butex(base, false) } {
                // A waker holds the record between dequeue and signal; spin
                // until it is safe to destroy.
                sys::spin_until(|| {
                    unsafe { &(*pw).sig }.load(Ordering::Acquire) == SAFE_TO_DESTROY
                });
            }
            return Err(WaitError::TimedOut);
        }
        // EINTR: re-arm the sleep. EAGAIN cannot get here, it implies the
        // sig already changed.
    }
}

fn get_worker(control: &'static dyn Control) -> &'static dyn Worker {
    sched::current_worker().unwrap_or_else(|| control.choose_one_group())
}

/// Returns 0 when there was no timer or it was unscheduled, -1 while the
/// timer callback is running and still owns the record.
unsafe fn unsleep_if_necessary(w: *mut ButexFiberWaiter, timer: &TimerThread) -> i32 {
    // SAFETY: w is valid per the wait-path handshakes.
    let sleep_id = unsafe { &*w }.sleep_id();
    if sleep_id == 0 {
        return 0;
    }
    if timer.unschedule(sleep_id) > 0 {
        return -1;
    }
    unsafe { &(*w).sleep_id }.store(0, Ordering::Relaxed);
    0
}

/// Hand a dequeued waiter to its resumption mechanism. The caller already
/// nulled its `container` and released the lock.
unsafe fn dispatch_one(front: *mut ButexWaiter) {
    // SAFETY: a dequeued waiter stays valid until it is resumed.
    let tid = unsafe { (*front).tid };
    if tid == 0 {
        unsafe { wakeup_thread_waiter(front.cast::<ButexThreadWaiter>()) };
        return;
    }
    let fw = front.cast::<ButexFiberWaiter>();
    unsafe { unsleep_if_necessary(fw, global_timer_thread()) };
    match sched::current_worker() {
        // Direct symmetric transfer on the waker's own worker.
        Some(g) => g.exchange(tid),
        None => get_worker(unsafe { (*fw).control }).ready_to_run(tid),
    }
}

/// Wake one waiter if any. Returns the number woken (0 or 1).
///
/// # Safety
///
/// `handle` must be a live butex handle.
pub unsafe fn butex_wake(handle: *mut i32) -> usize {
    let b = butex_locate(handle);
    let front;
    {
        // SAFETY: handle is live per contract.
        let mut waiters = unsafe { &(*b).waiters }.lock();
        // SAFETY: queued nodes are valid while the lock is held.
        front = unsafe { waiters.pop_front() };
        if front.is_null() {
            return 0;
        }
        unsafe { &(*front).container }.store(ptr::null_mut(), Ordering::Relaxed);
    }
    // SAFETY: front was just dequeued under the lock.
    unsafe { dispatch_one(front) };
    1
}

/// As [`butex_wake`], but drops one announced reference before touching the
/// dequeued waiter, so the embedding object may be freed while the wake is
/// still in flight.
///
/// # Safety
///
/// `handle` must be a live butex handle with a reference added by
/// [`butex_add_ref_before_wake`].
pub unsafe fn butex_wake_and_remove_ref(handle: *mut i32) -> usize {
    let b = butex_locate(handle);
    let front;
    {
        // SAFETY: handle is live per contract.
        let mut waiters = unsafe { &(*b).waiters }.lock();
        // SAFETY: queued nodes are valid while the lock is held.
        front = unsafe { waiters.pop_front() };
        if front.is_null() {
            drop(waiters);
            unsafe { &(*b).unlock_nref }.fetch_sub(1, Ordering::Release);
            return 0;
        }
        unsafe { &(*front).container }.store(ptr::null_mut(), Ordering::Relaxed);
    }
    // The butex may be freed the instant this hits zero; b is not used below.
    unsafe { &(*b).unlock_nref }.fetch_sub(1, Ordering::Release);
    // SAFETY: front was just dequeued under the lock.
    unsafe { dispatch_one(front) };
    1
}

unsafe fn butex_wake_all_impl(handle: *mut i32, remove_ref: bool) -> usize {
    let b = butex_locate(handle);
    let mut fiber_waiters = WaiterList::new();
    let mut thread_waiters = WaiterList::new();
    {
        // SAFETY: handle is live per contract; nodes are valid under the lock.
        let mut waiters = unsafe { &(*b).waiters }.lock();
        loop {
            let w = unsafe { waiters.pop_front() };
            if w.is_null() {
                break;
            }
            unsafe { &(*w).container }.store(ptr::null_mut(), Ordering::Relaxed);
            if unsafe { (*w).tid } != 0 {
                unsafe { fiber_waiters.push_back(w) };
            } else {
                unsafe { thread_waiters.push_back(w) };
            }
        }
    }
    if remove_ref {
        unsafe { &(*b).unlock_nref }.fetch_sub(1, Ordering::Release);
    }

    let mut nwakeup = 0;
    loop {
        // SAFETY: dequeued nodes stay valid until resumed.
        let w = unsafe { thread_waiters.pop_front() };
        if w.is_null() {
            break;
        }
        unsafe { wakeup_thread_waiter(w.cast::<ButexThreadWaiter>()) };
        nwakeup += 1;
    }
    if fiber_waiters.is_empty() {
        return nwakeup;
    }
    // The first fiber is exchanged with at the very end for LIFO locality;
    // the others go onto the ready queue in reverse with one batched signal.
    let next = unsafe { fiber_waiters.pop_front() }.cast::<ButexFiberWaiter>();
    // SAFETY: next was dequeued above and is still parked.
    unsafe { unsleep_if_necessary(next, global_timer_thread()) };
    nwakeup += 1;
    let g = get_worker(unsafe { (*next).control });
    let saved_nwakeup = nwakeup;
    loop {
        let w = unsafe { fiber_waiters.pop_back() };
        if w.is_null() {
            break;
        }
        let fw = w.cast::<ButexFiberWaiter>();
        unsafe { unsleep_if_necessary(fw, global_timer_thread()) };
        g.ready_to_run_nosignal(unsafe { (*w).tid });
        nwakeup += 1;
    }
    if saved_nwakeup != nwakeup {
        g.flush_nosignal_tasks();
    }
    let next_tid = unsafe { (*next).base.tid };
    match sched::current_worker() {
        Some(cur) if sched::same_worker(cur, g) => g.exchange(next_tid),
        _ => g.ready_to_run(next_tid),
    }
    nwakeup
}

/// Wake every waiter. Returns the number woken.
///
/// # Safety
///
/// `handle` must be a live butex handle.
pub unsafe fn butex_wake_all(handle: *mut i32) -> usize {
    // SAFETY: forwarded contract.
    unsafe { butex_wake_all_impl(handle, false) }
}

/// As [`butex_wake_all`], dropping one announced reference before the wakes.
///
/// # Safety
///
/// As [`butex_wake_and_remove_ref`].
pub unsafe fn butex_wake_all_and_remove_ref(handle: *mut i32) -> usize {
    // SAFETY: forwarded contract.
    unsafe { butex_wake_all_impl(handle, true) }
}

/// Wake every waiter except the fiber `excluded_tid`, which is put back at
/// the tail of the queue. Returns the number woken.
///
/// # Safety
///
/// `handle` must be a live butex handle.
pub unsafe fn butex_wake_except(handle: *mut i32, excluded_tid: FiberId) -> usize {
    let b = butex_locate(handle);
    let mut fiber_waiters = WaiterList::new();
    let mut thread_waiters = WaiterList::new();
    {
        let mut excluded: *mut ButexWaiter = ptr::null_mut();
        // SAFETY: handle is live per contract; nodes are valid under the lock.
        let mut waiters = unsafe { &(*b).waiters }.lock();
        loop {
            let w = unsafe { waiters.pop_front() };
            if w.is_null() {
                break;
            }
            let tid = unsafe { (*w).tid };
            if tid != 0 {
                if tid != excluded_tid {
                    unsafe { &(*w).container }.store(ptr::null_mut(), Ordering::Relaxed);
                    unsafe { fiber_waiters.push_back(w) };
                } else {
                    excluded = w;
                }
            } else {
                unsafe { &(*w).container }.store(ptr::null_mut(), Ordering::Relaxed);
                unsafe { thread_waiters.push_back(w) };
            }
        }
        if !excluded.is_null() {
            // Still tagged with this butex; it only moves to the tail.
            unsafe { waiters.push_back(excluded) };
        }
    }

    let mut nwakeup = 0;
    loop {
        // SAFETY: dequeued nodes stay valid until resumed.
        let w = unsafe { thread_waiters.pop_front() };
        if w.is_null() {
            break;
        }
        unsafe { wakeup_thread_waiter(w.cast::<ButexThreadWaiter>()) };
        nwakeup += 1;
    }
    if fiber_waiters.is_empty() {
        return nwakeup;
    }
    let front = fiber_waiters.front().cast::<ButexFiberWaiter>();
    let g = get_worker(unsafe { (*front).control });
    let saved_nwakeup = nwakeup;
    loop {
        let w = unsafe { fiber_waiters.pop_back() };
        if w.is_null() {
            break;
        }
        let fw = w.cast::<ButexFiberWaiter>();
        unsafe { unsleep_if_necessary(fw, global_timer_thread()) };
        g.ready_to_run_nosignal(unsafe { (*w).tid });
        nwakeup += 1;
    }
    if saved_nwakeup != nwakeup {
        g.flush_nosignal_tasks();
    }
    nwakeup
}

/// Wake one waiter of `src` and migrate every remaining `src` waiter to the
/// tail of `dst`, retagging each moved waiter's container. Returns the
/// number woken (0 or 1).
///
/// # Safety
///
/// Both handles must be live butex handles.
pub unsafe fn butex_requeue(src: *mut i32, dst: *mut i32) -> usize {
    let b = butex_locate(src);
    let m = butex_locate(dst);
    if ptr::eq(b, m) {
        // Migrating onto the same queue leaves everyone but the head where
        // they are; that is a plain wake.
        return unsafe { butex_wake(src) };
    }
    let front;
    {
        // The only two-lock path in the crate; pointer order breaks the tie.
        // SAFETY: both handles are live per contract.
        let (mut src_waiters, mut dst_waiters) = if (b as usize) < (m as usize) {
            let first = unsafe { &(*b).waiters }.lock();
            let second = unsafe { &(*m).waiters }.lock();
            (first, second)
        } else {
            let second = unsafe { &(*m).waiters }.lock();
            let first = unsafe { &(*b).waiters }.lock();
            (first, second)
        };
        // SAFETY: nodes are valid under their container's lock, and we hold
        // both.
        front = unsafe { src_waiters.pop_front() };
        if front.is_null() {
            return 0;
        }
        unsafe { &(*front).container }.store(ptr::null_mut(), Ordering::Relaxed);
        loop {
            let w = unsafe { src_waiters.pop_front() };
            if w.is_null() {
                break;
            }
            unsafe { dst_waiters.push_back(w) };
            unsafe { &(*w).container }.store(m, Ordering::Relaxed);
        }
    }
    // SAFETY: front was dequeued under the locks.
    unsafe { dispatch_one(front) };
    1
}

/// Remove `bw` from whichever butex holds it; optionally resume it.
///
/// Callable from any thread; at most one caller erases. A null `container`
/// makes the whole call a no-op, which is what the deferred-enqueue and stop
/// protocols rely on. The record is guaranteed valid throughout: its owner
/// spins until every outside user has finished.
pub(crate) unsafe fn erase_from_butex(bw: *mut ButexWaiter, wakeup: bool) -> bool {
    let saved_errno = sys::errno();
    let mut erased = false;
    loop {
        // SAFETY: bw is valid per the contract above.
        let b = unsafe { &(*bw).container }.load(Ordering::Acquire);
        if b.is_null() {
            break;
        }
        // SAFETY: a non-null container is a live butex; waiters cannot
        // outlive the butex they are queued on.
        let mut waiters = unsafe { &(*b).waiters }.lock();
        if ptr::eq(b, unsafe { &(*bw).container }.load(Ordering::Relaxed)) {
            // SAFETY: the unchanged container proves membership in this list.
            unsafe { waiters.remove(bw) };
            unsafe { &(*bw).container }.store(ptr::null_mut(), Ordering::Relaxed);
            if unsafe { (*bw).tid } != 0 {
                unsafe { &(*bw.cast::<ButexFiberWaiter>()).waiter_state }
                    .store(WaiterState::TimedOut);
            }
            erased = true;
            break;
        }
        // A requeue moved the waiter between the load and the lock; retry
        // against the new container.
    }
    if erased && wakeup {
        let tid = unsafe { (*bw).tid };
        if tid != 0 {
            let fw = bw.cast::<ButexFiberWaiter>();
            get_worker(unsafe { (*fw).control }).ready_to_run(tid);
        } else {
            // SAFETY: an erased thread waiter is ours to signal.
            unsafe { wakeup_thread_waiter(bw.cast::<ButexThreadWaiter>()) };
        }
    }
    sys::set_errno(saved_errno);
    erased
}

/// Timer entry point: at most one of this callback and a concurrent wake
/// resumes the waiter.
unsafe fn erase_from_butex_and_wakeup(arg: *mut c_void) {
    let bw = arg.cast::<ButexWaiter>();
    loop {
        // SAFETY: the owner spins on unschedule before tearing the record
        // down, so it is valid for the whole callback.
        if unsafe { erase_from_butex(bw, true) } {
            return;
        }
        // Not queued anywhere right now. Only timed fiber waits arm this
        // callback, and their enqueue is deferred until after the yield, so
        // the deadline can also beat the enqueue.
        let fw = bw.cast::<ButexFiberWaiter>();
        let b = unsafe { (*fw).initial_butex };
        // SAFETY: the initial butex outlives the wait call that named it.
        let waiters = unsafe { &(*b).waiters }.lock();
        if !unsafe { &(*bw).container }.load(Ordering::Relaxed).is_null() {
            // Enqueued between the failed erase and taking the lock; retry.
            drop(waiters);
            continue;
        }
        if unsafe { &(*fw).ever_queued }.load(Ordering::Relaxed) {
            // A waker already dequeued the record; the wake wins.
            return;
        }
        // The deadline beat the deferred enqueue: record the timeout under
        // the lock the enqueue checks, so it backs out and self-wakes.
        if unsafe { &(*fw).waiter_state }.load() == WaiterState::Timed {
            unsafe { &(*fw).waiter_state }.store(WaiterState::TimedOut);
        }
        return;
    }
}

/// The remained action of a fiber wait: runs with the fiber's context saved,
/// before any other fiber resumes on this worker. Queueing after the switch
/// is what closes the "wake lost because the wait had not recorded itself
/// yet" race without holding the lock across a context switch.
unsafe fn wait_for_butex(arg: *mut c_void) {
    let bw = arg.cast::<ButexFiberWaiter>();
    // SAFETY: the record lives in the suspended fiber's frame, which cannot
    // unwind before this action completes and the fiber is resumed.
    let b = unsafe { (*bw).initial_butex };
    {
        // A timed waiter must still be in TIMED state when queued; TIMEDOUT
        // here means the deadline already fired and queueing must not
        // happen. Both sides take this lock, so the state is well ordered.
        let mut waiters = unsafe { &(*b).waiters }.lock();
        let meta = unsafe { &*(*bw).task_meta };
        let stop_interrupt =
            meta.stop.load(Ordering::Relaxed) && meta.interruptible.load(Ordering::Relaxed);
        if unsafe { &(*b).value }.load(Ordering::Relaxed) == unsafe { (*bw).expected_value }
            && unsafe { &(*bw).waiter_state }.load() != WaiterState::TimedOut
            && !stop_interrupt
        {
            let base = unsafe { ptr::addr_of_mut!((*bw).base) };
            unsafe { waiters.push_back(base) };
            unsafe { &(*bw).base.container }.store(b, Ordering::Relaxed);
            unsafe { &(*bw).ever_queued }.store(true, Ordering::Relaxed);
            return;
        }
    }
    // container stayed null, so the timer callback and stoppers are no-ops
    // from here on; the record is exclusively this worker's again.
    unsafe { unsleep_if_necessary(bw, global_timer_thread()) };
    if unsafe { &(*bw).waiter_state }.load() != WaiterState::TimedOut {
        unsafe { &(*bw).waiter_state }.store(WaiterState::Cancelled);
    }
    let tid = unsafe { (*bw).base.tid };
    // A direct transfer back to the cancelled fiber would run a remained
    // action inside a remained action; self-wake keeps the stack bounded.
    let worker = sched::current_worker().expect("remained actions run on a worker");
    worker.ready_to_run(tid);
}

unsafe fn butex_wait_from_thread(
    g: Option<&'static dyn Worker>,
    b: *mut Butex,
    expected_value: i32,
    abstime: Option<&Timespec>,
) -> Result<(), WaitError> {
    // The kernel futex takes a relative timeout.
    let mut timeout = None;
    if let Some(abstime) = abstime {
        let timeout_us = abstime.as_microseconds() - gettimeofday_us();
        if timeout_us <= LEAST_SLEEP_US {
            return Err(WaitError::TimedOut);
        }
        timeout = Some(Timespec::from_microseconds(timeout_us));
    }

    let mut task: *mut FiberMeta = ptr::null_mut();
    let mut set_waiter = false;
    let mut pw = ButexThreadWaiter::new();
    let pw_ptr = ptr::addr_of_mut!(pw);

    if let Some(g) = g {
        task = g.current_task();
        // SAFETY: a worker's current task record is live for the whole call.
        let meta = unsafe { &*task };
        if meta.interruptible.load(Ordering::Acquire) {
            if meta.stop.load(Ordering::Acquire) {
                return Err(WaitError::Stopped);
            }
            set_waiter = true;
            // Release pairs with the stopper's acquire consume.
            meta.current_waiter.store(
                // SAFETY: pw_ptr points into this frame.
                unsafe { ptr::addr_of_mut!((*pw_ptr).base) },
                Ordering::Release,
            );
        }
    }

    let rc;
    {
        // SAFETY: b is live per the caller.
        let mut waiters = unsafe { &(*b).waiters }.lock();
        if unsafe { &(*b).value }.load(Ordering::Relaxed) == expected_value {
            // SAFETY: pw is unlinked and outlives its time in the queue.
            unsafe { waiters.push_back(ptr::addr_of_mut!((*pw_ptr).base)) };
            unsafe { &(*pw_ptr).base.container }.store(b, Ordering::Relaxed);
            drop(waiters);
            BUTEX_WAITER_COUNT.fetch_add(1, Ordering::Relaxed);
            // SAFETY: pw stays valid; wait_thread leaves the queue clean.
            rc = unsafe { wait_thread(pw_ptr, timeout.as_ref()) };
            BUTEX_WAITER_COUNT.fetch_sub(1, Ordering::Relaxed);
        } else {
            drop(waiters);
            rc = Err(WaitError::WouldBlock);
        }
    }
    if !task.is_null() {
        // SAFETY: as above.
        let meta = unsafe { &*task };
        if set_waiter {
            // A null here means a stopper borrowed the waiter; spin until it
            // is handed back, then leave the slot cleared.
            sys::spin_until(|| {
                !meta
                    .current_waiter
                    .swap(ptr::null_mut(), Ordering::Acquire)
                    .is_null()
            });
        }
        if meta.stop.load(Ordering::Acquire) {
            return Err(WaitError::Stopped);
        }
    }
    rc
}

/// Block until the butex is woken, as long as its value still equals
/// `expected_value`, optionally bounded by an absolute wall-clock deadline.
///
/// Returns `Ok(())` on a normal wake; see [`WaitError`] for the error kinds
/// and their priority.
///
/// # Safety
///
/// `handle` must be a live butex handle for the whole call.
pub unsafe fn butex_wait(
    handle: *mut i32,
    expected_value: i32,
    abstime: Option<&Timespec>,
) -> Result<(), WaitError> {
    let b = butex_locate(handle);
    // SAFETY: handle is live per contract.
    if unsafe { &(*b).value }.load(Ordering::Relaxed) != expected_value {
        // Callers often act on the mismatch right away; make the writes that
        // produced it visible first.
        fence(Ordering::Acquire);
        return Err(WaitError::WouldBlock);
    }
    let g = match sched::current_worker() {
        Some(g) if !g.is_current_kthread_task() => g,
        // SAFETY: forwarded contract.
        other => return unsafe { butex_wait_from_thread(other, b, expected_value, abstime) },
    };

    let meta = g.current_task();
    let mut bbw = ButexFiberWaiter::new(g.current_tid(), meta, expected_value, b, g.control());
    let bbw_ptr = ptr::addr_of_mut!(bbw);

    if let Some(abstime) = abstime {
        // Arm the timer before queueing; if it beats the deferred enqueue,
        // the enqueue backs out. Optimistic locking.
        bbw.waiter_state.store(WaiterState::Timed);
        if abstime.as_microseconds() <= gettimeofday_us() + LEAST_SLEEP_US {
            return Err(WaitError::TimedOut);
        }
        // SAFETY: the spin after sched keeps bbw alive until the callback
        // has finished or been unscheduled.
        let sleep_id = unsafe {
            global_timer_thread().schedule(
                erase_from_butex_and_wakeup,
                bbw_ptr.cast::<c_void>(),
                *abstime,
            )
        };
        if sleep_id == 0 {
            // The timer service is shut down.
            return Err(WaitError::Stopped);
        }
        bbw.sleep_id.store(sleep_id, Ordering::Relaxed);
    }
    BUTEX_WAITER_COUNT.fetch_add(1, Ordering::Relaxed);
    // Release pairs with the stopper's acquire consume, so a stopper sees a
    // fully-built record (and the task's current interruptibility).
    // SAFETY: meta is the live current task record.
    unsafe { &*meta }.current_waiter.store(
        // SAFETY: bbw_ptr points into this frame.
        unsafe { ptr::addr_of_mut!((*bbw_ptr).base) },
        Ordering::Release,
    );
    g.set_remained(wait_for_butex, bbw_ptr.cast::<c_void>());
    g.sched();
    // From here the fiber may be running on a different worker; g is stale.

    // The timer callback may still be using the record; the chance is small,
    // spin it out.
    // SAFETY: bbw is this frame's record.
    sys::spin_until(|| unsafe { unsleep_if_necessary(bbw_ptr, global_timer_thread()) } >= 0);
    // A null current_waiter means a stopper is still using the record; spin
    // until it is handed back.
    // SAFETY: meta outlives the fiber's run.
    let meta = unsafe { &*bbw.task_meta };
    sys::spin_until(|| {
        !meta
            .current_waiter
            .swap(ptr::null_mut(), Ordering::Acquire)
            .is_null()
    });
    BUTEX_WAITER_COUNT.fetch_sub(1, Ordering::Relaxed);

    // Stop has the highest priority, then an observed timeout.
    if meta.stop.load(Ordering::Acquire) {
        return Err(WaitError::Stopped);
    }
    match bbw.waiter_state.load() {
        WaiterState::TimedOut => Err(WaitError::TimedOut),
        WaiterState::Cancelled => Err(WaitError::WouldBlock),
        _ => Ok(()),
    }
}

/// As [`butex_wait`], with stop-interruption disabled for the duration.
///
/// A stop requested meanwhile still marks the task; it just cannot cut the
/// wait short, and the wait reports it once it finishes.
///
/// # Safety
///
/// As [`butex_wait`].
pub unsafe fn butex_wait_uninterruptible(
    handle: *mut i32,
    expected_value: i32,
    abstime: Option<&Timespec>,
) -> Result<(), WaitError> {
    let mut caller: *mut FiberMeta = ptr::null_mut();
    let mut saved_interruptible = true;
    if let Some(g) = sched::current_worker() {
        caller = g.current_task();
        // SAFETY: the current task record is live for the whole call.
        saved_interruptible = unsafe { &*caller }
            .interruptible
            .swap(false, Ordering::AcqRel);
    }
    // SAFETY: forwarded contract.
    let rc = unsafe { butex_wait(handle, expected_value, abstime) };
    if !caller.is_null() {
        // SAFETY: as above.
        unsafe { &*caller }
            .interruptible
            .store(saved_interruptible, Ordering::Release);
    }
    rc
}

/// Interrupt the fiber `tid` out of whatever butex wait it is blocked in.
///
/// Consuming the published waiter gives this thread exclusive use of the
/// record; after the erase it is handed back so the owner can observe the
/// stop and clear it. This is the only way one thread legally removes
/// another fiber's on-frame waiter. `Err` carries an errno (`ESRCH` when no
/// such fiber is registered).
pub fn stop_butex_wait(tid: FiberId) -> Result<(), i32> {
    let w = fiber::stop_and_consume_butex_waiter(tid)?;
    if !w.is_null() {
        // SAFETY: the waiter's owner spins until the record is handed back,
        // keeping it valid for the erase.
        unsafe { erase_from_butex(w, true) };
        if fiber::set_butex_waiter(tid, w).is_err() {
            tracing::error!("butex_wait should spin until the waiter is restored");
            return Err(libc::EINVAL);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::MaybeUninit;
    use std::time::{Duration, Instant};

    #[test]
    fn layout_contract() {
        assert_eq!(offset_of!(Butex, value), 0);
        assert!(std::mem::align_of::<Butex>() >= 64);
    }

    #[test]
    fn create_destroy_roundtrip() {
        let h = butex_create();
        assert!(!h.is_null());
        unsafe {
            assert_eq!(butex_value(h).load(Ordering::Relaxed), 0);
            butex_value(h).store(42, Ordering::Relaxed);
            assert_eq!(butex_value(h).load(Ordering::Relaxed), 42);
            butex_destroy(h);
        }
    }

    #[test]
    fn construct_destruct_in_place() {
        let mut mem = MaybeUninit::<Butex>::uninit();
        let h = unsafe { butex_construct(mem.as_mut_ptr()) };
        assert_eq!(h.cast::<Butex>(), mem.as_mut_ptr());
        unsafe {
            butex_value(h).store(7, Ordering::Relaxed);
            assert_eq!(butex_value(h).load(Ordering::Relaxed), 7);
            butex_destruct(mem.as_mut_ptr());
        }
    }

    #[test]
    fn mismatch_fast_path_would_block() {
        let h = butex_create();
        unsafe {
            butex_value(h).store(5, Ordering::Relaxed);
            assert_eq!(butex_wait(h, 7, None), Err(WaitError::WouldBlock));
            butex_destroy(h);
        }
    }

    #[test]
    fn wake_with_empty_queue_is_zero() {
        let h = butex_create();
        unsafe {
            assert_eq!(butex_wake(h), 0);
            assert_eq!(butex_wake_all(h), 0);
            assert_eq!(butex_wake_except(h, 1), 0);
            butex_destroy(h);
        }
    }

    #[test]
    fn requeue_with_empty_source_is_zero() {
        let src = butex_create();
        let dst = butex_create();
        unsafe {
            assert_eq!(butex_requeue(src, dst), 0);
            butex_destroy(src);
            butex_destroy(dst);
        }
    }

    #[test]
    fn requeue_to_itself_is_a_wake() {
        let h = butex_create();
        unsafe {
            assert_eq!(butex_requeue(h, h), 0);
            butex_destroy(h);
        }
    }

    #[test]
    fn expired_deadline_times_out_without_queueing() {
        let h = butex_create();
        let past = Timespec::from_microseconds(gettimeofday_us() - 1_000);
        unsafe {
            assert_eq!(butex_wait(h, 0, Some(&past)), Err(WaitError::TimedOut));
        }
        assert_eq!(butex_waiter_count(), 0);
        unsafe { butex_destroy(h) };
    }

    #[test]
    fn ref_counting_balances() {
        let h = butex_create();
        unsafe {
            butex_add_ref_before_wake(h);
            butex_remove_ref(h);
            butex_add_ref_before_wake(h);
            assert_eq!(butex_wake_and_remove_ref(h), 0);
            butex_add_ref_before_wake(h);
            assert_eq!(butex_wake_all_and_remove_ref(h), 0);
            butex_destroy(h);
        }
    }

    #[test]
    fn teardown_waits_for_inflight_wake_ref() {
        let h = butex_create();
        unsafe { butex_add_ref_before_wake(h) };
        let addr = h as usize;
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(60));
            unsafe { butex_wake_all_and_remove_ref(addr as *mut i32) };
        });
        std::thread::sleep(Duration::from_millis(10));
        let start = Instant::now();
        unsafe { butex_destroy(h) };
        assert!(start.elapsed() >= Duration::from_millis(20));
        waker.join().unwrap();
    }

    #[test]
    fn stop_of_unknown_fiber_is_esrch() {
        assert_eq!(stop_butex_wait(987_654_321), Err(libc::ESRCH));
    }
}
