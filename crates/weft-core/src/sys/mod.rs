//! Kernel futex primitives and spin helpers.
//!
//! Thin wrappers over `syscall(SYS_futex, ..)` with `FUTEX_PRIVATE_FLAG`
//! always set; butexes are process-private. Timeouts are relative, as the
//! kernel wants them.

use crate::time::Timespec;
use std::hint;
use std::ptr;

/// Current value of the calling thread's errno.
pub fn errno() -> i32 {
    // SAFETY: __errno_location returns a valid thread-local pointer.
    unsafe { *libc::__errno_location() }
}

/// Overwrite the calling thread's errno.
pub fn set_errno(value: i32) {
    // SAFETY: __errno_location returns a valid thread-local pointer.
    unsafe { *libc::__errno_location() = value }
}

/// Park the calling thread on `addr` while `*addr == expected`.
///
/// Returns `Ok(())` on a wake-up and `Err(errno)` otherwise; the interesting
/// errnos are `EAGAIN` (word already changed), `EINTR` and `ETIMEDOUT`.
///
/// # Safety
///
/// `addr` must point to a live, aligned 32-bit word for the whole call.
pub unsafe fn futex_wait_private(
    addr: *const i32,
    expected: i32,
    timeout: Option<&Timespec>,
) -> Result<(), i32> {
    let ts = timeout.map(Timespec::to_kernel);
    let ts_ptr = ts
        .as_ref()
        .map_or(ptr::null(), |t| t as *const libc::timespec);
    // SAFETY: caller guarantees addr; ts_ptr is null or points to a local.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr,
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            ts_ptr,
        )
    };
    if rc == 0 { Ok(()) } else { Err(errno()) }
}

/// Wake up to `nwake` threads parked on `addr`. Returns the number woken.
///
/// A failure (notably EFAULT when the word's mapping is already gone) is
/// deliberately reported as zero; see the butex wake protocol.
///
/// # Safety
///
/// `addr` must be a plausible word address; it may already be unmapped.
pub unsafe fn futex_wake_private(addr: *const i32, nwake: i32) -> usize {
    // SAFETY: the kernel validates the address and returns EFAULT if gone.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr,
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            nwake,
        )
    };
    if rc < 0 { 0 } else { rc as usize }
}

/// One pause instruction; the body of every short spin.
#[inline]
pub fn cpu_relax() {
    hint::spin_loop();
}

/// Spin until `done` returns true: at most 30 pauses before the first
/// re-check, a scheduler yield on every iteration after that.
///
/// Callers use this only against a peer that holds a reference across a
/// constant-time critical section, so the wait is bounded.
pub fn spin_until<F: FnMut() -> bool>(mut done: F) {
    if done() {
        return;
    }
    for _ in 0..30 {
        cpu_relax();
    }
    while !done() {
        std::thread::yield_now();
    }
}
