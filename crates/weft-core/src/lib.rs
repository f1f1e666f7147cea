//! Core synchronization primitive of the weft M:N threading runtime.
//!
//! The centerpiece is the [`butex`] module: a futex-like wait/wake object
//! that parks both fibers (cooperatively scheduled user-space tasks) and
//! native OS threads against a shared 32-bit state word. Every higher-level
//! primitive of the runtime — mutexes, condition variables, semaphores, join,
//! channel wakeups — reduces to it.
//!
//! The fiber scheduler itself is an external collaborator; [`sched`] defines
//! the narrow contract the butex consumes (current task, deferred "remained"
//! hook, ready queues, direct exchange). [`timer`] provides the timer service
//! used for timed waits, and [`fiber`] the per-task record and registry that
//! make external interruption (`stop`) possible.
//!
//! Linux-only: parking native threads goes through the kernel futex syscall.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod butex;
pub mod errno;
pub mod fiber;
pub mod sched;
pub mod sys;
pub mod time;
pub mod timer;

pub use butex::{
    butex_add_ref_before_wake, butex_construct, butex_create, butex_destroy, butex_destruct,
    butex_remove_ref, butex_requeue, butex_value, butex_wait, butex_wait_uninterruptible,
    butex_wake, butex_wake_all, butex_wake_all_and_remove_ref, butex_wake_and_remove_ref,
    butex_wake_except, butex_waiter_count, stop_butex_wait, Butex,
};
pub use errno::WaitError;
pub use fiber::{FiberId, FiberMeta};
pub use time::Timespec;
