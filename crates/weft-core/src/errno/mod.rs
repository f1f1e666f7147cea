//! Error kinds of the wait path.
//!
//! Wake, requeue and stop operations do not fail; only `butex_wait` and
//! friends return an error, and only one of the three kinds below. The
//! numeric mapping is kept for callers that surface errno-style codes at the
//! runtime's edge.

use std::fmt;

/// Interruption of a stopped task. Outside the range the kernel uses so it
/// can never collide with a real errno.
pub const ESTOP: i32 = -20;

/// Why a `butex_wait` call returned without being woken normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The value word did not match the expected value, either on entry or
    /// when re-checked under the waiter lock before queueing.
    WouldBlock,
    /// The deadline was reached without a wake.
    TimedOut,
    /// The waiting task is being stopped. Takes priority over every other
    /// outcome, including an already-observed timeout.
    Stopped,
}

impl WaitError {
    /// The errno-style code for this kind.
    pub const fn as_errno(self) -> i32 {
        match self {
            WaitError::WouldBlock => libc::EWOULDBLOCK,
            WaitError::TimedOut => libc::ETIMEDOUT,
            WaitError::Stopped => ESTOP,
        }
    }

    /// Static description, `strerror` style.
    pub const fn message(self) -> &'static str {
        match self {
            WaitError::WouldBlock => "Value of the butex does not match the expected value",
            WaitError::TimedOut => "Deadline reached before a wake-up",
            WaitError::Stopped => "The waiting task is being stopped",
        }
    }
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for WaitError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(WaitError::WouldBlock.as_errno(), libc::EWOULDBLOCK);
        assert_eq!(WaitError::TimedOut.as_errno(), libc::ETIMEDOUT);
        assert_eq!(WaitError::Stopped.as_errno(), ESTOP);
    }

    #[test]
    fn estop_is_not_a_kernel_errno() {
        assert!(ESTOP < 0);
    }

    #[test]
    fn messages_are_distinct() {
        assert_ne!(WaitError::WouldBlock.message(), WaitError::TimedOut.message());
        assert_ne!(WaitError::TimedOut.message(), WaitError::Stopped.message());
        assert_eq!(
            format!("{}", WaitError::TimedOut),
            WaitError::TimedOut.message()
        );
    }
}
