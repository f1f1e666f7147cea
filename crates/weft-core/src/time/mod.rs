//! Deadline arithmetic.
//!
//! Deadlines on the wait paths are absolute wall-clock times, carried as a
//! [`Timespec`] and compared in microseconds against [`gettimeofday_us`].
//! The kernel futex wants a relative timeout, so the conversion to and from
//! microsecond counts lives here.

/// Seconds plus nanoseconds, the shape the kernel uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timespec {
    /// Seconds.
    pub tv_sec: i64,
    /// Nanoseconds (0 to 999_999_999).
    pub tv_nsec: i64,
}

impl Timespec {
    /// Total microseconds represented by this timespec.
    pub const fn as_microseconds(&self) -> i64 {
        self.tv_sec * 1_000_000 + self.tv_nsec / 1_000
    }

    /// Build a timespec from a microsecond count.
    pub const fn from_microseconds(us: i64) -> Timespec {
        Timespec {
            tv_sec: us / 1_000_000,
            tv_nsec: (us % 1_000_000) * 1_000,
        }
    }

    /// An absolute deadline `us` microseconds from now.
    pub fn from_now_us(us: i64) -> Timespec {
        Timespec::from_microseconds(gettimeofday_us() + us)
    }

    pub(crate) const fn to_kernel(&self) -> libc::timespec {
        libc::timespec {
            tv_sec: self.tv_sec,
            tv_nsec: self.tv_nsec,
        }
    }
}

/// Microseconds since the Unix epoch, wall clock.
pub fn gettimeofday_us() -> i64 {
    let mut tv = libc::timeval {
        tv_sec: 0,
        tv_usec: 0,
    };
    // SAFETY: tv is a valid out-parameter; a null timezone is allowed.
    unsafe { libc::gettimeofday(&mut tv, std::ptr::null_mut()) };
    tv.tv_sec * 1_000_000 + tv.tv_usec
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn microsecond_roundtrip() {
        for us in [0i64, 1, 999_999, 1_000_000, 1_500_000, 86_400_000_000] {
            assert_eq!(Timespec::from_microseconds(us).as_microseconds(), us);
        }
    }

    #[test]
    fn sub_microsecond_nanos_truncate() {
        let ts = Timespec {
            tv_sec: 1,
            tv_nsec: 1_999,
        };
        assert_eq!(ts.as_microseconds(), 1_000_001);
    }

    #[test]
    fn now_is_monotonicish() {
        let a = gettimeofday_us();
        let b = gettimeofday_us();
        assert!(b + 1_000_000 >= a);
        // A sane wall clock is well past 2020.
        assert!(a > 1_577_836_800_000_000);
    }

    #[test]
    fn deadline_from_now_is_in_the_future() {
        let d = Timespec::from_now_us(50_000);
        assert!(d.as_microseconds() > gettimeofday_us());
    }
}
