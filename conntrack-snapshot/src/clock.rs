use std::{io, mem};

use chrono::{DateTime, Utc};

/// Time sources sampled once per snapshot.
pub trait Clock {
    fn wall_now(&self) -> DateTime<Utc>;

    /// Whole seconds of `CLOCK_MONOTONIC`, the clock the datapath stamps
    /// conntrack lifetimes with.
    fn monotonic_seconds(&self) -> io::Result<u32>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn wall_now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic_seconds(&self) -> io::Result<u32> {
        let mut ts: libc::timespec = unsafe { mem::zeroed() };
        let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ts.tv_sec as u32)
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn wall_now(&self) -> DateTime<Utc> {
        (**self).wall_now()
    }

    fn monotonic_seconds(&self) -> io::Result<u32> {
        (**self).monotonic_seconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_monotonic_clock_does_not_go_backwards() {
        let clock = SystemClock;
        let first = clock.monotonic_seconds().unwrap();
        let second = clock.monotonic_seconds().unwrap();
        assert!(second >= first);
    }
}
