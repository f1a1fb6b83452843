use std::sync::atomic::AtomicU32;
use std::time::Duration;

use crate::Result;

#[cfg(target_os = "linux")]
pub fn futex_wait(addr: &AtomicU32, expected: u32, timeout: Option<Duration>) -> Result<()> {
    use libc::{syscall, timespec, EAGAIN, EINTR, ETIMEDOUT, FUTEX_WAIT, SYS_futex};

    let mut ts = timespec { tv_sec: 0, tv_nsec: 0 };
    let ts_ptr = if let Some(timeout) = timeout {
        ts.tv_sec = timeout.as_secs() as libc::time_t;
        ts.tv_nsec = timeout.subsec_nanos() as libc::c_long;
        &ts as *const timespec
    } else {
        std::ptr::null()
    };

    let res = unsafe {
        syscall(
            SYS_futex,
            addr as *const AtomicU32 as *const u32,
            FUTEX_WAIT,
            expected,
            ts_ptr,
            std::ptr::null::<u32>(),
            0,
        )
    };
    if res == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == EAGAIN || code == EINTR || code == ETIMEDOUT => Ok(()),
        _ => Err(crate::Error::Io(err)),
    }
}

#[cfg(target_os = "linux")]
pub fn futex_wake(addr: &AtomicU32) -> Result<()> {
    use libc::{syscall, FUTEX_WAKE, SYS_futex};
    let res = unsafe {
        syscall(
            SYS_futex,
            addr as *const AtomicU32 as *const u32,
            FUTEX_WAKE,
            i32::MAX,
            std::ptr::null::<u32>(),
            std::ptr::null::<u32>(),
            0,
        )
    };
    if res < 0 {
        return Err(crate::Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wait(_addr: &AtomicU32, _expected: u32, timeout: Option<Duration>) -> Result<()> {
    if let Some(timeout) = timeout {
        std::thread::sleep(timeout.min(Duration::from_millis(1)));
    } else {
        std::thread::sleep(Duration::from_millis(1));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake(_addr: &AtomicU32) -> Result<()> {
    Ok(())
}

/// How a polling loop behaves when a cycle finds no work.
///
/// - `BusySpin`: 100% CPU on one core, lowest wake latency.
/// - `SpinThenYield`: spins a bounded number of times, then yields to the OS.
/// - `Sleep`: periodic polling, millisecond-class latency, near-zero CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleStrategy {
    BusySpin,
    SpinThenYield { spins: u32 },
    Sleep(Duration),
}

impl Default for IdleStrategy {
    fn default() -> Self {
        IdleStrategy::SpinThenYield { spins: 100 }
    }
}

/// Tracks consecutive idle cycles for an `IdleStrategy`.
#[derive(Debug)]
pub struct Idler {
    strategy: IdleStrategy,
    idle_cycles: u32,
}

impl Idler {
    pub fn new(strategy: IdleStrategy) -> Self {
        Self {
            strategy,
            idle_cycles: 0,
        }
    }

    /// Called once per duty cycle with the amount of work done. A non-zero
    /// work count resets the idle escalation.
    pub fn idle(&mut self, work_count: usize) {
        if work_count > 0 {
            self.idle_cycles = 0;
            return;
        }
        match self.strategy {
            IdleStrategy::BusySpin => std::hint::spin_loop(),
            IdleStrategy::SpinThenYield { spins } => {
                if self.idle_cycles < spins {
                    self.idle_cycles += 1;
                    std::hint::spin_loop();
                } else {
                    std::thread::yield_now();
                }
            }
            IdleStrategy::Sleep(duration) => std::thread::sleep(duration),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idler_resets_on_work() {
        let mut idler = Idler::new(IdleStrategy::SpinThenYield { spins: 2 });
        idler.idle(0);
        idler.idle(0);
        assert_eq!(idler.idle_cycles, 2);
        idler.idle(5);
        assert_eq!(idler.idle_cycles, 0);
    }

    #[test]
    fn futex_wake_without_waiters_is_ok() {
        let word = AtomicU32::new(0);
        futex_wake(&word).unwrap();
    }

    #[test]
    fn futex_wait_returns_on_mismatch() {
        let word = AtomicU32::new(7);
        // Expected value differs from actual: EAGAIN, treated as a wake.
        futex_wait(&word, 3, Some(Duration::from_millis(50))).unwrap();
    }
}
