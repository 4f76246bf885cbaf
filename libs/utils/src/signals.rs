//! A flag that SIGINT/SIGTERM set, polled from blocking loops.
//!
//! The engine has exactly one thread of control and no async runtime, so
//! there is nothing to cancel a future on: every long-running loop (the
//! archive waiter, standby replay polling, the file copier between files)
//! checks [`Interrupt::fired`] at the top of each iteration and unwinds via
//! [`crate::lsn`]-adjacent error types rather than a signal handler doing
//! anything but flipping a bit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use signal_hook::consts::{SIGINT, SIGTERM};

#[derive(Clone)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
}

impl Interrupt {
    /// Registers SIGINT and SIGTERM handlers that set a shared flag.
    /// Safe to call once per process; additional calls register additional
    /// (harmless, redundant) handlers.
    pub fn install() -> std::io::Result<Self> {
        let flag = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(SIGINT, Arc::clone(&flag))?;
        signal_hook::flag::register(SIGTERM, Arc::clone(&flag))?;
        Ok(Interrupt { flag })
    }

    /// For tests: a handle that is never set by a real signal.
    pub fn never() -> Self {
        Interrupt {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn fired(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Test-only: simulate receipt of a signal.
    pub fn simulate(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_clear_and_can_be_simulated() {
        let i = Interrupt::never();
        assert!(!i.fired());
        i.simulate();
        assert!(i.fired());
        // clones observe the same flag
        let j = i.clone();
        assert!(j.fired());
    }
}
