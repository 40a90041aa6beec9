//! Cooperative stop tokens: a tiny `check() -> bool`
//! interface polled at message-granularity boundaries by the WAL Streamer,
//! Base Backup Pipeline, and Copy Manager, built on `signal-hook`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;

/// A shared flag toggled by an OS signal handler (or manually, for tests)
/// and polled cooperatively by long-running components.
#[derive(Clone)]
pub struct StopToken {
    flag: Arc<AtomicBool>,
}

impl StopToken {
    pub fn new() -> Self {
        StopToken { flag: Arc::new(AtomicBool::new(false)) }
    }

    /// Registers `SIGTERM`/`SIGINT` handlers that set this token's flag,
    /// acting as a `ConditionalSignalHandler`.
    pub fn install_os_handlers(&self) -> std::io::Result<()> {
        flag::register(SIGTERM, Arc::clone(&self.flag))?;
        flag::register(SIGINT, Arc::clone(&self.flag))?;
        Ok(())
    }

    pub fn check(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Asserts the flag directly; used by tests and by an operator-facing
    /// "stop this worker" control path that doesn't go through a signal.
    pub fn trip(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

impl Default for StopToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_is_not_tripped() {
        assert!(!StopToken::new().check());
    }

    #[test]
    fn trip_is_observed_through_clones() {
        let token = StopToken::new();
        let cloned = token.clone();
        assert!(!cloned.check());
        token.trip();
        assert!(cloned.check());
    }
}
