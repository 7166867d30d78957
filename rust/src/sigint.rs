//! Deferring SIGINT across backend mutations.

// SPDX-License-Identifier: Apache-2.0 OR MIT

use anyhow::{Context, Result};
use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow, Signal};

/// Blocks SIGINT while alive.  A SIGINT arriving meanwhile stays pending
/// and is delivered once the guard is dropped, unless it was already
/// blocked when the guard was created.
#[derive(Debug)]
#[must_use = "SIGINT is unblocked again when the guard is dropped"]
pub struct SigintGuard {
    was_blocked: bool,
}

impl SigintGuard {
    pub fn block() -> Result<Self> {
        let mut set = SigSet::empty();
        set.add(Signal::SIGINT);
        let mut old = SigSet::empty();
        sigprocmask(SigmaskHow::SIG_BLOCK, Some(&set), Some(&mut old))
            .context("Blocking SIGINT")?;
        tracing::debug!("SIGINT blocked");
        Ok(Self {
            was_blocked: old.contains(Signal::SIGINT),
        })
    }
}

impl Drop for SigintGuard {
    fn drop(&mut self) {
        if self.was_blocked {
            return;
        }
        let mut set = SigSet::empty();
        set.add(Signal::SIGINT);
        match sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&set), None) {
            Ok(()) => tracing::debug!("SIGINT restored"),
            Err(e) => tracing::warn!("Unblocking SIGINT: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sigint_blocked() -> bool {
        let mut old = SigSet::empty();
        sigprocmask(SigmaskHow::SIG_BLOCK, None, Some(&mut old)).unwrap();
        old.contains(Signal::SIGINT)
    }

    #[test]
    fn nesting() -> Result<()> {
        // Signal masks are per thread and the test harness runs each test
        // in its own thread.
        assert!(!sigint_blocked());
        let outer = SigintGuard::block()?;
        assert!(sigint_blocked());
        let inner = SigintGuard::block()?;
        drop(inner);
        assert!(sigint_blocked());
        drop(outer);
        assert!(!sigint_blocked());
        Ok(())
    }
}
