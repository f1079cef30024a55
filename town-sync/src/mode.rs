//! Operating-mode decision: remote-store-backed or local-broadcast fallback.
//!
//! The controller is the single source of truth for "are we backed by the
//! remote store". It starts Remote only when configuration is present, and
//! flips to LocalBroadcast on missing-resource errors, subscription failures,
//! or repeated transient failures. It never flips back on its own; a flip is
//! permanent for the session.
//!
//! State lives in atomics so tile writes and presence writes can report
//! failures concurrently from independent tasks without coordination.

use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

/// Number of transient failures tolerated before degrading the whole session.
/// A single transient failure only retries the failing operation locally.
pub const TRANSIENT_FLIP_THRESHOLD: u32 = 3;

const MODE_REMOTE: u8 = 0;
const MODE_LOCAL: u8 = 1;

/// Operating configuration: backend-store-backed or same-device fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Remote,
    LocalBroadcast,
}

/// Failure classes callers report; they drive the fallback decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Remote resource does not exist (missing table, not-found). Permanent.
    ResourceMissing,
    /// Network/timeout/unspecified remote failure for one operation.
    Transient,
    /// A change-feed subscription reported failure after establishing.
    Subscription,
}

pub struct ModeController {
    mode: AtomicU8,
    transient_failures: AtomicU32,
    started_remote: bool,
}

impl ModeController {
    /// Decide the starting mode: Remote only when configuration is present.
    pub fn resolve(config_present: bool) -> Self {
        let mode = if config_present { MODE_REMOTE } else { MODE_LOCAL };
        if !config_present {
            log::info!("no remote configuration, starting in local-broadcast mode");
        }
        Self {
            mode: AtomicU8::new(mode),
            transient_failures: AtomicU32::new(0),
            started_remote: config_present,
        }
    }

    pub fn current(&self) -> Mode {
        match self.mode.load(Ordering::Acquire) {
            MODE_REMOTE => Mode::Remote,
            _ => Mode::LocalBroadcast,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.current() == Mode::Remote
    }

    /// Whether the session started Remote and has since degraded.
    pub fn degraded(&self) -> bool {
        self.started_remote && self.current() == Mode::LocalBroadcast
    }

    /// Report a failed remote operation; returns the mode to use from now on.
    ///
    /// Missing-resource and subscription failures flip immediately. Transient
    /// failures flip only once `TRANSIENT_FLIP_THRESHOLD` of them accumulate,
    /// so a one-off timeout does not abandon the backend.
    pub fn report_failure(&self, kind: FailureKind) -> Mode {
        match kind {
            FailureKind::ResourceMissing | FailureKind::Subscription => {
                self.flip_local(kind);
            }
            FailureKind::Transient => {
                let seen = self.transient_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if seen >= TRANSIENT_FLIP_THRESHOLD {
                    self.flip_local(kind);
                }
            }
        }
        self.current()
    }

    fn flip_local(&self, kind: FailureKind) {
        // compare_exchange so concurrent reporters log the transition once
        if self
            .mode
            .compare_exchange(MODE_REMOTE, MODE_LOCAL, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            log::warn!("remote store failed ({kind:?}), degrading to local-broadcast mode");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_resolve_without_config_is_local() {
        let mode = ModeController::resolve(false);
        assert_eq!(mode.current(), Mode::LocalBroadcast);
        assert!(!mode.degraded()); // never was remote
    }

    #[test]
    fn test_resolve_with_config_is_remote() {
        let mode = ModeController::resolve(true);
        assert_eq!(mode.current(), Mode::Remote);
        assert!(mode.is_remote());
    }

    #[test]
    fn test_resource_missing_flips_immediately() {
        let mode = ModeController::resolve(true);
        assert_eq!(mode.report_failure(FailureKind::ResourceMissing), Mode::LocalBroadcast);
        assert!(mode.degraded());
    }

    #[test]
    fn test_subscription_failure_flips_immediately() {
        let mode = ModeController::resolve(true);
        assert_eq!(mode.report_failure(FailureKind::Subscription), Mode::LocalBroadcast);
    }

    #[test]
    fn test_single_transient_failure_does_not_flip() {
        let mode = ModeController::resolve(true);
        assert_eq!(mode.report_failure(FailureKind::Transient), Mode::Remote);
        assert_eq!(mode.current(), Mode::Remote);
    }

    #[test]
    fn test_repeated_transient_failures_flip() {
        let mode = ModeController::resolve(true);
        for _ in 0..TRANSIENT_FLIP_THRESHOLD - 1 {
            assert_eq!(mode.report_failure(FailureKind::Transient), Mode::Remote);
        }
        assert_eq!(mode.report_failure(FailureKind::Transient), Mode::LocalBroadcast);
    }

    #[test]
    fn test_flip_is_permanent_and_idempotent() {
        let mode = ModeController::resolve(true);
        mode.report_failure(FailureKind::ResourceMissing);
        mode.report_failure(FailureKind::Transient);
        mode.report_failure(FailureKind::Subscription);
        assert_eq!(mode.current(), Mode::LocalBroadcast);
    }

    #[test]
    fn test_concurrent_reporters_converge() {
        let mode = Arc::new(ModeController::resolve(true));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mode = mode.clone();
                std::thread::spawn(move || {
                    mode.report_failure(FailureKind::ResourceMissing);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(mode.current(), Mode::LocalBroadcast);
    }
}
