//! Administrative gate for experiment scheduling.
//!
//! One controller is created by the daemon's composition root and shared with
//! the orchestrator. Transitions are unrestricted; every change is logged.

use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::AdminState;

#[derive(Debug)]
struct Inner {
    state: AdminState,
    since: Instant,
    since_wall: DateTime<Utc>,
}

#[derive(Debug)]
pub struct AdminController {
    inner: RwLock<Inner>,
}

/// Point-in-time view for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminSnapshot {
    pub state: AdminState,
    pub since: DateTime<Utc>,
    pub seconds_in_state: u64,
}

impl AdminController {
    pub fn new(initial: AdminState) -> Self {
        Self {
            inner: RwLock::new(Inner {
                state: initial,
                since: Instant::now(),
                since_wall: Utc::now(),
            }),
        }
    }

    pub fn state(&self) -> AdminState {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).state
    }

    /// Set the state. Setting the current state again keeps the original
    /// `since` timestamp.
    pub fn set_state(&self, next: AdminState) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.state == next {
            return;
        }
        tracing::info!(from = %inner.state, to = %next, "admin state changed");
        inner.state = next;
        inner.since = Instant::now();
        inner.since_wall = Utc::now();
    }

    pub fn time_in_state(&self) -> Duration {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .since
            .elapsed()
    }

    /// True only in [`AdminState::Started`]. Checked before every scheduling
    /// action, not once per tick.
    pub fn can_run_experiments(&self) -> bool {
        self.state() == AdminState::Started
    }

    pub fn snapshot(&self) -> AdminSnapshot {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        AdminSnapshot {
            state: inner.state,
            since: inner.since_wall,
            seconds_in_state: inner.since.elapsed().as_secs(),
        }
    }
}

impl Default for AdminController {
    fn default() -> Self {
        Self::new(AdminState::Starting)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(AdminState::Starting, false)]
    #[case(AdminState::Started, true)]
    #[case(AdminState::Paused, false)]
    #[case(AdminState::Abort, false)]
    fn only_started_runs_experiments(#[case] state: AdminState, #[case] allowed: bool) {
        let admin = AdminController::new(state);
        assert_eq!(admin.can_run_experiments(), allowed);
    }

    #[test]
    fn transitions_are_permissive() {
        let admin = AdminController::default();
        admin.set_state(AdminState::Started);
        admin.set_state(AdminState::Starting);
        assert_eq!(admin.state(), AdminState::Starting);
        admin.set_state(AdminState::Abort);
        admin.set_state(AdminState::Started);
        assert!(admin.can_run_experiments());
    }

    #[test]
    fn repeated_state_keeps_since() {
        let admin = AdminController::new(AdminState::Paused);
        let before = admin.snapshot().since;
        std::thread::sleep(Duration::from_millis(5));
        admin.set_state(AdminState::Paused);
        assert_eq!(admin.snapshot().since, before);
        assert!(admin.time_in_state() >= Duration::from_millis(5));
    }

    #[test]
    fn change_resets_time_in_state() {
        let admin = AdminController::new(AdminState::Paused);
        std::thread::sleep(Duration::from_millis(20));
        admin.set_state(AdminState::Started);
        assert!(admin.time_in_state() < Duration::from_millis(20));
    }
}
