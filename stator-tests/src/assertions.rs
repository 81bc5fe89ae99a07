//! Custom assertions for common verification patterns
//!
//! Fluent checks with messages that name the entity and the field that
//! differed.

use chrono::{DateTime, Utc};
use stator_core::EntityRecord;
use stator_runtime::{AdvanceKind, Failure, Outcome, TransitionReport};

/// Start assertions on a record
pub fn assert_entity(record: &EntityRecord) -> EntityAssertions<'_> {
    EntityAssertions { record }
}

/// Entity record assertion helpers
#[derive(Clone, Copy)]
pub struct EntityAssertions<'a> {
    record: &'a EntityRecord,
}

impl<'a> EntityAssertions<'a> {
    pub fn in_state(self, state: &str) -> Self {
        assert_eq!(
            self.record.state, state,
            "{}: expected state '{}' but found '{}'",
            self.record.entity, state, self.record.state
        );
        self
    }

    pub fn attempts(self, count: u32) -> Self {
        assert_eq!(
            self.record.attempt_count, count,
            "{}: expected {} attempts but found {}",
            self.record.entity, count, self.record.attempt_count
        );
        self
    }

    /// No failed attempt since the last successful transition
    pub fn clean(self) -> Self {
        self.attempts(0);
        assert!(
            self.record.state_attempted.is_none(),
            "{}: state_attempted should be cleared",
            self.record.entity
        );
        self
    }

    pub fn changed_at(self, at: DateTime<Utc>) -> Self {
        assert_eq!(
            self.record.state_changed, at,
            "{}: unexpected state_changed",
            self.record.entity
        );
        self
    }

    /// No live lease at `now`
    pub fn unlocked_at(self, now: DateTime<Utc>) -> Self {
        assert!(
            !self.record.is_locked(now),
            "{}: still leased by {:?} until {:?}",
            self.record.entity,
            self.record.state_lock_owner,
            self.record.state_locked_until
        );
        self
    }

    /// Leased at `now` by an owner token starting with `worker_id`
    pub fn leased_by(self, worker_id: &str, now: DateTime<Utc>) -> Self {
        assert!(
            self.record.is_locked(now),
            "{}: expected a live lease",
            self.record.entity
        );
        let owner = self.record.state_lock_owner.as_deref().unwrap_or_default();
        assert!(
            owner.starts_with(worker_id),
            "{}: lease owner '{}' does not belong to '{}'",
            self.record.entity,
            owner,
            worker_id
        );
        self
    }
}

/// Start assertions on a transition report
pub fn assert_report(report: &TransitionReport) -> ReportAssertions<'_> {
    ReportAssertions { report }
}

/// Transition report assertion helpers
#[derive(Clone, Copy)]
pub struct ReportAssertions<'a> {
    report: &'a TransitionReport,
}

impl<'a> ReportAssertions<'a> {
    pub fn from_state(self, state: &str) -> Self {
        assert_eq!(self.report.from_state, state, "unexpected from_state");
        self
    }

    pub fn advanced_to(self, state: &str, via: AdvanceKind) -> Self {
        match &self.report.outcome {
            Outcome::Advanced { to, via: actual } if to == state && *actual == via => {}
            other => panic!(
                "{}: expected advance to '{}' via {:?}, got {:?}",
                self.report.entity, state, via, other
            ),
        }
        self
    }

    /// Failed attempt that will be retried
    pub fn retrying(self, attempt_count: u32) -> Self {
        match &self.report.outcome {
            Outcome::Retrying {
                attempt_count: actual,
                ..
            } if *actual == attempt_count => {}
            other => panic!(
                "{}: expected retry #{}, got {:?}",
                self.report.entity, attempt_count, other
            ),
        }
        self
    }

    pub fn failed_with(self, expected: &Failure) -> Self {
        let failure = match &self.report.outcome {
            Outcome::Retrying { failure, .. } | Outcome::Frozen { failure, .. } => failure,
            other => panic!(
                "{}: expected a failed attempt, got {:?}",
                self.report.entity, other
            ),
        };
        assert_eq!(failure, expected, "{}: unexpected failure", self.report.entity);
        self
    }

    pub fn frozen(self) -> Self {
        assert!(
            matches!(
                self.report.outcome,
                Outcome::Frozen { .. } | Outcome::InvariantViolation { frozen: true, .. }
            ),
            "{}: expected a frozen entity, got {:?}",
            self.report.entity,
            self.report.outcome
        );
        self
    }

    /// Claimed, found nothing to do and released
    pub fn skipped(self) -> Self {
        assert!(
            matches!(self.report.outcome, Outcome::Skipped { .. }),
            "{}: expected the entity to be released untouched, got {:?}",
            self.report.entity,
            self.report.outcome
        );
        self
    }

    pub fn lease_lost(self) -> Self {
        assert_eq!(
            self.report.outcome,
            Outcome::LeaseLost,
            "{}: expected the write to be fenced off",
            self.report.entity
        );
        self
    }
}
