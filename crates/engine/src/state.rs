//! Attempt lifecycle states and the legal-transition table.

use std::fmt;

/// State of one attempt, as recorded in memory and (for the durable
/// subset) in its ATR entry.
///
/// Lifecycle:
///
/// ```text
/// NotStarted → Pending → Committing → Committed → Completed
///                      ↘ Aborting  → Aborted   → RolledBack
/// ```
///
/// `Committing` and `Aborting` are in-memory only; the ATR records
/// `PENDING`, `COMMITTED`, `COMPLETED`, `ABORTED` and `ROLLED_BACK`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    /// No mutation has been staged yet; no ATR entry exists.
    NotStarted,
    /// ATR entry written; mutations are being staged.
    Pending,
    /// Commit requested; the COMMITTED record is being written.
    Committing,
    /// Point of no return: the attempt will complete, possibly via
    /// cleanup.
    Committed,
    /// All mutations unstaged.
    Completed,
    /// Rollback requested; the ABORTED record is being written.
    Aborting,
    /// Rollback recorded; staged documents are being restored.
    Aborted,
    /// All staged documents restored.
    RolledBack,
}

impl AttemptState {
    /// Wire name used in the ATR `st` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptState::NotStarted => "NOT_STARTED",
            AttemptState::Pending => "PENDING",
            AttemptState::Committing => "COMMITTING",
            AttemptState::Committed => "COMMITTED",
            AttemptState::Completed => "COMPLETED",
            AttemptState::Aborting => "ABORTING",
            AttemptState::Aborted => "ABORTED",
            AttemptState::RolledBack => "ROLLED_BACK",
        }
    }

    /// Parse a wire name; unknown strings map to `NotStarted`.
    pub fn parse(s: &str) -> Self {
        match s {
            "PENDING" => AttemptState::Pending,
            "COMMITTING" => AttemptState::Committing,
            "COMMITTED" => AttemptState::Committed,
            "COMPLETED" => AttemptState::Completed,
            "ABORTING" => AttemptState::Aborting,
            "ABORTED" => AttemptState::Aborted,
            "ROLLED_BACK" => AttemptState::RolledBack,
            _ => AttemptState::NotStarted,
        }
    }

    /// Whether a durable transition from `self` to `next` is legal.
    ///
    /// Only transitions recorded in the ATR are checked here:
    /// `PENDING → {ABORTED, COMMITTED}`, `COMMITTED → COMPLETED`,
    /// `ABORTED → ROLLED_BACK`.
    pub fn can_transition_to(&self, next: AttemptState) -> bool {
        matches!(
            (self, next),
            (AttemptState::Pending, AttemptState::Committed)
                | (AttemptState::Pending, AttemptState::Aborted)
                | (AttemptState::Committed, AttemptState::Completed)
                | (AttemptState::Aborted, AttemptState::RolledBack)
        )
    }

    /// Whether no further protocol work is owed for this attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptState::Completed | AttemptState::RolledBack)
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names_roundtrip() {
        for st in [
            AttemptState::Pending,
            AttemptState::Committed,
            AttemptState::Completed,
            AttemptState::Aborted,
            AttemptState::RolledBack,
        ] {
            assert_eq!(AttemptState::parse(st.as_str()), st);
        }
        assert_eq!(AttemptState::parse("bogus"), AttemptState::NotStarted);
    }

    #[test]
    fn test_legal_transitions() {
        use AttemptState::*;
        assert!(Pending.can_transition_to(Committed));
        assert!(Pending.can_transition_to(Aborted));
        assert!(Committed.can_transition_to(Completed));
        assert!(Aborted.can_transition_to(RolledBack));

        assert!(!Committed.can_transition_to(Aborted));
        assert!(!Committed.can_transition_to(RolledBack));
        assert!(!Aborted.can_transition_to(Committed));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!NotStarted.can_transition_to(Committed));
    }
}
