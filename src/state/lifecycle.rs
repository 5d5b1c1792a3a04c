//! Per-resource lifecycle during an apply cycle.
//!
//! ```text
//! Absent  -> Planned -> Applying -> Applied
//! Applied -> Planned -> Applying -> Updated | Replaced | Deleted
//!                       Applying -> Failed
//!            Planned -> Skipped
//! ```

use serde::Serialize;
use std::fmt;

use crate::error::ExecutionError;

/// Where a resource stands in the current cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// Not provisioned.
    Absent,
    /// Provisioned by an earlier cycle and untouched by this one.
    Applied,
    /// An action is planned but has not started.
    Planned,
    /// An action is in flight.
    Applying,
    /// Updated in place.
    Updated,
    /// Replaced by a new remote object.
    Replaced,
    /// Removed.
    Deleted,
    /// The action failed.
    Failed,
    /// The action never started.
    Skipped,
}

impl Lifecycle {
    /// Returns true if `self -> to` is a legal transition.
    #[must_use]
    pub const fn can_transition(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Absent | Self::Applied, Self::Planned)
                | (Self::Planned, Self::Applying | Self::Skipped)
                | (
                    Self::Applying,
                    Self::Applied | Self::Updated | Self::Replaced | Self::Deleted | Self::Failed
                )
        )
    }

    /// Moves to `to`.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::InvalidTransition` if the transition is illegal.
    pub fn transition(&mut self, to: Self, resource: &str) -> Result<(), ExecutionError> {
        if !self.can_transition(to) {
            return Err(ExecutionError::InvalidTransition {
                resource: resource.to_string(),
                from: self.to_string(),
                to: to.to_string(),
            });
        }
        *self = to;
        Ok(())
    }

    /// Returns true once no further transition happens in this cycle.
    #[must_use]
    pub const fn is_final(self) -> bool {
        !matches!(self, Self::Planned | Self::Applying)
    }

    /// Returns true if the resource ended the cycle in a good state.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(
            self,
            Self::Absent | Self::Applied | Self::Updated | Self::Replaced | Self::Deleted
        )
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Absent => "absent",
            Self::Applied => "applied",
            Self::Planned => "planned",
            Self::Applying => "applying",
            Self::Updated => "updated",
            Self::Replaced => "replaced",
            Self::Deleted => "deleted",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_path() {
        let mut state = Lifecycle::Absent;
        state.transition(Lifecycle::Planned, "a").unwrap();
        state.transition(Lifecycle::Applying, "a").unwrap();
        state.transition(Lifecycle::Applied, "a").unwrap();
        assert!(state.is_final());
        assert!(state.is_success());
    }

    #[test]
    fn test_update_and_skip_paths() {
        let mut updated = Lifecycle::Applied;
        updated.transition(Lifecycle::Planned, "a").unwrap();
        updated.transition(Lifecycle::Applying, "a").unwrap();
        updated.transition(Lifecycle::Updated, "a").unwrap();

        let mut skipped = Lifecycle::Applied;
        skipped.transition(Lifecycle::Planned, "b").unwrap();
        skipped.transition(Lifecycle::Skipped, "b").unwrap();
        assert!(!skipped.is_success());
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut state = Lifecycle::Absent;
        let err = state.transition(Lifecycle::Applying, "a").unwrap_err();
        assert!(err.to_string().contains("absent -> applying"));
        assert_eq!(state, Lifecycle::Absent);

        assert!(!Lifecycle::Failed.can_transition(Lifecycle::Applied));
        assert!(!Lifecycle::Applying.can_transition(Lifecycle::Skipped));
        assert!(!Lifecycle::Skipped.can_transition(Lifecycle::Applying));
    }
}
