//! Commit states and the aggregate-state rule

use std::fmt;
use std::str::FromStr;

use crate::error::{BedrockError, Result};

/// Per-participant (and aggregate) commit state.
///
/// The derive order is the ordinal order used for aggregation:
/// `None < Committed < Prepared < Done < Rollbacked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CommitState {
    None,
    /// Commit requested, prepare outcome not yet known
    Committed,
    Prepared,
    Done,
    Rollbacked,
}

impl CommitState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CommitState::Done | CommitState::Rollbacked)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommitState::None => "None",
            CommitState::Committed => "Committed",
            CommitState::Prepared => "Prepared",
            CommitState::Done => "Done",
            CommitState::Rollbacked => "Rollbacked",
        }
    }
}

impl fmt::Display for CommitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommitState {
    type Err = BedrockError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "None" => Ok(CommitState::None),
            "Committed" => Ok(CommitState::Committed),
            "Prepared" => Ok(CommitState::Prepared),
            "Done" => Ok(CommitState::Done),
            "Rollbacked" => Ok(CommitState::Rollbacked),
            other => Err(BedrockError::Encoding(format!("Unknown commit state '{}'", other))),
        }
    }
}

/// Aggregate state of a transaction: the minimum of its participants' states.
///
/// Rollbacked sorts last, so one rolled-back participant does not pull the
/// aggregate down; only agreement from every participant moves it.
pub fn aggregate<'a>(states: impl IntoIterator<Item = &'a CommitState>) -> CommitState {
    states.into_iter().copied().min().unwrap_or(CommitState::None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trip_names() {
        for state in [
            CommitState::None,
            CommitState::Committed,
            CommitState::Prepared,
            CommitState::Done,
            CommitState::Rollbacked,
        ] {
            assert_eq!(state.as_str().parse::<CommitState>().unwrap(), state);
        }
        assert!("Aborted".parse::<CommitState>().is_err());
    }

    #[test]
    fn test_aggregate_is_minimum() {
        let states = [CommitState::Done, CommitState::Prepared, CommitState::Done];
        assert_eq!(aggregate(&states), CommitState::Prepared);
    }

    #[test]
    fn test_single_rollback_does_not_pull_aggregate_down() {
        let states = [CommitState::Rollbacked, CommitState::Prepared];
        assert_eq!(aggregate(&states), CommitState::Prepared);

        let states = [CommitState::Rollbacked, CommitState::Done];
        assert_eq!(aggregate(&states), CommitState::Done);

        let states = [CommitState::Rollbacked, CommitState::Rollbacked];
        assert_eq!(aggregate(&states), CommitState::Rollbacked);
    }

    #[test]
    fn test_aggregate_of_nothing() {
        let nothing: [CommitState; 0] = [];
        assert_eq!(aggregate(&nothing), CommitState::None);
    }
}
