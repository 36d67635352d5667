use serde::{Deserialize, Serialize};

use super::AutonomyLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDecision {
    Proceed,
    AskQueen,
    ValidateWithQueen,
    NotifyQueen,
}

/// What a drone should do next on a step.
///
/// A blocker always goes to the queen. Ambiguity goes to the queen unless the
/// step runs with full autonomy. Otherwise the level decides: validation and
/// notification levels report back, the rest proceed.
pub fn decide(autonomy: AutonomyLevel, ambiguity_detected: bool, blocker_detected: bool) -> PolicyDecision {
    if blocker_detected {
        return PolicyDecision::AskQueen;
    }
    match autonomy {
        AutonomyLevel::Full => PolicyDecision::Proceed,
        _ if ambiguity_detected => PolicyDecision::AskQueen,
        AutonomyLevel::AskIfUnclear => PolicyDecision::Proceed,
        AutonomyLevel::ValidateBeforeNext => PolicyDecision::ValidateWithQueen,
        AutonomyLevel::NotifyWhenDone => PolicyDecision::NotifyQueen,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocker_always_escalates() {
        for level in [
            AutonomyLevel::Full,
            AutonomyLevel::AskIfUnclear,
            AutonomyLevel::ValidateBeforeNext,
            AutonomyLevel::NotifyWhenDone,
        ] {
            assert_eq!(decide(level, false, true), PolicyDecision::AskQueen);
        }
    }

    #[test]
    fn test_full_autonomy_ignores_ambiguity() {
        assert_eq!(decide(AutonomyLevel::Full, true, false), PolicyDecision::Proceed);
    }

    #[test]
    fn test_ask_if_unclear() {
        assert_eq!(decide(AutonomyLevel::AskIfUnclear, false, false), PolicyDecision::Proceed);
        assert_eq!(decide(AutonomyLevel::AskIfUnclear, true, false), PolicyDecision::AskQueen);
    }

    #[test]
    fn test_reporting_levels() {
        assert_eq!(
            decide(AutonomyLevel::ValidateBeforeNext, false, false),
            PolicyDecision::ValidateWithQueen
        );
        assert_eq!(
            decide(AutonomyLevel::NotifyWhenDone, false, false),
            PolicyDecision::NotifyQueen
        );
        assert_eq!(
            decide(AutonomyLevel::NotifyWhenDone, true, false),
            PolicyDecision::AskQueen
        );
    }
}
