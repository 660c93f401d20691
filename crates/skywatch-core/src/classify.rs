use serde::{Deserialize, Serialize};

use crate::CountObservation;

/// Likely cause of a day-over-day follower count movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeClassification {
    RealUnfollow,
    BlockedOrSuspended,
    Cleanup,
    NoChange,
}

impl ChangeClassification {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RealUnfollow => "real_unfollow",
            Self::BlockedOrSuspended => "blocked_or_suspended",
            Self::Cleanup => "cleanup",
            Self::NoChange => "no_change",
        }
    }
}

/// First match wins:
///
/// | profile | listing | result |
/// |---|---|---|
/// | < 0 | < 0 | real unfollow |
/// | = 0 | < 0 | blocked or suspended |
/// | < 0 | = 0 | cleanup (index lag) |
/// | else | else | no change |
pub fn classify_deltas(profile_delta: i64, api_delta: i64) -> ChangeClassification {
    match (profile_delta.signum(), api_delta.signum()) {
        (-1, -1) => ChangeClassification::RealUnfollow,
        (0, -1) => ChangeClassification::BlockedOrSuspended,
        (-1, 0) => ChangeClassification::Cleanup,
        _ => ChangeClassification::NoChange,
    }
}

pub fn classify_counts(
    previous: &CountObservation,
    current: &CountObservation,
) -> ChangeClassification {
    classify_deltas(
        current.profile_followers - previous.profile_followers,
        current.api_followers - previous.api_followers,
    )
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    #[test]
    fn decision_table_matches_first_row_that_applies() {
        assert_eq!(classify_deltas(-2, -1), ChangeClassification::RealUnfollow);
        assert_eq!(
            classify_deltas(0, -3),
            ChangeClassification::BlockedOrSuspended
        );
        assert_eq!(classify_deltas(-1, 0), ChangeClassification::Cleanup);
        assert_eq!(classify_deltas(0, 0), ChangeClassification::NoChange);
        assert_eq!(classify_deltas(4, -1), ChangeClassification::NoChange);
        assert_eq!(classify_deltas(-1, 2), ChangeClassification::NoChange);
    }

    #[test]
    fn classify_counts_uses_follower_columns() {
        let day1 = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let day2 = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
        let previous = CountObservation::new(day1, 100, 98, 0, 0).with_following(10, 10);
        let current = CountObservation::new(day2, 100, 97, 0, 0).with_following(5, 5);

        assert_eq!(
            classify_counts(&previous, &current),
            ChangeClassification::BlockedOrSuspended
        );
    }
}
