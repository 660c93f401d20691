use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use skywatch_core::{Entity, RelationType, diff_members};
use skywatch_store::StoreReader;

use crate::AnalysisError;

/// Whether a comparison baseline exists. Once a day has a prior snapshot,
/// every later day does too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum HistoryState {
    NoHistory,
    HasHistory { previous_date: NaiveDate },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub date: NaiveDate,
    pub history: HistoryState,
    pub joined: Vec<Entity>,
    pub departed_candidates: Vec<Entity>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.departed_candidates.is_empty()
    }
}

/// Diffs a day's follower snapshot against the closest earlier day.
#[derive(Debug, Clone, Copy)]
pub struct ChangeDetector {
    relation: RelationType,
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::for_relation(RelationType::Follower)
    }

    pub fn for_relation(relation: RelationType) -> Self {
        Self { relation }
    }

    pub fn compute_changes(
        &self,
        reader: &StoreReader<'_>,
        date: NaiveDate,
    ) -> Result<ChangeSet, AnalysisError> {
        let Some(previous_date) = reader.previous_snapshot_date(self.relation, date)? else {
            tracing::info!(
                date = %date,
                relation = self.relation.as_str(),
                "no earlier snapshot; recording baseline"
            );
            return Ok(ChangeSet {
                date,
                history: HistoryState::NoHistory,
                joined: Vec::new(),
                departed_candidates: Vec::new(),
            });
        };

        let previous = reader.entities_on(self.relation, previous_date)?;
        let current = reader.entities_on(self.relation, date)?;
        let diff = diff_members(&previous, &current);

        tracing::debug!(
            date = %date,
            previous_date = %previous_date,
            joined = diff.joined.len(),
            departed_candidates = diff.departed_candidates.len(),
            "membership diff computed"
        );

        Ok(ChangeSet {
            date,
            history: HistoryState::HasHistory { previous_date },
            joined: diff.joined,
            departed_candidates: diff.departed_candidates,
        })
    }
}
