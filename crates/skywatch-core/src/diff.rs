use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::Entity;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MembershipDiff {
    pub joined: Vec<Entity>,
    pub departed_candidates: Vec<Entity>,
}

impl MembershipDiff {
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.departed_candidates.is_empty()
    }
}

/// Set difference by `did`. Both sides come back sorted by `did` so the
/// output is reproducible regardless of listing order.
pub fn diff_members(previous: &[Entity], current: &[Entity]) -> MembershipDiff {
    let previous_by_did: HashMap<&str, &Entity> = previous
        .iter()
        .filter(|entity| entity.has_identity())
        .map(|entity| (entity.did.as_str(), entity))
        .collect();
    let current_by_did: HashMap<&str, &Entity> = current
        .iter()
        .filter(|entity| entity.has_identity())
        .map(|entity| (entity.did.as_str(), entity))
        .collect();

    let mut joined: Vec<Entity> = current_by_did
        .iter()
        .filter(|(did, _)| !previous_by_did.contains_key(*did))
        .map(|(_, entity)| (*entity).clone())
        .collect();

    let mut departed_candidates: Vec<Entity> = previous_by_did
        .iter()
        .filter(|(did, _)| !current_by_did.contains_key(*did))
        .map(|(_, entity)| (*entity).clone())
        .collect();

    joined.sort_by(|a, b| a.did.cmp(&b.did));
    departed_candidates.sort_by(|a, b| a.did.cmp(&b.did));

    MembershipDiff {
        joined,
        departed_candidates,
    }
}
