use serde::{Deserialize, Serialize};

use crate::{EngagementCounts, InteractionKind};

const LIKE_WEIGHT: u64 = 1;
const REPOST_WEIGHT: u64 = 2;
const FOLLOW_WEIGHT: u64 = 3;
const QUOTE_WEIGHT: u64 = 4;
const REPLY_WEIGHT: u64 = 5;

const INDIRECT_ENGAGEMENT_FACTOR: f64 = 0.5;

/// Per-actor interaction counts inside a reporting window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct InteractionTally {
    pub likes: u64,
    pub reposts: u64,
    pub follows: u64,
    pub quotes: u64,
    pub replies: u64,
}

impl InteractionTally {
    pub fn add(&mut self, kind: InteractionKind) {
        match kind {
            InteractionKind::Like => self.likes += 1,
            InteractionKind::Repost => self.reposts += 1,
            InteractionKind::Follow => self.follows += 1,
            InteractionKind::Quote => self.quotes += 1,
            InteractionKind::Reply => self.replies += 1,
        }
    }
}

/// Higher-effort interactions weigh more: likes 1, reposts 2, follows 3,
/// quotes 4, replies 5.
pub fn interaction_score(tally: &InteractionTally) -> u64 {
    tally.likes * LIKE_WEIGHT
        + tally.reposts * REPOST_WEIGHT
        + tally.follows * FOLLOW_WEIGHT
        + tally.quotes * QUOTE_WEIGHT
        + tally.replies * REPLY_WEIGHT
}

/// `likes + reposts*2 + replies*3 + bookmarks*2`, plus the same formula over
/// the indirect counters at half weight.
pub fn post_score(counts: &EngagementCounts) -> f64 {
    let direct = weighted(counts.likes, counts.reposts, counts.replies, counts.bookmarks);
    let indirect = weighted(
        counts.indirect_likes,
        counts.indirect_reposts,
        counts.indirect_replies,
        counts.indirect_bookmarks,
    );
    direct as f64 + indirect as f64 * INDIRECT_ENGAGEMENT_FACTOR
}

fn weighted(likes: i64, reposts: i64, replies: i64, bookmarks: i64) -> i64 {
    likes.max(0) + reposts.max(0) * 2 + replies.max(0) * 3 + bookmarks.max(0) * 2
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceClass {
    Giver,
    Receiver,
    Balanced,
}

impl BalanceClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Giver => "giver",
            Self::Receiver => "receiver",
            Self::Balanced => "balanced",
        }
    }
}

/// `given / received`, or 0 when nothing was received.
pub fn balance_ratio(given_total: u64, received_total: u64) -> f64 {
    if received_total == 0 {
        0.0
    } else {
        given_total as f64 / received_total as f64
    }
}

pub fn classify_balance(ratio: f64) -> BalanceClass {
    if ratio > 1.0 {
        BalanceClass::Giver
    } else if ratio < 1.0 {
        BalanceClass::Receiver
    } else {
        BalanceClass::Balanced
    }
}
