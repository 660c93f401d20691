use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

mod classify;
mod diff;
mod reconcile;
mod score;
mod time;

pub use classify::{ChangeClassification, classify_counts, classify_deltas};
pub use diff::{MembershipDiff, diff_members};
pub use reconcile::{reconcile, total_by_kind};
pub use score::{
    BalanceClass, InteractionTally, balance_ratio, classify_balance, interaction_score,
    post_score,
};
pub use time::{ReportWindow, parse_timestamp};

use time::{deserialize_optional_timestamp, deserialize_timestamp};

pub type Did = String;

/// An account as seen by a listing. `did` is the identity key; `handle` is
/// display-only and may be empty when the source could not resolve it.
/// A missing `did` deserializes as empty so the store can skip the row
/// instead of the whole batch failing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Entity {
    #[serde(default)]
    pub did: Did,
    #[serde(default)]
    pub handle: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: String,
    #[serde(default)]
    pub bio: String,
}

impl Entity {
    pub fn new(did: impl Into<String>, handle: impl Into<String>) -> Self {
        Self {
            did: did.into(),
            handle: handle.into(),
            ..Self::default()
        }
    }

    pub fn has_identity(&self) -> bool {
        !self.did.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    Follower,
    Following,
    Muted,
    Blocked,
}

impl RelationType {
    pub const ALL: [RelationType; 4] = [
        Self::Follower,
        Self::Following,
        Self::Muted,
        Self::Blocked,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Follower => "follower",
            Self::Following => "following",
            Self::Muted => "muted",
            Self::Blocked => "blocked",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "follower" => Some(Self::Follower),
            "following" => Some(Self::Following),
            "muted" => Some(Self::Muted),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }
}

/// One row of a relation listing. Following and blocked records carry the
/// time the relation was created when the source exposes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "relation", rename_all = "snake_case")]
pub enum RelationMember {
    Follower {
        entity: Entity,
    },
    Following {
        entity: Entity,
        #[serde(default, deserialize_with = "deserialize_optional_timestamp")]
        followed_at: Option<DateTime<Utc>>,
    },
    Muted {
        entity: Entity,
    },
    Blocked {
        entity: Entity,
        #[serde(default, deserialize_with = "deserialize_optional_timestamp")]
        blocked_at: Option<DateTime<Utc>>,
    },
}

impl RelationMember {
    pub fn new(relation: RelationType, entity: Entity, related_at: Option<DateTime<Utc>>) -> Self {
        match relation {
            RelationType::Follower => Self::Follower { entity },
            RelationType::Following => Self::Following {
                entity,
                followed_at: related_at,
            },
            RelationType::Muted => Self::Muted { entity },
            RelationType::Blocked => Self::Blocked {
                entity,
                blocked_at: related_at,
            },
        }
    }

    pub fn relation_type(&self) -> RelationType {
        match self {
            Self::Follower { .. } => RelationType::Follower,
            Self::Following { .. } => RelationType::Following,
            Self::Muted { .. } => RelationType::Muted,
            Self::Blocked { .. } => RelationType::Blocked,
        }
    }

    pub fn entity(&self) -> &Entity {
        match self {
            Self::Follower { entity }
            | Self::Following { entity, .. }
            | Self::Muted { entity }
            | Self::Blocked { entity, .. } => entity,
        }
    }

    pub fn into_entity(self) -> Entity {
        match self {
            Self::Follower { entity }
            | Self::Following { entity, .. }
            | Self::Muted { entity }
            | Self::Blocked { entity, .. } => entity,
        }
    }

    pub fn related_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Following { followed_at, .. } => *followed_at,
            Self::Blocked { blocked_at, .. } => *blocked_at,
            Self::Follower { .. } | Self::Muted { .. } => None,
        }
    }

    pub fn did(&self) -> &str {
        &self.entity().did
    }
}

/// Profile-reported totals next to what the paginated listings returned on
/// the same day. The gap between the two is the hidden population.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountObservation {
    pub collection_date: NaiveDate,
    pub profile_followers: i64,
    pub api_followers: i64,
    pub profile_following: i64,
    pub api_following: i64,
    pub muted_count: i64,
    pub blocked_count: i64,
}

impl CountObservation {
    pub fn new(
        collection_date: NaiveDate,
        profile_followers: i64,
        api_followers: i64,
        muted_count: i64,
        blocked_count: i64,
    ) -> Self {
        Self {
            collection_date,
            profile_followers,
            api_followers,
            profile_following: 0,
            api_following: 0,
            muted_count,
            blocked_count,
        }
    }

    pub fn with_following(mut self, profile_following: i64, api_following: i64) -> Self {
        self.profile_following = profile_following;
        self.api_following = api_following;
        self
    }

    pub fn hidden_followers(&self) -> i64 {
        self.profile_followers - self.api_followers
    }

    pub fn hidden_following(&self) -> i64 {
        self.profile_following - self.api_following
    }

    /// Hidden followers not explained by our own mute and block lists.
    pub fn suspected_hidden_non_mute_block(&self) -> i64 {
        (self.hidden_followers() - self.muted_count - self.blocked_count).max(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Joined,
    Departed,
}

impl ChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Joined => "joined",
            Self::Departed => "departed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "joined" => Some(Self::Joined),
            "departed" => Some(Self::Departed),
            _ => None,
        }
    }
}

/// How much trust a committed change event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    /// The oracle confirmed the relation is gone.
    Verified,
    /// The oracle failed or timed out; recorded anyway.
    FailOpen,
    /// No verification applies (joins, or no oracle configured).
    #[default]
    Unchecked,
}

impl VerificationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Verified => "verified",
            Self::FailOpen => "fail_open",
            Self::Unchecked => "unchecked",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "verified" => Some(Self::Verified),
            "fail_open" => Some(Self::FailOpen),
            "unchecked" => Some(Self::Unchecked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub change_date: NaiveDate,
    pub change_type: ChangeType,
    pub did: Did,
    pub handle: String,
    pub verification: VerificationStatus,
}

impl ChangeEvent {
    pub fn joined(change_date: NaiveDate, entity: &Entity) -> Self {
        Self {
            change_date,
            change_type: ChangeType::Joined,
            did: entity.did.clone(),
            handle: entity.handle.clone(),
            verification: VerificationStatus::Unchecked,
        }
    }

    pub fn departed(
        change_date: NaiveDate,
        entity: &Entity,
        verification: VerificationStatus,
    ) -> Self {
        Self {
            change_date,
            change_type: ChangeType::Departed,
            did: entity.did.clone(),
            handle: entity.handle.clone(),
            verification,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyMetric {
    pub metric_date: NaiveDate,
    pub follower_count: i64,
    pub following_count: i64,
    pub departed_count: i64,
    pub joined_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Likes,
    Reposts,
    Replies,
    Quotes,
    Bookmarks,
    IndirectLikes,
    IndirectReposts,
    IndirectReplies,
    IndirectBookmarks,
}

impl MetricKind {
    pub const ALL: [MetricKind; 9] = [
        Self::Likes,
        Self::Reposts,
        Self::Replies,
        Self::Quotes,
        Self::Bookmarks,
        Self::IndirectLikes,
        Self::IndirectReposts,
        Self::IndirectReplies,
        Self::IndirectBookmarks,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Likes => "likes",
            Self::Reposts => "reposts",
            Self::Replies => "replies",
            Self::Quotes => "quotes",
            Self::Bookmarks => "bookmarks",
            Self::IndirectLikes => "indirect_likes",
            Self::IndirectReposts => "indirect_reposts",
            Self::IndirectReplies => "indirect_replies",
            Self::IndirectBookmarks => "indirect_bookmarks",
        }
    }
}

/// Cumulative engagement totals for one post at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EngagementCounts {
    pub likes: i64,
    pub reposts: i64,
    pub replies: i64,
    pub quotes: i64,
    pub bookmarks: i64,
    pub indirect_likes: i64,
    pub indirect_reposts: i64,
    pub indirect_replies: i64,
    pub indirect_bookmarks: i64,
}

impl EngagementCounts {
    pub fn get(&self, kind: MetricKind) -> i64 {
        match kind {
            MetricKind::Likes => self.likes,
            MetricKind::Reposts => self.reposts,
            MetricKind::Replies => self.replies,
            MetricKind::Quotes => self.quotes,
            MetricKind::Bookmarks => self.bookmarks,
            MetricKind::IndirectLikes => self.indirect_likes,
            MetricKind::IndirectReposts => self.indirect_reposts,
            MetricKind::IndirectReplies => self.indirect_replies,
            MetricKind::IndirectBookmarks => self.indirect_bookmarks,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementObservation {
    pub collection_date: NaiveDate,
    pub post_uri: String,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub text: String,
    pub counts: EngagementCounts,
}

/// Engagement attributed to one period. Never negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementDelta {
    pub period_date: NaiveDate,
    pub metric_kind: MetricKind,
    pub amount: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Like,
    Repost,
    Follow,
    Quote,
    Reply,
}

impl InteractionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Like => "like",
            Self::Repost => "repost",
            Self::Follow => "follow",
            Self::Quote => "quote",
            Self::Reply => "reply",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "like" => Some(Self::Like),
            "repost" => Some(Self::Repost),
            "follow" => Some(Self::Follow),
            "quote" => Some(Self::Quote),
            "reply" => Some(Self::Reply),
            _ => None,
        }
    }
}

/// Someone else acting on the tracked account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionEvent {
    pub actor: Entity,
    pub kind: InteractionKind,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingLike {
    pub subject_uri: String,
    #[serde(skip)]
    pub subject_author_did: Option<Did>,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub liked_at: DateTime<Utc>,
}

impl OutgoingLike {
    pub fn new(subject_uri: impl Into<String>, liked_at: DateTime<Utc>) -> Self {
        let subject_uri = subject_uri.into();
        let subject_author_did = author_did_from_uri(&subject_uri).map(str::to_owned);
        Self {
            subject_uri,
            subject_author_did,
            liked_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingRepost {
    pub subject_uri: String,
    #[serde(skip)]
    pub subject_author_did: Option<Did>,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub reposted_at: DateTime<Utc>,
}

impl OutgoingRepost {
    pub fn new(subject_uri: impl Into<String>, reposted_at: DateTime<Utc>) -> Self {
        let subject_uri = subject_uri.into();
        let subject_author_did = author_did_from_uri(&subject_uri).map(str::to_owned);
        Self {
            subject_uri,
            subject_author_did,
            reposted_at,
        }
    }
}

/// A post authored by the tracked account. `is_self_reply` is fixed at
/// ingestion so every query agrees on what counts as a thread continuation;
/// it is never taken from the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingPost {
    pub post_uri: String,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub reply_parent_uri: Option<String>,
    #[serde(skip)]
    pub is_self_reply: bool,
}

impl OutgoingPost {
    pub fn new(
        post_uri: impl Into<String>,
        created_at: DateTime<Utc>,
        reply_parent_uri: Option<String>,
        account_did: &str,
    ) -> Self {
        let reply_parent_uri = reply_parent_uri
            .map(|uri| uri.trim().to_owned())
            .filter(|uri| !uri.is_empty());
        let is_self_reply = reply_parent_uri
            .as_deref()
            .and_then(author_did_from_uri)
            .is_some_and(|author| !account_did.is_empty() && author == account_did);

        Self {
            post_uri: post_uri.into(),
            created_at,
            reply_parent_uri,
            is_self_reply,
        }
    }

    pub fn is_reply(&self) -> bool {
        self.reply_parent_uri.is_some()
    }

    pub fn is_reply_to_others(&self) -> bool {
        self.is_reply() && !self.is_self_reply
    }
}

/// Extracts the repository DID from an `at://<did>/<collection>/<rkey>` URI.
pub fn author_did_from_uri(uri: &str) -> Option<&str> {
    let rest = uri.trim().strip_prefix("at://")?;
    let did = rest.split('/').next()?;
    (!did.is_empty()).then_some(did)
}
