use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use skywatch_config::{SkywatchConfig, database_path, load_workspace_config};
use skywatch_core::{
    BalanceClass, ChangeClassification, ChangeEvent, ChangeType, CountObservation, DailyMetric,
    EngagementCounts, EngagementObservation, Entity, InteractionTally, RelationType,
    ReportWindow, balance_ratio, classify_balance, interaction_score, post_score,
};
use skywatch_store::{CollectionRunRecord, ReadView, SqliteStore};

use crate::AnalysisError;
use crate::classification::DayClassifier;
use crate::engagement::{
    EngagementTally, EngagementTimelinePoint, received_deltas, tally, timeline,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopInteractor {
    pub actor: Entity,
    pub tally: InteractionTally,
    pub score: u64,
    pub last_interaction_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EngagementSide {
    pub likes: u64,
    pub reposts: u64,
    pub replies: u64,
    pub total: u64,
}

impl EngagementSide {
    fn new(likes: u64, reposts: u64, replies: u64) -> Self {
        Self {
            likes,
            reposts,
            replies,
            total: likes + reposts + replies,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngagementBalance {
    pub given: EngagementSide,
    pub received: EngagementSide,
    pub ratio: f64,
    pub classification: BalanceClass,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopPost {
    pub post_uri: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub counts: EngagementCounts,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GraphStats {
    pub follower_count: usize,
    pub following_count: usize,
    pub departed_count: usize,
    pub joined_count: usize,
    pub mutual_count: usize,
    pub non_mutual_count: usize,
    pub followers_only_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeHistoryEntry {
    #[serde(flatten)]
    pub event: ChangeEvent,
    pub classification: Option<ChangeClassification>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HiddenAnalytics {
    pub current: Option<CountObservation>,
    pub history: Vec<CountObservation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HiddenCategories {
    pub muted: Vec<Entity>,
    pub blocked: Vec<Entity>,
}

/// Per-post averages over the latest engagement collection, plus follower
/// growth across the last [`GROWTH_SAMPLE`] count observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvancedMetrics {
    pub collection_date: NaiveDate,
    pub post_count: usize,
    pub avg_likes: f64,
    pub avg_reposts: f64,
    pub avg_replies: f64,
    pub max_likes: i64,
    pub total_likes: i64,
    pub total_reposts: i64,
    pub total_replies: i64,
    /// `avg_likes + avg_reposts * 2 + avg_replies`.
    pub engagement_rate: f64,
    /// Percent change in listed followers from the oldest to the newest sample.
    pub follower_growth_pct: f64,
    pub follower_history: Vec<CountObservation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingDay {
    pub date: NaiveDate,
    pub posts: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetGrowthPoint {
    pub date: NaiveDate,
    pub follower_count: i64,
    pub joined: i64,
    pub departed: i64,
    pub net_followers: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StatsSummary {
    pub days_tracked: usize,
    /// Last tracked day's follower count minus the first's.
    pub follower_change: i64,
    pub avg_followers: i64,
    pub total_posts: usize,
    pub total_engagement: u64,
    pub avg_engagement_per_post: f64,
}

/// The headline reports over the configured window, read from one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Overview {
    pub anchor: Option<NaiveDate>,
    pub window_days: u32,
    pub stats: GraphStats,
    pub summary: StatsSummary,
    pub engagement_balance: EngagementBalance,
    pub top_interactors: Vec<TopInteractor>,
    pub top_posts: Vec<TopPost>,
}

pub const GROWTH_SAMPLE: u32 = 30;

/// Read-only reports over committed state. Each call opens its own
/// [`ReadView`], so a report never mixes two collection runs.
pub struct GraphAnalyzer {
    workspace: PathBuf,
    config: SkywatchConfig,
    store: SqliteStore,
}

impl GraphAnalyzer {
    pub fn new(workspace: impl AsRef<Path>) -> Result<Self, AnalysisError> {
        let workspace = workspace.as_ref().to_path_buf();
        let config = load_workspace_config(&workspace)?;
        let store = SqliteStore::open_path(database_path(&workspace, &config))?;
        Ok(Self {
            workspace,
            config,
            store,
        })
    }

    pub fn with_store(
        workspace: impl AsRef<Path>,
        config: SkywatchConfig,
        store: SqliteStore,
    ) -> Self {
        Self {
            workspace: workspace.as_ref().to_path_buf(),
            config,
            store,
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn config(&self) -> &SkywatchConfig {
        &self.config
    }

    /// Stats, summary, balance and the top lists over `reporting.window_days`,
    /// with lists capped at `reporting.top_limit`.
    pub fn overview(&self) -> Result<Overview, AnalysisError> {
        let days = self.config.reporting.window_days;
        let limit = usize::try_from(self.config.reporting.top_limit).unwrap_or(usize::MAX);
        let view = self.store.read_view()?;

        Ok(Overview {
            anchor: view.anchor(),
            window_days: days,
            stats: stats_in(&view, days)?,
            summary: stats_summary_in(&view, days)?,
            engagement_balance: engagement_balance_in(&view, days)?,
            top_interactors: top_interactors_in(&view, days, limit)?,
            top_posts: top_posts_in(&view, days, limit)?,
        })
    }

    pub fn mutuals(&self) -> Result<Vec<Entity>, AnalysisError> {
        let view = self.store.read_view()?;
        Ok(RelationSets::load(&view)?.mutuals())
    }

    pub fn non_mutual_following(&self) -> Result<Vec<Entity>, AnalysisError> {
        let view = self.store.read_view()?;
        Ok(RelationSets::load(&view)?.non_mutual_following())
    }

    pub fn followers_only(&self) -> Result<Vec<Entity>, AnalysisError> {
        let view = self.store.read_view()?;
        Ok(RelationSets::load(&view)?.followers_only())
    }

    /// Actors ranked by weighted interaction score, then by most recent
    /// interaction, then by did.
    pub fn top_interactors(
        &self,
        days: u32,
        limit: usize,
    ) -> Result<Vec<TopInteractor>, AnalysisError> {
        top_interactors_in(&self.store.read_view()?, days, limit)
    }

    /// Given: likes, reposts and replies to other people's posts. Received:
    /// reconciled likes, reposts and replies on the account's posts.
    pub fn engagement_balance(&self, days: u32) -> Result<EngagementBalance, AnalysisError> {
        engagement_balance_in(&self.store.read_view()?, days)
    }

    /// Posts created inside the window, ranked by their latest counters.
    pub fn top_posts(&self, days: u32, limit: usize) -> Result<Vec<TopPost>, AnalysisError> {
        top_posts_in(&self.store.read_view()?, days, limit)
    }

    pub fn stats(&self, days: u32) -> Result<GraphStats, AnalysisError> {
        stats_in(&self.store.read_view()?, days)
    }

    pub fn stats_summary(&self, days: u32) -> Result<StatsSummary, AnalysisError> {
        stats_summary_in(&self.store.read_view()?, days)
    }

    /// Newest first; each event carries its day's count-based classification.
    pub fn change_history(&self, days: u32) -> Result<Vec<ChangeHistoryEntry>, AnalysisError> {
        let view = self.store.read_view()?;
        let Some(window) = report_window(&view, days) else {
            return Ok(Vec::new());
        };
        let reader = view.reader();
        let mut classifier = DayClassifier::new(&reader);

        let mut history = Vec::new();
        for event in reader.change_events_in(&window)? {
            let classification = classifier.classify(event.change_date)?;
            history.push(ChangeHistoryEntry {
                event,
                classification,
            });
        }
        Ok(history)
    }

    pub fn hidden_analytics(&self, days: u32) -> Result<HiddenAnalytics, AnalysisError> {
        let view = self.store.read_view()?;
        let Some(window) = report_window(&view, days) else {
            return Ok(HiddenAnalytics::default());
        };

        let history = view.reader().count_observations_in(&window)?;
        let current = match history.last() {
            Some(last) => Some(*last),
            None => view
                .reader()
                .previous_count_observation(window.anchor.succ_opt().unwrap_or(window.anchor))?,
        };
        Ok(HiddenAnalytics { current, history })
    }

    pub fn hidden_categories(&self) -> Result<HiddenCategories, AnalysisError> {
        let view = self.store.read_view()?;
        let reader = view.reader();
        let muted = reader
            .latest(RelationType::Muted)?
            .map(|(_, members)| members)
            .unwrap_or_default();
        let blocked = reader
            .latest(RelationType::Blocked)?
            .map(|(_, members)| members)
            .unwrap_or_default();

        Ok(HiddenCategories {
            muted: sorted_for_display(muted),
            blocked: sorted_for_display(blocked),
        })
    }

    /// Chronological.
    pub fn follower_growth(&self, days: u32) -> Result<Vec<DailyMetric>, AnalysisError> {
        let view = self.store.read_view()?;
        let Some(window) = report_window(&view, days) else {
            return Ok(Vec::new());
        };
        Ok(view.reader().daily_metrics_in(&window)?)
    }

    /// One point per tracked day, chronological.
    pub fn net_growth(&self, days: u32) -> Result<Vec<NetGrowthPoint>, AnalysisError> {
        let view = self.store.read_view()?;
        let Some(window) = report_window(&view, days) else {
            return Ok(Vec::new());
        };

        Ok(view
            .reader()
            .daily_metrics_in(&window)?
            .into_iter()
            .map(|metric| NetGrowthPoint {
                date: metric.metric_date,
                follower_count: metric.follower_count,
                joined: metric.joined_count,
                departed: metric.departed_count,
                net_followers: metric.joined_count - metric.departed_count,
            })
            .collect())
    }

    pub fn engagement_timeline(
        &self,
        days: u32,
    ) -> Result<Vec<EngagementTimelinePoint>, AnalysisError> {
        let view = self.store.read_view()?;
        let Some(window) = report_window(&view, days) else {
            return Ok(Vec::new());
        };
        let observations = view.reader().engagement_observations(window.anchor)?;
        Ok(timeline(&received_deltas(&observations, &window)))
    }

    /// Reconciled engagement received inside the window, by kind.
    pub fn engagement_breakdown(&self, days: u32) -> Result<EngagementTally, AnalysisError> {
        let view = self.store.read_view()?;
        let Some(window) = report_window(&view, days) else {
            return Ok(EngagementTally::default());
        };
        let observations = view.reader().engagement_observations(window.anchor)?;
        Ok(tally(&received_deltas(&observations, &window)))
    }

    /// Distinct posts per creation day, chronological, days without posts omitted.
    pub fn posting_frequency(&self, days: u32) -> Result<Vec<PostingDay>, AnalysisError> {
        let view = self.store.read_view()?;
        let Some(window) = report_window(&view, days) else {
            return Ok(Vec::new());
        };

        let mut posts_by_day: BTreeMap<NaiveDate, HashSet<String>> = BTreeMap::new();
        for observation in view.reader().engagement_observations(window.anchor)? {
            if window.contains_timestamp(observation.created_at) {
                posts_by_day
                    .entry(observation.created_at.date_naive())
                    .or_default()
                    .insert(observation.post_uri);
            }
        }

        Ok(posts_by_day
            .into_iter()
            .map(|(date, posts)| PostingDay {
                date,
                posts: posts.len(),
            })
            .collect())
    }

    /// `None` until some engagement has been collected.
    pub fn advanced_metrics(&self) -> Result<Option<AdvancedMetrics>, AnalysisError> {
        let view = self.store.read_view()?;
        let Some(anchor) = view.anchor() else {
            return Ok(None);
        };
        let reader = view.reader();
        let observations = reader.engagement_observations(anchor)?;
        let Some(latest) = observations.iter().map(|observation| observation.collection_date).max()
        else {
            return Ok(None);
        };

        let current: Vec<&EngagementCounts> = observations
            .iter()
            .filter(|observation| observation.collection_date == latest)
            .map(|observation| &observation.counts)
            .collect();
        let post_count = current.len();
        let total_likes: i64 = current.iter().map(|counts| counts.likes).sum();
        let total_reposts: i64 = current.iter().map(|counts| counts.reposts).sum();
        let total_replies: i64 = current.iter().map(|counts| counts.replies).sum();
        let max_likes = current.iter().map(|counts| counts.likes).max().unwrap_or(0);

        let per_post = |total: i64| total as f64 / post_count as f64;
        let (avg_likes, avg_reposts, avg_replies) = (
            per_post(total_likes),
            per_post(total_reposts),
            per_post(total_replies),
        );

        let follower_history = reader.recent_count_observations(anchor, GROWTH_SAMPLE)?;
        let follower_growth_pct = match (follower_history.first(), follower_history.last()) {
            (Some(oldest), Some(newest))
                if follower_history.len() >= 2 && oldest.api_followers > 0 =>
            {
                (newest.api_followers - oldest.api_followers) as f64
                    / oldest.api_followers as f64
                    * 100.0
            }
            _ => 0.0,
        };

        Ok(Some(AdvancedMetrics {
            collection_date: latest,
            post_count,
            avg_likes: round_to(avg_likes, 2),
            avg_reposts: round_to(avg_reposts, 2),
            avg_replies: round_to(avg_replies, 2),
            max_likes,
            total_likes,
            total_reposts,
            total_replies,
            engagement_rate: round_to(avg_likes + avg_reposts * 2.0 + avg_replies, 2),
            follower_growth_pct: round_to(follower_growth_pct, 2),
            follower_history,
        }))
    }

    pub fn recent_collection_runs(
        &self,
        limit: u32,
    ) -> Result<Vec<CollectionRunRecord>, AnalysisError> {
        let view = self.store.read_view()?;
        Ok(view.reader().recent_runs(limit)?)
    }
}

fn top_interactors_in(
    view: &ReadView,
    days: u32,
    limit: usize,
) -> Result<Vec<TopInteractor>, AnalysisError> {
    let Some(window) = report_window(view, days) else {
        return Ok(Vec::new());
    };

    let mut by_actor: HashMap<String, TopInteractor> = HashMap::new();
    for event in view.reader().interactions_in(&window)? {
        let entry = by_actor
            .entry(event.actor.did.clone())
            .or_insert_with(|| TopInteractor {
                actor: event.actor.clone(),
                tally: InteractionTally::default(),
                score: 0,
                last_interaction_at: event.occurred_at,
            });
        entry.tally.add(event.kind);
        if event.occurred_at >= entry.last_interaction_at {
            entry.last_interaction_at = event.occurred_at;
            entry.actor = event.actor;
        }
    }

    let mut ranked: Vec<TopInteractor> = by_actor
        .into_values()
        .map(|mut interactor| {
            interactor.score = interaction_score(&interactor.tally);
            interactor
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| b.last_interaction_at.cmp(&a.last_interaction_at))
            .then_with(|| a.actor.did.cmp(&b.actor.did))
    });
    ranked.truncate(limit);
    Ok(ranked)
}

fn engagement_balance_in(view: &ReadView, days: u32) -> Result<EngagementBalance, AnalysisError> {
    let Some(window) = report_window(view, days) else {
        return Ok(balance(EngagementSide::default(), EngagementSide::default()));
    };
    let reader = view.reader();

    let likes_given = reader.outgoing_likes_in(&window)?.len() as u64;
    let reposts_given = reader.outgoing_reposts_in(&window)?.len() as u64;
    let replies_given = reader
        .outgoing_posts_in(&window)?
        .iter()
        .filter(|post| post.is_reply_to_others())
        .count() as u64;
    let given = EngagementSide::new(likes_given, reposts_given, replies_given);

    let observations = reader.engagement_observations(window.anchor)?;
    let received_tally = tally(&received_deltas(&observations, &window));
    let received = EngagementSide::new(
        received_tally.likes,
        received_tally.reposts,
        received_tally.replies,
    );

    let result = balance(given, received);
    tracing::debug!(
        days,
        given = given.total,
        received = received.total,
        ratio = result.ratio,
        class = result.classification.as_str(),
        "engagement balance computed"
    );
    Ok(result)
}

fn top_posts_in(view: &ReadView, days: u32, limit: usize) -> Result<Vec<TopPost>, AnalysisError> {
    let Some(window) = report_window(view, days) else {
        return Ok(Vec::new());
    };

    let observations = view.reader().engagement_observations(window.anchor)?;
    let mut latest: BTreeMap<&str, &EngagementObservation> = BTreeMap::new();
    for observation in observations
        .iter()
        .filter(|observation| window.contains_timestamp(observation.created_at))
    {
        // rows arrive ordered by collection date within each post
        latest.insert(observation.post_uri.as_str(), observation);
    }

    let mut ranked: Vec<TopPost> = latest
        .into_values()
        .map(|observation| TopPost {
            post_uri: observation.post_uri.clone(),
            text: observation.text.clone(),
            created_at: observation.created_at,
            counts: observation.counts,
            score: post_score(&observation.counts),
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.created_at.cmp(&a.created_at))
            .then_with(|| a.post_uri.cmp(&b.post_uri))
    });
    ranked.truncate(limit);
    Ok(ranked)
}

fn stats_in(view: &ReadView, days: u32) -> Result<GraphStats, AnalysisError> {
    let sets = RelationSets::load(view)?;

    let mut stats = GraphStats {
        follower_count: sets.followers.len(),
        following_count: sets.following.len(),
        mutual_count: sets.mutuals().len(),
        non_mutual_count: sets.non_mutual_following().len(),
        followers_only_count: sets.followers_only().len(),
        ..GraphStats::default()
    };

    if let Some(window) = report_window(view, days) {
        for event in view.reader().change_events_in(&window)? {
            match event.change_type {
                ChangeType::Joined => stats.joined_count += 1,
                ChangeType::Departed => stats.departed_count += 1,
            }
        }
    }

    Ok(stats)
}

fn stats_summary_in(view: &ReadView, days: u32) -> Result<StatsSummary, AnalysisError> {
    let Some(window) = report_window(view, days) else {
        return Ok(StatsSummary::default());
    };
    let reader = view.reader();

    let metrics = reader.daily_metrics_in(&window)?;
    let follower_change = match (metrics.first(), metrics.last()) {
        (Some(first), Some(last)) => last.follower_count - first.follower_count,
        _ => 0,
    };
    let avg_followers = if metrics.is_empty() {
        0
    } else {
        metrics.iter().map(|metric| metric.follower_count).sum::<i64>() / metrics.len() as i64
    };

    let observations = reader.engagement_observations(window.anchor)?;
    let total_posts = observations
        .iter()
        .filter(|observation| window.contains_date(observation.collection_date))
        .map(|observation| observation.post_uri.as_str())
        .collect::<HashSet<_>>()
        .len();
    let total_engagement = tally(&received_deltas(&observations, &window)).total();
    let avg_engagement_per_post = if total_posts == 0 {
        0.0
    } else {
        round_to(total_engagement as f64 / total_posts as f64, 1)
    };

    Ok(StatsSummary {
        days_tracked: metrics.len(),
        follower_change,
        avg_followers,
        total_posts,
        total_engagement,
        avg_engagement_per_post,
    })
}

struct RelationSets {
    followers: Vec<Entity>,
    following: Vec<Entity>,
}

impl RelationSets {
    fn load(view: &ReadView) -> Result<Self, AnalysisError> {
        let reader = view.reader();
        let followers = reader
            .latest(RelationType::Follower)?
            .map(|(_, members)| members)
            .unwrap_or_default();
        let following = reader
            .latest(RelationType::Following)?
            .map(|(_, members)| members)
            .unwrap_or_default();
        Ok(Self {
            followers,
            following,
        })
    }

    fn mutuals(&self) -> Vec<Entity> {
        let following = dids(&self.following);
        sorted_for_display(
            self.followers
                .iter()
                .filter(|entity| following.contains(entity.did.as_str()))
                .cloned()
                .collect(),
        )
    }

    fn non_mutual_following(&self) -> Vec<Entity> {
        let followers = dids(&self.followers);
        sorted_for_display(
            self.following
                .iter()
                .filter(|entity| !followers.contains(entity.did.as_str()))
                .cloned()
                .collect(),
        )
    }

    fn followers_only(&self) -> Vec<Entity> {
        let following = dids(&self.following);
        sorted_for_display(
            self.followers
                .iter()
                .filter(|entity| !following.contains(entity.did.as_str()))
                .cloned()
                .collect(),
        )
    }
}

fn dids(entities: &[Entity]) -> HashSet<&str> {
    entities.iter().map(|entity| entity.did.as_str()).collect()
}

fn sorted_for_display(mut entities: Vec<Entity>) -> Vec<Entity> {
    entities.sort_by(|a, b| {
        a.handle
            .to_lowercase()
            .cmp(&b.handle.to_lowercase())
            .then_with(|| a.did.cmp(&b.did))
    });
    entities
}

fn report_window(view: &ReadView, days: u32) -> Option<ReportWindow> {
    view.anchor().map(|anchor| ReportWindow::new(anchor, days))
}

fn round_to(value: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}

fn balance(given: EngagementSide, received: EngagementSide) -> EngagementBalance {
    let ratio = balance_ratio(given.total, received.total);
    EngagementBalance {
        given,
        received,
        ratio,
        classification: classify_balance(ratio),
    }
}
