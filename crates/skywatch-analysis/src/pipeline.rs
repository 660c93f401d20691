use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use skywatch_config::{SkywatchConfig, database_path, load_workspace_config, validate_config};
use skywatch_core::{
    ChangeEvent, CountObservation, DailyMetric, EngagementObservation, Entity,
    InteractionEvent, OutgoingLike, OutgoingPost, OutgoingRepost, RelationMember, RelationType,
};
use skywatch_store::{
    CollectionRun, RecordOutcome, RunLogEntry, RunStatus, SqliteStore,
};

use crate::detector::{ChangeDetector, ChangeSet, HistoryState};
use crate::verification::{RelationOracle, VerificationFilter, VerificationOutcome};
use crate::AnalysisError;

/// Everything the collector observed for one day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionBatch {
    pub collection_date: NaiveDate,
    #[serde(default)]
    pub followers: Vec<RelationMember>,
    #[serde(default)]
    pub following: Vec<RelationMember>,
    #[serde(default)]
    pub muted: Vec<RelationMember>,
    #[serde(default)]
    pub blocked: Vec<RelationMember>,
    #[serde(default)]
    pub counts: Option<CountObservation>,
    #[serde(default)]
    pub engagement: Vec<EngagementObservation>,
    #[serde(default)]
    pub interactions: Vec<InteractionEvent>,
    #[serde(default)]
    pub outgoing_likes: Vec<OutgoingLike>,
    #[serde(default)]
    pub outgoing_reposts: Vec<OutgoingRepost>,
    #[serde(default)]
    pub outgoing_posts: Vec<OutgoingPost>,
}

impl CollectionBatch {
    pub fn new(collection_date: NaiveDate) -> Self {
        Self {
            collection_date,
            followers: Vec::new(),
            following: Vec::new(),
            muted: Vec::new(),
            blocked: Vec::new(),
            counts: None,
            engagement: Vec::new(),
            interactions: Vec::new(),
            outgoing_likes: Vec::new(),
            outgoing_reposts: Vec::new(),
            outgoing_posts: Vec::new(),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, AnalysisError> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionReport {
    pub collection_date: NaiveDate,
    pub history: HistoryState,
    pub followers: RecordOutcome,
    pub following: RecordOutcome,
    pub skipped: usize,
    pub joined: Vec<Entity>,
    pub departed: Vec<ChangeEvent>,
    pub false_positives: Vec<Entity>,
    pub events_inserted: usize,
    pub metric: DailyMetric,
    pub latest_committed_date: NaiveDate,
    pub run_id: i64,
}

/// Runs one collection day end to end: record, diff, verify, log events,
/// update the day's metric, and commit, all in one store transaction.
///
/// The pipeline owns a tokio runtime for departure verification and drives
/// it with `block_on`. Construct, run and drop it from synchronous code only;
/// doing any of those on an async worker thread panics.
pub struct CollectionPipeline {
    config: SkywatchConfig,
    store: SqliteStore,
    detector: ChangeDetector,
    verifier: Option<VerificationFilter>,
    runtime: tokio::runtime::Runtime,
}

impl CollectionPipeline {
    pub fn new(
        workspace: impl AsRef<Path>,
        oracle: Option<Arc<dyn RelationOracle>>,
    ) -> Result<Self, AnalysisError> {
        let workspace = workspace.as_ref();
        let config = load_workspace_config(workspace)?;
        let store = SqliteStore::open_path(database_path(workspace, &config))?;
        Self::with_store(store, config, oracle)
    }

    pub fn with_store(
        store: SqliteStore,
        config: SkywatchConfig,
        oracle: Option<Arc<dyn RelationOracle>>,
    ) -> Result<Self, AnalysisError> {
        for warning in validate_config(&config) {
            tracing::warn!(code = warning.code, "{}", warning.message);
        }

        let concurrency = config.verification.concurrency.max(1);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(concurrency)
            .enable_all()
            .build()?;

        let verifier = match oracle {
            Some(oracle) if config.verification.enabled => {
                Some(VerificationFilter::from_config(oracle, &config.verification))
            }
            Some(_) => {
                tracing::info!("verification disabled in config; departures will be unchecked");
                None
            }
            None => None,
        };

        Ok(Self {
            config,
            store,
            detector: ChangeDetector::new(),
            verifier,
            runtime,
        })
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn config(&self) -> &SkywatchConfig {
        &self.config
    }

    /// On failure nothing from the batch is kept, and the failure is appended
    /// to the collection log.
    ///
    /// # Panics
    ///
    /// Panics when called from within an async runtime, since verification
    /// blocks on the pipeline's own runtime.
    pub fn run(&self, batch: &CollectionBatch) -> Result<CollectionReport, AnalysisError> {
        let started_at = Utc::now();
        let clock = Instant::now();

        match self.execute(batch, started_at, &clock) {
            Ok(report) => Ok(report),
            Err(err) => {
                tracing::error!(
                    date = %batch.collection_date,
                    error = %err,
                    "collection run failed; rolled back"
                );
                let entry = RunLogEntry {
                    collection_date: batch.collection_date,
                    started_at,
                    duration_ms: elapsed_ms(&clock),
                    status: RunStatus::Failed,
                    followers_collected: batch.followers.len() as i64,
                    following_collected: batch.following.len() as i64,
                    joined_count: 0,
                    departed_count: 0,
                    false_positive_count: 0,
                    fail_open_count: 0,
                    skipped_count: 0,
                    error_message: Some(err.to_string()),
                };
                if let Err(log_err) = self.store.log_failed_run(&entry) {
                    tracing::warn!(error = %log_err, "could not record failed run");
                }
                Err(err)
            }
        }
    }

    fn execute(
        &self,
        batch: &CollectionBatch,
        started_at: chrono::DateTime<Utc>,
        clock: &Instant,
    ) -> Result<CollectionReport, AnalysisError> {
        let date = batch.collection_date;
        let mut run = self.store.begin_run(date)?;

        let followers = run.record_relations(RelationType::Follower, &batch.followers)?;
        let following = run.record_relations(RelationType::Following, &batch.following)?;
        let mut skipped = followers.skipped + following.skipped;
        skipped += run.record_relations(RelationType::Muted, &batch.muted)?.skipped;
        skipped += run.record_relations(RelationType::Blocked, &batch.blocked)?.skipped;
        if let Some(counts) = &batch.counts {
            if counts.collection_date != date {
                tracing::warn!(
                    date = %date,
                    counts_date = %counts.collection_date,
                    "count observation dated differently from its batch; storing under the batch date"
                );
            }
            run.record_counts(counts)?;
        }
        skipped += run.record_engagement(&batch.engagement)?.skipped;
        skipped += run.record_interactions(&batch.interactions)?.skipped;
        let outgoing = OutgoingActivity::attribute(batch, &self.config.tracker.account_did);
        skipped += run.record_outgoing_likes(&outgoing.likes)?.skipped;
        skipped += run.record_outgoing_reposts(&outgoing.reposts)?.skipped;
        skipped += run.record_outgoing_posts(&outgoing.posts)?.skipped;

        let changes = self.detector.compute_changes(&run.reader(), date)?;
        let verification = self.verify(&changes)?;
        restore_false_positives(&mut run, &changes, &verification.false_positives)?;

        let mut events: Vec<ChangeEvent> = changes
            .joined
            .iter()
            .map(|entity| ChangeEvent::joined(date, entity))
            .collect();
        let departed = verification.departure_events(date);
        events.extend(departed.iter().cloned());
        let events_inserted = run.insert_change_events(&events)?;
        let metric = run.upsert_daily_metric()?;

        let entry = RunLogEntry {
            collection_date: date,
            started_at,
            duration_ms: elapsed_ms(clock),
            status: RunStatus::Committed,
            followers_collected: followers.inserted as i64,
            following_collected: following.inserted as i64,
            joined_count: changes.joined.len() as i64,
            departed_count: departed.len() as i64,
            false_positive_count: verification.false_positives.len() as i64,
            fail_open_count: verification.fail_open.len() as i64,
            skipped_count: skipped as i64,
            error_message: None,
        };
        let run_id = run.log_run(&entry)?;
        let latest_committed_date = run.commit()?;

        tracing::info!(
            date = %date,
            followers = followers.inserted,
            joined = changes.joined.len(),
            departed = departed.len(),
            false_positives = verification.false_positives.len(),
            fail_open = verification.fail_open.len(),
            skipped,
            "collection run recorded"
        );

        Ok(CollectionReport {
            collection_date: date,
            history: changes.history,
            followers,
            following,
            skipped,
            joined: changes.joined,
            departed,
            false_positives: verification.false_positives,
            events_inserted,
            metric,
            latest_committed_date,
            run_id,
        })
    }

    fn verify(&self, changes: &ChangeSet) -> Result<VerificationOutcome, AnalysisError> {
        let candidates = changes.departed_candidates.clone();
        let account_did = self.config.tracker.account_did.as_str();

        match &self.verifier {
            Some(verifier) if !account_did.is_empty() => self
                .runtime
                .block_on(verifier.confirm(candidates, account_did)),
            Some(_) => {
                tracing::warn!("tracker.account_did is empty; skipping departure verification");
                Ok(VerificationOutcome::unchecked(candidates))
            }
            None => Ok(VerificationOutcome::unchecked(candidates)),
        }
    }
}

/// Outgoing records with their derived fields recomputed from the URIs and
/// the tracked account, whatever the collector sent.
struct OutgoingActivity {
    likes: Vec<OutgoingLike>,
    reposts: Vec<OutgoingRepost>,
    posts: Vec<OutgoingPost>,
}

impl OutgoingActivity {
    fn attribute(batch: &CollectionBatch, account_did: &str) -> Self {
        if account_did.is_empty() && !batch.outgoing_posts.is_empty() {
            tracing::warn!(
                date = %batch.collection_date,
                "tracker.account_did is empty; no outgoing reply will count as a self-reply"
            );
        }

        Self {
            likes: batch
                .outgoing_likes
                .iter()
                .map(|like| OutgoingLike::new(like.subject_uri.clone(), like.liked_at))
                .collect(),
            reposts: batch
                .outgoing_reposts
                .iter()
                .map(|repost| OutgoingRepost::new(repost.subject_uri.clone(), repost.reposted_at))
                .collect(),
            posts: batch
                .outgoing_posts
                .iter()
                .map(|post| {
                    OutgoingPost::new(
                        post.post_uri.clone(),
                        post.created_at,
                        post.reply_parent_uri.clone(),
                        account_did,
                    )
                })
                .collect(),
        }
    }
}

/// Puts false-positive departures back into the day's follower snapshot,
/// copied from the baseline day, so tomorrow's diff does not see them rejoin.
fn restore_false_positives(
    run: &mut CollectionRun,
    changes: &ChangeSet,
    false_positives: &[Entity],
) -> Result<(), AnalysisError> {
    let HistoryState::HasHistory { previous_date } = changes.history else {
        return Ok(());
    };
    if false_positives.is_empty() {
        return Ok(());
    }

    let wanted: HashSet<&str> = false_positives
        .iter()
        .map(|entity| entity.did.as_str())
        .collect();
    let restored: Vec<RelationMember> = run
        .reader()
        .members_on(RelationType::Follower, previous_date)?
        .into_iter()
        .filter(|member| wanted.contains(member.did()))
        .collect();

    let outcome = run.record_relations(RelationType::Follower, &restored)?;
    tracing::debug!(
        date = %changes.date,
        restored = outcome.inserted,
        "false positives restored into follower snapshot"
    );
    Ok(())
}

fn elapsed_ms(clock: &Instant) -> i64 {
    i64::try_from(clock.elapsed().as_millis()).unwrap_or(i64::MAX)
}
