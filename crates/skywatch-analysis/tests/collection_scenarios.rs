use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use skywatch_analysis::{
    CollectionBatch, CollectionPipeline, GraphAnalyzer, HistoryState, OracleError,
    RelationOracle, classify_day,
};
use skywatch_config::{SkywatchConfig, validate_config};
use skywatch_core::{
    ChangeClassification, ChangeType, CountObservation, Entity, InteractionKind, RelationMember,
    RelationType, ReportWindow, VerificationStatus,
};
use skywatch_store::{RunStatus, SqliteStore};
use tempfile::{TempDir, tempdir};

#[derive(Debug, Clone, Copy)]
enum Script {
    StillRelated,
    NotRelated,
    Error,
    Hang,
    Panic,
}

struct ScriptedOracle {
    answers: HashMap<String, Script>,
    calls: AtomicUsize,
}

impl ScriptedOracle {
    fn new(answers: &[(&str, Script)]) -> Self {
        Self {
            answers: answers
                .iter()
                .map(|(did, script)| ((*did).to_owned(), *script))
                .collect(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl RelationOracle for ScriptedOracle {
    async fn still_related(
        &self,
        candidate_did: &str,
        authoritative_did: &str,
    ) -> Result<bool, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(authoritative_did, "did:plc:me");

        match self.answers.get(candidate_did).copied() {
            Some(Script::StillRelated) => Ok(true),
            Some(Script::NotRelated) => Ok(false),
            Some(Script::Error) => Err(OracleError::Unavailable("502 bad gateway".to_owned())),
            Some(Script::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(true)
            }
            Some(Script::Panic) => panic!("scripted oracle failure"),
            None => Err(OracleError::InvalidResponse(format!("unscripted {candidate_did}"))),
        }
    }
}

struct Harness {
    temp: TempDir,
    store: SqliteStore,
    config: SkywatchConfig,
}

impl Harness {
    fn new() -> Self {
        let temp = tempdir().expect("tempdir");
        let store = SqliteStore::open(temp.path()).expect("open store");
        let mut config = SkywatchConfig::default();
        config.tracker.account_did = "did:plc:me".to_owned();
        config.verification.timeout_ms = 50;
        config.verification.concurrency = 4;
        Self {
            temp,
            store,
            config,
        }
    }

    fn pipeline(&self, oracle: Arc<ScriptedOracle>) -> CollectionPipeline {
        let oracle: Arc<dyn RelationOracle> = oracle;
        CollectionPipeline::with_store(self.store.clone(), self.config.clone(), Some(oracle))
            .expect("pipeline")
    }

    fn unverified_pipeline(&self) -> CollectionPipeline {
        CollectionPipeline::with_store(self.store.clone(), self.config.clone(), None)
            .expect("pipeline")
    }

    fn analyzer(&self) -> GraphAnalyzer {
        GraphAnalyzer::with_store(self.temp.path(), self.config.clone(), self.store.clone())
    }
}

fn day(n: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, n).expect("valid date")
}

fn members(relation: RelationType, dids: &[&str]) -> Vec<RelationMember> {
    dids.iter()
        .map(|did| RelationMember::new(relation, Entity::new(*did, format!("{did}.test")), None))
        .collect()
}

fn follower_batch(date: NaiveDate, dids: &[&str]) -> CollectionBatch {
    let mut batch = CollectionBatch::new(date);
    batch.followers = members(RelationType::Follower, dids);
    batch
}

fn snapshot_dids(store: &SqliteStore, date: NaiveDate) -> Vec<String> {
    let view = store.read_view().expect("view");
    view.reader()
        .members_on(RelationType::Follower, date)
        .expect("members")
        .into_iter()
        .map(|member| member.did().to_owned())
        .collect()
}

#[test]
fn first_run_is_a_baseline_with_zero_changes() {
    let harness = Harness::new();
    let oracle = Arc::new(ScriptedOracle::new(&[]));

    let report = harness
        .pipeline(oracle.clone())
        .run(&follower_batch(day(1), &["A", "B", "C"]))
        .expect("first run");

    assert_eq!(report.history, HistoryState::NoHistory);
    assert!(report.joined.is_empty());
    assert!(report.departed.is_empty());
    assert_eq!(report.metric.follower_count, 3);
    assert_eq!(report.metric.joined_count, 0);
    assert_eq!(report.metric.departed_count, 0);
    assert_eq!(report.latest_committed_date, day(1));
    assert_eq!(oracle.calls.load(Ordering::SeqCst), 0);

    let growth = harness.analyzer().follower_growth(30).expect("growth");
    assert_eq!(growth.len(), 1);
    assert_eq!(growth[0].metric_date, day(1));
}

#[test]
fn confirmed_departure_is_logged_and_classified() {
    let harness = Harness::new();
    let oracle = Arc::new(ScriptedOracle::new(&[("B", Script::NotRelated)]));
    let pipeline = harness.pipeline(oracle);

    let mut first = follower_batch(day(1), &["A", "B", "C"]);
    first.counts = Some(CountObservation::new(day(1), 3, 3, 0, 0));
    pipeline.run(&first).expect("day 1");

    let mut second = follower_batch(day(2), &["A", "C"]);
    second.counts = Some(CountObservation::new(day(2), 2, 2, 0, 0));
    let report = pipeline.run(&second).expect("day 2");

    assert_eq!(
        report.history,
        HistoryState::HasHistory {
            previous_date: day(1)
        }
    );
    assert_eq!(report.departed.len(), 1);
    assert_eq!(report.departed[0].did, "B");
    assert_eq!(report.departed[0].verification, VerificationStatus::Verified);

    let analyzer = harness.analyzer();
    let history = analyzer.change_history(1).expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].event.change_type, ChangeType::Departed);
    assert_eq!(history[0].event.did, "B");
    assert_eq!(
        history[0].classification,
        Some(ChangeClassification::RealUnfollow)
    );

    let stats = analyzer.stats(1).expect("stats");
    assert_eq!(stats.follower_count, 2);
    assert_eq!(stats.departed_count, 1);
    assert_eq!(stats.joined_count, 0);
}

#[test]
fn pagination_drift_produces_no_events_and_no_phantom_rejoin() {
    let harness = Harness::new();
    let oracle = Arc::new(ScriptedOracle::new(&[("B", Script::StillRelated)]));
    let pipeline = harness.pipeline(oracle.clone());

    pipeline
        .run(&follower_batch(day(1), &["A", "B", "C"]))
        .expect("day 1");
    let report = pipeline
        .run(&follower_batch(day(2), &["A", "C"]))
        .expect("day 2");

    assert!(report.departed.is_empty());
    assert_eq!(report.events_inserted, 0);
    assert_eq!(
        report
            .false_positives
            .iter()
            .map(|entity| entity.did.as_str())
            .collect::<Vec<_>>(),
        vec!["B"]
    );
    assert_eq!(report.metric.follower_count, 3);
    assert_eq!(snapshot_dids(&harness.store, day(2)), vec!["A", "B", "C"]);

    let third = pipeline
        .run(&follower_batch(day(3), &["A", "B", "C"]))
        .expect("day 3");
    assert!(third.joined.is_empty());
    assert!(harness.analyzer().change_history(30).expect("history").is_empty());
    assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn replaying_a_day_never_duplicates_events() {
    let harness = Harness::new();
    let oracle = Arc::new(ScriptedOracle::new(&[("B", Script::NotRelated)]));
    let pipeline = harness.pipeline(oracle);

    pipeline
        .run(&follower_batch(day(1), &["A", "B", "C"]))
        .expect("day 1");
    let mut second = follower_batch(day(2), &["A", "C", "D"]);
    second.counts = Some(CountObservation::new(day(2), 3, 3, 0, 0));

    let first_pass = pipeline.run(&second).expect("day 2");
    let replay = pipeline.run(&second).expect("day 2 replay");

    assert_eq!(first_pass.events_inserted, 2);
    assert_eq!(replay.events_inserted, 0);
    assert_eq!(replay.joined, first_pass.joined);
    assert_eq!(replay.departed, first_pass.departed);
    assert_eq!(replay.metric, first_pass.metric);
    assert_eq!(snapshot_dids(&harness.store, day(2)), vec!["A", "C", "D"]);

    let history = harness.analyzer().change_history(30).expect("history");
    assert_eq!(history.len(), 2);

    let runs = harness
        .analyzer()
        .recent_collection_runs(10)
        .expect("runs");
    assert_eq!(runs.len(), 3);
    assert!(runs.iter().all(|run| run.entry.status == RunStatus::Committed));
}

#[test]
fn oracle_timeouts_and_errors_fail_open() {
    let harness = Harness::new();
    let oracle = Arc::new(ScriptedOracle::new(&[
        ("B", Script::Hang),
        ("C", Script::Error),
        ("D", Script::NotRelated),
    ]));
    let pipeline = harness.pipeline(oracle);

    pipeline
        .run(&follower_batch(day(1), &["A", "B", "C", "D"]))
        .expect("day 1");
    let report = pipeline
        .run(&follower_batch(day(2), &["A"]))
        .expect("day 2 completes despite the hung lookup");

    let statuses: Vec<(&str, VerificationStatus)> = report
        .departed
        .iter()
        .map(|event| (event.did.as_str(), event.verification))
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("B", VerificationStatus::FailOpen),
            ("C", VerificationStatus::FailOpen),
            ("D", VerificationStatus::Verified),
        ]
    );

    let runs = harness.analyzer().recent_collection_runs(1).expect("runs");
    assert_eq!(runs[0].entry.fail_open_count, 2);
    assert_eq!(runs[0].entry.departed_count, 3);
}

#[test]
fn failed_run_rolls_back_and_is_logged() {
    let harness = Harness::new();
    let oracle = Arc::new(ScriptedOracle::new(&[("B", Script::Panic)]));
    let pipeline = harness.pipeline(oracle);

    pipeline
        .run(&follower_batch(day(1), &["A", "B"]))
        .expect("day 1");
    let mut second = follower_batch(day(2), &["A", "E"]);
    second.counts = Some(CountObservation::new(day(2), 2, 2, 0, 0));

    assert!(pipeline.run(&second).is_err());

    assert_eq!(
        harness.store.latest_committed_date().expect("pointer"),
        Some(day(1))
    );
    assert!(snapshot_dids(&harness.store, day(2)).is_empty());

    let analyzer = harness.analyzer();
    assert!(analyzer.change_history(30).expect("history").is_empty());
    assert!(analyzer.hidden_analytics(30).expect("hidden").history.is_empty());

    let runs = analyzer.recent_collection_runs(10).expect("runs");
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].entry.status, RunStatus::Failed);
    assert_eq!(runs[0].entry.collection_date, day(2));
    assert!(runs[0].entry.error_message.is_some());
    assert_eq!(runs[1].entry.status, RunStatus::Committed);
}

#[test]
fn without_an_oracle_departures_are_unchecked() {
    let harness = Harness::new();
    let pipeline = harness.unverified_pipeline();

    pipeline
        .run(&follower_batch(day(1), &["A", "B"]))
        .expect("day 1");
    let report = pipeline
        .run(&follower_batch(day(2), &["A"]))
        .expect("day 2");

    assert_eq!(report.departed.len(), 1);
    assert_eq!(report.departed[0].verification, VerificationStatus::Unchecked);
}

#[test]
fn relation_sets_partition_followers_and_following() {
    let harness = Harness::new();
    let mut batch = follower_batch(day(1), &["A", "B", "C"]);
    batch.following = members(RelationType::Following, &["B", "C", "D"]);
    harness.unverified_pipeline().run(&batch).expect("day 1");

    let analyzer = harness.analyzer();
    let dids = |entities: Vec<Entity>| -> Vec<String> {
        entities.into_iter().map(|entity| entity.did).collect()
    };
    let mutuals = dids(analyzer.mutuals().expect("mutuals"));
    let followers_only = dids(analyzer.followers_only().expect("followers only"));
    let non_mutual = dids(analyzer.non_mutual_following().expect("non mutual"));

    assert_eq!(mutuals, vec!["B", "C"]);
    assert_eq!(followers_only, vec!["A"]);
    assert_eq!(non_mutual, vec!["D"]);

    let mut followers: Vec<String> = mutuals.iter().chain(&followers_only).cloned().collect();
    followers.sort();
    assert_eq!(followers, vec!["A", "B", "C"]);
    let mut following: Vec<String> = mutuals.iter().chain(&non_mutual).cloned().collect();
    following.sort();
    assert_eq!(following, vec!["B", "C", "D"]);
    assert!(mutuals.iter().all(|did| !followers_only.contains(did)));
    assert!(mutuals.iter().all(|did| !non_mutual.contains(did)));

    let stats = analyzer.stats(30).expect("stats");
    assert_eq!(stats.mutual_count, 2);
    assert_eq!(stats.followers_only_count, 1);
    assert_eq!(stats.non_mutual_count, 1);
}

#[test]
fn reports_are_empty_before_any_commit() {
    let harness = Harness::new();
    let analyzer = harness.analyzer();

    assert!(analyzer.mutuals().expect("mutuals").is_empty());
    assert!(analyzer.top_interactors(30, 10).expect("top").is_empty());
    assert!(analyzer.top_posts(30, 10).expect("posts").is_empty());
    assert!(analyzer.engagement_timeline(30).expect("timeline").is_empty());
    assert_eq!(analyzer.engagement_balance(30).expect("balance").ratio, 0.0);
    assert_eq!(analyzer.hidden_analytics(30).expect("hidden").current, None);
}

#[test]
fn batch_deserializes_from_collector_json() {
    let raw = r#"{
        "collection_date": "2024-06-01",
        "followers": [
            {"relation": "follower", "entity": {"did": "did:plc:a", "handle": "a.test"}}
        ],
        "following": [
            {"relation": "following", "entity": {"did": "did:plc:b"}, "followed_at": "2024-01-05T10:00:00Z"}
        ]
    }"#;

    let batch = CollectionBatch::from_json(raw).expect("parse batch");
    assert_eq!(batch.collection_date, day(1));
    assert_eq!(batch.followers.len(), 1);
    assert_eq!(
        batch.following[0].related_at(),
        Some(Utc.with_ymd_and_hms(2024, 1, 5, 10, 0, 0).unwrap())
    );
    assert!(batch.muted.is_empty());
    assert_eq!(batch.counts, None);
}

#[test]
fn diff_and_classification_skip_missing_days() {
    let harness = Harness::new();
    let pipeline = harness.unverified_pipeline();

    let mut first = follower_batch(day(1), &["A", "B", "C"]);
    first.counts = Some(CountObservation::new(day(1), 3, 3, 0, 0));
    pipeline.run(&first).expect("day 1");

    let mut third = follower_batch(day(3), &["A", "C"]);
    third.counts = Some(CountObservation::new(day(3), 3, 2, 0, 0));
    let report = pipeline.run(&third).expect("day 3");
    let recollected = pipeline.run(&third).expect("day 3 again");

    for pass in [&report, &recollected] {
        assert_eq!(
            pass.history,
            HistoryState::HasHistory {
                previous_date: day(1)
            }
        );
        assert_eq!(
            pass.departed
                .iter()
                .map(|event| event.did.as_str())
                .collect::<Vec<_>>(),
            vec!["B"]
        );
    }
    assert_eq!(report.events_inserted, 1);
    assert_eq!(recollected.events_inserted, 0);

    let view = harness.store.read_view().expect("view");
    assert_eq!(
        classify_day(&view.reader(), day(3)).expect("classify"),
        Some(ChangeClassification::BlockedOrSuspended)
    );
    drop(view);

    let history = harness.analyzer().change_history(30).expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(
        history[0].classification,
        Some(ChangeClassification::BlockedOrSuspended)
    );
}

#[test]
fn members_without_a_did_are_skipped_not_fatal() {
    let harness = Harness::new();
    let raw = r#"{
        "collection_date": "2024-06-01",
        "followers": [
            {"relation": "follower", "entity": {"did": "did:plc:a", "handle": "a.test"}},
            {"relation": "follower", "entity": {"handle": "ghost.test"}},
            {"relation": "follower", "entity": {"did": "did:plc:b"}}
        ]
    }"#;

    let batch = CollectionBatch::from_json(raw).expect("parse batch");
    assert_eq!(batch.followers.len(), 3);

    let report = harness.unverified_pipeline().run(&batch).expect("run");
    assert_eq!(report.followers.inserted, 2);
    assert_eq!(report.followers.skipped, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.metric.follower_count, 2);
    assert_eq!(
        snapshot_dids(&harness.store, day(1)),
        vec!["did:plc:a", "did:plc:b"]
    );

    let runs = harness.analyzer().recent_collection_runs(1).expect("runs");
    assert_eq!(runs[0].entry.skipped_count, 1);
}

#[test]
fn collector_timestamps_accept_naive_and_space_separated_forms() {
    let harness = Harness::new();
    let raw = r#"{
        "collection_date": "2024-06-01",
        "following": [
            {"relation": "following", "entity": {"did": "did:plc:b"}, "followed_at": "2024-01-05 10:00:00"}
        ],
        "blocked": [
            {"relation": "blocked", "entity": {"did": "did:plc:x"}, "blocked_at": null}
        ],
        "engagement": [
            {
                "collection_date": "2024-06-01",
                "post_uri": "at://did:plc:me/app.bsky.feed.post/1",
                "created_at": "2024-06-01T08:00:00",
                "counts": {"likes": 3, "reposts": 0, "replies": 0, "quotes": 0, "bookmarks": 0,
                           "indirect_likes": 0, "indirect_reposts": 0, "indirect_replies": 0,
                           "indirect_bookmarks": 0}
            }
        ],
        "interactions": [
            {"actor": {"did": "did:plc:fan"}, "kind": "like", "occurred_at": "2024-06-01 09:30:00"}
        ],
        "outgoing_likes": [
            {"subject_uri": "at://did:plc:other/app.bsky.feed.post/9", "liked_at": "2024-06-01 12:00"}
        ]
    }"#;

    let batch = CollectionBatch::from_json(raw).expect("parse batch");
    assert_eq!(
        batch.following[0].related_at(),
        Some(Utc.with_ymd_and_hms(2024, 1, 5, 10, 0, 0).unwrap())
    );
    assert_eq!(batch.blocked[0].related_at(), None);
    assert_eq!(
        batch.engagement[0].created_at,
        Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()
    );
    assert_eq!(
        batch.interactions[0].occurred_at,
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 30, 0).unwrap()
    );
    assert_eq!(batch.interactions[0].kind, InteractionKind::Like);
    assert_eq!(
        batch.outgoing_likes[0].liked_at,
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    );

    harness.unverified_pipeline().run(&batch).expect("run");
    let analyzer = harness.analyzer();
    assert_eq!(analyzer.engagement_balance(1).expect("balance").given.likes, 1);
    assert_eq!(analyzer.top_interactors(1, 10).expect("interactors").len(), 1);
}

#[test]
fn outgoing_attribution_is_derived_from_uris_not_the_wire() {
    let harness = Harness::new();
    let raw = r#"{
        "collection_date": "2024-06-01",
        "outgoing_likes": [
            {"subject_uri": "at://did:plc:other/app.bsky.feed.post/9", "subject_author_did": "did:plc:wrong", "liked_at": "2024-06-01T10:00:00Z"}
        ],
        "outgoing_posts": [
            {"post_uri": "at://did:plc:me/app.bsky.feed.post/2", "created_at": "2024-06-01T11:00:00Z",
             "reply_parent_uri": "at://did:plc:me/app.bsky.feed.post/1", "is_self_reply": false},
            {"post_uri": "at://did:plc:me/app.bsky.feed.post/3", "created_at": "2024-06-01T12:00:00Z",
             "reply_parent_uri": "at://did:plc:other/app.bsky.feed.post/7"},
            {"post_uri": "at://did:plc:me/app.bsky.feed.post/4", "created_at": "2024-06-01T13:00:00Z",
             "reply_parent_uri": "at://did:plc:other/app.bsky.feed.post/8", "is_self_reply": true},
            {"post_uri": "at://did:plc:me/app.bsky.feed.post/5", "created_at": "2024-06-01T14:00:00Z"}
        ]
    }"#;

    let batch = CollectionBatch::from_json(raw).expect("parse batch");
    harness.unverified_pipeline().run(&batch).expect("run");

    let balance = harness.analyzer().engagement_balance(30).expect("balance");
    assert_eq!(balance.given.replies, 2);
    assert_eq!(balance.given.likes, 1);

    let view = harness.store.read_view().expect("view");
    let window = ReportWindow::new(day(1), 1);
    let likes = view.reader().outgoing_likes_in(&window).expect("likes");
    assert_eq!(likes[0].subject_author_did.as_deref(), Some("did:plc:other"));
    let self_replies: Vec<String> = view
        .reader()
        .outgoing_posts_in(&window)
        .expect("posts")
        .into_iter()
        .filter(|post| post.is_self_reply)
        .map(|post| post.post_uri)
        .collect();
    assert_eq!(self_replies, vec!["at://did:plc:me/app.bsky.feed.post/2"]);
}

#[test]
fn config_warnings_are_reported_without_blocking_collection() {
    let mut harness = Harness::new();
    harness.config.tracker.account_did.clear();
    harness.config.reporting.window_days = 0;
    let codes: Vec<&str> = validate_config(&harness.config)
        .iter()
        .map(|warning| warning.code)
        .collect();
    assert!(codes.contains(&"tracker.account_did_missing"));
    assert!(codes.contains(&"reporting.window_zero"));

    let oracle = Arc::new(ScriptedOracle::new(&[("B", Script::NotRelated)]));
    let pipeline = harness.pipeline(oracle.clone());
    pipeline
        .run(&follower_batch(day(1), &["A", "B"]))
        .expect("day 1");
    let report = pipeline
        .run(&follower_batch(day(2), &["A"]))
        .expect("day 2");

    assert_eq!(report.departed.len(), 1);
    assert_eq!(report.departed[0].verification, VerificationStatus::Unchecked);
    assert_eq!(oracle.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn pipeline_runs_on_a_plain_thread_beside_an_async_runtime() {
    let departed = std::thread::spawn(|| {
        let harness = Harness::new();
        let oracle = Arc::new(ScriptedOracle::new(&[("B", Script::NotRelated)]));
        let pipeline = harness.pipeline(oracle);
        pipeline
            .run(&follower_batch(day(1), &["A", "B"]))
            .expect("day 1");
        let report = pipeline
            .run(&follower_batch(day(2), &["A"]))
            .expect("day 2");
        drop(pipeline);
        report.departed.len()
    })
    .join()
    .expect("collection thread");

    assert_eq!(departed, 1);
}
