use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod reader;
mod run;
mod view;

pub use reader::StoreReader;
pub use run::CollectionRun;
pub use view::ReadView;

pub const STORE_DIR_NAME: &str = ".skywatch";
pub const STORE_FILE_NAME: &str = "skywatch.sqlite";

const LATEST_COMMITTED_KEY: &str = "latest_committed_date";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("collection run for {0} was already finished")]
    RunFinished(NaiveDate),
}

/// What a single `record_*` call did with its batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecordOutcome {
    pub inserted: usize,
    pub skipped: usize,
}

impl RecordOutcome {
    pub fn merge(&mut self, other: RecordOutcome) {
        self.inserted += other.inserted;
        self.skipped += other.skipped;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Committed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Committed => "committed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "committed" => Some(Self::Committed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One line of the collection log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub collection_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub status: RunStatus,
    pub followers_collected: i64,
    pub following_collected: i64,
    pub joined_count: i64,
    pub departed_count: i64,
    pub false_positive_count: i64,
    pub fail_open_count: i64,
    pub skipped_count: i64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRunRecord {
    pub id: i64,
    #[serde(flatten)]
    pub entry: RunLogEntry,
}

/// Handle to the on-disk store. Every run and view opens its own connection,
/// so the handle itself is cheap to clone and share.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    sqlite_path: PathBuf,
}

impl SqliteStore {
    pub fn open(workspace_root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let sqlite_path = workspace_root
            .as_ref()
            .join(STORE_DIR_NAME)
            .join(STORE_FILE_NAME);
        Self::open_path(sqlite_path)
    }

    pub fn open_path(sqlite_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let sqlite_path = sqlite_path.into();
        if let Some(parent) = sqlite_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&sqlite_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        run_migrations(&conn)?;
        drop(conn);

        Ok(Self { sqlite_path })
    }

    pub fn sqlite_path(&self) -> &Path {
        &self.sqlite_path
    }

    /// Starts the write transaction for one collection day.
    pub fn begin_run(&self, collection_date: NaiveDate) -> Result<CollectionRun, StoreError> {
        CollectionRun::begin(self.connection()?, collection_date)
    }

    /// Opens a consistent read snapshot of everything committed so far.
    pub fn read_view(&self) -> Result<ReadView, StoreError> {
        ReadView::open(self.connection()?)
    }

    pub fn latest_committed_date(&self) -> Result<Option<NaiveDate>, StoreError> {
        let conn = self.connection()?;
        StoreReader::new(&conn).latest_committed_date()
    }

    /// Appends a failed run to the collection log outside any run transaction,
    /// so the entry survives the rollback of the run it describes.
    pub fn log_failed_run(&self, entry: &RunLogEntry) -> Result<i64, StoreError> {
        let conn = self.connection()?;
        insert_run_log(&conn, entry)
    }

    fn connection(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.sqlite_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }
}

pub(crate) fn insert_run_log(conn: &Connection, entry: &RunLogEntry) -> Result<i64, StoreError> {
    conn.execute(
        r#"
        INSERT INTO collection_runs (
            collection_date, started_at, duration_ms, status,
            followers_collected, following_collected, joined_count, departed_count,
            false_positive_count, fail_open_count, skipped_count, error_message
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
        params![
            entry.collection_date,
            entry.started_at.timestamp_millis(),
            entry.duration_ms,
            entry.status.as_str(),
            entry.followers_collected,
            entry.following_collected,
            entry.joined_count,
            entry.departed_count,
            entry.false_positive_count,
            entry.fail_open_count,
            entry.skipped_count,
            entry.error_message,
        ],
    )?;

    Ok(conn.last_insert_rowid())
}

fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS relation_snapshots (
            collection_date TEXT NOT NULL,
            relation_type TEXT NOT NULL,
            did TEXT NOT NULL,
            handle TEXT NOT NULL DEFAULT '',
            display_name TEXT NOT NULL DEFAULT '',
            avatar_url TEXT NOT NULL DEFAULT '',
            bio TEXT NOT NULL DEFAULT '',
            related_at INTEGER,
            PRIMARY KEY (collection_date, relation_type, did)
        );

        CREATE INDEX IF NOT EXISTS idx_relation_snapshots_relation_date
            ON relation_snapshots(relation_type, collection_date);

        CREATE TABLE IF NOT EXISTS count_observations (
            collection_date TEXT PRIMARY KEY,
            profile_followers INTEGER NOT NULL,
            api_followers INTEGER NOT NULL,
            profile_following INTEGER NOT NULL DEFAULT 0,
            api_following INTEGER NOT NULL DEFAULT 0,
            muted_count INTEGER NOT NULL DEFAULT 0,
            blocked_count INTEGER NOT NULL DEFAULT 0,
            hidden_followers INTEGER NOT NULL,
            hidden_following INTEGER NOT NULL DEFAULT 0,
            suspected_hidden_non_mute_block INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS change_events (
            change_date TEXT NOT NULL,
            change_type TEXT NOT NULL,
            did TEXT NOT NULL,
            handle TEXT NOT NULL DEFAULT '',
            verification TEXT NOT NULL DEFAULT 'unchecked',
            PRIMARY KEY (change_date, change_type, did)
        );

        CREATE TABLE IF NOT EXISTS daily_metrics (
            metric_date TEXT PRIMARY KEY,
            follower_count INTEGER NOT NULL,
            following_count INTEGER NOT NULL,
            departed_count INTEGER NOT NULL,
            joined_count INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS engagement_observations (
            collection_date TEXT NOT NULL,
            post_uri TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            text TEXT NOT NULL DEFAULT '',
            likes INTEGER NOT NULL DEFAULT 0,
            reposts INTEGER NOT NULL DEFAULT 0,
            replies INTEGER NOT NULL DEFAULT 0,
            quotes INTEGER NOT NULL DEFAULT 0,
            bookmarks INTEGER NOT NULL DEFAULT 0,
            indirect_likes INTEGER NOT NULL DEFAULT 0,
            indirect_reposts INTEGER NOT NULL DEFAULT 0,
            indirect_replies INTEGER NOT NULL DEFAULT 0,
            indirect_bookmarks INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (collection_date, post_uri)
        );

        CREATE INDEX IF NOT EXISTS idx_engagement_observations_post
            ON engagement_observations(post_uri, collection_date);

        CREATE TABLE IF NOT EXISTS interactions (
            actor_did TEXT NOT NULL,
            kind TEXT NOT NULL,
            occurred_at INTEGER NOT NULL,
            actor_handle TEXT NOT NULL DEFAULT '',
            actor_display_name TEXT NOT NULL DEFAULT '',
            actor_avatar_url TEXT NOT NULL DEFAULT '',
            PRIMARY KEY (actor_did, kind, occurred_at)
        );

        CREATE INDEX IF NOT EXISTS idx_interactions_occurred_at
            ON interactions(occurred_at);

        CREATE TABLE IF NOT EXISTS outgoing_likes (
            subject_uri TEXT PRIMARY KEY,
            subject_author_did TEXT,
            liked_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS outgoing_reposts (
            subject_uri TEXT PRIMARY KEY,
            subject_author_did TEXT,
            reposted_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS outgoing_posts (
            post_uri TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL,
            reply_parent_uri TEXT,
            is_self_reply INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS collection_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            collection_date TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            duration_ms INTEGER NOT NULL,
            status TEXT NOT NULL,
            followers_collected INTEGER NOT NULL DEFAULT 0,
            following_collected INTEGER NOT NULL DEFAULT 0,
            joined_count INTEGER NOT NULL DEFAULT 0,
            departed_count INTEGER NOT NULL DEFAULT 0,
            false_positive_count INTEGER NOT NULL DEFAULT 0,
            fail_open_count INTEGER NOT NULL DEFAULT 0,
            skipped_count INTEGER NOT NULL DEFAULT 0,
            error_message TEXT
        );

        CREATE TABLE IF NOT EXISTS store_state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use skywatch_core::{Entity, RelationMember, RelationType};
    use tempfile::tempdir;

    use super::*;

    fn day(n: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 4, n).expect("valid date")
    }

    fn follower(did: &str) -> RelationMember {
        RelationMember::new(RelationType::Follower, Entity::new(did, did), None)
    }

    #[test]
    fn open_creates_database_under_workspace() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteStore::open(temp.path()).expect("open store");

        assert!(store.sqlite_path().exists());
        assert_eq!(
            store.sqlite_path(),
            temp.path().join(STORE_DIR_NAME).join(STORE_FILE_NAME)
        );
        assert_eq!(store.latest_committed_date().expect("pointer"), None);

        drop(store);
        SqliteStore::open(temp.path()).expect("reopen store");
    }

    #[test]
    fn failed_run_log_survives_rollback() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteStore::open(temp.path()).expect("open store");

        let mut run = store.begin_run(day(1)).expect("begin run");
        run.record_relations(RelationType::Follower, &[follower("did:plc:a")])
            .expect("record followers");
        run.abort().expect("abort run");

        let entry = RunLogEntry {
            collection_date: day(1),
            started_at: Utc.with_ymd_and_hms(2024, 4, 1, 6, 0, 0).unwrap(),
            duration_ms: 12,
            status: RunStatus::Failed,
            followers_collected: 1,
            following_collected: 0,
            joined_count: 0,
            departed_count: 0,
            false_positive_count: 0,
            fail_open_count: 0,
            skipped_count: 0,
            error_message: Some("collector went away".to_owned()),
        };
        store.log_failed_run(&entry).expect("log failed run");

        let view = store.read_view().expect("read view");
        let runs = view.reader().recent_runs(10).expect("recent runs");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].entry, entry);
        assert!(
            view.reader()
                .members_on(RelationType::Follower, day(1))
                .expect("members")
                .is_empty()
        );
        assert_eq!(view.anchor(), None);
    }
}
