use chrono::NaiveDate;
use rusqlite::{Connection, params};
use skywatch_core::{
    ChangeEvent, CountObservation, DailyMetric, EngagementObservation, InteractionEvent,
    OutgoingLike, OutgoingPost, OutgoingRepost, RelationMember, RelationType,
};

use crate::{
    LATEST_COMMITTED_KEY, RecordOutcome, RunLogEntry, StoreError, StoreReader, insert_run_log,
};

/// All writes for one collection day, inside one `BEGIN IMMEDIATE`
/// transaction. Nothing is visible to readers until [`CollectionRun::commit`];
/// dropping an unfinished run rolls it back.
pub struct CollectionRun {
    conn: Connection,
    collection_date: NaiveDate,
    finished: bool,
}

impl CollectionRun {
    pub(crate) fn begin(conn: Connection, collection_date: NaiveDate) -> Result<Self, StoreError> {
        conn.execute_batch("BEGIN IMMEDIATE")?;
        tracing::debug!(date = %collection_date, "collection run started");
        Ok(Self {
            conn,
            collection_date,
            finished: false,
        })
    }

    pub fn collection_date(&self) -> NaiveDate {
        self.collection_date
    }

    /// Reads through the run's own transaction, uncommitted rows included.
    pub fn reader(&self) -> StoreReader<'_> {
        StoreReader::new(&self.conn)
    }

    /// Upserts one relation's members for the run's day. Members without a
    /// DID, or tagged with a different relation, are skipped and logged.
    pub fn record_relations(
        &mut self,
        relation: RelationType,
        members: &[RelationMember],
    ) -> Result<RecordOutcome, StoreError> {
        self.ensure_open()?;
        let mut outcome = RecordOutcome::default();
        let mut stmt = self.conn.prepare_cached(
            r#"
            INSERT INTO relation_snapshots (
                collection_date, relation_type, did, handle, display_name, avatar_url, bio, related_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(collection_date, relation_type, did) DO UPDATE SET
                handle = excluded.handle,
                display_name = excluded.display_name,
                avatar_url = excluded.avatar_url,
                bio = excluded.bio,
                related_at = excluded.related_at
            "#,
        )?;

        for member in members {
            if member.relation_type() != relation {
                tracing::warn!(
                    date = %self.collection_date,
                    expected = relation.as_str(),
                    actual = member.relation_type().as_str(),
                    did = member.did(),
                    "skipping relation member recorded under the wrong relation"
                );
                outcome.skipped += 1;
                continue;
            }

            let entity = member.entity();
            if !entity.has_identity() {
                tracing::warn!(
                    date = %self.collection_date,
                    relation = relation.as_str(),
                    handle = %entity.handle,
                    "skipping relation member without a did"
                );
                outcome.skipped += 1;
                continue;
            }

            stmt.execute(params![
                self.collection_date,
                relation.as_str(),
                entity.did.trim(),
                entity.handle,
                entity.display_name,
                entity.avatar_url,
                entity.bio,
                member.related_at().map(|at| at.timestamp_millis()),
            ])?;
            outcome.inserted += 1;
        }

        tracing::debug!(
            date = %self.collection_date,
            relation = relation.as_str(),
            inserted = outcome.inserted,
            skipped = outcome.skipped,
            "relation snapshot recorded"
        );
        Ok(outcome)
    }

    /// Stores the day's counters; the derived hidden columns are computed here.
    pub fn record_counts(&mut self, counts: &CountObservation) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.conn.execute(
            r#"
            INSERT INTO count_observations (
                collection_date, profile_followers, api_followers, profile_following, api_following,
                muted_count, blocked_count, hidden_followers, hidden_following,
                suspected_hidden_non_mute_block
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(collection_date) DO UPDATE SET
                profile_followers = excluded.profile_followers,
                api_followers = excluded.api_followers,
                profile_following = excluded.profile_following,
                api_following = excluded.api_following,
                muted_count = excluded.muted_count,
                blocked_count = excluded.blocked_count,
                hidden_followers = excluded.hidden_followers,
                hidden_following = excluded.hidden_following,
                suspected_hidden_non_mute_block = excluded.suspected_hidden_non_mute_block
            "#,
            params![
                self.collection_date,
                counts.profile_followers,
                counts.api_followers,
                counts.profile_following,
                counts.api_following,
                counts.muted_count,
                counts.blocked_count,
                counts.hidden_followers(),
                counts.hidden_following(),
                counts.suspected_hidden_non_mute_block(),
            ],
        )?;
        Ok(())
    }

    pub fn record_engagement(
        &mut self,
        observations: &[EngagementObservation],
    ) -> Result<RecordOutcome, StoreError> {
        self.ensure_open()?;
        let mut outcome = RecordOutcome::default();
        let mut stmt = self.conn.prepare_cached(
            r#"
            INSERT INTO engagement_observations (
                collection_date, post_uri, created_at, text,
                likes, reposts, replies, quotes, bookmarks,
                indirect_likes, indirect_reposts, indirect_replies, indirect_bookmarks
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(collection_date, post_uri) DO UPDATE SET
                created_at = excluded.created_at,
                text = excluded.text,
                likes = excluded.likes,
                reposts = excluded.reposts,
                replies = excluded.replies,
                quotes = excluded.quotes,
                bookmarks = excluded.bookmarks,
                indirect_likes = excluded.indirect_likes,
                indirect_reposts = excluded.indirect_reposts,
                indirect_replies = excluded.indirect_replies,
                indirect_bookmarks = excluded.indirect_bookmarks
            "#,
        )?;

        for observation in observations {
            let post_uri = observation.post_uri.trim();
            if post_uri.is_empty() {
                tracing::warn!(date = %self.collection_date, "skipping engagement without a post uri");
                outcome.skipped += 1;
                continue;
            }

            let counts = &observation.counts;
            stmt.execute(params![
                self.collection_date,
                post_uri,
                observation.created_at.timestamp_millis(),
                observation.text,
                counts.likes,
                counts.reposts,
                counts.replies,
                counts.quotes,
                counts.bookmarks,
                counts.indirect_likes,
                counts.indirect_reposts,
                counts.indirect_replies,
                counts.indirect_bookmarks,
            ])?;
            outcome.inserted += 1;
        }

        Ok(outcome)
    }

    /// Duplicates on `(actor_did, kind, occurred_at)` are ignored.
    pub fn record_interactions(
        &mut self,
        events: &[InteractionEvent],
    ) -> Result<RecordOutcome, StoreError> {
        self.ensure_open()?;
        let mut outcome = RecordOutcome::default();
        let mut stmt = self.conn.prepare_cached(
            r#"
            INSERT OR IGNORE INTO interactions (
                actor_did, kind, occurred_at, actor_handle, actor_display_name, actor_avatar_url
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )?;

        for event in events {
            if !event.actor.has_identity() {
                tracing::warn!(
                    date = %self.collection_date,
                    kind = event.kind.as_str(),
                    "skipping interaction without an actor did"
                );
                outcome.skipped += 1;
                continue;
            }

            outcome.inserted += stmt.execute(params![
                event.actor.did.trim(),
                event.kind.as_str(),
                event.occurred_at.timestamp_millis(),
                event.actor.handle,
                event.actor.display_name,
                event.actor.avatar_url,
            ])?;
        }

        Ok(outcome)
    }

    pub fn record_outgoing_likes(
        &mut self,
        likes: &[OutgoingLike],
    ) -> Result<RecordOutcome, StoreError> {
        self.ensure_open()?;
        let mut outcome = RecordOutcome::default();
        let mut stmt = self.conn.prepare_cached(
            r#"
            INSERT INTO outgoing_likes (subject_uri, subject_author_did, liked_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(subject_uri) DO UPDATE SET
                subject_author_did = excluded.subject_author_did,
                liked_at = excluded.liked_at
            "#,
        )?;

        for like in likes {
            if like.subject_uri.trim().is_empty() {
                outcome.skipped += 1;
                continue;
            }
            stmt.execute(params![
                like.subject_uri.trim(),
                like.subject_author_did,
                like.liked_at.timestamp_millis(),
            ])?;
            outcome.inserted += 1;
        }

        Ok(outcome)
    }

    pub fn record_outgoing_reposts(
        &mut self,
        reposts: &[OutgoingRepost],
    ) -> Result<RecordOutcome, StoreError> {
        self.ensure_open()?;
        let mut outcome = RecordOutcome::default();
        let mut stmt = self.conn.prepare_cached(
            r#"
            INSERT INTO outgoing_reposts (subject_uri, subject_author_did, reposted_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(subject_uri) DO UPDATE SET
                subject_author_did = excluded.subject_author_did,
                reposted_at = excluded.reposted_at
            "#,
        )?;

        for repost in reposts {
            if repost.subject_uri.trim().is_empty() {
                outcome.skipped += 1;
                continue;
            }
            stmt.execute(params![
                repost.subject_uri.trim(),
                repost.subject_author_did,
                repost.reposted_at.timestamp_millis(),
            ])?;
            outcome.inserted += 1;
        }

        Ok(outcome)
    }

    pub fn record_outgoing_posts(
        &mut self,
        posts: &[OutgoingPost],
    ) -> Result<RecordOutcome, StoreError> {
        self.ensure_open()?;
        let mut outcome = RecordOutcome::default();
        let mut stmt = self.conn.prepare_cached(
            r#"
            INSERT INTO outgoing_posts (post_uri, created_at, reply_parent_uri, is_self_reply)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(post_uri) DO UPDATE SET
                created_at = excluded.created_at,
                reply_parent_uri = excluded.reply_parent_uri,
                is_self_reply = excluded.is_self_reply
            "#,
        )?;

        for post in posts {
            if post.post_uri.trim().is_empty() {
                outcome.skipped += 1;
                continue;
            }
            stmt.execute(params![
                post.post_uri.trim(),
                post.created_at.timestamp_millis(),
                post.reply_parent_uri,
                post.is_self_reply,
            ])?;
            outcome.inserted += 1;
        }

        Ok(outcome)
    }

    /// Appends events, ignoring any already logged for the same
    /// `(change_date, change_type, did)`. Returns how many rows were new.
    pub fn insert_change_events(&mut self, events: &[ChangeEvent]) -> Result<usize, StoreError> {
        self.ensure_open()?;
        let mut stmt = self.conn.prepare_cached(
            r#"
            INSERT OR IGNORE INTO change_events (change_date, change_type, did, handle, verification)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )?;

        let mut inserted = 0;
        for event in events {
            inserted += stmt.execute(params![
                event.change_date,
                event.change_type.as_str(),
                event.did,
                event.handle,
                event.verification.as_str(),
            ])?;
        }

        if inserted < events.len() {
            tracing::debug!(
                date = %self.collection_date,
                duplicates = events.len() - inserted,
                "change events already logged"
            );
        }
        Ok(inserted)
    }

    /// Derives the day's metric row from its snapshots and logged events.
    pub fn upsert_daily_metric(&mut self) -> Result<DailyMetric, StoreError> {
        self.ensure_open()?;
        let reader = StoreReader::new(&self.conn);
        let date = self.collection_date;
        let (joined_count, departed_count) = reader.change_totals_on(date)?;
        let metric = DailyMetric {
            metric_date: date,
            follower_count: reader.relation_count_on(RelationType::Follower, date)?,
            following_count: reader.relation_count_on(RelationType::Following, date)?,
            departed_count,
            joined_count,
        };

        self.conn.execute(
            r#"
            INSERT INTO daily_metrics (
                metric_date, follower_count, following_count, departed_count, joined_count
            ) VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(metric_date) DO UPDATE SET
                follower_count = excluded.follower_count,
                following_count = excluded.following_count,
                departed_count = excluded.departed_count,
                joined_count = excluded.joined_count
            "#,
            params![
                metric.metric_date,
                metric.follower_count,
                metric.following_count,
                metric.departed_count,
                metric.joined_count,
            ],
        )?;

        Ok(metric)
    }

    /// Logs the run inside its own transaction, so the entry commits with it.
    pub fn log_run(&mut self, entry: &RunLogEntry) -> Result<i64, StoreError> {
        self.ensure_open()?;
        insert_run_log(&self.conn, entry)
    }

    /// Advances the committed-date pointer (never backwards) and commits.
    pub fn commit(mut self) -> Result<NaiveDate, StoreError> {
        self.ensure_open()?;
        self.conn.execute(
            r#"
            INSERT INTO store_state (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET
                value = MAX(store_state.value, excluded.value)
            "#,
            params![LATEST_COMMITTED_KEY, self.collection_date],
        )?;
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;

        let latest = StoreReader::new(&self.conn)
            .latest_committed_date()?
            .unwrap_or(self.collection_date);
        tracing::info!(date = %self.collection_date, latest = %latest, "collection run committed");
        Ok(latest)
    }

    /// Discards everything recorded by this run.
    pub fn abort(mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.conn.execute_batch("ROLLBACK")?;
        self.finished = true;
        tracing::info!(date = %self.collection_date, "collection run rolled back");
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.finished {
            return Err(StoreError::RunFinished(self.collection_date));
        }
        Ok(())
    }
}

impl Drop for CollectionRun {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(err) = self.conn.execute_batch("ROLLBACK") {
            tracing::warn!(date = %self.collection_date, error = %err, "rollback of dropped run failed");
        }
    }
}
