use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use skywatch_core::{
    ChangeEvent, ChangeType, CountObservation, DailyMetric, EngagementCounts,
    EngagementObservation, Entity, InteractionEvent, InteractionKind, OutgoingLike,
    OutgoingPost, OutgoingRepost, RelationMember, RelationType, ReportWindow,
    VerificationStatus,
};

use crate::{
    CollectionRunRecord, LATEST_COMMITTED_KEY, RunLogEntry, RunStatus, StoreError,
};

/// Read queries shared by the write side (which must see its own
/// uncommitted rows) and the read side (which must not).
pub struct StoreReader<'conn> {
    conn: &'conn Connection,
}

impl<'conn> StoreReader<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    pub fn latest_committed_date(&self) -> Result<Option<NaiveDate>, StoreError> {
        let date = self
            .conn
            .query_row(
                "SELECT value FROM store_state WHERE key = ?1",
                params![LATEST_COMMITTED_KEY],
                |row| row.get::<_, NaiveDate>(0),
            )
            .optional()?;
        Ok(date)
    }

    /// Closest day strictly before `before` that has rows for `relation`.
    pub fn previous_snapshot_date(
        &self,
        relation: RelationType,
        before: NaiveDate,
    ) -> Result<Option<NaiveDate>, StoreError> {
        let date = self.conn.query_row(
            r#"
            SELECT MAX(collection_date)
            FROM relation_snapshots
            WHERE relation_type = ?1 AND collection_date < ?2
            "#,
            params![relation.as_str(), before],
            |row| row.get::<_, Option<NaiveDate>>(0),
        )?;
        Ok(date)
    }

    pub fn latest_snapshot_date(
        &self,
        relation: RelationType,
        on_or_before: NaiveDate,
    ) -> Result<Option<NaiveDate>, StoreError> {
        let date = self.conn.query_row(
            r#"
            SELECT MAX(collection_date)
            FROM relation_snapshots
            WHERE relation_type = ?1 AND collection_date <= ?2
            "#,
            params![relation.as_str(), on_or_before],
            |row| row.get::<_, Option<NaiveDate>>(0),
        )?;
        Ok(date)
    }

    pub fn members_on(
        &self,
        relation: RelationType,
        date: NaiveDate,
    ) -> Result<Vec<RelationMember>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT did, handle, display_name, avatar_url, bio, related_at
            FROM relation_snapshots
            WHERE relation_type = ?1 AND collection_date = ?2
            ORDER BY did ASC
            "#,
        )?;

        let rows = stmt.query_map(params![relation.as_str(), date], |row| {
            let entity = Entity {
                did: row.get(0)?,
                handle: row.get(1)?,
                display_name: row.get(2)?,
                avatar_url: row.get(3)?,
                bio: row.get(4)?,
            };
            let related_at = row
                .get::<_, Option<i64>>(5)?
                .map(|millis| millis_to_utc(5, millis))
                .transpose()?;
            Ok(RelationMember::new(relation, entity, related_at))
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn entities_on(
        &self,
        relation: RelationType,
        date: NaiveDate,
    ) -> Result<Vec<Entity>, StoreError> {
        Ok(self
            .members_on(relation, date)?
            .into_iter()
            .map(RelationMember::into_entity)
            .collect())
    }

    /// Most recent committed membership of `relation`, if any.
    pub fn latest(
        &self,
        relation: RelationType,
    ) -> Result<Option<(NaiveDate, Vec<Entity>)>, StoreError> {
        let Some(anchor) = self.latest_committed_date()? else {
            return Ok(None);
        };
        let Some(date) = self.latest_snapshot_date(relation, anchor)? else {
            return Ok(None);
        };

        Ok(Some((date, self.entities_on(relation, date)?)))
    }

    pub fn count_observation(
        &self,
        date: NaiveDate,
    ) -> Result<Option<CountObservation>, StoreError> {
        let record = self
            .conn
            .query_row(
                &format!("{COUNT_COLUMNS} WHERE collection_date = ?1"),
                params![date],
                count_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn previous_count_observation(
        &self,
        before: NaiveDate,
    ) -> Result<Option<CountObservation>, StoreError> {
        let record = self
            .conn
            .query_row(
                &format!(
                    "{COUNT_COLUMNS} WHERE collection_date < ?1 ORDER BY collection_date DESC LIMIT 1"
                ),
                params![before],
                count_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Chronological.
    pub fn count_observations_in(
        &self,
        window: &ReportWindow,
    ) -> Result<Vec<CountObservation>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "{COUNT_COLUMNS} WHERE collection_date > ?1 AND collection_date <= ?2 ORDER BY collection_date ASC"
        ))?;
        let rows = stmt.query_map(params![window.start(), window.anchor], count_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// The last `limit` observations on or before `until`, chronological.
    pub fn recent_count_observations(
        &self,
        until: NaiveDate,
        limit: u32,
    ) -> Result<Vec<CountObservation>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "{COUNT_COLUMNS} WHERE collection_date <= ?1 ORDER BY collection_date DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![until, i64::from(limit)], count_from_row)?;
        let mut observations = rows.collect::<Result<Vec<_>, _>>()?;
        observations.reverse();
        Ok(observations)
    }

    /// Newest first.
    pub fn change_events_in(&self, window: &ReportWindow) -> Result<Vec<ChangeEvent>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT change_date, change_type, did, handle, verification
            FROM change_events
            WHERE change_date > ?1 AND change_date <= ?2
            ORDER BY change_date DESC, change_type ASC, did ASC
            "#,
        )?;

        let rows = stmt.query_map(params![window.start(), window.anchor], |row| {
            let change_type: String = row.get(1)?;
            let verification: String = row.get(4)?;
            Ok(ChangeEvent {
                change_date: row.get(0)?,
                change_type: parse_column(1, &change_type, ChangeType::parse)?,
                did: row.get(2)?,
                handle: row.get(3)?,
                verification: parse_column(4, &verification, VerificationStatus::parse)?,
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// `(joined, departed)` events recorded for `date`.
    pub fn change_totals_on(&self, date: NaiveDate) -> Result<(i64, i64), StoreError> {
        let totals = self.conn.query_row(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN change_type = 'joined' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN change_type = 'departed' THEN 1 ELSE 0 END), 0)
            FROM change_events
            WHERE change_date = ?1
            "#,
            params![date],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(totals)
    }

    pub fn relation_count_on(
        &self,
        relation: RelationType,
        date: NaiveDate,
    ) -> Result<i64, StoreError> {
        let count = self.conn.query_row(
            r#"
            SELECT COUNT(*)
            FROM relation_snapshots
            WHERE relation_type = ?1 AND collection_date = ?2
            "#,
            params![relation.as_str(), date],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn daily_metric(&self, date: NaiveDate) -> Result<Option<DailyMetric>, StoreError> {
        let metric = self
            .conn
            .query_row(
                r#"
                SELECT metric_date, follower_count, following_count, departed_count, joined_count
                FROM daily_metrics
                WHERE metric_date = ?1
                "#,
                params![date],
                metric_from_row,
            )
            .optional()?;
        Ok(metric)
    }

    /// Chronological.
    pub fn daily_metrics_in(&self, window: &ReportWindow) -> Result<Vec<DailyMetric>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT metric_date, follower_count, following_count, departed_count, joined_count
            FROM daily_metrics
            WHERE metric_date > ?1 AND metric_date <= ?2
            ORDER BY metric_date ASC
            "#,
        )?;
        let rows = stmt.query_map(params![window.start(), window.anchor], metric_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Every engagement observation collected on or before `until`, grouped
    /// by post and ordered by collection date within each post.
    pub fn engagement_observations(
        &self,
        until: NaiveDate,
    ) -> Result<Vec<EngagementObservation>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT collection_date, post_uri, created_at, text,
                   likes, reposts, replies, quotes, bookmarks,
                   indirect_likes, indirect_reposts, indirect_replies, indirect_bookmarks
            FROM engagement_observations
            WHERE collection_date <= ?1
            ORDER BY post_uri ASC, collection_date ASC
            "#,
        )?;

        let rows = stmt.query_map(params![until], |row| {
            Ok(EngagementObservation {
                collection_date: row.get(0)?,
                post_uri: row.get(1)?,
                created_at: millis_to_utc(2, row.get(2)?)?,
                text: row.get(3)?,
                counts: EngagementCounts {
                    likes: row.get(4)?,
                    reposts: row.get(5)?,
                    replies: row.get(6)?,
                    quotes: row.get(7)?,
                    bookmarks: row.get(8)?,
                    indirect_likes: row.get(9)?,
                    indirect_reposts: row.get(10)?,
                    indirect_replies: row.get(11)?,
                    indirect_bookmarks: row.get(12)?,
                },
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Chronological.
    pub fn interactions_in(
        &self,
        window: &ReportWindow,
    ) -> Result<Vec<InteractionEvent>, StoreError> {
        let (lower, upper) = window_millis(window);
        let mut stmt = self.conn.prepare(
            r#"
            SELECT actor_did, actor_handle, actor_display_name, actor_avatar_url, kind, occurred_at
            FROM interactions
            WHERE occurred_at >= ?1 AND occurred_at < ?2
            ORDER BY occurred_at ASC, actor_did ASC, kind ASC
            "#,
        )?;

        let rows = stmt.query_map(params![lower, upper], |row| {
            let kind: String = row.get(4)?;
            Ok(InteractionEvent {
                actor: Entity {
                    did: row.get(0)?,
                    handle: row.get(1)?,
                    display_name: row.get(2)?,
                    avatar_url: row.get(3)?,
                    bio: String::new(),
                },
                kind: parse_column(4, &kind, InteractionKind::parse)?,
                occurred_at: millis_to_utc(5, row.get(5)?)?,
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn outgoing_likes_in(&self, window: &ReportWindow) -> Result<Vec<OutgoingLike>, StoreError> {
        let (lower, upper) = window_millis(window);
        let mut stmt = self.conn.prepare(
            r#"
            SELECT subject_uri, subject_author_did, liked_at
            FROM outgoing_likes
            WHERE liked_at >= ?1 AND liked_at < ?2
            ORDER BY liked_at ASC, subject_uri ASC
            "#,
        )?;
        let rows = stmt.query_map(params![lower, upper], |row| {
            Ok(OutgoingLike {
                subject_uri: row.get(0)?,
                subject_author_did: row.get(1)?,
                liked_at: millis_to_utc(2, row.get(2)?)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn outgoing_reposts_in(
        &self,
        window: &ReportWindow,
    ) -> Result<Vec<OutgoingRepost>, StoreError> {
        let (lower, upper) = window_millis(window);
        let mut stmt = self.conn.prepare(
            r#"
            SELECT subject_uri, subject_author_did, reposted_at
            FROM outgoing_reposts
            WHERE reposted_at >= ?1 AND reposted_at < ?2
            ORDER BY reposted_at ASC, subject_uri ASC
            "#,
        )?;
        let rows = stmt.query_map(params![lower, upper], |row| {
            Ok(OutgoingRepost {
                subject_uri: row.get(0)?,
                subject_author_did: row.get(1)?,
                reposted_at: millis_to_utc(2, row.get(2)?)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn outgoing_posts_in(&self, window: &ReportWindow) -> Result<Vec<OutgoingPost>, StoreError> {
        let (lower, upper) = window_millis(window);
        let mut stmt = self.conn.prepare(
            r#"
            SELECT post_uri, created_at, reply_parent_uri, is_self_reply
            FROM outgoing_posts
            WHERE created_at >= ?1 AND created_at < ?2
            ORDER BY created_at ASC, post_uri ASC
            "#,
        )?;
        let rows = stmt.query_map(params![lower, upper], |row| {
            Ok(OutgoingPost {
                post_uri: row.get(0)?,
                created_at: millis_to_utc(1, row.get(1)?)?,
                reply_parent_uri: row.get(2)?,
                is_self_reply: row.get(3)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Newest first.
    pub fn recent_runs(&self, limit: u32) -> Result<Vec<CollectionRunRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, collection_date, started_at, duration_ms, status,
                   followers_collected, following_collected, joined_count, departed_count,
                   false_positive_count, fail_open_count, skipped_count, error_message
            FROM collection_runs
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;

        let rows = stmt.query_map(params![i64::from(limit)], |row| {
            let status: String = row.get(4)?;
            Ok(CollectionRunRecord {
                id: row.get(0)?,
                entry: RunLogEntry {
                    collection_date: row.get(1)?,
                    started_at: millis_to_utc(2, row.get(2)?)?,
                    duration_ms: row.get(3)?,
                    status: parse_column(4, &status, RunStatus::parse)?,
                    followers_collected: row.get(5)?,
                    following_collected: row.get(6)?,
                    joined_count: row.get(7)?,
                    departed_count: row.get(8)?,
                    false_positive_count: row.get(9)?,
                    fail_open_count: row.get(10)?,
                    skipped_count: row.get(11)?,
                    error_message: row.get(12)?,
                },
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}

const COUNT_COLUMNS: &str = r#"
    SELECT collection_date, profile_followers, api_followers, profile_following,
           api_following, muted_count, blocked_count
    FROM count_observations
"#;

fn count_from_row(row: &Row<'_>) -> rusqlite::Result<CountObservation> {
    Ok(CountObservation {
        collection_date: row.get(0)?,
        profile_followers: row.get(1)?,
        api_followers: row.get(2)?,
        profile_following: row.get(3)?,
        api_following: row.get(4)?,
        muted_count: row.get(5)?,
        blocked_count: row.get(6)?,
    })
}

fn metric_from_row(row: &Row<'_>) -> rusqlite::Result<DailyMetric> {
    Ok(DailyMetric {
        metric_date: row.get(0)?,
        follower_count: row.get(1)?,
        following_count: row.get(2)?,
        departed_count: row.get(3)?,
        joined_count: row.get(4)?,
    })
}

pub(crate) fn millis_to_utc(column: usize, millis: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            Type::Integer,
            format!("timestamp out of range: {millis}").into(),
        )
    })
}

fn parse_column<T>(
    column: usize,
    value: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    parse(value).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            Type::Text,
            format!("unrecognized value '{value}'").into(),
        )
    })
}

/// Half-open millisecond range `[first instant of the window, first instant after it)`.
fn window_millis(window: &ReportWindow) -> (i64, i64) {
    (
        day_start_millis(window.start().succ_opt()),
        day_start_millis(window.anchor.succ_opt()),
    )
}

fn day_start_millis(date: Option<NaiveDate>) -> i64 {
    date.and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc().timestamp_millis())
        .unwrap_or(i64::MAX)
}
