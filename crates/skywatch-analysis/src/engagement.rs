use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use skywatch_core::{
    EngagementDelta, EngagementObservation, MetricKind, ReportWindow, reconcile,
};

/// Engagement summed per kind, indirect counts folded into their direct kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EngagementTally {
    pub likes: u64,
    pub reposts: u64,
    pub replies: u64,
    pub quotes: u64,
    pub bookmarks: u64,
}

impl EngagementTally {
    pub fn add(&mut self, delta: &EngagementDelta) {
        match delta.metric_kind {
            MetricKind::Likes | MetricKind::IndirectLikes => self.likes += delta.amount,
            MetricKind::Reposts | MetricKind::IndirectReposts => self.reposts += delta.amount,
            MetricKind::Replies | MetricKind::IndirectReplies => self.replies += delta.amount,
            MetricKind::Quotes => self.quotes += delta.amount,
            MetricKind::Bookmarks | MetricKind::IndirectBookmarks => self.bookmarks += delta.amount,
        }
    }

    pub fn accumulate(&mut self, other: &EngagementTally) {
        self.likes += other.likes;
        self.reposts += other.reposts;
        self.replies += other.replies;
        self.quotes += other.quotes;
        self.bookmarks += other.bookmarks;
    }

    pub fn total(&self) -> u64 {
        self.likes + self.reposts + self.replies + self.quotes + self.bookmarks
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementTimelinePoint {
    pub date: NaiveDate,
    pub daily: EngagementTally,
    pub cumulative: EngagementTally,
}

/// Reconciles every post in `observations` and returns the deltas that fall
/// inside `window`.
pub fn received_deltas(
    observations: &[EngagementObservation],
    window: &ReportWindow,
) -> Vec<EngagementDelta> {
    let mut by_post: BTreeMap<&str, Vec<EngagementObservation>> = BTreeMap::new();
    for observation in observations {
        by_post
            .entry(observation.post_uri.as_str())
            .or_default()
            .push(observation.clone());
    }

    let mut deltas = Vec::new();
    for (post_uri, mut history) in by_post {
        history.sort_by_key(|observation| observation.collection_date);
        log_regressions(post_uri, &history);
        deltas.extend(
            reconcile(post_uri, &history)
                .into_iter()
                .filter(|delta| window.contains_date(delta.period_date)),
        );
    }
    deltas
}

pub fn tally(deltas: &[EngagementDelta]) -> EngagementTally {
    let mut tally = EngagementTally::default();
    for delta in deltas {
        tally.add(delta);
    }
    tally
}

/// One point per day that received engagement, chronological, with running
/// totals from the start of the window.
pub fn timeline(deltas: &[EngagementDelta]) -> Vec<EngagementTimelinePoint> {
    let mut by_day: BTreeMap<NaiveDate, EngagementTally> = BTreeMap::new();
    for delta in deltas.iter().filter(|delta| delta.amount > 0) {
        by_day.entry(delta.period_date).or_default().add(delta);
    }

    let mut cumulative = EngagementTally::default();
    by_day
        .into_iter()
        .map(|(date, daily)| {
            cumulative.accumulate(&daily);
            EngagementTimelinePoint {
                date,
                daily,
                cumulative,
            }
        })
        .collect()
}

fn log_regressions(post_uri: &str, history: &[EngagementObservation]) {
    for pair in history.windows(2) {
        let (previous, current) = (&pair[0], &pair[1]);
        for kind in MetricKind::ALL {
            let before = previous.counts.get(kind);
            let after = current.counts.get(kind);
            if after < before {
                tracing::debug!(
                    post_uri,
                    metric = kind.as_str(),
                    date = %current.collection_date,
                    before,
                    after,
                    "engagement counter regressed; clamping delta to zero"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use skywatch_core::EngagementCounts;

    use super::*;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 7, day).expect("date")
    }

    fn observation(uri: &str, day: u32, likes: i64, indirect_likes: i64) -> EngagementObservation {
        EngagementObservation {
            collection_date: date(day),
            post_uri: uri.to_owned(),
            created_at: Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap(),
            text: String::new(),
            counts: EngagementCounts {
                likes,
                indirect_likes,
                ..EngagementCounts::default()
            },
        }
    }

    #[test]
    fn received_deltas_respect_window_and_fold_indirect() {
        let observations = vec![
            observation("at://did:plc:me/post/1", 2, 10, 0),
            observation("at://did:plc:me/post/1", 5, 14, 2),
            observation("at://did:plc:me/post/2", 5, 1, 0),
        ];

        let window = ReportWindow::new(date(5), 2);
        let deltas = received_deltas(&observations, &window);
        let tally = tally(&deltas);

        // post 1: +4 likes +2 indirect on day 5; post 2's first sighting lands on July 1
        assert_eq!(tally.likes, 6);
        assert_eq!(tally.total(), 6);

        let everything = received_deltas(&observations, &ReportWindow::new(date(5), 30));
        assert_eq!(super::tally(&everything).likes, 17);
    }

    #[test]
    fn timeline_accumulates_in_date_order() {
        let observations = vec![
            observation("at://did:plc:me/post/1", 3, 5, 0),
            observation("at://did:plc:me/post/1", 4, 8, 0),
        ];
        let deltas = received_deltas(&observations, &ReportWindow::new(date(4), 30));

        let points = timeline(&deltas);
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].date, date(1));
        assert_eq!(points[0].daily.likes, 5);
        assert_eq!(points[1].date, date(4));
        assert_eq!(points[1].daily.likes, 3);
        assert_eq!(points[1].cumulative.likes, 8);
    }
}
