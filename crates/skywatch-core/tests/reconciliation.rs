use std::error::Error;

use chrono::{NaiveDate, TimeZone, Utc};
use skywatch_core::{
    EngagementCounts, EngagementObservation, MetricKind, reconcile, total_by_kind,
};

const POST: &str = "at://did:plc:tracked/app.bsky.feed.post/3kxyz";

fn observe(date: NaiveDate, counts: EngagementCounts) -> EngagementObservation {
    EngagementObservation {
        collection_date: date,
        post_uri: POST.to_owned(),
        created_at: Utc
            .with_ymd_and_hms(2024, 2, 1, 9, 0, 0)
            .single()
            .unwrap_or_default(),
        text: "hello".to_owned(),
        counts,
    }
}

#[test]
fn single_observation_is_attributed_to_creation_date() -> Result<(), Box<dyn Error>> {
    let collected = NaiveDate::from_ymd_opt(2024, 2, 20).ok_or("date")?;
    let created = NaiveDate::from_ymd_opt(2024, 2, 1).ok_or("date")?;
    let counts = EngagementCounts {
        likes: 8,
        reposts: 2,
        replies: 1,
        bookmarks: 3,
        ..EngagementCounts::default()
    };

    let deltas = reconcile(POST, &[observe(collected, counts)]);

    assert_eq!(deltas.len(), MetricKind::ALL.len());
    assert!(deltas.iter().all(|delta| delta.period_date == created));
    let totals = total_by_kind(&deltas);
    assert_eq!(totals.get(&MetricKind::Likes), Some(&8));
    assert_eq!(totals.get(&MetricKind::Reposts), Some(&2));
    assert_eq!(totals.get(&MetricKind::Bookmarks), Some(&3));
    Ok(())
}

#[test]
fn every_metric_is_clamped_independently() -> Result<(), Box<dyn Error>> {
    let day1 = NaiveDate::from_ymd_opt(2024, 2, 10).ok_or("date")?;
    let day2 = NaiveDate::from_ymd_opt(2024, 2, 11).ok_or("date")?;

    let first = EngagementCounts {
        likes: 5,
        reposts: 4,
        quotes: 1,
        ..EngagementCounts::default()
    };
    let second = EngagementCounts {
        likes: 9,
        reposts: 1,
        quotes: 1,
        ..EngagementCounts::default()
    };

    let deltas = reconcile(POST, &[observe(day1, first), observe(day2, second)]);
    let on_day2: Vec<_> = deltas
        .iter()
        .filter(|delta| delta.period_date == day2)
        .collect();

    assert_eq!(on_day2.len(), MetricKind::ALL.len());
    for delta in on_day2 {
        let expected = match delta.metric_kind {
            MetricKind::Likes => 4,
            _ => 0,
        };
        assert_eq!(delta.amount, expected, "{:?}", delta.metric_kind);
    }
    Ok(())
}

#[test]
fn totals_never_exceed_the_highest_cumulative_value_seen() -> Result<(), Box<dyn Error>> {
    let series = [3_i64, 10, 2, 2, 11, 11, 0, 4];
    let observations = series
        .iter()
        .enumerate()
        .map(|(offset, likes)| {
            let date = NaiveDate::from_ymd_opt(2024, 3, 1 + offset as u32).ok_or("date")?;
            Ok(observe(
                date,
                EngagementCounts {
                    likes: *likes,
                    ..EngagementCounts::default()
                },
            ))
        })
        .collect::<Result<Vec<_>, Box<dyn Error>>>()?;

    let deltas = reconcile(POST, &observations);
    let likes = total_by_kind(&deltas)
        .get(&MetricKind::Likes)
        .copied()
        .unwrap_or_default();

    // 3 + 7 + 0 + 0 + 9 + 0 + 0 + 4
    assert_eq!(likes, 23);
    Ok(())
}
