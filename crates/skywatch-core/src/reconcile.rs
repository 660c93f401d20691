use std::collections::BTreeMap;

use crate::{EngagementDelta, EngagementObservation, MetricKind};

/// Turns cumulative per-post totals into per-period deltas.
///
/// The first observation of a post is attributed in full to the post's
/// creation date, which captures engagement accrued before tracking began.
/// Every later observation contributes `max(0, current - previous)` per
/// metric on its own collection date, so upstream regressions never produce
/// negative engagement.
///
/// Observations for other posts are ignored. Input order does not matter;
/// rows are processed by collection date.
pub fn reconcile(post_uri: &str, observations: &[EngagementObservation]) -> Vec<EngagementDelta> {
    let mut ordered: Vec<&EngagementObservation> = observations
        .iter()
        .filter(|observation| observation.post_uri == post_uri)
        .collect();
    ordered.sort_by_key(|observation| observation.collection_date);

    let mut deltas = Vec::with_capacity(ordered.len() * MetricKind::ALL.len());
    let mut previous: Option<&EngagementObservation> = None;

    for current in ordered {
        match previous {
            None => {
                let period_date = current.created_at.date_naive();
                for kind in MetricKind::ALL {
                    deltas.push(EngagementDelta {
                        period_date,
                        metric_kind: kind,
                        amount: non_negative(current.counts.get(kind)),
                    });
                }
            }
            Some(prior) => {
                for kind in MetricKind::ALL {
                    deltas.push(EngagementDelta {
                        period_date: current.collection_date,
                        metric_kind: kind,
                        amount: non_negative(current.counts.get(kind) - prior.counts.get(kind)),
                    });
                }
            }
        }
        previous = Some(current);
    }

    deltas
}

pub fn total_by_kind(deltas: &[EngagementDelta]) -> BTreeMap<MetricKind, u64> {
    let mut totals = BTreeMap::new();
    for delta in deltas {
        *totals.entry(delta.metric_kind).or_insert(0) += delta.amount;
    }
    totals
}

fn non_negative(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}
