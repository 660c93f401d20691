use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use skywatch_config::VerificationConfig;
use skywatch_core::{ChangeEvent, Entity, VerificationStatus};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;

use crate::{AnalysisError, OracleError};

/// Live "does `candidate_did` still follow `authoritative_did`" check against
/// a source paginated independently of the snapshot listing.
#[async_trait]
pub trait RelationOracle: Send + Sync {
    async fn still_related(
        &self,
        candidate_did: &str,
        authoritative_did: &str,
    ) -> Result<bool, OracleError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VerificationOutcome {
    /// The oracle says the relation is gone.
    pub confirmed: Vec<Entity>,
    /// The oracle failed or timed out; kept as departures.
    pub fail_open: Vec<Entity>,
    /// No lookup was made.
    pub unchecked: Vec<Entity>,
    /// The oracle says the relation still holds; dropped.
    pub false_positives: Vec<Entity>,
}

impl VerificationOutcome {
    pub fn unchecked(candidates: Vec<Entity>) -> Self {
        Self {
            unchecked: candidates,
            ..Self::default()
        }
    }

    /// Every candidate that is recorded as departed, sorted by did.
    pub fn verified(&self) -> Vec<&Entity> {
        let mut verified: Vec<&Entity> = self
            .confirmed
            .iter()
            .chain(&self.fail_open)
            .chain(&self.unchecked)
            .collect();
        verified.sort_by(|a, b| a.did.cmp(&b.did));
        verified
    }

    pub fn departure_events(&self, date: NaiveDate) -> Vec<ChangeEvent> {
        let statuses = [
            (&self.confirmed, VerificationStatus::Verified),
            (&self.fail_open, VerificationStatus::FailOpen),
            (&self.unchecked, VerificationStatus::Unchecked),
        ];
        let mut events: Vec<ChangeEvent> = statuses
            .into_iter()
            .flat_map(|(entities, status)| {
                entities
                    .iter()
                    .map(move |entity| ChangeEvent::departed(date, entity, status))
            })
            .collect();
        events.sort_by(|a, b| a.did.cmp(&b.did));
        events
    }

    pub fn departed_count(&self) -> usize {
        self.confirmed.len() + self.fail_open.len() + self.unchecked.len()
    }
}

enum Verdict {
    StillRelated,
    Departed,
    Failed(String),
}

#[derive(Clone)]
pub struct VerificationFilter {
    oracle: Arc<dyn RelationOracle>,
    lookup_timeout: Duration,
    concurrency: usize,
}

impl VerificationFilter {
    pub fn new(oracle: Arc<dyn RelationOracle>, lookup_timeout: Duration, concurrency: usize) -> Self {
        Self {
            oracle,
            lookup_timeout,
            concurrency: concurrency.max(1),
        }
    }

    pub fn from_config(oracle: Arc<dyn RelationOracle>, config: &VerificationConfig) -> Self {
        Self::new(
            oracle,
            Duration::from_millis(config.timeout_ms),
            config.concurrency,
        )
    }

    /// One bounded lookup per candidate, at most `concurrency` in flight.
    /// Lookups that error or time out fail open.
    pub async fn confirm(
        &self,
        candidates: Vec<Entity>,
        authoritative_did: &str,
    ) -> Result<VerificationOutcome, AnalysisError> {
        let mut outcome = VerificationOutcome::default();
        if candidates.is_empty() {
            return Ok(outcome);
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut join_set = JoinSet::new();

        for candidate in candidates {
            let oracle = self.oracle.clone();
            let semaphore = semaphore.clone();
            let authoritative_did = authoritative_did.to_owned();
            let lookup_timeout = self.lookup_timeout;

            join_set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (candidate, Verdict::Failed("verification semaphore closed".to_owned()));
                    }
                };

                let lookup = timeout(
                    lookup_timeout,
                    oracle.still_related(&candidate.did, &authoritative_did),
                )
                .await;

                let verdict = match lookup {
                    Ok(Ok(true)) => Verdict::StillRelated,
                    Ok(Ok(false)) => Verdict::Departed,
                    Ok(Err(err)) => Verdict::Failed(err.to_string()),
                    Err(_) => Verdict::Failed(format!(
                        "timed out after {}ms",
                        lookup_timeout.as_millis()
                    )),
                };
                (candidate, verdict)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            let (candidate, verdict) = joined
                .map_err(|err| AnalysisError::Verification(format!("oracle task join error: {err}")))?;

            match verdict {
                Verdict::StillRelated => {
                    tracing::info!(
                        did = %candidate.did,
                        handle = %candidate.handle,
                        reason = "oracle reports relation still holds",
                        "dropping departure false positive"
                    );
                    outcome.false_positives.push(candidate);
                }
                Verdict::Departed => outcome.confirmed.push(candidate),
                Verdict::Failed(reason) => {
                    tracing::warn!(
                        did = %candidate.did,
                        handle = %candidate.handle,
                        error = %reason,
                        "oracle lookup failed; recording departure unverified"
                    );
                    outcome.fail_open.push(candidate);
                }
            }
        }

        for bucket in [
            &mut outcome.confirmed,
            &mut outcome.fail_open,
            &mut outcome.false_positives,
        ] {
            bucket.sort_by(|a, b| a.did.cmp(&b.did));
        }

        tracing::debug!(
            confirmed = outcome.confirmed.len(),
            fail_open = outcome.fail_open.len(),
            false_positives = outcome.false_positives.len(),
            "departure candidates verified"
        );
        Ok(outcome)
    }
}
