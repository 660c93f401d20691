mod aggregation;
mod classification;
mod detector;
mod engagement;
mod error;
mod pipeline;
pub mod telemetry;
mod verification;

pub use aggregation::{
    AdvancedMetrics, ChangeHistoryEntry, EngagementBalance, EngagementSide, GROWTH_SAMPLE,
    GraphAnalyzer, GraphStats, HiddenAnalytics, HiddenCategories, NetGrowthPoint, Overview,
    PostingDay, StatsSummary, TopInteractor, TopPost,
};
pub use classification::classify_day;
pub use detector::{ChangeDetector, ChangeSet, HistoryState};
pub use engagement::{EngagementTally, EngagementTimelinePoint, received_deltas, timeline};
pub use error::{AnalysisError, OracleError};
pub use pipeline::{CollectionBatch, CollectionPipeline, CollectionReport};
pub use verification::{RelationOracle, VerificationFilter, VerificationOutcome};
