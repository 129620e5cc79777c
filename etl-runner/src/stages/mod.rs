pub mod aggregation;
pub mod cleaning;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgPool;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StageError {
    #[error("{stage} stage query failed with: {error}")]
    Query {
        stage: &'static str,
        error: sqlx::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageName {
    Cleaning,
    Aggregation,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Cleaning => "cleaning",
            StageName::Aggregation => "aggregation",
        }
    }
}

/// The bounded time range a stage recomputes on each run. Stages upsert, so
/// overlapping windows across runs recompute rather than duplicate.
#[derive(Debug, Clone, Copy)]
pub struct RecomputeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl RecomputeWindow {
    pub fn covering_last(duration: Duration) -> Self {
        let end = Utc::now();
        Self {
            start: end - duration,
            end,
        }
    }
}

/// A stage transform reads one layer and upserts the next. Implementations
/// must be idempotent over a fixed window: re-running with the same inputs
/// produces identical derived rows.
#[async_trait]
pub trait StageTransform: Send + Sync {
    fn name(&self) -> StageName;

    /// Returns the number of derived rows written (inserted or updated).
    async fn run(&self, pool: &PgPool, window: &RecomputeWindow) -> Result<u64, StageError>;
}
