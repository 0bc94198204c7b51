//! Aggregate engine: rating and funding summaries.
//!
//! Summaries are always recomputed from the full set of raw rows, never
//! updated incrementally, so replaying an event cannot double-count.

use std::sync::Arc;

use chrono::Utc;

use crate::error::SyncError;
use crate::store::{FundingStore, RatingStore};
use crate::types::{Funding, FundingAggregate, Rating, RatingAggregate};

/// Summarize a project's ratings. Zero rows yield `{average: 0, count: 0}`.
pub fn summarize_ratings(on_chain_project_id: u64, ratings: &[Rating]) -> RatingAggregate {
    let count = ratings.len() as u64;
    let sum: u64 = ratings.iter().map(|r| u64::from(r.stars)).sum();
    let average = if count == 0 {
        0.0
    } else {
        sum as f64 / count as f64
    };
    RatingAggregate {
        on_chain_project_id,
        average,
        count,
        updated_at: Utc::now(),
    }
}

/// Summarize a project's donations. Overflowing `u128` is reported as
/// [`SyncError::Inconsistent`] rather than wrapped.
pub fn summarize_funding(
    on_chain_project_id: u64,
    fundings: &[Funding],
    token_decimals: u8,
) -> Result<FundingAggregate, SyncError> {
    let total_base_units = fundings.iter().try_fold(0u128, |acc, f| {
        acc.checked_add(f.amount).ok_or_else(|| {
            SyncError::Inconsistent(format!(
                "funding total overflow for project {on_chain_project_id}"
            ))
        })
    })?;
    Ok(FundingAggregate {
        on_chain_project_id,
        total_base_units,
        total: to_display_units(total_base_units, token_decimals),
        count: fundings.len() as u64,
        updated_at: Utc::now(),
    })
}

/// Convert base units to display units (`amount / 10^decimals`).
pub fn to_display_units(amount: u128, decimals: u8) -> f64 {
    match 10u128.checked_pow(u32::from(decimals)) {
        Some(scale) => {
            let whole = amount / scale;
            let frac = amount % scale;
            whole as f64 + frac as f64 / scale as f64
        }
        None => amount as f64 / 10f64.powi(i32::from(decimals)),
    }
}

/// Recomputes and persists aggregate rows.
pub struct AggregateEngine<S> {
    store: Arc<S>,
    token_decimals: u8,
}

impl<S> Clone for AggregateEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            token_decimals: self.token_decimals,
        }
    }
}

impl<S> AggregateEngine<S>
where
    S: RatingStore + FundingStore,
{
    pub fn new(store: Arc<S>, token_decimals: u8) -> Self {
        Self {
            store,
            token_decimals,
        }
    }

    pub async fn recompute_ratings(&self, on_chain_id: u64) -> Result<RatingAggregate, SyncError> {
        let rows = self.store.ratings_for(on_chain_id).await?;
        let aggregate = summarize_ratings(on_chain_id, &rows);
        self.store.upsert_rating_aggregate(&aggregate).await?;
        tracing::debug!(
            project = on_chain_id,
            average = aggregate.average,
            count = aggregate.count,
            "Rating aggregate recomputed"
        );
        Ok(aggregate)
    }

    pub async fn recompute_funding(
        &self,
        on_chain_id: u64,
    ) -> Result<FundingAggregate, SyncError> {
        let rows = self.store.fundings_for(on_chain_id).await?;
        let aggregate = summarize_funding(on_chain_id, &rows, self.token_decimals)?;
        self.store.upsert_funding_aggregate(&aggregate).await?;
        tracing::debug!(
            project = on_chain_id,
            total = aggregate.total,
            count = aggregate.count,
            "Funding aggregate recomputed"
        );
        Ok(aggregate)
    }
}
