//! Transport selection by estimated cost
//!
//! Pure functions comparing the row-limited transport (cheap calls, one page
//! of records per call) against the bulk transport (expensive job setup, cheap
//! records). The constants come from [`EngineConfig`].

use std::time::Duration;

use crate::config::{EngineConfig, PollingConfig};

/// Outcome of [`suggest_query_engine`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryEngineChoice {
    /// Nothing to fetch; no call is needed
    pub skip: bool,
    pub use_bulk: bool,
    /// Fetch the whole entity once instead of the filtered subset queries
    pub query_all: bool,
}

/// Outcome of [`suggest_update_engine`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateEngineChoice {
    pub use_bulk: bool,
}

/// Bulk job polling cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

fn div_ceil(value: u64, divisor: u64) -> u64 {
    value.div_ceil(divisor.max(1))
}

/// Choose how to fetch `subset_count` of `total_count` records that would be
/// requested through `num_subset_queries` filtered queries.
pub fn suggest_query_engine(
    total_count: u64,
    subset_count: u64,
    num_subset_queries: u64,
    config: &EngineConfig,
) -> QueryEngineChoice {
    if total_count == 0 {
        return QueryEngineChoice {
            skip: true,
            ..Default::default()
        };
    }

    let queries = num_subset_queries.max(1);
    let subset = subset_count.min(total_count);
    let page = config.rest_query_page_size;

    let irrelevant = (total_count - subset) as f64 / total_count as f64;
    let penalty = config.irrelevant_records_penalty * irrelevant;

    let rest_subset = queries.max(div_ceil(subset, page)) as f64 * config.rest_query_call_cost
        + subset as f64 * config.rest_query_record_cost;
    let bulk_subset =
        queries as f64 * config.bulk_query_call_cost + subset as f64 * config.bulk_query_record_cost;
    let rest_all = div_ceil(total_count, page).max(1) as f64 * config.rest_query_call_cost
        + total_count as f64 * config.rest_query_record_cost
        + penalty;
    let bulk_all = config.bulk_query_call_cost
        + total_count as f64 * config.bulk_query_record_cost
        + penalty;

    let candidates = [
        (rest_subset, false, false),
        (bulk_subset, true, false),
        (rest_all, false, true),
        (bulk_all, true, true),
    ];

    let mut best = candidates[0];
    for candidate in &candidates[1..] {
        if candidate.0 < best.0 {
            best = *candidate;
        }
    }

    QueryEngineChoice {
        skip: false,
        use_bulk: best.1,
        query_all: best.2,
    }
}

/// Choose the transport for writing `total_count` records.
pub fn suggest_update_engine(total_count: u64, config: &EngineConfig) -> UpdateEngineChoice {
    if total_count == 0 {
        return UpdateEngineChoice::default();
    }

    let rest = div_ceil(total_count, config.rest_update_batch_size) as f64 * config.rest_update_call_cost
        + total_count as f64 * config.rest_update_record_cost;
    let bulk = div_ceil(total_count, config.bulk_update_batch_size) as f64 * config.bulk_update_call_cost
        + total_count as f64 * config.bulk_update_record_cost;

    UpdateEngineChoice {
        use_bulk: bulk < rest,
    }
}

/// Scale the poll interval and timeout with the expected job volume.
pub fn suggest_polling_settings(record_count: u64, config: &PollingConfig) -> PollingSettings {
    let factor = div_ceil(record_count, config.scale_factor).max(1);
    let interval = config
        .base_interval_ms
        .saturating_mul(factor)
        .min(config.max_interval_ms);

    PollingSettings {
        interval: Duration::from_millis(interval),
        timeout: Duration::from_millis(config.base_timeout_ms.saturating_mul(factor)),
    }
}
