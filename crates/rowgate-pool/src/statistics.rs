//! Pool statistics snapshots.

use serde::Serialize;

/// Size and usage at the moment of one checkout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PoolSample {
    /// Epoch milliseconds.
    pub timestamp: u64,
    pub size: usize,
    pub in_use: usize,
}

/// Statistics for one pool.
///
/// Rates and checkout times cover the period since the previous
/// `statistics` call; totals cover the period since creation or the last
/// reset.
#[derive(Clone, Debug, Serialize)]
pub struct PoolStatistics {
    pub username: String,
    pub timestamp: u64,
    pub creation_date: u64,
    pub reset_date: u64,
    pub enabled: bool,

    pub size: usize,
    pub available: usize,
    pub in_use: usize,

    pub created: u64,
    pub destroyed: u64,
    pub requests: u64,
    pub delayed_requests: u64,
    pub failed_requests: u64,

    pub requests_per_second: f64,
    pub delayed_requests_per_second: f64,
    pub failed_requests_per_second: f64,

    pub average_checkout_time_ms: f64,
    pub minimum_checkout_time_ms: f64,
    pub maximum_checkout_time_ms: f64,

    /// Samples newer than the requested `since`, oldest first.
    pub fine_grained: Vec<PoolSample>,
}
