// ABOUTME: Switchover readiness policy based on a configurable replication lag metric
// ABOUTME: Observes lag on the destination and compares it to the configured threshold

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;

use crate::clickhouse::tsv;
use crate::endpoint::DatabaseEndpoint;

/// What the lag threshold is measured in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LagMetric {
    /// Worst replica delay in seconds (`system.replicas.absolute_delay`)
    Seconds,
    /// Pending replication queue entries (`system.replication_queue`)
    QueueDepth,
}

impl LagMetric {
    fn query(self) -> &'static str {
        match self {
            LagMetric::Seconds => "SELECT max(absolute_delay) FROM system.replicas",
            LagMetric::QueueDepth => "SELECT count() FROM system.replication_queue",
        }
    }
}

impl fmt::Display for LagMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LagMetric::Seconds => f.write_str("seconds"),
            LagMetric::QueueDepth => f.write_str("queue entries"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchoverPolicy {
    pub metric: LagMetric,
    pub threshold: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchoverDecision {
    Proceed { observed: u64 },
    Wait { observed: u64 },
}

impl SwitchoverPolicy {
    pub fn new(metric: LagMetric, threshold: u64) -> Self {
        Self { metric, threshold }
    }

    pub fn evaluate(&self, observed: u64) -> SwitchoverDecision {
        if observed <= self.threshold {
            SwitchoverDecision::Proceed { observed }
        } else {
            SwitchoverDecision::Wait { observed }
        }
    }

    /// Measure the configured lag metric on `endpoint`
    ///
    /// An instance without replicated tables reports no lag.
    pub async fn observe(&self, endpoint: &dyn DatabaseEndpoint) -> Result<u64> {
        let rows = endpoint
            .query(self.metric.query())
            .await
            .with_context(|| format!("Failed to observe replication lag in {}", self.metric))?;
        Ok(rows
            .first()
            .and_then(|row| row.first())
            .and_then(|cell| tsv::parse_u64(cell))
            .unwrap_or(0))
    }
}
