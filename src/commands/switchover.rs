// ABOUTME: Switchover-check command implementation
// ABOUTME: Reports whether destination replication lag is within the configured threshold

use anyhow::Result;

use crate::endpoint::DatabaseEndpoint;
use crate::switchover::{SwitchoverDecision, SwitchoverPolicy};

/// Measure lag on `destination` and decide whether traffic may switch over
pub async fn switchover_check(
    destination: &dyn DatabaseEndpoint,
    policy: &SwitchoverPolicy,
) -> Result<SwitchoverDecision> {
    let observed = policy.observe(destination).await?;
    let decision = policy.evaluate(observed);
    match decision {
        SwitchoverDecision::Proceed { observed } => tracing::info!(
            "✓ Replication lag {} {} is within threshold {}; ready for switchover",
            observed,
            policy.metric,
            policy.threshold
        ),
        SwitchoverDecision::Wait { observed } => tracing::warn!(
            "⚠ Replication lag {} {} exceeds threshold {}; not ready for switchover",
            observed,
            policy.metric,
            policy.threshold
        ),
    }
    Ok(decision)
}
