// ABOUTME: Verify command implementation
// ABOUTME: Reconciles row counts (and optional checksums) between source and destination

use anyhow::Result;

use crate::migration::{self, MigrationContext, VerificationReport};

/// Compare every selected table on both sides and print the findings
pub async fn verify(ctx: &MigrationContext) -> Result<VerificationReport> {
    let report = migration::verify(ctx).await?;

    println!();
    println!("========================================");
    println!("Verification Results");
    println!("========================================");
    println!();
    println!("Matched tables: {}", report.matched.len());
    if report.is_clean() {
        println!("✓ All tables reconcile");
    } else {
        println!("Discrepancies: {}", report.findings.len());
        for finding in &report.findings {
            println!("  ✗ {}", finding);
        }
    }
    println!();
    Ok(report)
}
