// ABOUTME: Import command implementation
// ABOUTME: Loads shipped definitions and batches into the destination in phase order

use anyhow::{bail, Context, Result};
use dialoguer::{theme::ColorfulTheme, Confirm};
use std::sync::Arc;

use super::export::print_summary;
use crate::migration::{register_discovered, MigrationContext, PhaseScheduler, RunMode, RunSummary};

/// Import every unit found in the run directory
///
/// Progress is tracked in the run directory's import log, so an interrupted
/// import resumes at the first batch that was not yet loaded.
pub async fn import(ctx: Arc<MigrationContext>, skip_confirmation: bool) -> Result<RunSummary> {
    let destination = ctx.destination()?;
    let discovered = register_discovered(&ctx).await?;
    if discovered.is_empty() {
        bail!(
            "No exported units found in {}. Run `export` first or check the run directory.",
            ctx.layout.root().display()
        );
    }

    let pending = discovered
        .iter()
        .filter(|u| !ctx.store.is_complete(&u.name))
        .count();
    println!();
    println!(
        "Found {} unit(s) in {}, {} still to import into {}",
        discovered.len(),
        ctx.layout.root().display(),
        pending,
        destination.label()
    );

    if pending > 0 && !skip_confirmation {
        let confirmed = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt("Create objects and load data on the destination?")
            .default(false)
            .interact()
            .context("Failed to get confirmation")?;
        if !confirmed {
            bail!("Import cancelled by user");
        }
    }

    let names: Vec<_> = discovered.into_iter().map(|u| u.name).collect();
    let summary = PhaseScheduler::new(Arc::clone(&ctx), RunMode::Import)
        .run(&names)
        .await?;
    print_summary("Import", &summary);
    Ok(summary)
}
