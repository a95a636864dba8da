// ABOUTME: Capture and replay of users, roles, profiles, quotas, and grants
// ABOUTME: Replays principals before the grants that reference them

use anyhow::{anyhow, Context, Result};

use super::context::MigrationContext;
use super::exporter::{snapshot, write_kind_marker};
use super::layout::write_atomic;
use crate::checkpoint::{CheckpointEvent, FailureKind};
use crate::endpoint::{is_already_exists, AccessEntity, DatabaseEndpoint};
use crate::unit::QualifiedName;
use crate::utils::retry_with_backoff;

/// Render captured statements one per line
///
/// Access-control DDL is whitespace-insensitive, so embedded newlines are
/// folded into spaces to keep the file line-oriented.
fn render(statements: &[String]) -> String {
    let mut out = String::new();
    for statement in statements {
        let line = statement
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        let line = line.trim_end_matches(';');
        if line.is_empty() {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

fn parse(contents: &str) -> Vec<&str> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect()
}

/// Capture every access-control entity from the source
///
/// Entity kinds with nothing to migrate produce no file.
pub async fn export_bundle(
    ctx: &MigrationContext,
    source: &dyn DatabaseEndpoint,
    name: &QualifiedName,
) -> Result<()> {
    let unit = snapshot(ctx, name)?;
    let mut total = 0;
    for entity in AccessEntity::REPLAY_ORDER {
        let statements = retry_with_backoff(
            || source.access_entities(entity),
            ctx.config.max_retries,
            ctx.config.retry_delay,
        )
        .await
        .with_context(|| format!("Failed to capture {} definitions", entity))
        .context(FailureKind::AccessControlFailure)?;

        let rendered = render(&statements);
        let path = ctx.layout.absolute(&ctx.layout.access_control_file(entity));
        if rendered.is_empty() {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to remove {}", path.display()))
                }
            }
            continue;
        }
        total += statements.len();
        write_atomic(&path, rendered.as_bytes()).await?;
        tracing::debug!("Captured {} {} statement(s)", statements.len(), entity);
    }

    write_kind_marker(ctx, &unit).await?;
    ctx.store
        .record_event(
            name,
            CheckpointEvent::SchemaExported,
            format!("{} statement(s)", total),
        )
        .await?;
    tracing::info!("✓ Captured {} access-control statement(s)", total);
    Ok(())
}

/// Replay captured access control on the destination
///
/// Statements for entities that already exist are treated as applied. Any
/// other failure is logged and replay continues; the unit fails at the end
/// when at least one statement could not be applied.
pub async fn import_bundle(
    ctx: &MigrationContext,
    destination: &dyn DatabaseEndpoint,
    name: &QualifiedName,
) -> Result<()> {
    let mut applied = 0;
    let mut failures = Vec::new();

    for entity in AccessEntity::REPLAY_ORDER {
        ctx.check_cancelled()?;
        let path = ctx.layout.absolute(&ctx.layout.access_control_file(entity));
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read {}", path.display()))
                    .context(FailureKind::AccessControlFailure)
            }
        };

        for statement in parse(&contents) {
            match destination.execute(statement).await {
                Ok(()) => applied += 1,
                Err(e) if is_already_exists(&e) => {
                    tracing::debug!("{} already present on destination: {}", entity, statement);
                    applied += 1;
                }
                Err(e) => {
                    tracing::warn!("⚠ Failed to apply {} statement: {:#}", entity, e);
                    failures.push(format!("{}: {:#}", entity, e));
                }
            }
        }
    }

    if !failures.is_empty() {
        return Err(anyhow!(
            "{} access-control statement(s) failed, {} applied:\n  {}",
            failures.len(),
            applied,
            failures.join("\n  ")
        )
        .context(FailureKind::AccessControlFailure));
    }

    ctx.store
        .record_event(
            name,
            CheckpointEvent::Imported,
            format!("{} statement(s)", applied),
        )
        .await?;
    tracing::info!("✓ Replayed {} access-control statement(s)", applied);
    Ok(())
}
