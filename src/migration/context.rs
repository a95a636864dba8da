// ABOUTME: Shared state handed to every migration worker
// ABOUTME: Bundles config, checkpoint store, run layout, endpoints, transport, and cancellation

use anyhow::{Context, Result};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::layout::RunLayout;
use crate::checkpoint::CheckpointStore;
use crate::config::MigrationConfig;
use crate::endpoint::DatabaseEndpoint;
use crate::transport::Transport;

/// Marker error for work abandoned because the run was cancelled
///
/// Interrupted units are left in their last durable state rather than being
/// recorded as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("migration interrupted")
    }
}

impl std::error::Error for Interrupted {}

impl Interrupted {
    pub fn is(err: &anyhow::Error) -> bool {
        err.downcast_ref::<Interrupted>().is_some()
    }
}

pub struct MigrationContext {
    pub config: Arc<MigrationConfig>,
    pub store: Arc<CheckpointStore>,
    pub layout: RunLayout,
    pub source: Option<Arc<dyn DatabaseEndpoint>>,
    pub destination: Option<Arc<dyn DatabaseEndpoint>>,
    pub transport: Option<Arc<dyn Transport>>,
    pub cancel: CancellationToken,
}

impl MigrationContext {
    pub fn new(config: Arc<MigrationConfig>, store: Arc<CheckpointStore>, layout: RunLayout) -> Self {
        Self {
            config,
            store,
            layout,
            source: None,
            destination: None,
            transport: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_source(mut self, source: Arc<dyn DatabaseEndpoint>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_destination(mut self, destination: Arc<dyn DatabaseEndpoint>) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn source(&self) -> Result<&dyn DatabaseEndpoint> {
        self.source
            .as_deref()
            .context("This operation needs a source endpoint")
    }

    pub fn destination(&self) -> Result<&dyn DatabaseEndpoint> {
        self.destination
            .as_deref()
            .context("This operation needs a destination endpoint")
    }

    /// Import right after export when the destination is reachable from here
    pub fn is_direct(&self) -> bool {
        self.source.is_some() && self.destination.is_some()
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Interrupted.into());
        }
        Ok(())
    }
}
