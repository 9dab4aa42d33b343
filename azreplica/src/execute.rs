//! Per-kind execution of planned actions
//!
//! One attempt at a time: retries belong to the [`RetryCoordinator`](crate::retry::RetryCoordinator).

use std::sync::Arc;

use tracing::instrument;

use crate::account::Kind;
use crate::adapter::{DataPlane, copy_entry};
use crate::bulk::{BulkCopy, BulkJob, BulkOutcome};
use crate::credential::BulkLogin;
use crate::error::TransferError;
use crate::model::{ActionKind, ActionResult, EntryKey, Outcome, ResourceDescriptor, TransferAction};
use crate::retry::Completion;

#[derive(Copy, Clone, Debug)]
pub struct ExecutorSettings {
    pub overwrite: bool,
    /// Files up to this size are streamed directly instead of using the bulk-copy tool.
    pub stream_copy_threshold: u64,
}

pub struct TransferExecutor {
    source: Arc<dyn DataPlane>,
    destination: Arc<dyn DataPlane>,
    bulk: Arc<dyn BulkCopy>,
    login: BulkLogin,
    settings: ExecutorSettings,
}

impl TransferExecutor {
    pub fn new(
        source: Arc<dyn DataPlane>,
        destination: Arc<dyn DataPlane>,
        bulk: Arc<dyn BulkCopy>,
        login: BulkLogin,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            source,
            destination,
            bulk,
            login,
            settings,
        }
    }

    pub fn kind(&self) -> Kind {
        self.source.kind()
    }

    fn bulk_job(&self, resource: &ResourceDescriptor, key: Option<&EntryKey>, include: Vec<String>) -> BulkJob {
        BulkJob {
            source: self.source.location(&resource.name, key),
            destination: self.destination.location(&resource.name, key),
            overwrite: self.settings.overwrite,
            include,
            login: self.login.clone(),
        }
    }

    /// Makes one attempt at `action`.
    #[instrument(skip_all, fields(action = %action))]
    pub async fn attempt(&self, action: &TransferAction) -> Result<Completion, TransferError> {
        let resource = action.resource();
        let Some(entry) = action.entry() else {
            return match action.kind() {
                ActionKind::Create => {
                    self.destination.create_resource(resource).await?;
                    common::get_progress().resources_created.inc();
                    Ok(Completion::succeeded(0))
                }
                _ => Ok(Completion::skipped()),
            };
        };
        match action.kind() {
            ActionKind::Skip => Ok(Completion::skipped()),
            ActionKind::Create => {
                copy_entry(self.source.as_ref(), self.destination.as_ref(), &resource.name, entry, false)
                    .await?;
                Ok(Completion::succeeded(0))
            }
            ActionKind::Copy | ActionKind::Overwrite => {
                let overwrite = action.kind() == ActionKind::Overwrite;
                let bytes = match self.kind() {
                    Kind::Blob => {
                        return Err(TransferError::Unsupported(format!(
                            "{action}: blobs are copied per container with attempt_batch"
                        )));
                    }
                    Kind::FileShare if entry.size > self.settings.stream_copy_threshold => {
                        let outcome = self
                            .bulk
                            .copy(&self.bulk_job(resource, Some(&entry.key), Vec::new()))
                            .await?;
                        if outcome.skipped_any() {
                            return Ok(Completion::skipped());
                        }
                        outcome.bytes_transferred
                    }
                    Kind::FileShare => {
                        // creating a file replaces it, so check first unless replacing is intended
                        if !overwrite && self.destination.exists(&resource.name, &entry.key).await? {
                            return Ok(Completion::skipped());
                        }
                        copy_entry(self.source.as_ref(), self.destination.as_ref(), &resource.name, entry, overwrite)
                            .await?
                    }
                    Kind::Queue | Kind::Table => {
                        copy_entry(self.source.as_ref(), self.destination.as_ref(), &resource.name, entry, overwrite)
                            .await?
                    }
                };
                Ok(Completion::succeeded(bytes))
            }
        }
    }

    /// Copies a whole batch of blob actions of one container with a single bulk invocation.
    #[instrument(skip_all, fields(container = %resource.name, blobs = actions.len()))]
    pub async fn attempt_batch(
        &self,
        resource: &ResourceDescriptor,
        actions: &[TransferAction],
    ) -> Result<BulkOutcome, TransferError> {
        let include = actions
            .iter()
            .filter_map(|action| action.entry().and_then(|entry| entry.key.path()))
            .map(str::to_string)
            .collect();
        let outcome = self.bulk.copy(&self.bulk_job(resource, None, include)).await?;
        tracing::info!(
            "bulk copy of {} finished with {} after {}",
            resource,
            outcome.exit_status,
            bytesize::ByteSize(outcome.bytes_transferred)
        );
        Ok(outcome)
    }

    /// Single attempt of `action`, reported as a result.
    pub async fn execute(&self, action: &TransferAction) -> ActionResult {
        let start = std::time::Instant::now();
        let (outcome, bytes) = match self.attempt(action).await {
            Ok(completion) => (completion.outcome, completion.bytes),
            Err(TransferError::AlreadyExists) => (Outcome::SkippedExisting, 0),
            Err(error) => (Outcome::Failed(error.to_string()), 0),
        };
        ActionResult::for_action(action, outcome, 1)
            .with_elapsed(start.elapsed())
            .with_bytes(bytes)
    }
}
