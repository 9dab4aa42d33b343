//! Account-to-account replication for Azure Storage
//!
//! `azreplica` copies blob containers, queues, tables and file shares from a source storage
//! account to a destination account. Each run is a bounded, one-shot sweep: it lists what the
//! source has, compares it with the destination, and copies what is missing (or, with
//! overwrite enabled, replaces what exists). Nothing is ever deleted at the destination.
//!
//! # Flow
//!
//! 1. [`config::Settings::resolve`] checks which kinds can run; misconfigured kinds are
//!    reported as failures while the others proceed
//! 2. [`credential::CredentialBroker`] resolves one identity for the whole run, unless every
//!    target authenticates with a shared access signature
//! 3. for each kind, [`enumerate::ResourceEnumerator`] lists resources and their entries,
//!    [`plan::DiffPlanner`] turns them into [`model::TransferAction`]s and
//!    [`execute::TransferExecutor`] performs them under the [`retry::RetryCoordinator`]
//! 4. every action leaves an [`model::ActionResult`] in the [`report::RunReport`], whose
//!    [`report::Summary`] determines the exit code
//!
//! # Failure scoping
//!
//! Failures are contained at the narrowest scope: a failed action never stops its siblings,
//! a failed listing only affects its resource, and a misconfigured kind only affects
//! itself. Only authentication failure and having no runnable kind at all abort the run.
//!
//! # Bulk copies
//!
//! Blob containers and large share files are copied by `azcopy`, invoked once per container
//! with the list of blobs to copy. Queues, tables, directories and small files go through
//! the storage REST APIs directly.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

pub mod account;
pub mod adapter;
pub mod bulk;
pub mod config;
pub mod credential;
pub mod enumerate;
pub mod error;
pub mod execute;
pub mod model;
pub mod orchestrator;
pub mod plan;
pub mod report;
pub mod retry;

pub use account::Kind;
pub use config::Settings;
pub use error::{Error, TransferError};
pub use report::{FATAL_EXIT_CODE, RunStatus, Summary};

use adapter::Target;
use bulk::BulkCopy;
use credential::{BulkLogin, Credential, CredentialBroker};
use execute::{ExecutorSettings, TransferExecutor};
use model::ActionResult;
use orchestrator::KindJob;

/// How the bulk-copy tool authenticates for a pair of targets.
fn bulk_login(source: &Target, destination: &Target, credential: Option<&Credential>) -> BulkLogin {
    match credential {
        Some(credential) if source.needs_credential() || destination.needs_credential() => {
            credential.bulk_login()
        }
        _ => BulkLogin::None,
    }
}

/// Runs one replication sweep over every configured kind.
///
/// Returns `Err` only for failures that stop the run before any action executes.
pub async fn replicate(settings: &Settings, cancel: CancellationToken) -> Result<Summary, Error> {
    let resolved = settings.resolve()?;
    let client = reqwest::Client::builder()
        .user_agent(concat!("azreplica/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|error| Error::Configuration {
            kind: None,
            reason: format!("failed to build the HTTP client: {error}"),
        })?;
    let credential = if resolved.needs_credential() {
        let broker = CredentialBroker::from_settings(&settings.auth, &client);
        Some(broker.resolve().await?)
    } else {
        tracing::info!("every target uses a shared access signature, skipping credential resolution");
        None
    };
    let bulk: Arc<dyn BulkCopy> = Arc::new(bulk::AzCopy::new(&settings.azcopy));
    let plane_settings = settings.plane_settings();
    let mut preflight: Vec<ActionResult> = resolved
        .misconfigured
        .iter()
        .map(|(kind, error)| ActionResult::kind_failure(*kind, kind.to_string(), error.to_string()))
        .collect();
    let mut jobs = Vec::new();
    for plan in resolved.runnable {
        let planes = adapter::connect(&plan.source, credential.as_ref(), &client, &plane_settings)
            .and_then(|source| {
                let destination =
                    adapter::connect(&plan.destination, credential.as_ref(), &client, &plane_settings)?;
                Ok((source, destination))
            });
        let (source, destination) = match planes {
            Ok(planes) => planes,
            Err(error) => {
                tracing::error!("{error}");
                preflight.push(ActionResult::kind_failure(
                    plan.kind,
                    plan.kind.to_string(),
                    error.to_string(),
                ));
                continue;
            }
        };
        tracing::info!(
            "replicating {} from {} to {}",
            plan.kind,
            source.account(),
            destination.account()
        );
        let executor = TransferExecutor::new(
            source.clone(),
            destination.clone(),
            bulk.clone(),
            bulk_login(&plan.source, &plan.destination, credential.as_ref()),
            ExecutorSettings {
                overwrite: plan.overwrite,
                stream_copy_threshold: settings.stream_copy_threshold,
            },
        );
        jobs.push(KindJob {
            source,
            destination,
            enumerator: enumerate::ResourceEnumerator::new(plan.resource_name),
            planner: plan::DiffPlanner::new(plan.overwrite),
            executor: Arc::new(executor),
            coordinator: retry::RetryCoordinator::new(settings.retry, cancel.clone()),
        });
    }
    orchestrator::run(jobs, preflight, settings.orchestrator, cancel).await
}
