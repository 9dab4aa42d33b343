//! Run-wide dispatch
//!
//! Kinds run side by side. Within a kind, resources are enumerated and replicated a few at a
//! time, so listing the next resource overlaps with executing the previous one's actions.
//! Within a resource, entry actions run in a bounded worker group, after the resource itself
//! (and, for file shares, the parent directories) exist at the destination.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::TryStreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, instrument};

use crate::account::Kind;
use crate::adapter::DataPlane;
use crate::enumerate::{Listing, ResourceEnumerator};
use crate::error::{Error, TransferError};
use crate::execute::TransferExecutor;
use crate::model::{ActionKind, ActionResult, EntryKey, Outcome, ResourceDescriptor, TransferAction};
use crate::plan::DiffPlanner;
use crate::report::{RunReport, Summary};
use crate::retry::RetryCoordinator;

const RUN_CANCELLED: &str = "run cancelled";
const PARENT_RESOURCE_MISSING: &str = "parent resource missing";
const PARENT_DIRECTORY_MISSING: &str = "parent directory missing";

#[derive(Copy, Clone, Debug)]
pub struct OrchestratorSettings {
    /// Entry actions of one resource executing at the same time.
    pub resource_workers: usize,
    /// Resources of one kind being replicated at the same time.
    pub max_parallel_resources: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            resource_workers: 16,
            max_parallel_resources: 4,
        }
    }
}

/// Everything needed to replicate one kind.
pub struct KindJob {
    pub source: Arc<dyn DataPlane>,
    pub destination: Arc<dyn DataPlane>,
    pub enumerator: ResourceEnumerator,
    pub planner: DiffPlanner,
    pub executor: Arc<TransferExecutor>,
    pub coordinator: RetryCoordinator,
}

impl KindJob {
    pub fn kind(&self) -> Kind {
        self.source.kind()
    }
}

struct Context {
    settings: OrchestratorSettings,
    cancel: CancellationToken,
    report: RunReport,
}

/// Tasks whose panics still leave a failed result in the report.
#[derive(Default)]
struct Workers {
    tasks: tokio::task::JoinSet<()>,
    owed: HashMap<tokio::task::Id, ActionResult>,
}

impl Workers {
    fn spawn<F>(&mut self, owed: ActionResult, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = self.tasks.spawn(task.in_current_span());
        self.owed.insert(handle.id(), owed);
    }

    async fn join(mut self, report: &RunReport) {
        while let Some(joined) = self.tasks.join_next().await {
            let Err(error) = joined else { continue };
            tracing::error!("worker failed: {error}");
            if let Some(owed) = self.owed.remove(&error.id()) {
                report.record(ActionResult {
                    outcome: Outcome::Failed(format!("worker failed: {error}")),
                    ..owed
                });
            }
        }
    }
}

fn unexecuted(action: &TransferAction, reason: &str) -> ActionResult {
    ActionResult::for_action(action, Outcome::Failed(reason.to_string()), 0)
}

fn entry_path(action: &TransferAction) -> Option<&str> {
    action.entry().and_then(|entry| entry.key.path())
}

fn under_missing_directory(missing: &[String], path: Option<&str>) -> bool {
    let Some(path) = path else { return false };
    missing.iter().any(|dir| {
        path.strip_prefix(dir.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    })
}

/// Replicates every job and returns the finalized summary.
///
/// `preflight` holds failures found before dispatch, such as misconfigured kinds.
pub async fn run(
    jobs: Vec<KindJob>,
    preflight: Vec<ActionResult>,
    settings: OrchestratorSettings,
    cancel: CancellationToken,
) -> Result<Summary, Error> {
    let context = Arc::new(Context {
        settings,
        cancel,
        report: RunReport::new(),
    });
    for result in preflight {
        context.report.record(result);
    }
    let mut workers = Workers::default();
    for job in jobs {
        let owed = ActionResult::kind_failure(job.kind(), job.source.account().to_string(), "");
        let context_clone = context.clone();
        workers.spawn(owed, replicate_kind(Arc::new(job), context_clone));
    }
    workers.join(&context.report).await;
    let context = Arc::into_inner(context).ok_or_else(|| {
        Error::Transfer(TransferError::Other(
            "run report is still shared after every worker finished".to_string(),
        ))
    })?;
    Ok(context.report.finalize())
}

#[instrument(skip_all, fields(kind = %job.kind()))]
async fn replicate_kind(job: Arc<KindJob>, context: Arc<Context>) {
    let kind = job.kind();
    let resources = match job.enumerator.list(job.source.as_ref()).await {
        Ok(resources) => resources,
        Err(error) => {
            tracing::error!("{error}");
            context.report.record(ActionResult::kind_failure(
                kind,
                job.source.account().to_string(),
                error.to_string(),
            ));
            return;
        }
    };
    let slots = Arc::new(tokio::sync::Semaphore::new(
        context.settings.max_parallel_resources.max(1),
    ));
    let mut workers = Workers::default();
    for resource in resources {
        let permit = tokio::select! {
            biased;
            () = context.cancel.cancelled() => None,
            permit = slots.clone().acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            context.report.record(ActionResult::kind_failure(
                kind,
                resource.name.clone(),
                RUN_CANCELLED,
            ));
            continue;
        };
        let owed = ActionResult::kind_failure(kind, resource.name.clone(), "");
        let job = job.clone();
        let context_clone = context.clone();
        workers.spawn(owed, async move {
            let _permit = permit;
            replicate_resource(job, resource, context_clone).await;
        });
    }
    workers.join(&context.report).await;
}

/// Destination keys of `listing`.
async fn collect_keys(listing: &Listing) -> Result<HashSet<EntryKey>, TransferError> {
    listing.stream().map_ok(|entry| entry.key).try_collect().await
}

/// One action per source entry; queue listings are drained once and reused.
async fn plan_entries(
    kind: Kind,
    planner: &DiffPlanner,
    listing: &Listing,
    destination: &HashSet<EntryKey>,
) -> Result<Vec<TransferAction>, TransferError> {
    let resource = listing.resource();
    if kind == Kind::Queue {
        let entries = listing.materialize().await?;
        return Ok(planner.plan(resource, entries.iter().cloned(), destination));
    }
    listing
        .stream()
        .map_ok(|entry| planner.plan_entry(resource, entry, destination))
        .try_collect()
        .await
}

#[instrument(skip_all, fields(kind = %resource.kind, resource = %resource.name))]
async fn replicate_resource(
    job: Arc<KindJob>,
    resource: Arc<ResourceDescriptor>,
    context: Arc<Context>,
) {
    let report = &context.report;
    let fail_resource = |reason: String| {
        tracing::error!("{reason}");
        report.record(ActionResult::kind_failure(
            resource.kind,
            resource.name.clone(),
            reason,
        ));
    };
    let enumeration_failure = |source: TransferError| {
        Error::Enumeration {
            resource: resource.to_string(),
            source,
        }
        .to_string()
    };
    let (exists, _) = job
        .coordinator
        .call("destination lookup", || {
            job.destination.resource_exists(&resource.name)
        })
        .await;
    let exists = match exists {
        Ok(exists) => exists,
        Err(error) => return fail_resource(enumeration_failure(error)),
    };
    // queues are never diffed, so their destination listing is not needed
    let destination_keys = if exists && resource.kind != Kind::Queue {
        let counterpart = Arc::new(resource.counterpart(job.destination.account()));
        let listing = job
            .enumerator
            .children(job.destination.clone(), counterpart, false);
        match job
            .coordinator
            .call("destination listing", || collect_keys(&listing))
            .await
        {
            (Ok(keys), _) => keys,
            (Err(error), _) => return fail_resource(enumeration_failure(error)),
        }
    } else {
        HashSet::new()
    };
    let listing = job.enumerator.children(
        job.source.clone(),
        resource.clone(),
        resource.kind == Kind::Queue,
    );
    let planned = match job
        .coordinator
        .call("source listing", || {
            plan_entries(resource.kind, &job.planner, &listing, &destination_keys)
        })
        .await
    {
        (Ok(planned), _) => planned,
        (Err(error), _) => {
            let reason = enumeration_failure(error);
            // received messages stay hidden on the source until their visibility timeout
            for action in job.planner.plan(&resource, listing.received().await, &destination_keys) {
                report.record(unexecuted(&action, &reason));
            }
            return fail_resource(reason);
        }
    };
    let create = job.planner.plan_resource(&resource, exists);
    tracing::info!(
        "planned {} entry action(s){}",
        planned.len(),
        if create.is_some() { " after creating the destination" } else { "" }
    );
    if context.cancel.is_cancelled() {
        for action in create.iter().chain(&planned) {
            report.record(unexecuted(action, RUN_CANCELLED));
        }
        return;
    }
    if let Some(create) = create {
        let result = job
            .coordinator
            .run(&create, || job.executor.attempt(&create))
            .await;
        let failed = result.outcome.is_failed();
        report.record(result);
        if failed {
            tracing::error!(
                "{resource} could not be created, failing {} dependent action(s)",
                planned.len()
            );
            for action in &planned {
                report.record(unexecuted(action, PARENT_RESOURCE_MISSING));
            }
            return;
        }
    }
    dispatch(&job, &resource, planned, &context).await;
}

/// Executes the entry actions of one resource.
async fn dispatch(
    job: &Arc<KindJob>,
    resource: &Arc<ResourceDescriptor>,
    actions: Vec<TransferAction>,
    context: &Arc<Context>,
) {
    let report = &context.report;
    let mut directories = Vec::new();
    let mut batch = Vec::new();
    let mut rest = Vec::new();
    for action in actions {
        let is_directory = action.entry().is_some_and(|entry| entry.key.is_directory());
        match action.kind() {
            ActionKind::Skip => report.record(job.executor.execute(&action).await),
            _ if is_directory => directories.push(action),
            ActionKind::Copy | ActionKind::Overwrite if resource.kind == Kind::Blob => {
                batch.push(action)
            }
            _ => rest.push(action),
        }
    }
    // parents first; the sort is stable so siblings keep listing order
    directories.sort_by_key(|action| entry_path(action).map_or(0, |path| path.matches('/').count()));
    let mut missing: Vec<String> = Vec::new();
    for action in directories {
        let path = entry_path(&action).unwrap_or_default().to_string();
        if context.cancel.is_cancelled() {
            report.record(unexecuted(&action, RUN_CANCELLED));
        } else if under_missing_directory(&missing, Some(path.as_str())) {
            report.record(unexecuted(&action, PARENT_DIRECTORY_MISSING));
            missing.push(path);
        } else {
            let result = job
                .coordinator
                .run(&action, || job.executor.attempt(&action))
                .await;
            if result.outcome.is_failed() {
                missing.push(path);
            }
            report.record(result);
        }
    }
    if !batch.is_empty() {
        copy_batch(job, resource, &batch, context).await;
    }
    let slots = Arc::new(tokio::sync::Semaphore::new(
        context.settings.resource_workers.max(1),
    ));
    let mut workers = Workers::default();
    for action in rest {
        if under_missing_directory(&missing, entry_path(&action)) {
            report.record(unexecuted(&action, PARENT_DIRECTORY_MISSING));
            continue;
        }
        let permit = tokio::select! {
            biased;
            () = context.cancel.cancelled() => None,
            permit = slots.clone().acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            report.record(unexecuted(&action, RUN_CANCELLED));
            continue;
        };
        let owed = unexecuted(&action, "");
        let job = job.clone();
        let context = context.clone();
        workers.spawn(owed, async move {
            let _permit = permit;
            let _in_flight = throttle::in_flight_permit().await;
            let _guard = common::get_progress().actions.guard();
            let result = job
                .coordinator
                .run(&action, || job.executor.attempt(&action))
                .await;
            context.report.record(result);
        });
    }
    workers.join(report).await;
}

/// Copies all blob actions of a container with one bulk invocation.
///
/// Blobs the tool skipped are reported as existing; when it cannot say which ones it skipped,
/// none of the batch is known to be copied. Bytes are attributed per blob up to the total the
/// tool reported.
async fn copy_batch(
    job: &KindJob,
    resource: &ResourceDescriptor,
    batch: &[TransferAction],
    context: &Context,
) {
    if context.cancel.is_cancelled() {
        for action in batch {
            context.report.record(unexecuted(action, RUN_CANCELLED));
        }
        return;
    }
    let _in_flight = throttle::in_flight_permit().await;
    let _guard = common::get_progress().actions.guard();
    let start = std::time::Instant::now();
    let what = format!("bulk copy of {resource}");
    let (result, attempts) = job
        .coordinator
        .call(&what, || job.executor.attempt_batch(resource, batch))
        .await;
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(error) => {
            tracing::error!("{what} failed after {attempts} attempt(s): {error}");
            for action in batch {
                context.report.record(
                    ActionResult::for_action(action, Outcome::Failed(error.to_string()), attempts)
                        .with_elapsed(start.elapsed()),
                );
            }
            return;
        }
    };
    if outcome.unnamed_skips > 0 {
        tracing::error!(
            "{what} skipped {} blob(s) it could not name, failing the unconfirmed ones",
            outcome.unnamed_skips
        );
    }
    let skipped: HashSet<&str> = outcome.skipped.iter().map(String::as_str).collect();
    let mut unattributed = outcome.bytes_transferred;
    for action in batch {
        let (result, bytes) = match entry_path(action) {
            Some(path) if skipped.contains(path) => (Outcome::SkippedExisting, 0),
            _ if outcome.unnamed_skips > 0 => (
                Outcome::Failed(format!(
                    "bulk copy finished with {} and skipped {} unnamed blob(s)",
                    outcome.exit_status, outcome.unnamed_skips
                )),
                0,
            ),
            _ => {
                let bytes = action.entry().map_or(0, |entry| entry.size).min(unattributed);
                unattributed -= bytes;
                (Outcome::Succeeded, bytes)
            }
        };
        context.report.record(
            ActionResult::for_action(action, result, attempts)
                .with_elapsed(start.elapsed())
                .with_bytes(bytes),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::memory::{MemoryBulk, MemoryPlane};
    use crate::credential::BulkLogin;
    use crate::execute::ExecutorSettings;
    use crate::report::RunStatus;
    use crate::retry::RetryPolicy;

    struct Fixture {
        source: Arc<MemoryPlane>,
        destination: Arc<MemoryPlane>,
        bulk: Arc<MemoryBulk>,
    }

    impl Fixture {
        fn new(kind: Kind) -> Self {
            let source = MemoryPlane::new("src", kind);
            let destination = MemoryPlane::new("dst", kind);
            let bulk = MemoryBulk::new(source.clone(), destination.clone());
            Self {
                source,
                destination,
                bulk,
            }
        }

        fn job(&self, overwrite: bool, cancel: &CancellationToken) -> KindJob {
            let executor = TransferExecutor::new(
                self.source.clone(),
                self.destination.clone(),
                self.bulk.clone(),
                BulkLogin::None,
                ExecutorSettings {
                    overwrite,
                    stream_copy_threshold: 1024,
                },
            );
            KindJob {
                source: self.source.clone(),
                destination: self.destination.clone(),
                enumerator: ResourceEnumerator::new(None),
                planner: DiffPlanner::new(overwrite),
                executor: Arc::new(executor),
                coordinator: RetryCoordinator::new(RetryPolicy::default(), cancel.clone()),
            }
        }
    }

    async fn replicate(jobs: Vec<KindJob>, cancel: CancellationToken) -> Summary {
        run(jobs, Vec::new(), OrchestratorSettings::default(), cancel)
            .await
            .unwrap()
    }

    fn path(name: &str) -> EntryKey {
        EntryKey::Path(name.to_string())
    }

    #[tokio::test]
    async fn copies_missing_blob_and_skips_existing() {
        let blobs = Fixture::new(Kind::Blob);
        blobs.source.add_file("photos", "a.txt", "old");
        blobs.source.add_file("photos", "b.txt", "bee");
        blobs.destination.add_file("photos", "a.txt", "kept");
        let cancel = CancellationToken::new();
        let summary = replicate(vec![blobs.job(false, &cancel)], cancel).await;
        let tally = summary.counts[Kind::Blob];
        assert_eq!((tally.succeeded, tally.skipped, tally.failed), (1, 1, 0));
        assert_eq!(summary.status().exit_code(), 0);
        assert_eq!(blobs.bulk.invocations(), 1);
        assert_eq!(blobs.bulk.jobs.lock().unwrap()[0].include, ["b.txt"]);
        assert_eq!(blobs.destination.body("photos", &path("a.txt")).unwrap(), "kept");
        assert_eq!(blobs.destination.body("photos", &path("b.txt")).unwrap(), "bee");
    }

    #[tokio::test]
    async fn blobs_skipped_by_the_tool_are_reported_as_existing() {
        let blobs = Fixture::new(Kind::Blob);
        blobs.source.add_file("photos", "a.txt", "aaa");
        blobs.source.add_file("photos", "b.txt", "bb");
        blobs.destination.add_resource("photos");
        blobs.bulk.race(&["b.txt"]);
        let cancel = CancellationToken::new();
        let summary = replicate(vec![blobs.job(false, &cancel)], cancel).await;
        let tally = summary.counts[Kind::Blob];
        assert_eq!((tally.succeeded, tally.skipped, tally.failed), (1, 1, 0));
        assert_eq!(summary.bytes_transferred, 3);
        assert_eq!(blobs.destination.body("photos", &path("b.txt")).unwrap(), "concurrent");
    }

    #[tokio::test]
    async fn unnamed_skips_leave_the_batch_unconfirmed() {
        let blobs = Fixture::new(Kind::Blob);
        blobs.source.add_file("photos", "a.txt", "aaa");
        blobs.source.add_file("photos", "b.txt", "bb");
        blobs.destination.add_resource("photos");
        blobs.bulk.race(&["b.txt"]);
        blobs.bulk.hide_skipped_names();
        let cancel = CancellationToken::new();
        let summary = replicate(vec![blobs.job(false, &cancel)], cancel).await;
        assert_eq!(summary.counts[Kind::Blob].failed, 2);
        assert_eq!(summary.bytes_transferred, 0);
        assert!(summary.failures[0].reason.contains("CompletedWithSkipped"));
        assert_eq!(summary.status(), RunStatus::Failure);
    }

    #[tokio::test]
    async fn second_run_creates_nothing() {
        let blobs = Fixture::new(Kind::Blob);
        blobs.source.add_file("photos", "a.txt", "a");
        blobs.source.add_file("photos", "b.txt", "b");
        let cancel = CancellationToken::new();
        let first = replicate(vec![blobs.job(false, &cancel)], cancel.clone()).await;
        assert_eq!(first.counts[Kind::Blob].succeeded, 3);
        let second = replicate(vec![blobs.job(false, &cancel)], cancel).await;
        let tally = second.counts[Kind::Blob];
        assert_eq!((tally.succeeded, tally.skipped, tally.failed), (0, 2, 0));
        assert_eq!(blobs.bulk.invocations(), 1);
    }

    #[tokio::test]
    async fn failed_table_creation_fails_its_entities() {
        let tables = Fixture::new(Kind::Table);
        tables.source.add_row("orders", "eu", "1");
        tables.source.add_row("orders", "eu", "2");
        tables
            .destination
            .fail_creates(TransferError::PermissionDenied("no role".into()));
        let cancel = CancellationToken::new();
        let summary = replicate(vec![tables.job(false, &cancel)], cancel).await;
        let tally = summary.counts[Kind::Table];
        assert_eq!((tally.succeeded, tally.skipped, tally.failed), (0, 0, 3));
        let orphaned: Vec<_> = summary
            .failures
            .iter()
            .filter(|failure| failure.reason == PARENT_RESOURCE_MISSING)
            .map(|failure| failure.entry.clone().unwrap())
            .collect();
        assert_eq!(orphaned, ["(eu, 1)", "(eu, 2)"]);
        assert_eq!(summary.status(), RunStatus::Failure);
        assert_eq!(tables.destination.writes.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_outage_is_a_partial_failure() {
        let blobs = Fixture::new(Kind::Blob);
        blobs.source.add_file("photos", "a.jpg", "jpeg");
        let queues = Fixture::new(Kind::Queue);
        queues.source.add_messages("orders", &["one", "two"]);
        queues
            .destination
            .fail_writes(TransferError::Network("connection reset".into()));
        let tables = Fixture::new(Kind::Table);
        tables.source.add_row("orders", "eu", "1");
        let shares = Fixture::new(Kind::FileShare);
        shares.source.add_file("docs", "readme.md", "hello");
        let cancel = CancellationToken::new();
        let jobs = vec![
            blobs.job(false, &cancel),
            queues.job(false, &cancel),
            tables.job(false, &cancel),
            shares.job(false, &cancel),
        ];
        let summary = replicate(jobs, cancel).await;
        for kind in [Kind::Blob, Kind::Table, Kind::FileShare] {
            assert_eq!(summary.counts[kind].failed, 0, "{kind}");
            assert!(summary.counts[kind].succeeded > 0, "{kind}");
        }
        assert_eq!(summary.counts[Kind::Queue].failed, 1);
        assert_eq!(
            summary.failures[0].reason,
            "network error: connection reset"
        );
        assert_eq!(
            queues.destination.writes.load(std::sync::atomic::Ordering::SeqCst),
            3
        );
        assert_eq!(summary.status(), RunStatus::PartialFailure);
        assert_eq!(summary.status().exit_code(), 1);
        assert!(tables.destination.has_resource("orders"));
        assert_eq!(shares.destination.body("docs", &path("readme.md")).unwrap(), "hello");
    }

    #[tokio::test(start_paused = true)]
    async fn interrupted_queue_listing_copies_every_message() {
        let queues = Fixture::new(Kind::Queue);
        queues.source.add_messages("orders", &["a1", "a2"]);
        queues.source.add_messages("orders", &["b1"]);
        queues.source.add_messages("orders", &["c1"]);
        queues.source.interrupt_listings(
            1,
            TransferError::Throttled {
                status: 503,
                message: "server busy".into(),
            },
            1,
        );
        let cancel = CancellationToken::new();
        let summary = replicate(vec![queues.job(false, &cancel)], cancel).await;
        let tally = summary.counts[Kind::Queue];
        assert_eq!((tally.succeeded, tally.skipped, tally.failed), (4, 0, 0));
        let mut copied = queues.destination.messages("orders");
        copied.sort();
        assert_eq!(copied, ["a1", "a2", "b1", "c1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn received_messages_fail_with_their_listing() {
        let queues = Fixture::new(Kind::Queue);
        queues.source.add_messages("orders", &["a1", "a2"]);
        queues.source.add_messages("orders", &["b1"]);
        queues
            .source
            .interrupt_listings(1, TransferError::Network("reset".into()), usize::MAX);
        let cancel = CancellationToken::new();
        let summary = replicate(vec![queues.job(false, &cancel)], cancel).await;
        // one batch per attempt is received before the listing breaks again
        let stranded: Vec<_> = summary
            .failures
            .iter()
            .filter_map(|failure| failure.entry.clone())
            .collect();
        assert_eq!(stranded, ["batch #0", "batch #1"]);
        assert!(summary.failures.iter().all(|failure| failure.reason.contains("reset")));
        assert_eq!(summary.counts[Kind::Queue].failed, 3);
        assert_eq!(summary.status(), RunStatus::Failure);
        assert!(!queues.destination.has_resource("orders"));
    }

    #[tokio::test]
    async fn share_directories_precede_their_files() {
        let shares = Fixture::new(Kind::FileShare);
        shares.source.add_file("docs", "a/b/c.txt", "deep");
        shares.source.add_directory("docs", "a/b");
        shares.source.add_directory("docs", "a");
        shares.source.add_file("docs", "top.txt", "top");
        shares.destination.add_resource("docs");
        let cancel = CancellationToken::new();
        let summary = replicate(vec![shares.job(false, &cancel)], cancel).await;
        assert_eq!(summary.status(), RunStatus::Success);
        assert_eq!(summary.counts[Kind::FileShare].succeeded, 4);
        assert_eq!(
            shares.destination.keys("docs"),
            [
                EntryKey::Path("a/b/c.txt".into()),
                EntryKey::Path("top.txt".into()),
                EntryKey::Directory("a".into()),
                EntryKey::Directory("a/b".into()),
            ]
        );
    }

    #[tokio::test]
    async fn failed_directory_fails_its_subtree() {
        let shares = Fixture::new(Kind::FileShare);
        shares.source.add_directory("docs", "a");
        shares.source.add_directory("docs", "a/b");
        shares.source.add_file("docs", "a/b/c.txt", "deep");
        shares.source.add_file("docs", "ab.txt", "sibling");
        shares.destination.add_resource("docs");
        shares
            .destination
            .fail_next_writes([TransferError::InvalidName("a".into())]);
        let cancel = CancellationToken::new();
        let summary = replicate(vec![shares.job(false, &cancel)], cancel).await;
        let tally = summary.counts[Kind::FileShare];
        assert_eq!((tally.succeeded, tally.failed), (1, 3));
        let orphaned: Vec<_> = summary
            .failures
            .iter()
            .filter(|failure| failure.reason == PARENT_DIRECTORY_MISSING)
            .map(|failure| failure.entry.clone().unwrap())
            .collect();
        assert_eq!(orphaned, ["a/b/", "a/b/c.txt"]);
        assert_eq!(shares.destination.keys("docs"), [EntryKey::Path("ab.txt".into())]);
    }

    #[tokio::test]
    async fn cancelled_run_records_every_action() {
        let blobs = Fixture::new(Kind::Blob);
        blobs.source.add_file("photos", "a.txt", "a");
        blobs.source.add_file("photos", "b.txt", "b");
        blobs.destination.add_resource("photos");
        let tables = Fixture::new(Kind::Table);
        tables.source.add_row("orders", "eu", "1");
        let cancel = CancellationToken::new();
        let jobs = vec![blobs.job(false, &cancel), tables.job(false, &cancel)];
        cancel.cancel();
        let summary = replicate(jobs, cancel).await;
        assert_eq!(summary.total().succeeded, 0);
        assert!(summary.total().failed > 0);
        assert!(
            summary
                .failures
                .iter()
                .all(|failure| failure.reason == RUN_CANCELLED)
        );
        assert_eq!(blobs.bulk.invocations(), 0);
        assert!(!tables.destination.has_resource("orders"));
    }

    #[tokio::test]
    async fn enumeration_failure_is_scoped_to_its_kind() {
        let blobs = Fixture::new(Kind::Blob);
        blobs.source.add_file("photos", "a.txt", "a");
        blobs
            .source
            .fail_list_resources(TransferError::PermissionDenied("list denied".into()));
        let tables = Fixture::new(Kind::Table);
        tables.source.add_row("orders", "eu", "1");
        let cancel = CancellationToken::new();
        let jobs = vec![blobs.job(false, &cancel), tables.job(false, &cancel)];
        let summary = replicate(jobs, cancel).await;
        assert_eq!(summary.counts[Kind::Blob].failed, 1);
        assert_eq!(summary.counts[Kind::Table].succeeded, 2);
        assert_eq!(summary.status(), RunStatus::PartialFailure);
    }

    #[tokio::test]
    async fn overwrite_replaces_table_entities() {
        let tables = Fixture::new(Kind::Table);
        tables.source.add_row("orders", "eu", "1");
        tables.destination.add_row("orders", "eu", "1");
        tables.destination.add_row("orders", "us", "9");
        let cancel = CancellationToken::new();
        let summary = replicate(vec![tables.job(true, &cancel)], cancel).await;
        let tally = summary.counts[Kind::Table];
        assert_eq!((tally.succeeded, tally.skipped, tally.failed), (1, 0, 0));
        assert_eq!(tables.destination.keys("orders").len(), 2);
    }

    #[tokio::test]
    async fn preflight_failures_are_reported() {
        let tables = Fixture::new(Kind::Table);
        tables.source.add_row("orders", "eu", "1");
        let cancel = CancellationToken::new();
        let summary = run(
            vec![tables.job(false, &cancel)],
            vec![ActionResult::kind_failure(
                Kind::Queue,
                "queue",
                "no destination account configured",
            )],
            OrchestratorSettings::default(),
            cancel,
        )
        .await
        .unwrap();
        assert_eq!(summary.counts[Kind::Queue].failed, 1);
        assert_eq!(summary.status(), RunStatus::PartialFailure);
    }
}
