//! In-memory data plane and bulk-copy fake with fault injection.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use super::{DataPlane, EntryStream};
use crate::account::{AccountRef, Kind};
use crate::bulk::{BulkCopy, BulkJob, BulkOutcome};
use crate::error::TransferError;
use crate::model::{EntryDescriptor, EntryKey, Payload, ResourceDescriptor, Side};

#[derive(Clone, Debug, Default)]
pub struct MemoryResource {
    pub metadata: BTreeMap<String, String>,
    pub entries: BTreeMap<EntryKey, (EntryDescriptor, Bytes)>,
}

#[derive(Debug, Default)]
struct Faults {
    list_resources: Option<TransferError>,
    list_entries: Option<TransferError>,
    /// Listings that fail after yielding this many entries, and how many more times.
    interrupt: Option<(usize, TransferError, usize)>,
    create_resource: Option<TransferError>,
    /// Returned by the next writes, one per call.
    queued_writes: VecDeque<TransferError>,
    /// Returned by every write once the queue is empty.
    writes: Option<TransferError>,
}

pub struct MemoryPlane {
    account: AccountRef,
    resources: Mutex<BTreeMap<String, MemoryResource>>,
    faults: Mutex<Faults>,
    /// Queue batches already received, hidden from later listings.
    received: Mutex<HashSet<(String, EntryKey)>>,
    pub writes: AtomicUsize,
    pub listings: AtomicUsize,
}

impl MemoryPlane {
    pub fn new(account: &str, kind: Kind) -> Arc<Self> {
        Arc::new(Self {
            account: AccountRef::parse(account, kind).unwrap(),
            resources: Mutex::new(BTreeMap::new()),
            faults: Mutex::new(Faults::default()),
            received: Mutex::new(HashSet::new()),
            writes: AtomicUsize::new(0),
            listings: AtomicUsize::new(0),
        })
    }

    pub fn add_resource(&self, name: &str) {
        self.resources
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default();
    }

    fn insert(&self, resource: &str, entry: EntryDescriptor, body: Bytes) {
        self.resources
            .lock()
            .unwrap()
            .entry(resource.to_string())
            .or_default()
            .entries
            .insert(entry.key.clone(), (entry, body));
    }

    pub fn add_file(&self, resource: &str, path: &str, body: &str) {
        let body = Bytes::from(body.to_string());
        self.insert(resource, EntryDescriptor::file(path, body.len() as u64), body);
    }

    pub fn add_directory(&self, resource: &str, path: &str) {
        self.insert(resource, EntryDescriptor::directory(path), Bytes::new());
    }

    pub fn add_row(&self, resource: &str, partition_key: &str, row_key: &str) {
        let properties = serde_json::json!({
            "PartitionKey": partition_key,
            "RowKey": row_key,
            "Value": format!("{partition_key}-{row_key}"),
        });
        let serde_json::Value::Object(properties) = properties else {
            unreachable!()
        };
        self.insert(
            resource,
            EntryDescriptor::row(partition_key, row_key, properties),
            Bytes::new(),
        );
    }

    pub fn add_messages(&self, resource: &str, texts: &[&str]) {
        let mut resources = self.resources.lock().unwrap();
        let queue = resources.entry(resource.to_string()).or_default();
        let index = queue.entries.len() as u64;
        let entry = EntryDescriptor::batch(index, texts.iter().map(|t| t.to_string()).collect());
        queue.entries.insert(entry.key.clone(), (entry, Bytes::new()));
    }

    pub fn has_resource(&self, name: &str) -> bool {
        self.resources.lock().unwrap().contains_key(name)
    }

    pub fn keys(&self, resource: &str) -> Vec<EntryKey> {
        self.resources
            .lock()
            .unwrap()
            .get(resource)
            .map(|r| r.entries.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn body(&self, resource: &str, key: &EntryKey) -> Option<Bytes> {
        self.resources
            .lock()
            .unwrap()
            .get(resource)
            .and_then(|r| r.entries.get(key).map(|(_, body)| body.clone()))
    }

    pub fn metadata(&self, resource: &str) -> BTreeMap<String, String> {
        self.resources
            .lock()
            .unwrap()
            .get(resource)
            .map(|r| r.metadata.clone())
            .unwrap_or_default()
    }

    pub fn set_metadata(&self, resource: &str, key: &str, value: &str) {
        self.resources
            .lock()
            .unwrap()
            .entry(resource.to_string())
            .or_default()
            .metadata
            .insert(key.to_string(), value.to_string());
    }

    /// All message texts of a queue, in batch order.
    pub fn messages(&self, resource: &str) -> Vec<String> {
        self.resources
            .lock()
            .unwrap()
            .get(resource)
            .map(|r| {
                r.entries
                    .values()
                    .flat_map(|(entry, _)| match &entry.payload {
                        Payload::Messages(texts) => texts.clone(),
                        _ => Vec::new(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn fail_list_resources(&self, error: TransferError) {
        self.faults.lock().unwrap().list_resources = Some(error);
    }

    pub fn fail_list_entries(&self, error: TransferError) {
        self.faults.lock().unwrap().list_entries = Some(error);
    }

    /// The next `times` listings fail after `after` entries.
    pub fn interrupt_listings(&self, after: usize, error: TransferError, times: usize) {
        self.faults.lock().unwrap().interrupt = Some((after, error, times));
    }

    pub fn fail_creates(&self, error: TransferError) {
        self.faults.lock().unwrap().create_resource = Some(error);
    }

    pub fn fail_next_writes(&self, errors: impl IntoIterator<Item = TransferError>) {
        self.faults.lock().unwrap().queued_writes.extend(errors);
    }

    pub fn fail_writes(&self, error: TransferError) {
        self.faults.lock().unwrap().writes = Some(error);
    }

    fn write_fault(&self) -> Option<TransferError> {
        let mut faults = self.faults.lock().unwrap();
        faults.queued_writes.pop_front().or_else(|| faults.writes.clone())
    }

    /// Copies `key` from `source` the way a server-side copy would; `None` when skipped.
    pub fn copy_from(
        &self,
        source: &MemoryPlane,
        resource: &str,
        key: &EntryKey,
        overwrite: bool,
    ) -> Result<Option<u64>, TransferError> {
        let (entry, body) = source
            .resources
            .lock()
            .unwrap()
            .get(resource)
            .and_then(|r| r.entries.get(key).cloned())
            .ok_or_else(|| TransferError::NotFound(format!("{resource}/{key}")))?;
        let mut resources = self.resources.lock().unwrap();
        let target = resources
            .get_mut(resource)
            .ok_or_else(|| TransferError::NotFound(resource.to_string()))?;
        if target.entries.contains_key(key) && !overwrite {
            return Ok(None);
        }
        let size = body.len() as u64;
        target.entries.insert(key.clone(), (entry, body));
        Ok(Some(size))
    }
}

#[async_trait]
impl DataPlane for MemoryPlane {
    fn kind(&self) -> Kind {
        self.account.kind()
    }

    fn account(&self) -> &AccountRef {
        &self.account
    }

    async fn list_resources(
        &self,
        prefix: Option<&str>,
    ) -> Result<Vec<ResourceDescriptor>, TransferError> {
        if let Some(error) = self.faults.lock().unwrap().list_resources.clone() {
            return Err(error);
        }
        Ok(self
            .resources
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| prefix.is_none_or(|prefix| name.starts_with(prefix)))
            .map(|(name, resource)| ResourceDescriptor {
                metadata: resource.metadata.clone(),
                ..ResourceDescriptor::new(&self.account, Side::Source, name.clone())
            })
            .collect())
    }

    fn list_entries(&self, resource: &ResourceDescriptor) -> EntryStream {
        self.listings.fetch_add(1, Ordering::SeqCst);
        let mut faults = self.faults.lock().unwrap();
        if let Some(error) = faults.list_entries.clone() {
            return futures::stream::once(async move { Err(error) }).boxed();
        }
        let interrupt = match &mut faults.interrupt {
            Some((after, error, times)) if *times > 0 => {
                *times -= 1;
                Some((*after, error.clone()))
            }
            _ => None,
        };
        drop(faults);
        let mut received = self.received.lock().unwrap();
        let mut entries: Vec<_> = self
            .resources
            .lock()
            .unwrap()
            .get(&resource.name)
            .map(|r| r.entries.values().map(|(entry, _)| entry.clone()).collect())
            .unwrap_or_default();
        if self.kind() == Kind::Queue {
            entries.retain(|entry| !received.contains(&(resource.name.clone(), entry.key.clone())));
        }
        let failure = interrupt.map(|(after, error)| {
            entries.truncate(after);
            error
        });
        if self.kind() == Kind::Queue {
            received.extend(entries.iter().map(|entry| (resource.name.clone(), entry.key.clone())));
        }
        futures::stream::iter(entries.into_iter().map(Ok))
            .chain(futures::stream::iter(failure.map(Err)))
            .boxed()
    }

    async fn resource_exists(&self, name: &str) -> Result<bool, TransferError> {
        Ok(self.has_resource(name))
    }

    async fn exists(&self, resource: &str, key: &EntryKey) -> Result<bool, TransferError> {
        Ok(self.keys(resource).contains(key))
    }

    async fn create_resource(&self, source: &ResourceDescriptor) -> Result<(), TransferError> {
        if let Some(error) = self.faults.lock().unwrap().create_resource.clone() {
            return Err(error);
        }
        let mut resources = self.resources.lock().unwrap();
        if resources.contains_key(&source.name) {
            return Err(TransferError::AlreadyExists);
        }
        resources.insert(
            source.name.clone(),
            MemoryResource {
                metadata: source.metadata.clone(),
                entries: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn read_entry(
        &self,
        resource: &str,
        entry: &EntryDescriptor,
    ) -> Result<Bytes, TransferError> {
        self.body(resource, &entry.key)
            .ok_or_else(|| TransferError::NotFound(format!("{resource}/{}", entry.key)))
    }

    async fn write_entry(
        &self,
        resource: &str,
        entry: &EntryDescriptor,
        body: Option<Bytes>,
        overwrite: bool,
    ) -> Result<u64, TransferError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if let Some(error) = self.write_fault() {
            return Err(error);
        }
        let mut resources = self.resources.lock().unwrap();
        let target = resources
            .get_mut(resource)
            .ok_or_else(|| TransferError::NotFound(resource.to_string()))?;
        let key = match &entry.key {
            EntryKey::Batch(_) => EntryKey::Batch(target.entries.len() as u64),
            key => key.clone(),
        };
        let exists = target.entries.contains_key(&key);
        if exists && (key.is_directory() || !overwrite) {
            return Err(TransferError::AlreadyExists);
        }
        let body = body.unwrap_or_default();
        let written = match &entry.payload {
            Payload::Remote => body.len() as u64,
            _ => entry.size,
        };
        let stored = EntryDescriptor {
            key: key.clone(),
            ..entry.clone()
        };
        target.entries.insert(key, (stored, body));
        Ok(written)
    }

    fn location(&self, resource: &str, key: Option<&EntryKey>) -> String {
        match key.and_then(EntryKey::path) {
            Some(path) => format!("memory://{}/{resource}/{path}", self.account.name()),
            None => format!("memory://{}/{resource}", self.account.name()),
        }
    }
}

/// Bulk copy between two memory planes.
pub struct MemoryBulk {
    source: Arc<MemoryPlane>,
    destination: Arc<MemoryPlane>,
    failures: Mutex<VecDeque<TransferError>>,
    /// Paths a concurrent writer creates at the destination just before the next copy.
    racing: Mutex<Vec<String>>,
    /// Report skips as a count only.
    anonymous_skips: std::sync::atomic::AtomicBool,
    pub jobs: Mutex<Vec<BulkJob>>,
}

impl MemoryBulk {
    pub fn new(source: Arc<MemoryPlane>, destination: Arc<MemoryPlane>) -> Arc<Self> {
        Arc::new(Self {
            source,
            destination,
            failures: Mutex::new(VecDeque::new()),
            racing: Mutex::new(Vec::new()),
            anonymous_skips: std::sync::atomic::AtomicBool::new(false),
            jobs: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_next(&self, errors: impl IntoIterator<Item = TransferError>) {
        self.failures.lock().unwrap().extend(errors);
    }

    pub fn race(&self, paths: &[&str]) {
        self.racing
            .lock()
            .unwrap()
            .extend(paths.iter().map(|path| path.to_string()));
    }

    pub fn hide_skipped_names(&self) {
        self.anonymous_skips.store(true, Ordering::SeqCst);
    }

    pub fn invocations(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }
}

#[async_trait]
impl BulkCopy for MemoryBulk {
    async fn copy(&self, job: &BulkJob) -> Result<BulkOutcome, TransferError> {
        self.jobs.lock().unwrap().push(job.clone());
        tokio::task::yield_now().await;
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        let prefix = format!("memory://{}/", self.source.account().name());
        let location = job
            .source
            .strip_prefix(&prefix)
            .ok_or_else(|| TransferError::Other(format!("foreign location {}", job.source)))?;
        let (resource, single) = match location.split_once('/') {
            Some((resource, path)) => (resource, Some(path)),
            None => (location, None),
        };
        let paths: Vec<String> = match single {
            Some(path) => vec![path.to_string()],
            None if job.include.is_empty() => self
                .source
                .keys(resource)
                .into_iter()
                .filter_map(|key| match key {
                    EntryKey::Path(path) => Some(path),
                    _ => None,
                })
                .collect(),
            None => job.include.clone(),
        };
        for path in self.racing.lock().unwrap().drain(..) {
            self.destination.add_file(resource, &path, "concurrent");
        }
        let mut outcome = BulkOutcome {
            exit_status: "Completed".to_string(),
            ..BulkOutcome::default()
        };
        for path in paths {
            let key = EntryKey::Path(path.clone());
            match self.destination.copy_from(&self.source, resource, &key, job.overwrite)? {
                Some(bytes) => outcome.bytes_transferred += bytes,
                None if self.anonymous_skips.load(Ordering::SeqCst) => outcome.unnamed_skips += 1,
                None => outcome.skipped.push(path),
            }
        }
        if outcome.skipped_any() {
            outcome.exit_status = "CompletedWithSkipped".to_string();
        }
        Ok(outcome)
    }
}
