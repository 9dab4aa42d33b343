//! Data-plane adapters
//!
//! Each storage kind implements [`DataPlane`]; callers only depend on the trait. The REST
//! adapters talk to the storage services directly; tests use an in-memory plane.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};

use crate::account::{AccountRef, ConnectionString, Kind};
use crate::credential::Credential;
use crate::error::{Error, TransferError};
use crate::model::{EntryDescriptor, EntryKey, Payload, ResourceDescriptor};

pub mod blob;
pub mod http;
#[cfg(test)]
pub mod memory;
pub mod queue;
pub mod share;
pub mod table;

pub type EntryStream = BoxStream<'static, Result<EntryDescriptor, TransferError>>;

#[async_trait]
pub trait DataPlane: Send + Sync {
    fn kind(&self) -> Kind;

    fn account(&self) -> &AccountRef;

    /// Lists resources, optionally only those whose name starts with `prefix`.
    async fn list_resources(
        &self,
        prefix: Option<&str>,
    ) -> Result<Vec<ResourceDescriptor>, TransferError>;

    /// Lazily lists the children of `resource`; every call starts a fresh listing.
    fn list_entries(&self, resource: &ResourceDescriptor) -> EntryStream;

    async fn resource_exists(&self, name: &str) -> Result<bool, TransferError>;

    async fn exists(&self, resource: &str, key: &EntryKey) -> Result<bool, TransferError>;

    /// Creates a resource named like `source`, carrying over its metadata.
    async fn create_resource(&self, source: &ResourceDescriptor) -> Result<(), TransferError>;

    async fn read_entry(
        &self,
        _resource: &str,
        entry: &EntryDescriptor,
    ) -> Result<Bytes, TransferError> {
        Err(TransferError::Unsupported(format!(
            "direct read of {} from {}",
            entry.key,
            self.kind()
        )))
    }

    /// Writes one entry; returns the number of payload bytes written.
    async fn write_entry(
        &self,
        _resource: &str,
        entry: &EntryDescriptor,
        _body: Option<Bytes>,
        _overwrite: bool,
    ) -> Result<u64, TransferError> {
        Err(TransferError::Unsupported(format!(
            "direct write of {} to {}",
            entry.key,
            self.kind()
        )))
    }

    /// Address of a resource or entry as understood by the bulk-copy tool.
    fn location(&self, resource: &str, key: Option<&EntryKey>) -> String;
}

/// Copies one entry between planes without the bulk-copy tool.
pub async fn copy_entry(
    source: &dyn DataPlane,
    destination: &dyn DataPlane,
    resource: &str,
    entry: &EntryDescriptor,
    overwrite: bool,
) -> Result<u64, TransferError> {
    let body = match (&entry.payload, &entry.key) {
        (_, EntryKey::Directory(_)) | (Payload::Entity(_), _) | (Payload::Messages(_), _) => None,
        (Payload::Remote, _) => Some(source.read_entry(resource, entry).await?),
    };
    destination
        .write_entry(resource, entry, body, overwrite)
        .await
}

/// Where a kind's resources live and how requests authenticate.
#[derive(Clone, Debug)]
pub enum Target {
    Account(AccountRef),
    ConnectionString(ConnectionString),
}

impl Target {
    pub fn account(&self) -> &AccountRef {
        match self {
            Target::Account(account) => account,
            Target::ConnectionString(connection) => &connection.account,
        }
    }

    pub fn needs_credential(&self) -> bool {
        matches!(self, Target::Account(_))
    }
}

/// Settings shared by every REST adapter.
#[derive(Clone, Debug)]
pub struct PlaneSettings {
    pub call_timeout: std::time::Duration,
    pub queue_visibility_timeout: std::time::Duration,
}

/// Builds the REST adapter for `target`.
pub fn connect(
    target: &Target,
    credential: Option<&Credential>,
    client: &reqwest::Client,
    settings: &PlaneSettings,
) -> Result<Arc<dyn DataPlane>, Error> {
    let account = target.account();
    let auth = match (target, credential) {
        (Target::ConnectionString(connection), _) => http::Auth::Sas(connection.sas().to_string()),
        (Target::Account(_), Some(credential)) => http::Auth::Bearer(credential.clone()),
        (Target::Account(_), None) => {
            return Err(Error::configuration(
                account.kind(),
                format!("no credential available for {account}"),
            ));
        }
    };
    let transport = http::Transport::new(client.clone(), auth, settings.call_timeout);
    let base = url::Url::parse(&account.endpoint()).map_err(|err| {
        Error::configuration(account.kind(), format!("invalid endpoint for {account}: {err}"))
    })?;
    let plane: Arc<dyn DataPlane> = match account.kind() {
        Kind::Blob => Arc::new(blob::BlobPlane::new(account.clone(), base, transport)),
        Kind::Queue => Arc::new(queue::QueuePlane::new(
            account.clone(),
            base,
            transport,
            settings.queue_visibility_timeout,
        )),
        Kind::Table => Arc::new(table::TablePlane::new(account.clone(), base, transport)),
        Kind::FileShare => Arc::new(share::SharePlane::new(
            account.clone(),
            base,
            transport.with_file_intent(),
        )),
    };
    Ok(plane)
}

/// Turns a marker-paginated listing into a stream of items.
///
/// `fetch` receives the continuation marker (none for the first page) and returns one page
/// plus the next marker; an empty or missing marker ends the listing.
pub(crate) fn paged<T, F, Fut>(fetch: F) -> BoxStream<'static, Result<T, TransferError>>
where
    T: Send + 'static,
    F: Fn(Option<String>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<(Vec<T>, Option<String>), TransferError>>
        + Send
        + 'static,
{
    futures::stream::try_unfold(Some(None), move |state: Option<Option<String>>| {
        let page = state.map(&fetch);
        async move {
            let Some(page) = page else {
                return Ok::<_, TransferError>(None);
            };
            let (items, next) = page.await?;
            let next = next.filter(|marker| !marker.is_empty());
            let state = next.map(Some);
            Ok(Some((
                futures::stream::iter(items.into_iter().map(Ok)),
                state,
            )))
        }
    })
    .try_flatten()
    .boxed()
}

/// Appends path segments to an endpoint, percent-encoding each one.
pub(crate) fn join_url(base: &url::Url, segments: &[&str]) -> Result<url::Url, TransferError> {
    let mut url = base.clone();
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|()| TransferError::InvalidName(format!("{base} cannot carry a path")))?;
        path.pop_if_empty();
        for segment in segments {
            path.extend(segment.split('/').filter(|part| !part.is_empty()));
        }
    }
    Ok(url)
}

pub(crate) fn parse_xml<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, TransferError> {
    let text = std::str::from_utf8(body)
        .map_err(|err| TransferError::Other(format!("listing is not UTF-8: {err}")))?;
    // some responses start with a byte order mark
    quick_xml::de::from_str(text.trim_start_matches('\u{feff}'))
        .map_err(|err| TransferError::Other(format!("unreadable listing: {err}")))
}

pub(crate) fn parse_last_modified(text: Option<&str>) -> Option<chrono::DateTime<chrono::Utc>> {
    text.and_then(|text| chrono::DateTime::parse_from_rfc2822(text).ok())
        .map(|time| time.with_timezone(&chrono::Utc))
}

/// Treats "not found" as a negative answer to an existence probe.
pub(crate) fn found<T>(result: Result<T, TransferError>) -> Result<bool, TransferError> {
    match result {
        Ok(_) => Ok(true),
        Err(TransferError::NotFound(_)) => Ok(false),
        Err(error) => Err(error),
    }
}
