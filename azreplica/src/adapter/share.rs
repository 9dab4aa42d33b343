use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use reqwest::Method;
use serde::Deserialize;

use super::http::{Call, Transport, append_sas};
use super::{
    DataPlane, EntryStream, found, join_url, parse_last_modified, parse_xml,
};
use crate::account::{AccountRef, Kind};
use crate::error::TransferError;
use crate::model::{EntryDescriptor, EntryKey, ResourceDescriptor, Side};

/// Largest range accepted by a single Put Range call.
const MAX_RANGE: usize = 4 * 1024 * 1024;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ShareList {
    #[serde(default)]
    shares: Shares,
    next_marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Shares {
    #[serde(rename = "Share", default)]
    items: Vec<ShareItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ShareItem {
    name: String,
    #[serde(default)]
    properties: ShareProperties,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ShareProperties {
    quota: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DirectoryList {
    #[serde(default)]
    entries: Entries,
    next_marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Entries {
    #[serde(rename = "$value", default)]
    items: Vec<DirectoryItem>,
}

#[derive(Debug, Deserialize)]
enum DirectoryItem {
    File(FileItem),
    Directory(NamedItem),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FileItem {
    name: String,
    #[serde(default)]
    properties: FileProperties,
}

#[derive(Debug, Default, Deserialize)]
struct FileProperties {
    #[serde(rename = "Content-Length", default)]
    content_length: u64,
    #[serde(rename = "Last-Modified")]
    last_modified: Option<String>,
    #[serde(rename = "Etag")]
    etag: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NamedItem {
    name: String,
}

fn child_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// Depth-first walk over a share, one directory page at a time.
struct Walk {
    transport: Arc<Transport>,
    share: url::Url,
    pending: Vec<String>,
    current: Option<(String, Option<String>)>,
}

impl Walk {
    async fn next_page(mut self) -> Result<Option<(Vec<EntryDescriptor>, Walk)>, TransferError> {
        let (dir, marker) = match self.current.take() {
            Some(current) => current,
            None => match self.pending.pop() {
                Some(dir) => (dir, None),
                None => return Ok(None),
            },
        };
        let mut url = join_url(&self.share, &[&dir])?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("restype", "directory")
                .append_pair("comp", "list")
                .append_pair("include", "Timestamps,Etag");
            if let Some(marker) = &marker {
                query.append_pair("marker", marker);
            }
        }
        let reply = self.transport.send(Call::new(Method::GET, url)).await?;
        let page: DirectoryList = parse_xml(&reply.body)?;
        let mut entries = Vec::with_capacity(page.entries.items.len());
        let mut subdirs = Vec::new();
        for item in page.entries.items {
            match item {
                DirectoryItem::File(file) => entries.push(EntryDescriptor {
                    etag: file.properties.etag,
                    last_modified: parse_last_modified(file.properties.last_modified.as_deref()),
                    ..EntryDescriptor::file(
                        child_path(&dir, &file.name),
                        file.properties.content_length,
                    )
                }),
                DirectoryItem::Directory(child) => {
                    let path = child_path(&dir, &child.name);
                    entries.push(EntryDescriptor::directory(path.clone()));
                    subdirs.push(path);
                }
            }
        }
        if let Some(next) = page.next_marker.filter(|next| !next.is_empty()) {
            self.current = Some((dir, Some(next)));
        }
        // reversed so the first subdirectory is walked first
        self.pending.extend(subdirs.into_iter().rev());
        Ok(Some((entries, self)))
    }
}

/// Network file shares. Directories are created explicitly; files are streamed or bulk-copied.
pub struct SharePlane {
    account: AccountRef,
    base: url::Url,
    transport: Arc<Transport>,
}

impl SharePlane {
    pub fn new(account: AccountRef, base: url::Url, transport: Transport) -> Self {
        Self {
            account,
            base,
            transport: Arc::new(transport),
        }
    }
}

#[async_trait]
impl DataPlane for SharePlane {
    fn kind(&self) -> Kind {
        Kind::FileShare
    }

    fn account(&self) -> &AccountRef {
        &self.account
    }

    async fn list_resources(
        &self,
        prefix: Option<&str>,
    ) -> Result<Vec<ResourceDescriptor>, TransferError> {
        let mut resources = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let mut url = self.base.clone();
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("comp", "list").append_pair("include", "metadata");
                if let Some(prefix) = prefix {
                    query.append_pair("prefix", prefix);
                }
                if let Some(marker) = &marker {
                    query.append_pair("marker", marker);
                }
            }
            let reply = self.transport.send(Call::new(Method::GET, url)).await?;
            let page: ShareList = parse_xml(&reply.body)?;
            resources.extend(page.shares.items.into_iter().map(|item| ResourceDescriptor {
                metadata: item.metadata,
                quota: item.properties.quota,
                ..ResourceDescriptor::new(&self.account, Side::Source, item.name)
            }));
            marker = page.next_marker.filter(|marker| !marker.is_empty());
            if marker.is_none() {
                return Ok(resources);
            }
        }
    }

    fn list_entries(&self, resource: &ResourceDescriptor) -> EntryStream {
        let share = match join_url(&self.base, &[&resource.name]) {
            Ok(share) => share,
            Err(error) => return futures::stream::once(async move { Err(error) }).boxed(),
        };
        let walk = Walk {
            transport: self.transport.clone(),
            share,
            pending: vec![String::new()],
            current: None,
        };
        futures::stream::try_unfold(walk, Walk::next_page)
            .map_ok(|entries| futures::stream::iter(entries.into_iter().map(Ok)))
            .try_flatten()
            .boxed()
    }

    async fn resource_exists(&self, name: &str) -> Result<bool, TransferError> {
        let mut url = join_url(&self.base, &[name])?;
        url.query_pairs_mut().append_pair("restype", "share");
        found(self.transport.send(Call::new(Method::HEAD, url)).await)
    }

    async fn exists(&self, resource: &str, key: &EntryKey) -> Result<bool, TransferError> {
        let Some(path) = key.path() else {
            return Ok(false);
        };
        let mut url = join_url(&self.base, &[resource, path])?;
        if key.is_directory() {
            url.query_pairs_mut().append_pair("restype", "directory");
        }
        found(self.transport.send(Call::new(Method::HEAD, url)).await)
    }

    async fn create_resource(&self, source: &ResourceDescriptor) -> Result<(), TransferError> {
        let mut url = join_url(&self.base, &[&source.name])?;
        url.query_pairs_mut().append_pair("restype", "share");
        let mut call = Call::new(Method::PUT, url).metadata(&source.metadata);
        if let Some(quota) = source.quota {
            call = call.header("x-ms-share-quota", quota.to_string());
        }
        self.transport.send(call).await?;
        Ok(())
    }

    async fn read_entry(
        &self,
        resource: &str,
        entry: &EntryDescriptor,
    ) -> Result<Bytes, TransferError> {
        let path = entry
            .key
            .path()
            .ok_or_else(|| TransferError::Unsupported(format!("read of {}", entry.key)))?;
        let url = join_url(&self.base, &[resource, path])?;
        let reply = self.transport.send(Call::new(Method::GET, url)).await?;
        Ok(reply.body)
    }

    async fn write_entry(
        &self,
        resource: &str,
        entry: &EntryDescriptor,
        body: Option<Bytes>,
        _overwrite: bool,
    ) -> Result<u64, TransferError> {
        match (&entry.key, body) {
            (EntryKey::Directory(path), _) => {
                let mut url = join_url(&self.base, &[resource, path])?;
                url.query_pairs_mut().append_pair("restype", "directory");
                self.transport
                    .send(Call::new(Method::PUT, url).body(Bytes::new()))
                    .await?;
                Ok(0)
            }
            (EntryKey::Path(path), Some(body)) => {
                let url = join_url(&self.base, &[resource, path])?;
                // creating a file replaces any existing one
                let create = Call::new(Method::PUT, url.clone())
                    .header("x-ms-type", "file")
                    .header("x-ms-content-length", body.len().to_string())
                    .body(Bytes::new());
                self.transport.send(create).await?;
                let mut offset = 0;
                while offset < body.len() {
                    let end = (offset + MAX_RANGE).min(body.len());
                    let mut range_url = url.clone();
                    range_url.query_pairs_mut().append_pair("comp", "range");
                    let call = Call::new(Method::PUT, range_url)
                        .header("x-ms-range", format!("bytes={}-{}", offset, end - 1))
                        .header("x-ms-write", "update")
                        .body(body.slice(offset..end));
                    self.transport.send(call).await?;
                    offset = end;
                }
                Ok(body.len() as u64)
            }
            (key, _) => Err(TransferError::Unsupported(format!("share write of {key}"))),
        }
    }

    fn location(&self, resource: &str, key: Option<&EntryKey>) -> String {
        let mut segments = vec![resource];
        if let Some(path) = key.and_then(EntryKey::path) {
            segments.push(path);
        }
        let mut url = join_url(&self.base, &segments).unwrap_or_else(|_| self.base.clone());
        if let Some(sas) = self.transport.sas() {
            append_sas(&mut url, sas);
        }
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_directory_listing() {
        let body = r#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults ServiceEndpoint="https://acct.file.core.windows.net/" ShareName="docs" DirectoryPath="reports">
  <Entries>
    <File>
      <Name>q1.pdf</Name>
      <Properties><Content-Length>2048</Content-Length></Properties>
    </File>
    <Directory>
      <Name>archive</Name>
    </Directory>
    <File>
      <Name>q2.pdf</Name>
      <Properties><Content-Length>10</Content-Length></Properties>
    </File>
  </Entries>
  <NextMarker>page2</NextMarker>
</EnumerationResults>"#;
        let page: DirectoryList = parse_xml(body.as_bytes()).unwrap();
        assert_eq!(page.entries.items.len(), 3);
        assert!(matches!(
            &page.entries.items[0],
            DirectoryItem::File(file) if file.name == "q1.pdf" && file.properties.content_length == 2048
        ));
        assert!(matches!(
            &page.entries.items[1],
            DirectoryItem::Directory(dir) if dir.name == "archive"
        ));
        assert_eq!(page.next_marker.as_deref(), Some("page2"));
    }

    #[test]
    fn parses_share_listing_with_quota() {
        let body = r#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults ServiceEndpoint="https://acct.file.core.windows.net/">
  <Shares>
    <Share>
      <Name>docs</Name>
      <Properties><Quota>100</Quota></Properties>
      <Metadata><dept>finance</dept></Metadata>
    </Share>
  </Shares>
</EnumerationResults>"#;
        let page: ShareList = parse_xml(body.as_bytes()).unwrap();
        assert_eq!(page.shares.items[0].properties.quota, Some(100));
        assert_eq!(page.shares.items[0].metadata["dept"], "finance");
    }

    #[test]
    fn child_paths_are_relative_to_share_root() {
        assert_eq!(child_path("", "a.txt"), "a.txt");
        assert_eq!(child_path("reports/2024", "a.txt"), "reports/2024/a.txt");
    }
}
