use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;

use super::http::{Call, Transport, append_sas};
use super::{DataPlane, EntryStream, found, join_url, paged, parse_last_modified, parse_xml};
use crate::account::{AccountRef, Kind};
use crate::error::TransferError;
use crate::model::{EntryDescriptor, EntryKey, ResourceDescriptor, Side};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerList {
    #[serde(default)]
    containers: Containers,
    next_marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Containers {
    #[serde(rename = "Container", default)]
    items: Vec<ContainerItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerItem {
    name: String,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BlobList {
    #[serde(default)]
    blobs: Blobs,
    next_marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Blobs {
    #[serde(rename = "Blob", default)]
    items: Vec<BlobItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BlobItem {
    name: String,
    properties: BlobProperties,
}

#[derive(Debug, Deserialize)]
struct BlobProperties {
    #[serde(rename = "Content-Length", default)]
    content_length: u64,
    #[serde(rename = "Etag")]
    etag: Option<String>,
    #[serde(rename = "Last-Modified")]
    last_modified: Option<String>,
}

impl From<BlobItem> for EntryDescriptor {
    fn from(item: BlobItem) -> Self {
        EntryDescriptor {
            etag: item.properties.etag,
            last_modified: parse_last_modified(item.properties.last_modified.as_deref()),
            ..EntryDescriptor::file(item.name, item.properties.content_length)
        }
    }
}

/// Blob containers. Payloads only move through the bulk-copy tool.
pub struct BlobPlane {
    account: AccountRef,
    base: url::Url,
    transport: Arc<Transport>,
}

impl BlobPlane {
    pub fn new(account: AccountRef, base: url::Url, transport: Transport) -> Self {
        Self {
            account,
            base,
            transport: Arc::new(transport),
        }
    }
}

#[async_trait]
impl DataPlane for BlobPlane {
    fn kind(&self) -> Kind {
        Kind::Blob
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
            let page: ContainerList = parse_xml(&reply.body)?;
            resources.extend(page.containers.items.into_iter().map(|item| ResourceDescriptor {
                metadata: item.metadata,
                ..ResourceDescriptor::new(&self.account, Side::Source, item.name)
            }));
            marker = page.next_marker.filter(|marker| !marker.is_empty());
            if marker.is_none() {
                return Ok(resources);
            }
        }
    }

    fn list_entries(&self, resource: &ResourceDescriptor) -> EntryStream {
        let transport = self.transport.clone();
        let container = join_url(&self.base, &[&resource.name]);
        paged(move |marker: Option<String>| {
            let transport = transport.clone();
            let container = container.clone();
            async move {
                let mut url = container?;
                {
                    let mut query = url.query_pairs_mut();
                    query
                        .append_pair("restype", "container")
                        .append_pair("comp", "list");
                    if let Some(marker) = &marker {
                        query.append_pair("marker", marker);
                    }
                }
                let reply = transport.send(Call::new(Method::GET, url)).await?;
                let page: BlobList = parse_xml(&reply.body)?;
                let entries = page.blobs.items.into_iter().map(EntryDescriptor::from).collect();
                Ok::<_, TransferError>((entries, page.next_marker))
            }
        })
    }

    async fn resource_exists(&self, name: &str) -> Result<bool, TransferError> {
        let mut url = join_url(&self.base, &[name])?;
        url.query_pairs_mut().append_pair("restype", "container");
        found(self.transport.send(Call::new(Method::HEAD, url)).await)
    }

    async fn exists(&self, resource: &str, key: &EntryKey) -> Result<bool, TransferError> {
        let Some(path) = key.path() else {
            return Ok(false);
        };
        let url = join_url(&self.base, &[resource, path])?;
        found(self.transport.send(Call::new(Method::HEAD, url)).await)
    }

    async fn create_resource(&self, source: &ResourceDescriptor) -> Result<(), TransferError> {
        let mut url = join_url(&self.base, &[&source.name])?;
        url.query_pairs_mut().append_pair("restype", "container");
        let call = Call::new(Method::PUT, url).metadata(&source.metadata);
        self.transport.send(call).await?;
        Ok(())
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
    fn parses_container_listing() {
        let body = r#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults ServiceEndpoint="https://acct.blob.core.windows.net/">
  <Containers>
    <Container>
      <Name>photos</Name>
      <Properties><Etag>"0x1"</Etag></Properties>
      <Metadata><owner>ops</owner></Metadata>
    </Container>
    <Container>
      <Name>logs</Name>
      <Properties><Etag>"0x2"</Etag></Properties>
    </Container>
  </Containers>
  <NextMarker>logs</NextMarker>
</EnumerationResults>"#;
        let page: ContainerList = parse_xml(body.as_bytes()).unwrap();
        assert_eq!(page.containers.items.len(), 2);
        assert_eq!(page.containers.items[0].name, "photos");
        assert_eq!(page.containers.items[0].metadata["owner"], "ops");
        assert!(page.containers.items[1].metadata.is_empty());
        assert_eq!(page.next_marker.as_deref(), Some("logs"));
    }

    #[test]
    fn parses_blob_listing() {
        let body = r#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults ServiceEndpoint="https://acct.blob.core.windows.net/" ContainerName="photos">
  <Blobs>
    <Blob>
      <Name>2024/a.jpg</Name>
      <Properties>
        <Last-Modified>Mon, 01 Jan 2024 10:00:00 GMT</Last-Modified>
        <Etag>0x8DC</Etag>
        <Content-Length>1024</Content-Length>
        <BlobType>BlockBlob</BlobType>
      </Properties>
    </Blob>
  </Blobs>
</EnumerationResults>"#;
        let page: BlobList = parse_xml(body.as_bytes()).unwrap();
        assert!(page.next_marker.is_none());
        let entries: Vec<EntryDescriptor> =
            page.blobs.items.into_iter().map(EntryDescriptor::from).collect();
        assert_eq!(entries[0].key, EntryKey::Path("2024/a.jpg".into()));
        assert_eq!(entries[0].size, 1024);
        assert_eq!(entries[0].etag.as_deref(), Some("0x8DC"));
        assert!(entries[0].last_modified.is_some());
    }

    #[test]
    fn location_carries_signature() {
        let account = AccountRef::parse("acct", Kind::Blob).unwrap();
        let base = url::Url::parse(&account.endpoint()).unwrap();
        let transport = Transport::new(
            reqwest::Client::new(),
            crate::adapter::http::Auth::Sas("sv=1&sig=x".into()),
            std::time::Duration::from_secs(5),
        );
        let plane = BlobPlane::new(account, base, transport);
        assert_eq!(
            plane.location("photos", None),
            "https://acct.blob.core.windows.net/photos?sv=1&sig=x"
        );
        assert_eq!(
            plane.location("photos", Some(&EntryKey::Path("a b.txt".into()))),
            "https://acct.blob.core.windows.net/photos/a%20b.txt?sv=1&sig=x"
        );
    }
}
