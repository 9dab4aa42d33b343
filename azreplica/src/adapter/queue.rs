use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::Method;
use serde::Deserialize;

use super::http::{Call, Transport, append_sas};
use super::{DataPlane, EntryStream, found, join_url, parse_xml};
use crate::account::{AccountRef, Kind};
use crate::error::TransferError;
use crate::model::{EntryDescriptor, EntryKey, Payload, ResourceDescriptor, Side};

/// The service returns at most this many messages per receive.
pub const MAX_BATCH: u64 = 32;
const MAX_VISIBILITY_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QueueList {
    #[serde(default)]
    queues: Queues,
    next_marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Queues {
    #[serde(rename = "Queue", default)]
    items: Vec<QueueItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QueueItem {
    name: String,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    #[serde(rename = "QueueMessage", default)]
    messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Message {
    #[serde(default)]
    message_text: String,
}

fn message_body(text: &str) -> String {
    format!(
        "<QueueMessage><MessageText>{}</MessageText></QueueMessage>",
        quick_xml::escape::escape(text)
    )
}

/// Message queues.
///
/// Listing receives messages under a visibility timeout instead of peeking, so that more than
/// 32 messages can be read; the messages are not deleted and reappear on the source once the
/// timeout elapses. A listing is therefore not repeatable and must be materialized once.
pub struct QueuePlane {
    account: AccountRef,
    base: url::Url,
    transport: Arc<Transport>,
    visibility_timeout: std::time::Duration,
}

impl QueuePlane {
    pub fn new(
        account: AccountRef,
        base: url::Url,
        transport: Transport,
        visibility_timeout: std::time::Duration,
    ) -> Self {
        Self {
            account,
            base,
            transport: Arc::new(transport),
            visibility_timeout,
        }
    }
}

struct Cursor {
    transport: Arc<Transport>,
    queue: url::Url,
    visibility_secs: u64,
    /// Messages still expected, unknown until the queue metadata is read.
    remaining: Option<u64>,
    index: u64,
}

impl Cursor {
    async fn next_batch(mut self) -> Result<Option<(EntryDescriptor, Cursor)>, TransferError> {
        let remaining = match self.remaining {
            Some(remaining) => remaining,
            None => {
                let mut url = self.queue.clone();
                url.query_pairs_mut().append_pair("comp", "metadata");
                let reply = self.transport.send(Call::new(Method::GET, url)).await?;
                reply
                    .header("x-ms-approximate-messages-count")
                    .and_then(|count| count.parse().ok())
                    .unwrap_or(0)
            }
        };
        if remaining == 0 {
            return Ok(None);
        }
        let mut url = join_url(&self.queue, &["messages"])?;
        url.query_pairs_mut()
            .append_pair("numofmessages", &remaining.min(MAX_BATCH).to_string())
            .append_pair("visibilitytimeout", &self.visibility_secs.to_string());
        let reply = self.transport.send(Call::new(Method::GET, url)).await?;
        let list: MessageList = parse_xml(&reply.body)?;
        if list.messages.is_empty() {
            return Ok(None);
        }
        let texts: Vec<String> = list
            .messages
            .into_iter()
            .map(|message| message.message_text)
            .collect();
        self.remaining = Some(remaining.saturating_sub(texts.len() as u64));
        let entry = EntryDescriptor::batch(self.index, texts);
        self.index += 1;
        Ok(Some((entry, self)))
    }
}

#[async_trait]
impl DataPlane for QueuePlane {
    fn kind(&self) -> Kind {
        Kind::Queue
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
            let page: QueueList = parse_xml(&reply.body)?;
            resources.extend(page.queues.items.into_iter().map(|item| ResourceDescriptor {
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
        let queue = match join_url(&self.base, &[&resource.name]) {
            Ok(queue) => queue,
            Err(error) => return futures::stream::once(async move { Err(error) }).boxed(),
        };
        let cursor = Cursor {
            transport: self.transport.clone(),
            queue,
            visibility_secs: self.visibility_timeout.as_secs().clamp(1, MAX_VISIBILITY_SECS),
            remaining: None,
            index: 0,
        };
        futures::stream::try_unfold(cursor, Cursor::next_batch).boxed()
    }

    async fn resource_exists(&self, name: &str) -> Result<bool, TransferError> {
        let mut url = join_url(&self.base, &[name])?;
        url.query_pairs_mut().append_pair("comp", "metadata");
        found(self.transport.send(Call::new(Method::GET, url)).await)
    }

    async fn exists(&self, _resource: &str, _key: &EntryKey) -> Result<bool, TransferError> {
        // messages have no identity that survives a re-send
        Ok(false)
    }

    async fn create_resource(&self, source: &ResourceDescriptor) -> Result<(), TransferError> {
        let url = join_url(&self.base, &[&source.name])?;
        let call = Call::new(Method::PUT, url).metadata(&source.metadata);
        self.transport.send(call).await?;
        Ok(())
    }

    async fn write_entry(
        &self,
        resource: &str,
        entry: &EntryDescriptor,
        _body: Option<Bytes>,
        _overwrite: bool,
    ) -> Result<u64, TransferError> {
        let Payload::Messages(texts) = &entry.payload else {
            return Err(TransferError::Unsupported(format!(
                "queue entry {} carries no messages",
                entry.key
            )));
        };
        let url = join_url(&self.base, &[resource, "messages"])?;
        let mut written = 0;
        for text in texts {
            let call = Call::new(Method::POST, url.clone())
                .header("content-type", "application/xml")
                .body(message_body(text));
            self.transport.send(call).await?;
            written += text.len() as u64;
        }
        Ok(written)
    }

    fn location(&self, resource: &str, _key: Option<&EntryKey>) -> String {
        let mut url = join_url(&self.base, &[resource]).unwrap_or_else(|_| self.base.clone());
        if let Some(sas) = self.transport.sas() {
            append_sas(&mut url, sas);
        }
        url.to_string()
    }
}
