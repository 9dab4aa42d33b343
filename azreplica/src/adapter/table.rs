use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::http::{Call, Reply, Transport, append_sas};
use super::{DataPlane, EntryStream, found, join_url, paged};
use crate::account::{AccountRef, Kind};
use crate::error::TransferError;
use crate::model::{EntryDescriptor, EntryKey, Payload, ResourceDescriptor, Side};

const ACCEPT: &str = "application/json;odata=minimalmetadata";

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct TableItem {
    #[serde(rename = "TableName")]
    table_name: String,
}

fn parse_json<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, TransferError> {
    serde_json::from_slice(body)
        .map_err(|err| TransferError::Other(format!("unreadable table response: {err}")))
}

/// Quotes a key for use inside `PartitionKey='...'`.
fn quote_key(key: &str) -> String {
    key.replace('\'', "''")
}

fn entity_path(table: &str, partition_key: &str, row_key: &str) -> String {
    format!(
        "{table}(PartitionKey='{}',RowKey='{}')",
        quote_key(partition_key),
        quote_key(row_key)
    )
}

/// Turns a listed entity into an entry, dropping service-maintained properties.
///
/// Type annotations such as `Amount@odata.type` are kept so that Int64, DateTime, Guid and
/// Binary values keep their type on the destination.
fn entity_entry(mut properties: Map<String, Value>) -> Result<EntryDescriptor, TransferError> {
    let etag = properties
        .get("odata.etag")
        .and_then(Value::as_str)
        .map(str::to_string);
    let last_modified = properties
        .get("Timestamp")
        .and_then(Value::as_str)
        .and_then(|time| chrono::DateTime::parse_from_rfc3339(time).ok())
        .map(|time| time.with_timezone(&chrono::Utc));
    properties.retain(|name, _| {
        name != "Timestamp" && name != "Timestamp@odata.type" && !name.starts_with("odata.")
    });
    let key = |name: &str| {
        properties
            .get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| TransferError::Other(format!("entity without {name}")))
    };
    let partition_key = key("PartitionKey")?;
    let row_key = key("RowKey")?;
    Ok(EntryDescriptor {
        etag,
        last_modified,
        ..EntryDescriptor::row(partition_key, row_key, properties)
    })
}

fn continuation(reply: &Reply, names: &[&str]) -> Option<String> {
    let values: Vec<&str> = names
        .iter()
        .map(|name| reply.header(&format!("x-ms-continuation-{name}")).unwrap_or_default())
        .collect();
    if values.iter().all(|value| value.is_empty()) {
        None
    } else {
        Some(values.join("\n"))
    }
}

/// Structured tables through the OData JSON API.
pub struct TablePlane {
    account: AccountRef,
    base: url::Url,
    transport: Arc<Transport>,
}

impl TablePlane {
    pub fn new(account: AccountRef, base: url::Url, transport: Transport) -> Self {
        Self {
            account,
            base,
            transport: Arc::new(transport),
        }
    }
}

fn odata_call(method: Method, url: url::Url) -> Call {
    Call::new(method, url)
        .header("accept", ACCEPT)
        .header("dataserviceversion", "3.0")
        .header("maxdataserviceversion", "3.0;NetFx")
}

#[async_trait]
impl DataPlane for TablePlane {
    fn kind(&self) -> Kind {
        Kind::Table
    }

    fn account(&self) -> &AccountRef {
        &self.account
    }

    async fn list_resources(
        &self,
        prefix: Option<&str>,
    ) -> Result<Vec<ResourceDescriptor>, TransferError> {
        let mut resources = Vec::new();
        let mut next_table: Option<String> = None;
        loop {
            let mut url = join_url(&self.base, &["Tables"])?;
            if let Some(next) = &next_table {
                url.query_pairs_mut().append_pair("NextTableName", next);
            }
            let reply = self.transport.send(odata_call(Method::GET, url)).await?;
            let page: Page<TableItem> = parse_json(&reply.body)?;
            resources.extend(
                page.value
                    .into_iter()
                    .filter(|item| prefix.is_none_or(|prefix| item.table_name.starts_with(prefix)))
                    .map(|item| ResourceDescriptor::new(&self.account, Side::Source, item.table_name)),
            );
            next_table = continuation(&reply, &["NextTableName"]);
            if next_table.is_none() {
                return Ok(resources);
            }
        }
    }

    fn list_entries(&self, resource: &ResourceDescriptor) -> EntryStream {
        let transport = self.transport.clone();
        let table = join_url(&self.base, &[&format!("{}()", resource.name)]);
        paged(move |marker: Option<String>| {
            let transport = transport.clone();
            let table = table.clone();
            async move {
                let mut url = table?;
                if let Some(marker) = &marker {
                    let (partition, row) = marker.split_once('\n').unwrap_or((marker.as_str(), ""));
                    let mut query = url.query_pairs_mut();
                    query.append_pair("NextPartitionKey", partition);
                    if !row.is_empty() {
                        query.append_pair("NextRowKey", row);
                    }
                }
                let reply = transport.send(odata_call(Method::GET, url)).await?;
                let page: Page<Map<String, Value>> = parse_json(&reply.body)?;
                let entries = page
                    .value
                    .into_iter()
                    .map(entity_entry)
                    .collect::<Result<Vec<_>, _>>()?;
                let next = continuation(&reply, &["NextPartitionKey", "NextRowKey"]);
                Ok::<_, TransferError>((entries, next))
            }
        })
    }

    async fn resource_exists(&self, name: &str) -> Result<bool, TransferError> {
        let url = join_url(&self.base, &[&format!("Tables('{}')", quote_key(name))])?;
        found(self.transport.send(odata_call(Method::GET, url)).await)
    }

    async fn exists(&self, resource: &str, key: &EntryKey) -> Result<bool, TransferError> {
        let EntryKey::Row {
            partition_key,
            row_key,
        } = key
        else {
            return Ok(false);
        };
        let url = join_url(&self.base, &[&entity_path(resource, partition_key, row_key)])?;
        found(self.transport.send(odata_call(Method::GET, url)).await)
    }

    async fn create_resource(&self, source: &ResourceDescriptor) -> Result<(), TransferError> {
        let url = join_url(&self.base, &["Tables"])?;
        let body = serde_json::to_vec(&serde_json::json!({ "TableName": source.name }))
            .map_err(|err| TransferError::Other(err.to_string()))?;
        let call = odata_call(Method::POST, url)
            .header("content-type", "application/json")
            .header("prefer", "return-no-content")
            .body(body);
        self.transport.send(call).await?;
        Ok(())
    }

    async fn write_entry(
        &self,
        resource: &str,
        entry: &EntryDescriptor,
        _body: Option<Bytes>,
        overwrite: bool,
    ) -> Result<u64, TransferError> {
        let (
            Payload::Entity(properties),
            EntryKey::Row {
                partition_key,
                row_key,
            },
        ) = (&entry.payload, &entry.key)
        else {
            return Err(TransferError::Unsupported(format!(
                "table entry {} carries no entity",
                entry.key
            )));
        };
        let body = serde_json::to_vec(properties).map_err(|err| TransferError::Other(err.to_string()))?;
        let written = body.len() as u64;
        let call = if overwrite {
            // PUT without If-Match inserts or replaces
            let url = join_url(&self.base, &[&entity_path(resource, partition_key, row_key)])?;
            odata_call(Method::PUT, url)
        } else {
            let url = join_url(&self.base, &[resource])?;
            odata_call(Method::POST, url).header("prefer", "return-no-content")
        };
        let call = call.header("content-type", "application/json").body(body);
        self.transport.send(call).await?;
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
