use std::collections::BTreeMap;
use std::sync::Arc;

use enum_map::Enum;
use serde::Serialize;

use crate::account::{AccountRef, Kind};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Side {
    Source,
    Destination,
}

/// One replicable unit: a container, queue, table or share.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub kind: Kind,
    pub name: String,
    pub account: AccountRef,
    pub side: Side,
    pub metadata: BTreeMap<String, String>,
    /// Share quota in GiB.
    pub quota: Option<u64>,
}

impl ResourceDescriptor {
    pub fn new(account: &AccountRef, side: Side, name: impl Into<String>) -> Self {
        Self {
            kind: account.kind(),
            name: name.into(),
            account: account.clone(),
            side,
            metadata: BTreeMap::new(),
            quota: None,
        }
    }

    /// The same resource name on the other account.
    pub fn counterpart(&self, account: &AccountRef) -> Self {
        Self {
            kind: self.kind,
            name: self.name.clone(),
            account: account.clone(),
            side: match self.side {
                Side::Source => Side::Destination,
                Side::Destination => Side::Source,
            },
            metadata: BTreeMap::new(),
            quota: None,
        }
    }
}

impl std::fmt::Display for ResourceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind.resource_noun(), self.name)
    }
}

/// Logical key used to join source and destination listings.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryKey {
    /// Blob name or file path relative to the share root.
    Path(String),
    Directory(String),
    Row {
        partition_key: String,
        row_key: String,
    },
    /// Position of a received message batch; never present at the destination.
    Batch(u64),
}

impl EntryKey {
    pub fn is_directory(&self) -> bool {
        matches!(self, EntryKey::Directory(_))
    }

    /// Path of a file or directory entry.
    pub fn path(&self) -> Option<&str> {
        match self {
            EntryKey::Path(path) | EntryKey::Directory(path) => Some(path),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryKey::Path(path) => f.write_str(path),
            EntryKey::Directory(path) => write!(f, "{path}/"),
            EntryKey::Row {
                partition_key,
                row_key,
            } => write!(f, "({partition_key}, {row_key})"),
            EntryKey::Batch(index) => write!(f, "batch #{index}"),
        }
    }
}

/// What an entry carries besides its metadata.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// Bytes stay on the service and are fetched when copied.
    Remote,
    /// Table entity properties, including `@odata.type` annotations.
    Entity(serde_json::Map<String, serde_json::Value>),
    /// Message texts of one received batch.
    Messages(Vec<String>),
}

/// Snapshot of one child of a resource at enumeration time.
#[derive(Clone, Debug, PartialEq)]
pub struct EntryDescriptor {
    pub key: EntryKey,
    pub size: u64,
    pub etag: Option<String>,
    pub last_modified: Option<chrono::DateTime<chrono::Utc>>,
    pub payload: Payload,
}

impl EntryDescriptor {
    pub fn file(path: impl Into<String>, size: u64) -> Self {
        Self {
            key: EntryKey::Path(path.into()),
            size,
            etag: None,
            last_modified: None,
            payload: Payload::Remote,
        }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            key: EntryKey::Directory(path.into()),
            size: 0,
            etag: None,
            last_modified: None,
            payload: Payload::Remote,
        }
    }

    pub fn row(
        partition_key: impl Into<String>,
        row_key: impl Into<String>,
        properties: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        let size = serde_json::to_vec(&properties).map_or(0, |body| body.len() as u64);
        Self {
            key: EntryKey::Row {
                partition_key: partition_key.into(),
                row_key: row_key.into(),
            },
            size,
            etag: None,
            last_modified: None,
            payload: Payload::Entity(properties),
        }
    }

    pub fn batch(index: u64, messages: Vec<String>) -> Self {
        Self {
            key: EntryKey::Batch(index),
            size: messages.iter().map(|text| text.len() as u64).sum(),
            etag: None,
            last_modified: None,
            payload: Payload::Messages(messages),
        }
    }

    /// The same batch at another position; other entries are returned unchanged.
    pub fn renumbered(mut self, index: u64) -> Self {
        if let EntryKey::Batch(_) = self.key {
            self.key = EntryKey::Batch(index);
        }
        self
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Enum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    Create,
    Copy,
    Skip,
    Overwrite,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ActionKind::Create => "create",
            ActionKind::Copy => "copy",
            ActionKind::Skip => "skip",
            ActionKind::Overwrite => "overwrite",
        })
    }
}

/// The policy decision behind a planned action.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    MissingAtDestination,
    DestinationExists,
    OverwriteEnabled,
    /// Queue batches are re-sent without comparing against the destination.
    ResendAll,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Decision::MissingAtDestination => "destination missing",
            Decision::DestinationExists => "destination exists",
            Decision::OverwriteEnabled => "overwrite enabled",
            Decision::ResendAll => "queue messages are always re-sent",
        })
    }
}

/// A planned operation, consumed once by the executor.
#[derive(Clone, Debug)]
pub struct TransferAction {
    kind: ActionKind,
    resource: Arc<ResourceDescriptor>,
    entry: Option<Arc<EntryDescriptor>>,
    decision: Decision,
}

impl TransferAction {
    pub(crate) fn new(
        kind: ActionKind,
        resource: Arc<ResourceDescriptor>,
        entry: Option<Arc<EntryDescriptor>>,
        decision: Decision,
    ) -> Self {
        Self {
            kind,
            resource,
            entry,
            decision,
        }
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    /// The source-side resource this action replicates.
    pub fn resource(&self) -> &Arc<ResourceDescriptor> {
        &self.resource
    }

    /// `None` for resource-level creation.
    pub fn entry(&self) -> Option<&Arc<EntryDescriptor>> {
        self.entry.as_ref()
    }

    pub fn decision(&self) -> Decision {
        self.decision
    }
}

impl std::fmt::Display for TransferAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.entry {
            Some(entry) => write!(f, "{} {}/{}", self.kind, self.resource.name, entry.key),
            None => write!(f, "{} {}", self.kind, self.resource),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case", tag = "status", content = "reason")]
pub enum Outcome {
    Succeeded,
    SkippedExisting,
    Failed(String),
}

impl Outcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }
}

/// The outcome of executing one action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ActionResult {
    pub kind: Kind,
    pub action: ActionKind,
    pub resource: String,
    pub entry: Option<String>,
    pub outcome: Outcome,
    pub attempts: u32,
    pub elapsed: std::time::Duration,
    pub bytes: u64,
}

impl ActionResult {
    pub fn for_action(action: &TransferAction, outcome: Outcome, attempts: u32) -> Self {
        Self {
            kind: action.resource.kind,
            action: action.kind,
            resource: action.resource.name.clone(),
            entry: action.entry.as_ref().map(|entry| entry.key.to_string()),
            outcome,
            attempts,
            elapsed: std::time::Duration::ZERO,
            bytes: 0,
        }
    }

    /// A failure that happened before any action of `kind` could be planned.
    pub fn kind_failure(kind: Kind, resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind,
            action: ActionKind::Create,
            resource: resource.into(),
            entry: None,
            outcome: Outcome::Failed(reason.into()),
            attempts: 0,
            elapsed: std::time::Duration::ZERO,
            bytes: 0,
        }
    }

    pub fn with_elapsed(mut self, elapsed: std::time::Duration) -> Self {
        self.elapsed = elapsed;
        self
    }

    pub fn with_bytes(mut self, bytes: u64) -> Self {
        self.bytes = bytes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_display_by_kind() {
        assert_eq!(EntryKey::Path("a/b.txt".into()).to_string(), "a/b.txt");
        assert_eq!(EntryKey::Directory("a".into()).to_string(), "a/");
        assert_eq!(
            EntryKey::Row {
                partition_key: "p".into(),
                row_key: "r".into()
            }
            .to_string(),
            "(p, r)"
        );
        assert_eq!(EntryKey::Batch(3).to_string(), "batch #3");
    }

    #[test]
    fn batch_size_counts_message_text() {
        let entry = EntryDescriptor::batch(0, vec!["abc".into(), "de".into()]);
        assert_eq!(entry.size, 5);
    }

    #[test]
    fn result_identifies_entry() {
        let account = AccountRef::parse("acct", Kind::Blob).unwrap();
        let resource = Arc::new(ResourceDescriptor::new(&account, Side::Source, "photos"));
        let action = TransferAction::new(
            ActionKind::Copy,
            resource,
            Some(Arc::new(EntryDescriptor::file("b.txt", 3))),
            Decision::MissingAtDestination,
        );
        let result = ActionResult::for_action(&action, Outcome::Succeeded, 1);
        assert_eq!(result.resource, "photos");
        assert_eq!(result.entry.as_deref(), Some("b.txt"));
        assert_eq!(action.to_string(), "copy photos/b.txt");
    }
}
