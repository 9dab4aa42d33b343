//! Existence diffing
//!
//! Source and destination listings are joined by logical key. Replication is additive:
//! entries that only exist on the destination never produce an action.

use std::collections::HashSet;
use std::sync::Arc;

use crate::model::{
    ActionKind, Decision, EntryDescriptor, EntryKey, ResourceDescriptor, TransferAction,
};

#[derive(Copy, Clone, Debug, Default)]
pub struct DiffPlanner {
    overwrite: bool,
}

impl DiffPlanner {
    pub fn new(overwrite: bool) -> Self {
        Self { overwrite }
    }

    pub fn overwrite(&self) -> bool {
        self.overwrite
    }

    /// Resource-level creation, needed only when the destination lacks the resource.
    pub fn plan_resource(
        &self,
        resource: &Arc<ResourceDescriptor>,
        destination_exists: bool,
    ) -> Option<TransferAction> {
        (!destination_exists).then(|| {
            TransferAction::new(
                ActionKind::Create,
                resource.clone(),
                None,
                Decision::MissingAtDestination,
            )
        })
    }

    /// Plans exactly one action for a source entry.
    pub fn plan_entry(
        &self,
        resource: &Arc<ResourceDescriptor>,
        entry: EntryDescriptor,
        destination: &HashSet<EntryKey>,
    ) -> TransferAction {
        let (kind, decision) = match &entry.key {
            EntryKey::Batch(_) => (ActionKind::Copy, Decision::ResendAll),
            key if !destination.contains(key) => {
                if key.is_directory() {
                    (ActionKind::Create, Decision::MissingAtDestination)
                } else {
                    (ActionKind::Copy, Decision::MissingAtDestination)
                }
            }
            // an existing directory has nothing to overwrite
            key if key.is_directory() || !self.overwrite => {
                (ActionKind::Skip, Decision::DestinationExists)
            }
            _ => (ActionKind::Overwrite, Decision::OverwriteEnabled),
        };
        TransferAction::new(kind, resource.clone(), Some(Arc::new(entry)), decision)
    }

    pub fn plan(
        &self,
        resource: &Arc<ResourceDescriptor>,
        source: impl IntoIterator<Item = EntryDescriptor>,
        destination: &HashSet<EntryKey>,
    ) -> Vec<TransferAction> {
        source
            .into_iter()
            .map(|entry| self.plan_entry(resource, entry, destination))
            .collect()
    }
}
