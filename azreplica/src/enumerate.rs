use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use tracing::instrument;

use crate::adapter::{DataPlane, EntryStream};
use crate::error::{Error, TransferError};
use crate::model::{EntryDescriptor, ResourceDescriptor};

/// Lists the resources of one kind, optionally narrowed to a single named resource.
#[derive(Clone, Debug, Default)]
pub struct ResourceEnumerator {
    only: Option<String>,
}

impl ResourceEnumerator {
    pub fn new(only: Option<String>) -> Self {
        Self {
            only: only.filter(|name| !name.is_empty()),
        }
    }

    #[instrument(skip_all, fields(account = %plane.account()))]
    pub async fn list(
        &self,
        plane: &dyn DataPlane,
    ) -> Result<Vec<Arc<ResourceDescriptor>>, Error> {
        let scope = || match &self.only {
            Some(name) => format!("{} {name}", plane.kind().resource_noun()),
            None => format!("{} {}s", plane.account(), plane.kind().resource_noun()),
        };
        let mut resources = plane
            .list_resources(self.only.as_deref())
            .await
            .map_err(|source| Error::Enumeration {
                resource: scope(),
                source,
            })?;
        if let Some(name) = &self.only {
            resources.retain(|resource| &resource.name == name);
            if resources.is_empty() {
                return Err(Error::Enumeration {
                    resource: scope(),
                    source: TransferError::NotFound(format!("{name} does not exist on {}", plane.account())),
                });
            }
        }
        tracing::info!("found {} {}(s)", resources.len(), plane.kind().resource_noun());
        Ok(resources.into_iter().map(Arc::new).collect())
    }

    /// Child listing of `resource`; `drained` keeps everything received for re-iteration.
    pub fn children(
        &self,
        plane: Arc<dyn DataPlane>,
        resource: Arc<ResourceDescriptor>,
        drained: bool,
    ) -> Listing {
        Listing {
            plane,
            resource,
            drained: drained.then(|| Arc::new(Drained::default())),
        }
    }
}

/// Entries of a listing that cannot be repeated.
#[derive(Default)]
struct Drained {
    /// Everything received so far, kept across failed passes.
    received: tokio::sync::Mutex<Vec<EntryDescriptor>>,
    complete: tokio::sync::OnceCell<Arc<Vec<EntryDescriptor>>>,
}

/// A lazy, restartable listing of a resource's entries.
#[derive(Clone)]
pub struct Listing {
    plane: Arc<dyn DataPlane>,
    resource: Arc<ResourceDescriptor>,
    drained: Option<Arc<Drained>>,
}

impl Listing {
    pub fn resource(&self) -> &Arc<ResourceDescriptor> {
        &self.resource
    }

    /// Starts a pass over the entries, served from memory once a drained listing completed.
    pub fn stream(&self) -> EntryStream {
        if let Some(entries) = self.drained.as_ref().and_then(|drained| drained.complete.get()) {
            let entries = entries.clone();
            return futures::stream::iter((0..entries.len()).map(move |i| Ok(entries[i].clone())))
                .boxed();
        }
        self.plane.list_entries(&self.resource)
    }

    /// Reads every entry.
    ///
    /// A drained listing is read once. A pass that fails part way keeps what it received and
    /// the next call continues after it, since received entries are no longer listed.
    pub async fn materialize(&self) -> Result<Arc<Vec<EntryDescriptor>>, TransferError> {
        let Some(drained) = &self.drained else {
            let entries: Vec<EntryDescriptor> =
                self.plane.list_entries(&self.resource).try_collect().await?;
            return Ok(Arc::new(entries));
        };
        let resume = || async {
            let mut received = drained.received.lock().await;
            let mut entries = self.plane.list_entries(&self.resource);
            while let Some(entry) = entries.try_next().await? {
                let position = received.len() as u64;
                received.push(entry.renumbered(position));
            }
            Ok::<_, TransferError>(Arc::new(received.clone()))
        };
        drained.complete.get_or_try_init(resume).await.cloned()
    }

    /// Entries taken by failed passes of a drained listing.
    pub async fn received(&self) -> Vec<EntryDescriptor> {
        match &self.drained {
            Some(drained) => drained.received.lock().await.clone(),
            None => Vec::new(),
        }
    }
}
