use kube::{Resource, ResourceExt};
use tracing::*;

use crate::resources::clusters::Cluster;
use crate::runtime::{object_key, Delta, Informer, WorkQueue};

/// Maps changes to derived objects back to the Cluster that owns them
#[derive(Clone)]
pub struct OwnerResolver {
    clusters: Informer<Cluster>,
    queue: WorkQueue,
}

impl OwnerResolver {
    pub fn new(clusters: Informer<Cluster>, queue: WorkQueue) -> Self {
        Self { clusters, queue }
    }

    /// Enqueue the owning Cluster of the changed object, if it has one we know about.
    /// Returns the key that was enqueued.
    pub fn handle_object<K: Resource<DynamicType = ()>>(&self, delta: &Delta<K>) -> Option<String> {
        if let Delta::Updated { old, new } = delta {
            // relists replay every object; nothing changed unless the version did
            if old.resource_version() == new.resource_version() {
                return None;
            }
        }

        let obj = delta.object();
        let kind = K::kind(&());
        let name = obj.name_any();
        let owner = obj
            .owner_references()
            .iter()
            .find(|oref| oref.controller == Some(true))?;

        if owner.kind != Cluster::kind(&()) || owner.api_version != Cluster::api_version(&()) {
            return None;
        }

        let namespace = obj.namespace()?;
        let Some(cluster) = self.clusters.get(&namespace, &owner.name) else {
            debug!("Ignoring orphaned {kind} {namespace}/{name} of Cluster {}", owner.name);
            return None;
        };

        let key = object_key(cluster.as_ref());
        trace!("{kind} {namespace}/{name} changed, enqueueing Cluster {key}");
        self.queue.add_rate_limited(key.clone());
        Some(key)
    }
}
