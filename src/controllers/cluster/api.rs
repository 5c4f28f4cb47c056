use std::fmt::Debug;
use std::future::Future;

use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::client::Client;
use kube::runtime::events::{Event, EventType, Recorder};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::*;

use crate::resources::clusters::{Cluster, ClusterStatus};
use crate::Result;

const FIELD_MANAGER: &str = "elasticsearch-operator";

/// An object the controller derives from a Cluster
pub trait Dependent:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> Dependent for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// The writes (and the occasional uncached read) the reconciler makes against the api server
pub trait ClusterApi: Send + Sync + 'static {
    /// Create `obj`; fails with an `AlreadyExists` api error if the name is taken
    fn create<K: Dependent>(&self, obj: &K) -> impl Future<Output = Result<K>> + Send;

    fn get<K: Dependent>(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<K>>> + Send;

    /// Server-side apply `obj`, taking ownership of every field it sets
    fn apply<K: Dependent>(&self, obj: &K) -> impl Future<Output = Result<K>> + Send;

    fn patch_status(
        &self,
        cluster: &Cluster,
        status: &ClusterStatus,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Best effort; failures are logged and otherwise ignored
    fn record_event(
        &self,
        cluster: &Cluster,
        type_: EventType,
        reason: &str,
        note: String,
    ) -> impl Future<Output = ()> + Send;
}

pub struct KubeClusterApi {
    client: Client,
    recorder: Recorder,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self {
            recorder: Recorder::new(client.clone(), FIELD_MANAGER.into()),
            client,
        }
    }

    fn api<K: Dependent>(&self, obj: &K) -> Api<K> {
        match obj.meta().namespace.as_deref() {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::default_namespaced(self.client.clone()),
        }
    }
}

impl ClusterApi for KubeClusterApi {
    async fn create<K: Dependent>(&self, obj: &K) -> Result<K> {
        debug!("Creating {} {}", K::kind(&()), obj.name_any());
        let params = PostParams {
            dry_run: false,
            field_manager: Some(FIELD_MANAGER.into()),
        };
        Ok(self.api(obj).create(&params, obj).await?)
    }

    async fn get<K: Dependent>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn apply<K: Dependent>(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        debug!("Applying {} {name}", K::kind(&()));
        let params = PatchParams::apply(FIELD_MANAGER).force();
        Ok(self.api(obj).patch(&name, &params, &Patch::Apply(obj)).await?)
    }

    async fn patch_status(&self, cluster: &Cluster, status: &ClusterStatus) -> Result<()> {
        let api: Api<Cluster> = Api::namespaced(
            self.client.clone(),
            cluster.namespace().as_deref().unwrap_or("default"),
        );
        let patch = Patch::Apply(json!({
            "apiVersion": Cluster::api_version(&()),
            "kind": Cluster::kind(&()),
            "status": status,
        }));
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch_status(&cluster.name_any(), &params, &patch).await?;
        Ok(())
    }

    async fn record_event(&self, cluster: &Cluster, type_: EventType, reason: &str, note: String) {
        let event = Event {
            type_,
            reason: reason.into(),
            note: Some(note),
            action: "Reconcile".into(),
            secondary: None,
        };
        if let Err(err) = self.recorder.publish(&event, &cluster.object_ref(&())).await {
            warn!("Failed to record {reason} event for Cluster {}: {err}", cluster.name_any());
        }
    }
}
