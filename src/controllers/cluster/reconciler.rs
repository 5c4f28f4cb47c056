use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tokio::sync::RwLock;
use tracing::*;

use super::api::{ClusterApi, Dependent};
use super::reconcilers::master::{master_deployment, master_service, master_service_name};
use super::reconcilers::{has_drifted, service_dns_name};
use crate::controllers::Diagnostics;
use crate::resources::clusters::{Cluster, ClusterState, ClusterStatus};
use crate::runtime::{split_key, Informer};
use crate::{telemetry, Error, Metrics, Result};

/// Event reason when a Cluster is synced successfully
pub const SUCCESS_SYNCED: &str = "Synced";
/// Event reason when a derived object can't be created because something else owns the name
pub const ERR_RESOURCE_EXISTS: &str = "ErrResourceExists";
pub const MESSAGE_RESOURCE_SYNCED: &str = "Cluster synced successfully";

/// What a pass did to one derived object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Unchanged,
    Created,
    Updated,
}

/// Converges the objects derived from a Cluster.
///
/// Reads only come from the informer caches; writes go through `A`.
pub struct Reconciler<A> {
    api: A,
    clusters: Informer<Cluster>,
    services: Informer<Service>,
    deployments: Informer<Deployment>,
    metrics: Metrics,
    diagnostics: Arc<RwLock<Diagnostics>>,
    drift_correction: bool,
}

impl<A: ClusterApi> Reconciler<A> {
    pub fn new(
        api: A,
        clusters: Informer<Cluster>,
        services: Informer<Service>,
        deployments: Informer<Deployment>,
        metrics: Metrics,
        diagnostics: Arc<RwLock<Diagnostics>>,
    ) -> Self {
        Self {
            api,
            clusters,
            services,
            deployments,
            metrics,
            diagnostics,
            drift_correction: true,
        }
    }

    /// Whether owned objects that no longer match the Cluster are re-applied
    pub fn with_drift_correction(mut self, drift_correction: bool) -> Self {
        self.drift_correction = drift_correction;
        self
    }

    /// Bring the objects derived from the Cluster at `key` in line with its spec.
    ///
    /// Keys that can't be parsed and Clusters that are gone are not errors; retrying would not help.
    #[instrument(skip(self), fields(trace_id))]
    pub async fn sync(&self, key: &str) -> Result<()> {
        if let Some(trace_id) = telemetry::get_trace_id() {
            Span::current().record("trace_id", field::display(&trace_id));
        }
        let _timer = self.metrics.count_and_measure::<Cluster>();
        {
            let mut diagnostics = self.diagnostics.write().await;
            diagnostics.last_event = Utc::now();
            diagnostics.clusters = self.clusters.list().len();
        }

        let result = self.sync_cluster(key).await;
        if let Err(err) = &result {
            warn!("Sync of Cluster {key} failed: {err}");
            self.metrics.reconcile_failure::<Cluster>(key, err);
        }
        result
    }

    async fn sync_cluster(&self, key: &str) -> Result<()> {
        if let Err(err) = split_key(key) {
            warn!("{err}");
            return Ok(());
        }

        let Some(cluster) = self.clusters.get_by_key(key) else {
            info!("Cluster {key} in work queue no longer exists");
            return Ok(());
        };
        let namespace = cluster
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;

        info!("Reconciling Cluster {key}");

        let service = master_service(&cluster)?;
        let service = self.ensure(&cluster, &self.services, service).await?;

        let dns_name = service_dns_name(&master_service_name(&cluster.name_any()), &namespace);
        let deployment = master_deployment(&cluster, &dns_name)?;
        let deployment = self.ensure(&cluster, &self.deployments, deployment).await?;

        self.api
            .record_event(
                &cluster,
                EventType::Normal,
                SUCCESS_SYNCED,
                MESSAGE_RESOURCE_SYNCED.into(),
            )
            .await;

        let changed = [service, deployment]
            .iter()
            .any(|change| *change != Change::Unchanged);
        self.update_status(&cluster, changed).await
    }

    /// Make sure `desired` exists, is controlled by `cluster`, and (with drift correction) still
    /// matches what we would build now
    async fn ensure<K: Dependent>(
        &self,
        cluster: &Cluster,
        cache: &Informer<K>,
        desired: K,
    ) -> Result<Change> {
        let kind = K::kind(&());
        let name = desired.name_any();
        let namespace = desired
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;

        let existing = match cache.get(&namespace, &name) {
            Some(existing) => existing,
            None => match self.api.create(&desired).await {
                Ok(_) => {
                    info!("Created {kind} {namespace}/{name}");
                    return Ok(Change::Created);
                }
                Err(err) if err.is_already_exists() => {
                    debug!("{kind} {namespace}/{name} exists but is not cached yet");
                    match self.api.get::<K>(&namespace, &name).await? {
                        Some(existing) => Arc::new(existing),
                        // gone again; its delete event requeues the Cluster
                        None => return Err(err),
                    }
                }
                Err(err) => return Err(err),
            },
        };

        if !is_controlled_by(existing.as_ref(), cluster) {
            let err = Error::ResourceExists {
                kind: kind.to_string(),
                name,
            };
            self.api
                .record_event(cluster, EventType::Warning, ERR_RESOURCE_EXISTS, err.to_string())
                .await;
            return Err(err);
        }

        if self.drift_correction && has_drifted(existing.as_ref(), &desired) {
            info!("{kind} {namespace}/{name} differs from its Cluster, applying");
            self.api.apply(&desired).await?;
            return Ok(Change::Updated);
        }

        Ok(Change::Unchanged)
    }

    async fn update_status(&self, cluster: &Cluster, changed: bool) -> Result<()> {
        let state = if changed {
            ClusterState::Updating
        } else {
            ClusterState::Created
        };
        if cluster.state() == Some(state) {
            return Ok(());
        }
        debug!("Setting state of Cluster {} to {state:?}", cluster.name_any());
        self.api
            .patch_status(cluster, &ClusterStatus { state: Some(state) })
            .await
    }
}

fn is_controlled_by<K: Resource>(obj: &K, cluster: &Cluster) -> bool {
    let Some(uid) = cluster.meta().uid.as_deref() else {
        return false;
    };
    obj.owner_references()
        .iter()
        .any(|oref| oref.controller == Some(true) && oref.uid == uid)
}
