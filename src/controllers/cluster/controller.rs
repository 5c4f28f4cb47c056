use std::future::Future;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::watcher;
use kube::Resource;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::*;

use super::api::KubeClusterApi;
use super::owner::OwnerResolver;
use super::reconciler::Reconciler;
use super::reconcilers::{MANAGED_BY, MANAGED_BY_LABEL};
use crate::controllers::State;
use crate::resources::clusters::Cluster;
use crate::runtime::cache::run_informer;
use crate::runtime::{
    object_key, run_worker, wait_for_cache_sync, Delta, HasSynced, Reflector, WorkQueue,
    MAX_RETRIES,
};
use crate::{Metrics, Result};

const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Only watch this namespace; all namespaces when unset
    pub namespace: Option<String>,
    /// Number of keys reconciled concurrently
    pub workers: usize,
    /// Consecutive failures before a key is dropped
    pub max_retries: u32,
    /// How long startup waits for the initial list of every watched kind
    pub cache_sync_timeout: Duration,
    /// Re-apply owned objects that no longer match their Cluster
    pub drift_correction: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            workers: 1,
            max_retries: MAX_RETRIES,
            cache_sync_timeout: Duration::from_secs(60),
            drift_correction: true,
        }
    }
}

/// A change seen by one of the informers
#[derive(Debug)]
pub enum CacheEvent {
    Cluster(Delta<Cluster>),
    Service(Delta<Service>),
    Deployment(Delta<Deployment>),
}

impl CacheEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            CacheEvent::Cluster(_) => "Cluster",
            CacheEvent::Service(_) => "Service",
            CacheEvent::Deployment(_) => "Deployment",
        }
    }
}

/// Clusters go straight onto the queue; derived objects are handed to their owner
fn dispatch(queue: &WorkQueue, owners: &OwnerResolver, event: CacheEvent) {
    trace!("Dispatching {} event", event.kind());
    match event {
        CacheEvent::Cluster(delta) => queue.add(object_key(delta.object().as_ref())),
        CacheEvent::Service(delta) => {
            owners.handle_object(&delta);
        }
        CacheEvent::Deployment(delta) => {
            owners.handle_object(&delta);
        }
    }
}

/// Consume cache events until every informer has stopped
async fn dispatch_events(
    mut events: mpsc::Receiver<CacheEvent>,
    queue: WorkQueue,
    owners: OwnerResolver,
) {
    while let Some(event) = events.recv().await {
        dispatch(&queue, &owners, event);
    }
    debug!("All informers stopped, stopping event dispatch");
}

fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("Failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Block until every cache has synced, then spawn the workers draining `queue`.
///
/// Keys queued while waiting stay queued; no sync runs against a partial cache.
async fn start_workers_when_synced<F, Fut>(
    timeout: Duration,
    caches: &[&dyn HasSynced],
    queue: &WorkQueue,
    workers: usize,
    max_retries: u32,
    metrics: &Metrics,
    sync: F,
) -> Result<Vec<JoinHandle<()>>>
where
    F: Fn(String) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    info!("Waiting for caches to sync");
    wait_for_cache_sync(timeout, caches).await?;

    info!("Starting {workers} workers");
    Ok((0..workers.max(1))
        .map(|_| {
            tokio::spawn(run_worker(
                queue.clone(),
                max_retries,
                metrics.clone(),
                sync.clone(),
            ))
        })
        .collect())
}

// Initialize the controller and run it until a shutdown signal arrives (given the crd is installed)
pub async fn run(
    client: Client,
    metrics: Metrics,
    state: State,
    config: ControllerConfig,
) -> Result<()> {
    let namespace = config.namespace.as_deref();
    let cluster_api = api::<Cluster>(&client, namespace);

    if let Err(e) = cluster_api.list(&ListParams::default().limit(1)).await {
        error!("Cluster is not queryable; {e:?}. Is the CRD installed?");
        return Err(e.into());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);

    let (clusters, cluster_reflector) = Reflector::<Cluster>::new();
    let (services, service_reflector) = Reflector::<Service>::new();
    let (deployments, deployment_reflector) = Reflector::<Deployment>::new();

    // all objects we create have this label
    let cfg = watcher::Config::default().labels(&format!("{MANAGED_BY_LABEL}={MANAGED_BY}"));
    // but clusters themselves dont
    let cluster_cfg = watcher::Config::default();

    let mut tasks = vec![
        tokio::spawn(run_informer(
            cluster_api,
            cluster_cfg,
            cluster_reflector,
            events_tx.clone(),
            CacheEvent::Cluster,
            shutdown_rx.clone(),
        )),
        tokio::spawn(run_informer(
            api::<Service>(&client, namespace),
            cfg.clone(),
            service_reflector,
            events_tx.clone(),
            CacheEvent::Service,
            shutdown_rx.clone(),
        )),
        tokio::spawn(run_informer(
            api::<Deployment>(&client, namespace),
            cfg,
            deployment_reflector,
            events_tx,
            CacheEvent::Deployment,
            shutdown_rx,
        )),
    ];

    let queue = WorkQueue::default();
    let owners = OwnerResolver::new(clusters.clone(), queue.clone());
    tasks.push(tokio::spawn(dispatch_events(events_rx, queue.clone(), owners)));

    let reconciler = Arc::new(
        Reconciler::new(
            KubeClusterApi::new(client),
            clusters.clone(),
            services.clone(),
            deployments.clone(),
            metrics.clone(),
            state.diagnostics.clone(),
        )
        .with_drift_correction(config.drift_correction),
    );

    let workers = start_workers_when_synced(
        config.cache_sync_timeout,
        &[&clusters as &dyn HasSynced, &services, &deployments],
        &queue,
        config.workers,
        config.max_retries,
        &metrics,
        move |key: String| {
            let reconciler = reconciler.clone();
            async move { reconciler.sync(&key).await }
        },
    )
    .await;
    match workers {
        Ok(workers) => tasks.extend(workers),
        Err(err) => {
            error!("{err}");
            let _ = shutdown_tx.send(true);
            queue.shut_down();
            return Err(err);
        }
    }

    shutdown_signal().await;
    info!("Shutting down workers");
    let _ = shutdown_tx.send(true);
    queue.shut_down();

    for task in tasks {
        if let Err(err) = task.await {
            error!("Controller task failed: {err}");
        }
    }
    Ok(())
}
