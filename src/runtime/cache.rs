use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::runtime::reflector::{self, store::Writer, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch};
use tracing::*;

use crate::{Error, Result};

const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A change to a cached object, as seen by the informer
#[derive(Debug, Clone)]
pub enum Delta<K> {
    Added(Arc<K>),
    Updated {
        old: Arc<K>,
        new: Arc<K>,
    },
    Deleted(Arc<K>),
    /// The object disappeared while the watch was down; only its last cached state is known
    DeletedFinalStateUnknown {
        key: String,
        last_known: Arc<K>,
    },
}

impl<K> Delta<K> {
    /// The most recent known state of the object
    pub fn object(&self) -> &Arc<K> {
        match self {
            Delta::Added(obj) | Delta::Deleted(obj) => obj,
            Delta::Updated { new, .. } => new,
            Delta::DeletedFinalStateUnknown { last_known, .. } => last_known,
        }
    }
}

/// `namespace/name` for namespaced objects, `name` otherwise
pub fn object_key<K: Resource>(obj: &K) -> String {
    match obj.meta().namespace.as_deref() {
        Some(ns) if !ns.is_empty() => format!("{ns}/{}", obj.name_any()),
        _ => obj.name_any(),
    }
}

/// Inverse of [`object_key`]
pub fn split_key(key: &str) -> Result<(Option<&str>, &str)> {
    let (namespace, name) = match key.split_once('/') {
        None => (None, key),
        Some((ns, name)) => (Some(ns), name),
    };
    if name.is_empty() || name.contains('/') || namespace == Some("") {
        return Err(Error::MalformedKey(key.to_string()));
    }
    Ok((namespace, name))
}

pub trait HasSynced: Send + Sync {
    fn has_synced(&self) -> bool;
}

/// Read side of an informer: a snapshot view over the reflected objects
pub struct Informer<K: Resource<DynamicType = ()> + 'static> {
    store: Store<K>,
    synced: Arc<AtomicBool>,
}

impl<K: Resource<DynamicType = ()> + 'static> Clone for Informer<K> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            synced: self.synced.clone(),
        }
    }
}

impl<K: Resource<DynamicType = ()> + Clone + 'static> Informer<K> {
    pub fn get_by_key(&self, key: &str) -> Option<Arc<K>> {
        let (namespace, name) = split_key(key).ok()?;
        let oref = ObjectRef::new(name);
        match namespace {
            Some(ns) => self.store.get(&oref.within(ns)),
            None => self.store.get(&oref),
        }
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.store.get(&ObjectRef::new(name).within(namespace))
    }

    pub fn list(&self) -> Vec<Arc<K>> {
        self.store.state()
    }
}

impl<K: Resource<DynamicType = ()> + Send + Sync + 'static> HasSynced for Informer<K> {
    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}

/// Write side of an informer. Applies watcher events to the store and reports what changed.
pub struct Reflector<K: Resource<DynamicType = ()> + Clone + 'static> {
    writer: Writer<K>,
    reader: Store<K>,
    /// objects received so far in an ongoing relist
    relist: Option<Vec<Arc<K>>>,
    synced: Arc<AtomicBool>,
}

impl<K: Resource<DynamicType = ()> + Clone + 'static> Reflector<K> {
    pub fn new() -> (Informer<K>, Self) {
        let (reader, writer) = reflector::store();
        let synced = Arc::new(AtomicBool::new(false));
        let informer = Informer {
            store: reader.clone(),
            synced: synced.clone(),
        };
        (
            informer,
            Self {
                writer,
                reader,
                relist: None,
                synced,
            },
        )
    }

    pub fn apply(&mut self, event: watcher::Event<K>) -> Vec<Delta<K>> {
        let deltas = match &event {
            watcher::Event::Apply(obj) => {
                let new = Arc::new(obj.clone());
                match self.reader.get(&ObjectRef::from_obj(obj)) {
                    Some(old) => vec![Delta::Updated { old, new }],
                    None => vec![Delta::Added(new)],
                }
            }
            watcher::Event::Delete(obj) => vec![Delta::Deleted(Arc::new(obj.clone()))],
            watcher::Event::Init => {
                self.relist = Some(Vec::new());
                Vec::new()
            }
            watcher::Event::InitApply(obj) => {
                self.relist
                    .get_or_insert_with(Vec::new)
                    .push(Arc::new(obj.clone()));
                Vec::new()
            }
            watcher::Event::InitDone => self.finish_relist(),
        };

        // the store swaps in the relisted objects on InitDone, so deltas are computed against the old state first
        self.writer.apply_watcher_event(&event);
        if matches!(event, watcher::Event::InitDone) {
            self.synced.store(true, Ordering::Release);
        }
        deltas
    }

    fn finish_relist(&mut self) -> Vec<Delta<K>> {
        let listed = self.relist.take().unwrap_or_default();
        let mut seen = HashSet::with_capacity(listed.len());
        let mut deltas = Vec::with_capacity(listed.len());

        for new in listed {
            let oref = ObjectRef::from_obj(new.as_ref());
            deltas.push(match self.reader.get(&oref) {
                Some(old) => Delta::Updated { old, new },
                None => Delta::Added(new),
            });
            seen.insert(oref);
        }

        for last_known in self.reader.state() {
            if !seen.contains(&ObjectRef::from_obj(last_known.as_ref())) {
                deltas.push(Delta::DeletedFinalStateUnknown {
                    key: object_key(last_known.as_ref()),
                    last_known,
                });
            }
        }
        deltas
    }
}

/// List and watch `api`, mirroring it into the reflector and forwarding every change onto `events`.
///
/// Runs until `shutdown` fires or the receiving side of `events` goes away.
pub async fn run_informer<K, E>(
    api: Api<K>,
    config: watcher::Config,
    mut reflector: Reflector<K>,
    events: mpsc::Sender<E>,
    wrap: fn(Delta<K>) -> E,
    mut shutdown: watch::Receiver<bool>,
) where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let kind = K::kind(&()).to_string();
    let mut stream = watcher(api, config).default_backoff().boxed();
    debug!("Starting {kind} informer");

    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => break,
            event = stream.next() => event,
        };

        match event {
            None => {
                warn!("{kind} watch stream ended");
                break;
            }
            Some(Err(err)) => warn!("{kind} watch failed, retrying: {err}"),
            Some(Ok(event)) => {
                for delta in reflector.apply(event) {
                    if events.send(wrap(delta)).await.is_err() {
                        debug!("Event dispatcher has gone away, stopping {kind} informer");
                        return;
                    }
                }
            }
        }
    }
    debug!("Stopped {kind} informer");
}

/// Wait until every informer has completed its initial list, or fail after `timeout`
pub async fn wait_for_cache_sync(timeout: Duration, informers: &[&dyn HasSynced]) -> Result<()> {
    let synced = async {
        let mut interval = tokio::time::interval(SYNC_POLL_INTERVAL);
        loop {
            interval.tick().await;
            if informers.iter().all(|i| i.has_synced()) {
                return;
            }
        }
    };
    tokio::time::timeout(timeout, synced)
        .await
        .map_err(|_| Error::CacheSyncTimeout(timeout))
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::Service;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    fn service(name: &str, resource_version: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                resource_version: Some(resource_version.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn version(obj: &Service) -> Option<&str> {
        obj.metadata.resource_version.as_deref()
    }

    fn synced(reflector: &mut Reflector<Service>, objs: Vec<Service>) -> Vec<Delta<Service>> {
        let mut deltas = reflector.apply(watcher::Event::Init);
        for obj in objs {
            deltas.extend(reflector.apply(watcher::Event::InitApply(obj)));
        }
        deltas.extend(reflector.apply(watcher::Event::InitDone));
        deltas
    }

    #[test]
    fn split_key_accepts_namespaced_and_cluster_scoped() {
        assert_eq!(split_key("default/foo").unwrap(), (Some("default"), "foo"));
        assert_eq!(split_key("foo").unwrap(), (None, "foo"));
    }

    #[test]
    fn split_key_rejects_malformed() {
        for key in ["", "a/b/c", "/foo", "default/"] {
            assert!(
                matches!(split_key(key), Err(Error::MalformedKey(_))),
                "{key:?} should be rejected"
            );
        }
    }

    #[test]
    fn object_key_includes_namespace() {
        assert_eq!(object_key(&service("foo", "1")), "default/foo");
    }

    #[test]
    fn initial_list_is_reported_as_adds_and_marks_synced() {
        let (informer, mut reflector) = Reflector::<Service>::new();
        assert!(!informer.has_synced());

        let deltas = synced(&mut reflector, vec![service("foo", "1"), service("bar", "1")]);

        assert_eq!(deltas.len(), 2);
        assert!(deltas.iter().all(|d| matches!(d, Delta::Added(_))));
        assert!(informer.has_synced());
        assert!(informer.get_by_key("default/foo").is_some());
        assert!(informer.get("default", "bar").is_some());
    }

    #[test]
    fn objects_are_not_visible_until_list_completes() {
        let (informer, mut reflector) = Reflector::<Service>::new();
        reflector.apply(watcher::Event::Init);
        reflector.apply(watcher::Event::InitApply(service("foo", "1")));
        assert!(informer.get_by_key("default/foo").is_none());
        assert!(!informer.has_synced());
    }

    #[test]
    fn apply_of_known_object_is_an_update_with_old_state() {
        let (_, mut reflector) = Reflector::<Service>::new();
        synced(&mut reflector, vec![service("foo", "1")]);

        let deltas = reflector.apply(watcher::Event::Apply(service("foo", "2")));
        match deltas.as_slice() {
            [Delta::Updated { old, new }] => {
                assert_eq!(version(old), Some("1"));
                assert_eq!(version(new), Some("2"));
            }
            other => panic!("expected a single update, got {other:?}"),
        }

        let deltas = reflector.apply(watcher::Event::Apply(service("baz", "3")));
        assert!(matches!(deltas.as_slice(), [Delta::Added(_)]));
    }

    #[test]
    fn delete_removes_from_store() {
        let (informer, mut reflector) = Reflector::<Service>::new();
        synced(&mut reflector, vec![service("foo", "1")]);

        let deltas = reflector.apply(watcher::Event::Delete(service("foo", "2")));
        assert!(matches!(deltas.as_slice(), [Delta::Deleted(_)]));
        assert!(informer.get_by_key("default/foo").is_none());
    }

    #[test]
    fn relist_reports_vanished_objects_as_final_state_unknown() {
        let (informer, mut reflector) = Reflector::<Service>::new();
        synced(&mut reflector, vec![service("foo", "1"), service("bar", "1")]);

        let deltas = synced(&mut reflector, vec![service("foo", "5")]);

        assert_eq!(deltas.len(), 2);
        assert!(deltas.iter().any(|d| matches!(
            d,
            Delta::Updated { old, new } if version(old) == Some("1") && version(new) == Some("5")
        )));
        assert!(deltas.iter().any(|d| matches!(
            d,
            Delta::DeletedFinalStateUnknown { key, last_known }
                if key == "default/bar" && version(last_known) == Some("1")
        )));
        assert!(informer.get_by_key("default/bar").is_none());
        assert_eq!(informer.list().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_cache_sync_times_out() {
        let (informer, _reflector) = Reflector::<Service>::new();
        let result = wait_for_cache_sync(Duration::from_secs(5), &[&informer]).await;
        assert!(matches!(result, Err(Error::CacheSyncTimeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_cache_sync_returns_once_synced() {
        let (informer, mut reflector) = Reflector::<Service>::new();
        synced(&mut reflector, vec![]);
        wait_for_cache_sync(Duration::from_secs(5), &[&informer])
            .await
            .unwrap();
    }
}
