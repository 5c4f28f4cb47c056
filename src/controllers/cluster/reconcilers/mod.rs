use std::collections::BTreeMap;
use std::hash::Hasher;

use assert_json_diff::{assert_json_matches_no_panic, CompareMode, Config};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::{Resource, ResourceExt};
use serde::Serialize;

use crate::resources::clusters::Cluster;
use crate::{Error, Result};

pub mod master;

pub const SPEC_HASH_ANNOTATION: &str = "es.matt-tyler.github.com/spec-hash";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "elasticsearch-operator";
pub const CLUSTER_LABEL: &str = "elasticsearch-cluster";

// mandatory_labels are applied to every object derived from a Cluster
// it is not safe to change these; deployment selectors are immutable
pub fn mandatory_labels(cluster_name: &str, component: &str) -> BTreeMap<String, String> {
    let mut labels = selector_labels(cluster_name, component);
    labels.insert(MANAGED_BY_LABEL.into(), MANAGED_BY.into());
    labels.insert(CLUSTER_LABEL.into(), cluster_name.into());
    labels
}

pub fn selector_labels(cluster_name: &str, component: &str) -> BTreeMap<String, String> {
    BTreeMap::from_iter([
        ("app.kubernetes.io/name".into(), "elasticsearch".into()),
        ("app.kubernetes.io/instance".into(), cluster_name.into()),
        ("app.kubernetes.io/component".into(), component.into()),
    ])
}

pub fn label_selector(cluster_name: &str, component: &str) -> LabelSelector {
    LabelSelector {
        match_labels: Some(selector_labels(cluster_name, component)),
        match_expressions: None,
    }
}

/// Metadata for an object owned by `cluster`, living in the cluster's namespace
pub fn object_meta(cluster: &Cluster, name: impl Into<String>, component: &str) -> Result<ObjectMeta> {
    let oref = cluster
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey(".metadata.uid"))?;
    let namespace = cluster
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;

    Ok(ObjectMeta {
        name: Some(name.into()),
        namespace: Some(namespace),
        labels: Some(mandatory_labels(&cluster.name_any(), component)),
        owner_references: Some(vec![oref]),
        ..Default::default()
    })
}

/// Stamp `obj` with a hash of its own contents, so a later pass can tell whether the object in the
/// api server still matches what we would build now
pub fn with_spec_hash<K: Resource + Serialize>(mut obj: K) -> Result<K> {
    let mut hasher = fnv::FnvHasher::default();
    hasher.write(&serde_json::to_vec(&obj)?);
    obj.annotations_mut().insert(
        SPEC_HASH_ANNOTATION.into(),
        format!("{:016x}", hasher.finish()),
    );
    Ok(obj)
}

pub fn spec_hash<K: Resource>(obj: &K) -> Option<&str> {
    obj.annotations().get(SPEC_HASH_ANNOTATION).map(String::as_str)
}

/// Whether `observed` no longer carries everything `desired` sets.
///
/// Fields the api server or other controllers add are ignored; anything we set that was changed or
/// removed counts as drift.
pub fn has_drifted<K: Resource + Serialize>(observed: &K, desired: &K) -> bool {
    if spec_hash(observed) != spec_hash(desired) {
        return true;
    }
    assert_json_matches_no_panic(observed, desired, Config::new(CompareMode::Inclusive)).is_err()
}

/// The in-cluster DNS name of a service
pub fn service_dns_name(service_name: &str, namespace: &str) -> String {
    format!("{service_name}.{namespace}.svc.cluster.local")
}
