use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Image used for master nodes when the Cluster doesn't name one
pub const DEFAULT_ELASTICSEARCH_IMAGE: &str =
    "docker.elastic.co/elasticsearch/elasticsearch-oss:6.2.4";

/// Represents the desired topology of an Elasticsearch cluster
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "Cluster",
    group = "es.matt-tyler.github.com",
    version = "v1",
    namespaced,
    plural = "clusters",
    printcolumn = r#"{"name":"Size", "type":"integer", "jsonPath":".spec.size"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "ClusterStatus", shortname = "esc")]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Display name of the Elasticsearch cluster, used as `cluster.name`. Defaults to the object name.
    #[serde(default)]
    pub name: String,
    /// Desired number of nodes.
    #[schemars(range(min = 1))]
    pub size: i32,
    /// Container image for Elasticsearch nodes. Defaults to the OSS 6.2.4 image.
    pub image: Option<String>,
}

impl ClusterSpec {
    pub fn image(&self) -> &str {
        self.image
            .as_deref()
            .filter(|image| !image.is_empty())
            .unwrap_or(DEFAULT_ELASTICSEARCH_IMAGE)
    }
}

/// Status of the Cluster.
/// This is set and managed automatically.
/// Read-only.
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq)]
pub struct ClusterStatus {
    pub state: Option<ClusterState>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum ClusterState {
    /// All derived objects exist and are owned by the Cluster
    Created,
    /// Derived objects were created or corrected during the last pass
    Updating,
}

impl Cluster {
    pub fn state(&self) -> Option<ClusterState> {
        self.status.as_ref().and_then(|s| s.state)
    }

    /// `cluster.name` for the Elasticsearch nodes
    pub fn display_name(&self) -> &str {
        if self.spec.name.is_empty() {
            self.metadata.name.as_deref().unwrap_or_default()
        } else {
            &self.spec.name
        }
    }
}
