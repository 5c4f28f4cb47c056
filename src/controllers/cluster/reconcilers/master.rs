use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use super::{label_selector, mandatory_labels, object_meta, selector_labels, with_spec_hash};
use crate::resources::clusters::Cluster;
use crate::Result;

pub const COMPONENT: &str = "master";
pub const REST_PORT: i32 = 9200;
pub const NODE_PORT: i32 = 9300;
const CONTAINER_NAME: &str = "elastic-master";

/// Master node count. Fixed for now; `spec.size` is not yet honoured.
pub const MASTER_REPLICAS: i32 = 1;

pub fn master_service_name(cluster_name: &str) -> String {
    format!("{cluster_name}-master-service")
}

pub fn master_deployment_name(cluster_name: &str) -> String {
    format!("{cluster_name}-master-deployment")
}

/// Quorum for master election
pub fn minimum_master_nodes(replicas: i32) -> i32 {
    (replicas + 1) / 2
}

/// Headless service that master nodes use to discover each other
pub fn master_service(cluster: &Cluster) -> Result<Service> {
    let name = cluster.name_any();

    with_spec_hash(Service {
        metadata: object_meta(cluster, master_service_name(&name), COMPONENT)?,
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".into()),
            cluster_ip: Some("None".into()), // headless service
            selector: Some(selector_labels(&name, COMPONENT)),
            ports: Some(vec![
                ServicePort {
                    name: Some("rest".into()),
                    port: REST_PORT,
                    ..Default::default()
                },
                ServicePort {
                    name: Some("node".into()),
                    port: NODE_PORT,
                    ..Default::default()
                },
            ]),
            // masters have to find each other before any of them can become ready
            publish_not_ready_addresses: Some(true),
            ..Default::default()
        }),
        status: None,
    })
}

fn env(cluster: &Cluster, service_dns_name: &str, replicas: i32) -> Vec<EnvVar> {
    [
        ("cluster.name", cluster.display_name().to_string()),
        ("node.master", "true".into()),
        ("node.data", "false".into()),
        ("discovery.zen.ping.unicast.hosts", service_dns_name.into()),
        (
            "discovery.zen.minimum_master_nodes",
            minimum_master_nodes(replicas).to_string(),
        ),
    ]
    .into_iter()
    .map(|(name, value)| EnvVar {
        name: name.into(),
        value: Some(value),
        value_from: None,
    })
    .collect()
}

/// Rolling-updated deployment of master-eligible nodes
pub fn master_deployment(cluster: &Cluster, service_dns_name: &str) -> Result<Deployment> {
    let name = cluster.name_any();

    with_spec_hash(Deployment {
        metadata: object_meta(cluster, master_deployment_name(&name), COMPONENT)?,
        spec: Some(DeploymentSpec {
            replicas: Some(MASTER_REPLICAS),
            selector: label_selector(&name, COMPONENT),
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".into()),
                rolling_update: Some(RollingUpdateDeployment {
                    max_unavailable: Some(IntOrString::Int(1)),
                    max_surge: Some(IntOrString::Int(1)),
                }),
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(mandatory_labels(&name, COMPONENT)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: CONTAINER_NAME.into(),
                        image: Some(cluster.spec.image().into()),
                        image_pull_policy: Some("IfNotPresent".into()),
                        ports: Some(vec![
                            ContainerPort {
                                name: Some("http".into()),
                                container_port: REST_PORT,
                                ..Default::default()
                            },
                            ContainerPort {
                                name: Some("transport".into()),
                                container_port: NODE_PORT,
                                ..Default::default()
                            },
                        ]),
                        env: Some(env(cluster, service_dns_name, MASTER_REPLICAS)),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}

#[cfg(test)]
mod tests {
    use assert_json_diff::assert_json_include;
    use serde_json::json;

    use super::*;
    use crate::controllers::cluster::reconcilers::{service_dns_name, spec_hash};
    use crate::resources::clusters::ClusterSpec;
    use crate::Error;

    fn cluster(name: &str, size: i32) -> Cluster {
        let mut cluster = Cluster::new(
            name,
            ClusterSpec {
                name: name.into(),
                size,
                image: None,
            },
        );
        cluster.metadata.namespace = Some("default".into());
        cluster.metadata.uid = Some(format!("{name}-uid"));
        cluster
    }

    #[test]
    fn master_service_is_headless_with_es_ports() {
        let svc = master_service(&cluster("example-cluster", 1)).unwrap();

        assert_json_include!(
            actual: serde_json::to_value(&svc).unwrap(),
            expected: json!({
                "apiVersion": "v1",
                "kind": "Service",
                "metadata": {
                    "name": "example-cluster-master-service",
                    "namespace": "default",
                    "labels": {
                        "elasticsearch-cluster": "example-cluster",
                        "app.kubernetes.io/managed-by": "elasticsearch-operator",
                    },
                    "ownerReferences": [{
                        "apiVersion": "es.matt-tyler.github.com/v1",
                        "kind": "Cluster",
                        "name": "example-cluster",
                        "uid": "example-cluster-uid",
                        "controller": true,
                    }],
                },
                "spec": {
                    "type": "ClusterIP",
                    "clusterIP": "None",
                    "ports": [
                        {"name": "rest", "port": 9200},
                        {"name": "node", "port": 9300},
                    ],
                },
            })
        );
    }

    #[test]
    fn master_deployment_runs_one_master() {
        let cluster = cluster("example-cluster", 1);
        let dns = service_dns_name(&master_service_name("example-cluster"), "default");
        let deployment = master_deployment(&cluster, &dns).unwrap();

        assert_json_include!(
            actual: serde_json::to_value(&deployment).unwrap(),
            expected: json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": {
                    "name": "example-cluster-master-deployment",
                    "ownerReferences": [{"uid": "example-cluster-uid"}],
                },
                "spec": {
                    "replicas": 1,
                    "strategy": {
                        "type": "RollingUpdate",
                        "rollingUpdate": {"maxUnavailable": 1, "maxSurge": 1},
                    },
                    "template": {
                        "spec": {
                            "containers": [{
                                "name": "elastic-master",
                                "imagePullPolicy": "IfNotPresent",
                                "ports": [{"containerPort": 9200}, {"containerPort": 9300}],
                            }],
                        },
                    },
                },
            })
        );

        let env = deployment.spec.unwrap().template.spec.unwrap().containers[0]
            .env
            .clone()
            .unwrap();
        let value = |name: &str| {
            env.iter()
                .find(|e| e.name == name)
                .and_then(|e| e.value.clone())
        };
        assert_eq!(value("discovery.zen.minimum_master_nodes").as_deref(), Some("1"));
        assert_eq!(
            value("discovery.zen.ping.unicast.hosts").as_deref(),
            Some("example-cluster-master-service.default.svc.cluster.local")
        );
        assert_eq!(value("cluster.name").as_deref(), Some("example-cluster"));
    }

    #[test]
    fn replicas_ignore_size() {
        let deployment = master_deployment(&cluster("big", 5), "big-master-service").unwrap();
        assert_eq!(deployment.spec.unwrap().replicas, Some(MASTER_REPLICAS));
    }

    #[test]
    fn deployment_selector_matches_pod_labels_and_service_selector() {
        let cluster = cluster("example-cluster", 1);
        let svc = master_service(&cluster).unwrap();
        let deployment = master_deployment(&cluster, "dns").unwrap();

        let spec = deployment.spec.unwrap();
        let selector = spec.selector.match_labels.unwrap();
        let pod_labels = spec.template.metadata.unwrap().labels.unwrap();
        assert!(selector.iter().all(|(k, v)| pod_labels.get(k) == Some(v)));
        assert_eq!(svc.spec.unwrap().selector.unwrap(), selector);
    }

    #[test]
    fn builders_are_deterministic() {
        let cluster = cluster("example-cluster", 1);
        assert_eq!(
            serde_json::to_vec(&master_service(&cluster).unwrap()).unwrap(),
            serde_json::to_vec(&master_service(&cluster).unwrap()).unwrap(),
        );
        assert_eq!(
            serde_json::to_vec(&master_deployment(&cluster, "dns").unwrap()).unwrap(),
            serde_json::to_vec(&master_deployment(&cluster, "dns").unwrap()).unwrap(),
        );
    }

    #[test]
    fn spec_hash_tracks_desired_state() {
        let a = master_deployment(&cluster("example-cluster", 1), "dns").unwrap();
        let mut other = cluster("example-cluster", 1);
        other.spec.image = Some("elasticsearch:6.3.0".into());
        let b = master_deployment(&other, "dns").unwrap();

        assert!(spec_hash(&a).is_some());
        assert_ne!(spec_hash(&a), spec_hash(&b));
    }

    #[test]
    fn minimum_master_nodes_is_half_rounded_up() {
        assert_eq!(minimum_master_nodes(1), 1);
        assert_eq!(minimum_master_nodes(2), 1);
        assert_eq!(minimum_master_nodes(3), 2);
        assert_eq!(minimum_master_nodes(5), 3);
    }

    #[test]
    fn cluster_without_uid_cannot_own_objects() {
        let mut cluster = cluster("example-cluster", 1);
        cluster.metadata.uid = None;
        assert!(matches!(
            master_service(&cluster),
            Err(Error::MissingObjectKey(_))
        ));
    }
}
