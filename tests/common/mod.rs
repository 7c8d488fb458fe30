// Not every integration binary exercises every builder.
#![allow(dead_code)]

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, Namespace, PersistentVolumeClaim, PersistentVolumeClaimSpec, Pod, PodSpec,
    PodStatus, ResourceRequirements, Service, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity as K8sQuantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use pac_quota_controller::crd::{
    ClusterResourceQuota, ClusterResourceQuotaSpec, ClusterResourceQuotaStatus, NamespaceSelector,
    QuotaTotals,
};

pub fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn make_namespace(name: &str, label_pairs: &[(&str, &str)]) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels(label_pairs)),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn make_requests(pairs: &[(&str, &str)]) -> Option<ResourceRequirements> {
    if pairs.is_empty() {
        return None;
    }
    Some(ResourceRequirements {
        requests: Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), K8sQuantity(v.to_string())))
                .collect(),
        ),
        ..Default::default()
    })
}

pub fn make_container(name: &str, image: &str, requests: &[(&str, &str)]) -> Container {
    Container {
        name: name.to_string(),
        image: Some(image.to_string()),
        resources: make_requests(requests),
        ..Default::default()
    }
}

pub fn make_pod(
    name: &str,
    namespace: &str,
    containers: Vec<Container>,
    init_containers: Vec<Container>,
    phase: &str,
) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers,
            init_containers: if init_containers.is_empty() {
                None
            } else {
                Some(init_containers)
            },
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
    }
}

pub fn make_quota(
    name: &str,
    selector_pairs: &[(&str, &str)],
    hard_pairs: &[(&str, &str)],
) -> ClusterResourceQuota {
    ClusterResourceQuota {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: ClusterResourceQuotaSpec {
            namespace_selector: NamespaceSelector {
                match_labels: Some(labels(selector_pairs)),
                match_expressions: None,
            },
            hard: hard_pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        },
        status: None,
    }
}

/// Attach a published aggregate usage to a quota, the way the reconciler
/// leaves it for the admission handlers to read.
pub fn quota_with_used(
    mut quota: ClusterResourceQuota,
    used_pairs: &[(&str, &str)],
) -> ClusterResourceQuota {
    quota.status = Some(ClusterResourceQuotaStatus {
        namespaces: vec![],
        total: Some(QuotaTotals {
            hard: quota.spec.hard.clone(),
            used: used_pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }),
        conditions: vec![],
    });
    quota
}

pub fn make_pvc(
    name: &str,
    namespace: &str,
    size: &str,
    storage_class: Option<&str>,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            resources: make_requests(&[("storage", size)]),
            storage_class_name: storage_class.map(str::to_string),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn make_service(name: &str, namespace: &str, type_: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(type_.to_string()),
            ..Default::default()
        }),
        status: None,
    }
}
