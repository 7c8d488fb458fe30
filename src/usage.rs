use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, PodSpec, Service};

use crate::quantity::{ParseQuantityError, Quantity};

/// A usage vector: resource key to exact quantity.
pub type ResourceUsage = BTreeMap<String, Quantity>;

/* ============================= VECTOR OPS ============================= */

pub fn add_assign(acc: &mut ResourceUsage, other: &ResourceUsage) {
    for (key, qty) in other {
        *acc.entry(key.clone()).or_insert_with(Quantity::zero) += *qty;
    }
}

/// Signed difference `new - old` over the union of keys, with zero entries
/// dropped. Used by admission to preview updates.
pub fn delta(new: &ResourceUsage, old: &ResourceUsage) -> ResourceUsage {
    let mut out = new.clone();
    for (key, qty) in old {
        let entry = out.entry(key.clone()).or_insert_with(Quantity::zero);
        *entry = *entry - *qty;
    }
    out.retain(|_, qty| !qty.is_zero());
    out
}

/// Render a usage vector into the string map published on the status.
pub fn to_wire(usage: &ResourceUsage) -> BTreeMap<String, String> {
    usage
        .iter()
        .map(|(key, qty)| (key.clone(), qty.to_string()))
        .collect()
}

/// Parse a status string map back into an exact usage vector.
pub fn parse_wire(wire: &BTreeMap<String, String>) -> Result<ResourceUsage, ParseQuantityError> {
    wire.iter()
        .map(|(key, value)| Ok((key.clone(), Quantity::parse(value)?)))
        .collect()
}

/* ============================= RESOURCE KEYS ============================= */

const STORAGE_CLASS_STORAGE_SUFFIX: &str = ".storageclass.storage.k8s.io/requests.storage";
const STORAGE_CLASS_COUNT_SUFFIX: &str = ".storageclass.storage.k8s.io/persistentvolumeclaims";

pub fn storage_class_storage_key(storage_class: &str) -> String {
    format!("{storage_class}{STORAGE_CLASS_STORAGE_SUFFIX}")
}

pub fn storage_class_count_key(storage_class: &str) -> String {
    format!("{storage_class}{STORAGE_CLASS_COUNT_SUFFIX}")
}

/// Extract the storage class from a storage-class-scoped key, with a flag
/// for whether it is the byte-size key (true) or the PVC-count key (false).
pub fn storage_class_of_key(key: &str) -> Option<(&str, bool)> {
    if let Some(sc) = key.strip_suffix(STORAGE_CLASS_STORAGE_SUFFIX) {
        (!sc.is_empty()).then_some((sc, true))
    } else if let Some(sc) = key.strip_suffix(STORAGE_CLASS_COUNT_SUFFIX) {
        (!sc.is_empty()).then_some((sc, false))
    } else {
        None
    }
}

/// Normalize a hard-limit key: `cpu`/`memory` alias their `requests.` form
/// and the `count/<resource>.<group>` grammar collapses to the short alias.
pub fn normalize_key(key: &str) -> String {
    match key {
        "cpu" => "requests.cpu".to_string(),
        "memory" => "requests.memory".to_string(),
        _ => key.strip_prefix("count/").unwrap_or(key).to_string(),
    }
}

/// Whether a normalized key belongs to the recognized grammar.
pub fn is_recognized_key(key: &str) -> bool {
    matches!(
        key,
        "requests.cpu"
            | "limits.cpu"
            | "requests.memory"
            | "limits.memory"
            | "requests.ephemeral-storage"
            | "limits.ephemeral-storage"
            | "requests.storage"
            | "persistentvolumeclaims"
            | "services"
            | "services.loadbalancers"
            | "services.nodeports"
    ) || TrackedKind::ALL.iter().any(|k| k.count_key() == key)
        || key.strip_prefix("hugepages-").is_some_and(|s| !s.is_empty())
        || storage_class_of_key(key).is_some()
        || is_extended_resource(key)
}

/// Vendor-qualified extended resource, e.g. `example.com/gpu`.
fn is_extended_resource(name: &str) -> bool {
    match name.split_once('/') {
        Some((domain, resource)) => {
            !domain.is_empty() && !resource.is_empty() && domain.contains('.')
        }
        None => false,
    }
}

fn is_hugepages(name: &str) -> bool {
    name.strip_prefix("hugepages-").is_some_and(|s| !s.is_empty())
}

/* ============================= POD USAGE ============================= */

/// Terminal pods no longer hold their resources and contribute nothing.
pub fn is_terminal_pod(pod: &Pod) -> bool {
    matches!(
        pod.status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or_default(),
        "Succeeded" | "Failed"
    )
}

/// Compute a pod's usage vector.
///
/// Per resource the effective value is `max(sum over regular containers,
/// max over init containers)`: init containers run to completion before the
/// regular set starts, so the pod's peak is whichever is larger. Compute
/// resources emit `requests.`/`limits.` keys; hugepages and extended
/// resources emit their bare name (requests first, limits only when no
/// request is set). Non-terminal pods also count one `pods`.
pub fn pod_usage(pod: &Pod) -> ResourceUsage {
    let mut usage = ResourceUsage::new();
    if is_terminal_pod(pod) {
        return usage;
    }

    if let Some(spec) = &pod.spec {
        let requests = effective_resources(spec, Picker::Requests);
        let limits = effective_resources(spec, Picker::Limits);

        for (name, qty) in &requests {
            if qty.is_zero() {
                continue;
            }
            if is_hugepages(name) || is_extended_resource(name) {
                usage.insert(name.clone(), *qty);
            } else {
                usage.insert(format!("requests.{name}"), *qty);
            }
        }
        for (name, qty) in &limits {
            if qty.is_zero() {
                continue;
            }
            if is_hugepages(name) || is_extended_resource(name) {
                usage.entry(name.clone()).or_insert(*qty);
            } else {
                usage.insert(format!("limits.{name}"), *qty);
            }
        }
    }

    usage.insert("pods".to_string(), Quantity::one());
    usage
}

#[derive(Clone, Copy)]
enum Picker {
    Requests,
    Limits,
}

/// Effective per-resource values for one side (requests or limits):
/// sum across regular containers, max across init containers, max of the two.
fn effective_resources(spec: &PodSpec, picker: Picker) -> BTreeMap<String, Quantity> {
    let pick = |c: &k8s_openapi::api::core::v1::Container| {
        c.resources.as_ref().and_then(|r| match picker {
            Picker::Requests => r.requests.clone(),
            Picker::Limits => r.limits.clone(),
        })
    };

    let mut regular_sum: BTreeMap<String, Quantity> = BTreeMap::new();
    for container in &spec.containers {
        for (name, raw) in pick(container).unwrap_or_default() {
            if let Ok(qty) = Quantity::parse(&raw.0) {
                *regular_sum.entry(name).or_insert_with(Quantity::zero) += qty;
            }
        }
    }

    let mut init_max: BTreeMap<String, Quantity> = BTreeMap::new();
    for container in spec.init_containers.iter().flatten() {
        for (name, raw) in pick(container).unwrap_or_default() {
            if let Ok(qty) = Quantity::parse(&raw.0) {
                let entry = init_max.entry(name).or_insert_with(Quantity::zero);
                if qty > *entry {
                    *entry = qty;
                }
            }
        }
    }

    let mut effective = regular_sum;
    for (name, qty) in init_max {
        let entry = effective.entry(name).or_insert_with(Quantity::zero);
        if qty > *entry {
            *entry = qty;
        }
    }
    effective
}

/* ============================= PVC USAGE ============================= */

pub fn pvc_usage(pvc: &PersistentVolumeClaim) -> ResourceUsage {
    let one = Quantity::one();
    let mut usage = ResourceUsage::new();
    usage.insert("persistentvolumeclaims".to_string(), one);

    let Some(spec) = &pvc.spec else {
        return usage;
    };
    let storage_class = spec.storage_class_name.as_deref().filter(|s| !s.is_empty());

    if let Some(sc) = storage_class {
        usage.insert(storage_class_count_key(sc), one);
    }

    let requested = spec
        .resources
        .as_ref()
        .and_then(|r| r.requests.as_ref())
        .and_then(|req| req.get("storage"))
        .and_then(|raw| Quantity::parse(&raw.0).ok());

    if let Some(size) = requested {
        usage.insert("requests.storage".to_string(), size);
        if let Some(sc) = storage_class {
            usage.insert(storage_class_storage_key(sc), size);
        }
    }

    usage
}

/* ============================= SERVICE USAGE ============================= */

pub fn service_usage(service: &Service) -> ResourceUsage {
    let one = Quantity::one();
    let mut usage = ResourceUsage::new();
    usage.insert("services".to_string(), one);

    match service
        .spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        .unwrap_or_default()
    {
        "LoadBalancer" => {
            usage.insert("services.loadbalancers".to_string(), one);
        }
        "NodePort" => {
            usage.insert("services.nodeports".to_string(), one);
        }
        _ => {}
    }

    usage
}

/* ============================= TRACKED KINDS ============================= */

/// Every kind whose objects contribute to a resource key. Pod, PVC, and
/// Service have dedicated calculators; the rest are pure object counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TrackedKind {
    Pod,
    PersistentVolumeClaim,
    Service,
    ConfigMap,
    Secret,
    Deployment,
    StatefulSet,
    DaemonSet,
    ReplicationController,
    Job,
    CronJob,
    HorizontalPodAutoscaler,
    Ingress,
}

impl TrackedKind {
    pub const ALL: [TrackedKind; 13] = [
        TrackedKind::Pod,
        TrackedKind::PersistentVolumeClaim,
        TrackedKind::Service,
        TrackedKind::ConfigMap,
        TrackedKind::Secret,
        TrackedKind::Deployment,
        TrackedKind::StatefulSet,
        TrackedKind::DaemonSet,
        TrackedKind::ReplicationController,
        TrackedKind::Job,
        TrackedKind::CronJob,
        TrackedKind::HorizontalPodAutoscaler,
        TrackedKind::Ingress,
    ];

    pub fn kind(&self) -> &'static str {
        match self {
            TrackedKind::Pod => "Pod",
            TrackedKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            TrackedKind::Service => "Service",
            TrackedKind::ConfigMap => "ConfigMap",
            TrackedKind::Secret => "Secret",
            TrackedKind::Deployment => "Deployment",
            TrackedKind::StatefulSet => "StatefulSet",
            TrackedKind::DaemonSet => "DaemonSet",
            TrackedKind::ReplicationController => "ReplicationController",
            TrackedKind::Job => "Job",
            TrackedKind::CronJob => "CronJob",
            TrackedKind::HorizontalPodAutoscaler => "HorizontalPodAutoscaler",
            TrackedKind::Ingress => "Ingress",
        }
    }

    /// Short object-count alias for this kind.
    pub fn count_key(&self) -> &'static str {
        match self {
            TrackedKind::Pod => "pods",
            TrackedKind::PersistentVolumeClaim => "persistentvolumeclaims",
            TrackedKind::Service => "services",
            TrackedKind::ConfigMap => "configmaps",
            TrackedKind::Secret => "secrets",
            TrackedKind::Deployment => "deployments.apps",
            TrackedKind::StatefulSet => "statefulsets.apps",
            TrackedKind::DaemonSet => "daemonsets.apps",
            TrackedKind::ReplicationController => "replicationcontrollers",
            TrackedKind::Job => "jobs.batch",
            TrackedKind::CronJob => "cronjobs.batch",
            TrackedKind::HorizontalPodAutoscaler => "horizontalpodautoscalers.autoscaling",
            TrackedKind::Ingress => "ingresses.networking.k8s.io",
        }
    }

    pub fn from_kind(kind: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.kind() == kind)
    }

    /// Resolve a CLI flag value: the count-key alias or the kind name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.count_key() == name || k.kind().eq_ignore_ascii_case(name))
    }

    /// Usage contributed by one object of this kind existing: its count key.
    pub fn count_usage(&self) -> ResourceUsage {
        BTreeMap::from([(
            self.count_key().to_string(),
            Quantity::one(),
        )])
    }
}

/* ============================= TESTS ============================= */
