use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use k8s_openapi::api::core::v1::Namespace;

use crate::crd::{ClusterResourceQuota, ClusterResourceQuotaSpec};
use crate::quantity::Quantity;
use crate::selector;
use crate::usage::{self, ResourceUsage};

/* ============================= TYPES ============================= */

/// Outcome of one admission evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionVerdict {
    pub allowed: bool,
    pub message: Option<String>,
}

impl AdmissionVerdict {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            message: None,
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            message: Some(message.into()),
        }
    }
}

/* ============================= SPEC VALIDATION ============================= */

/// A persistent error in a quota spec. Surfaced as an admission rejection
/// on create/update and as a status condition by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecError {
    InvalidSelector(String),
    UnrecognizedKey(String),
    InvalidQuantity { key: String, reason: String },
    NegativeQuantity(String),
}

impl SpecError {
    /// The status condition type this error maps to.
    pub fn condition_type(&self) -> &'static str {
        match self {
            SpecError::InvalidSelector(_) => crate::crd::CONDITION_INVALID_SELECTOR,
            _ => crate::crd::CONDITION_INVALID_SPEC,
        }
    }
}

impl fmt::Display for SpecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpecError::InvalidSelector(reason) => write!(f, "invalid namespace selector: {reason}"),
            SpecError::UnrecognizedKey(key) => write!(f, "unrecognized resource key {key:?}"),
            SpecError::InvalidQuantity { key, reason } => {
                write!(f, "invalid quantity for {key:?}: {reason}")
            }
            SpecError::NegativeQuantity(key) => write!(f, "negative quantity for {key:?}"),
        }
    }
}

impl std::error::Error for SpecError {}

pub fn validate_quota_spec(spec: &ClusterResourceQuotaSpec) -> Result<(), SpecError> {
    selector::validate(&spec.namespace_selector).map_err(SpecError::InvalidSelector)?;

    for (key, value) in &spec.hard {
        let normalized = usage::normalize_key(key);
        if !usage::is_recognized_key(&normalized) {
            return Err(SpecError::UnrecognizedKey(key.clone()));
        }
        let qty = Quantity::parse(value).map_err(|e| SpecError::InvalidQuantity {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        if qty.is_negative() {
            return Err(SpecError::NegativeQuantity(key.clone()));
        }
    }

    Ok(())
}

/// The hard limits of a quota with keys normalized and values parsed.
/// Unparseable entries are dropped; they never pass spec validation.
pub fn hard_limits(spec: &ClusterResourceQuotaSpec) -> ResourceUsage {
    spec.hard
        .iter()
        .filter_map(|(key, value)| {
            Quantity::parse(value)
                .ok()
                .map(|qty| (usage::normalize_key(key), qty))
        })
        .collect()
}

/// The aggregate usage currently published on a quota's status.
pub fn status_used(quota: &ClusterResourceQuota) -> ResourceUsage {
    quota
        .status
        .as_ref()
        .and_then(|s| s.total.as_ref())
        .map(|t| {
            t.used
                .iter()
                .filter_map(|(key, value)| {
                    Quantity::parse(value).ok().map(|qty| (key.clone(), qty))
                })
                .collect()
        })
        .unwrap_or_default()
}

/* ============================= QUOTA OVERLAP (C5a) ============================= */

/// Gate a quota create/update: every namespace the candidate would select
/// must be free, i.e. selected by no other quota (live evaluation) and not
/// attributed to another quota in the ownership index.
pub fn check_quota_overlap(
    candidate: &ClusterResourceQuota,
    existing: &[ClusterResourceQuota],
    namespaces: &[Namespace],
    ownership_hint: &HashMap<String, String>,
    exclusion_key: &str,
) -> AdmissionVerdict {
    let candidate_name = candidate.metadata.name.as_deref().unwrap_or_default();
    let selected = selector::select(
        &candidate.spec.namespace_selector,
        namespaces,
        exclusion_key,
    );

    let mut conflicts: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for ns in selected {
        let ns_name = ns.metadata.name.as_deref().unwrap_or_default();
        let labels = selector::labels_of(ns);

        for other in existing {
            let other_name = other.metadata.name.as_deref().unwrap_or_default();
            if other_name == candidate_name {
                continue;
            }
            if selector::matches(&other.spec.namespace_selector, &labels) {
                conflicts
                    .entry(ns_name.to_string())
                    .or_default()
                    .insert(other_name.to_string());
            }
        }

        if let Some(owner) = ownership_hint.get(ns_name)
            && owner != candidate_name
        {
            conflicts
                .entry(ns_name.to_string())
                .or_default()
                .insert(owner.clone());
        }
    }

    if conflicts.is_empty() {
        return AdmissionVerdict::allow();
    }

    let detail: Vec<String> = conflicts
        .iter()
        .map(|(ns, owners)| {
            let owners: Vec<&str> = owners.iter().map(String::as_str).collect();
            format!(
                "namespace \"{ns}\" is already selected by {}",
                owners.join(", ")
            )
        })
        .collect();

    AdmissionVerdict::deny(format!(
        "namespace ownership conflict: {}",
        detail.join("; ")
    ))
}

/* ============================= NAMESPACE MULTI-MATCH (C5b) ============================= */

/// Gate a namespace create/update: with its new labels the namespace must
/// be selected by at most one quota.
pub fn check_namespace_multi_match(
    namespace: &str,
    labels: &BTreeMap<String, String>,
    quotas: &[ClusterResourceQuota],
    exclusion_key: &str,
) -> AdmissionVerdict {
    let selecting = selector::selecting_quotas(quotas, labels, exclusion_key);
    if selecting.len() <= 1 {
        return AdmissionVerdict::allow();
    }

    let names: Vec<&str> = selecting
        .iter()
        .map(|q| q.metadata.name.as_deref().unwrap_or_default())
        .collect();

    AdmissionVerdict::deny(format!(
        "multiple ClusterResourceQuotas select namespace \"{namespace}\": {}",
        names.join(", ")
    ))
}

/* ============================= USAGE DELTA (C5c) ============================= */

/// Gate a workload write against one quota: for every hard-limited key,
/// current usage plus the candidate delta must stay within the limit.
pub fn check_usage_delta(quota: &ClusterResourceQuota, delta: &ResourceUsage) -> AdmissionVerdict {
    let quota_name = quota.metadata.name.as_deref().unwrap_or_default();
    let hard = hard_limits(&quota.spec);
    let used = status_used(quota);

    let mut violations: Vec<String> = Vec::new();
    for (key, requested) in delta {
        if requested.is_zero() || requested.is_negative() {
            continue;
        }
        let Some(limit) = hard.get(key) else {
            continue;
        };
        let current = used.get(key).copied().unwrap_or_else(Quantity::zero);
        if current + *requested > *limit {
            violations.push(format!(
                "{}: quota \"{quota_name}\" limits {key} to {limit} (used {current}, requested {requested})",
                limit_phrase(key)
            ));
        }
    }

    if violations.is_empty() {
        AdmissionVerdict::allow()
    } else {
        AdmissionVerdict::deny(violations.join("; "))
    }
}

/// Human phrase for a denied resource key; admission messages and their
/// tests key on these substrings.
fn limit_phrase(key: &str) -> String {
    if let Some((sc, is_storage)) = usage::storage_class_of_key(key) {
        return if is_storage {
            format!("ClusterResourceQuota storage class '{sc}' storage validation failed")
        } else {
            format!("ClusterResourceQuota storage class '{sc}' PVC count validation failed")
        };
    }

    match key {
        "requests.cpu" => "ClusterResourceQuota CPU requests validation failed".to_string(),
        "limits.cpu" => "ClusterResourceQuota CPU limits validation failed".to_string(),
        "requests.memory" => "ClusterResourceQuota memory requests validation failed".to_string(),
        "limits.memory" => "ClusterResourceQuota memory limits validation failed".to_string(),
        "pods" => "pods limit exceeded".to_string(),
        "persistentvolumeclaims" => "PVC count limit exceeded".to_string(),
        "requests.storage" => "storage limit exceeded".to_string(),
        "requests.ephemeral-storage" | "limits.ephemeral-storage" => {
            "ephemeral storage limit exceeded".to_string()
        }
        _ => format!("{key} limit exceeded"),
    }
}

/* ============================= TESTS ============================= */
