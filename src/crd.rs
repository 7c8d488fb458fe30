use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/* ============================= SELECTOR TYPES ============================= */

/// Operator for a set-based selector requirement.
///
/// Matches the Kubernetes label-selector operators: `In` and `NotIn` test
/// membership of the label value, `Exists` and `DoesNotExist` test key
/// presence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// One set-based requirement of a namespace selector.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SelectorRequirement {
    pub key: String,
    pub operator: SelectorOperator,

    /// Required non-empty for `In`/`NotIn`; must be absent for
    /// `Exists`/`DoesNotExist`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<String>>,
}

/// Label predicate selecting the namespaces a quota spans.
///
/// Both forms may be combined; a namespace matches when every equality pair
/// and every expression matches. The empty selector matches all namespaces.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_labels: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_expressions: Option<Vec<SelectorRequirement>>,
}

/* ============================= SPEC ============================= */

/// ClusterResourceQuota aggregates resource usage across every namespace
/// matched by its selector and enforces the `hard` limits at admission.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "quota.powerapp.cloud",
    version = "v1alpha1",
    kind = "ClusterResourceQuota",
    plural = "clusterresourcequotas",
    shortname = "crq",
    status = "ClusterResourceQuotaStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterResourceQuotaSpec {
    /// Which namespaces this quota spans.
    #[serde(default)]
    pub namespace_selector: NamespaceSelector,

    /// Hard limits, keyed by resource key (`requests.cpu`, `pods`,
    /// `{sc}.storageclass.storage.k8s.io/requests.storage`, ...). Values are
    /// Kubernetes quantity strings.
    #[serde(default)]
    pub hard: BTreeMap<String, String>,
}

/* ============================= STATUS ============================= */

/// Per-namespace usage record published on the status.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceUsage {
    pub namespace: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub used: BTreeMap<String, String>,
}

/// Aggregate view over all selected namespaces.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct QuotaTotals {
    /// Mirror of `spec.hard` with keys normalized.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hard: BTreeMap<String, String>,

    /// Aggregate usage; every hard key is present, zero-filled when unused.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub used: BTreeMap<String, String>,
}

pub const CONDITION_INVALID_SELECTOR: &str = "InvalidSelector";
pub const CONDITION_INVALID_SPEC: &str = "InvalidSpec";
pub const CONDITION_OWNERSHIP_CONFLICT: &str = "NamespaceOwnershipConflict";

/// Convergent error reporting on the status; mirrors the shape of
/// `metav1.Condition`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuotaCondition {
    #[serde(rename = "type")]
    pub type_: String,

    /// "True" or "False".
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

/// ClusterResourceQuotaStatus is written only by the reconciler.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterResourceQuotaStatus {
    /// Selected namespaces with their usage, sorted by name.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<NamespaceUsage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<QuotaTotals>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<QuotaCondition>,
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn test_crd_generates_valid_yaml() {
        let crd = ClusterResourceQuota::crd();
        let yaml = serde_yaml::to_string(&crd).expect("CRD should serialize to YAML");
        assert!(yaml.contains("quota.powerapp.cloud"));
        assert!(yaml.contains("ClusterResourceQuota"));
        assert!(yaml.contains("clusterresourcequotas"));
    }

    #[test]
    fn test_crd_is_cluster_scoped() {
        let crd = ClusterResourceQuota::crd();
        assert_eq!(crd.spec.scope, "Cluster");
    }

    #[test]
    fn test_crd_shortname() {
        let crd = ClusterResourceQuota::crd();
        let names = &crd.spec.names;
        assert_eq!(names.short_names.as_deref(), Some(&["crq".to_string()][..]));
    }

    #[test]
    fn test_spec_serialization_roundtrip() {
        let spec = ClusterResourceQuotaSpec {
            namespace_selector: NamespaceSelector {
                match_labels: Some(BTreeMap::from([("team".to_string(), "test".to_string())])),
                match_expressions: None,
            },
            hard: BTreeMap::from([
                ("pods".to_string(), "5".to_string()),
                ("requests.cpu".to_string(), "1000m".to_string()),
            ]),
        };

        let json = serde_json::to_string(&spec).expect("should serialize");
        assert!(json.contains("namespaceSelector"));
        assert!(json.contains("matchLabels"));

        let back: ClusterResourceQuotaSpec =
            serde_json::from_str(&json).expect("should deserialize");
        assert_eq!(back.hard.get("pods").map(String::as_str), Some("5"));
        assert_eq!(
            back.namespace_selector
                .match_labels
                .as_ref()
                .and_then(|m| m.get("team"))
                .map(String::as_str),
            Some("test")
        );
    }

    #[test]
    fn test_selector_operator_wire_casing() {
        let req = SelectorRequirement {
            key: "env".to_string(),
            operator: SelectorOperator::DoesNotExist,
            values: None,
        };
        let json = serde_json::to_string(&req).expect("should serialize");
        assert!(json.contains(r#""operator":"DoesNotExist""#));
        assert!(!json.contains("values"));
    }

    #[test]
    fn test_match_expressions_roundtrip() {
        let json =
            r#"{"matchExpressions":[{"key":"env","operator":"In","values":["prod","staging"]}]}"#;
        let sel: NamespaceSelector = serde_json::from_str(json).expect("should deserialize");
        let exprs = sel.match_expressions.expect("expressions present");
        assert_eq!(exprs.len(), 1);
        assert_eq!(exprs[0].operator, SelectorOperator::In);
        assert_eq!(exprs[0].values.as_ref().map(Vec::len), Some(2));
    }

    #[test]
    fn test_empty_spec_deserializes() {
        let spec: ClusterResourceQuotaSpec =
            serde_json::from_str("{}").expect("empty object should deserialize");
        assert!(spec.hard.is_empty());
        assert_eq!(spec.namespace_selector, NamespaceSelector::default());
    }

    #[test]
    fn test_status_condition_wire_type_field() {
        let cond = QuotaCondition {
            type_: CONDITION_INVALID_SELECTOR.to_string(),
            status: "True".to_string(),
            reason: Some("InvalidSelector".to_string()),
            message: Some("operator In requires values".to_string()),
            last_transition_time: Some("2026-01-01T00:00:00Z".to_string()),
        };
        let json = serde_json::to_string(&cond).expect("should serialize");
        assert!(json.contains(r#""type":"InvalidSelector""#));
        assert!(json.contains("lastTransitionTime"));
    }

    #[test]
    fn test_status_omits_empty_collections() {
        let status = ClusterResourceQuotaStatus::default();
        let json = serde_json::to_string(&status).expect("should serialize");
        assert_eq!(json, "{}");
    }

    #[test]
    fn test_status_namespaces_roundtrip() {
        let status = ClusterResourceQuotaStatus {
            namespaces: vec![NamespaceUsage {
                namespace: "ns-a".to_string(),
                used: BTreeMap::from([("pods".to_string(), "1".to_string())]),
            }],
            total: Some(QuotaTotals {
                hard: BTreeMap::from([("pods".to_string(), "5".to_string())]),
                used: BTreeMap::from([("pods".to_string(), "1".to_string())]),
            }),
            conditions: vec![],
        };
        let json = serde_json::to_string(&status).expect("should serialize");
        let back: ClusterResourceQuotaStatus =
            serde_json::from_str(&json).expect("should deserialize");
        assert_eq!(back, status);
    }
}
