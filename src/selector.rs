use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Namespace;

use crate::crd::{ClusterResourceQuota, NamespaceSelector, SelectorOperator};

/// Default label key marking a namespace invisible to every quota.
pub const DEFAULT_EXCLUSION_LABEL: &str = "pac-quota-controller.powerapp.cloud/exclude";

/* ============================= MATCHING ============================= */

/// Evaluate a namespace selector against a label set.
///
/// The empty selector matches everything. `NotIn` and `DoesNotExist` match
/// when the key is absent, mirroring Kubernetes label-selector semantics.
pub fn matches(selector: &NamespaceSelector, labels: &BTreeMap<String, String>) -> bool {
    if let Some(match_labels) = &selector.match_labels {
        for (key, value) in match_labels {
            if labels.get(key) != Some(value) {
                return false;
            }
        }
    }

    if let Some(expressions) = &selector.match_expressions {
        for expr in expressions {
            let actual = labels.get(&expr.key);
            let listed = |v: &String| {
                expr.values
                    .as_ref()
                    .is_some_and(|vs| vs.iter().any(|candidate| candidate == v))
            };
            let ok = match expr.operator {
                SelectorOperator::In => actual.is_some_and(listed),
                SelectorOperator::NotIn => !actual.is_some_and(listed),
                SelectorOperator::Exists => actual.is_some(),
                SelectorOperator::DoesNotExist => actual.is_none(),
            };
            if !ok {
                return false;
            }
        }
    }

    true
}

/// Structural validation of a selector, independent of any namespace.
pub fn validate(selector: &NamespaceSelector) -> Result<(), String> {
    for expr in selector.match_expressions.iter().flatten() {
        if expr.key.is_empty() {
            return Err("match expression with empty key".to_string());
        }
        let has_values = expr.values.as_ref().is_some_and(|v| !v.is_empty());
        match expr.operator {
            SelectorOperator::In | SelectorOperator::NotIn => {
                if !has_values {
                    return Err(format!(
                        "operator {:?} on key {:?} requires at least one value",
                        expr.operator, expr.key
                    ));
                }
            }
            SelectorOperator::Exists | SelectorOperator::DoesNotExist => {
                if expr.values.as_ref().is_some_and(|v| !v.is_empty()) {
                    return Err(format!(
                        "operator {:?} on key {:?} must not carry values",
                        expr.operator, expr.key
                    ));
                }
            }
        }
    }
    Ok(())
}

/* ============================= EXCLUSION ============================= */

/// A namespace carrying the exclusion label with the exact value "true" is
/// invisible to every quota regardless of selector.
pub fn is_excluded(labels: &BTreeMap<String, String>, exclusion_key: &str) -> bool {
    labels.get(exclusion_key).map(String::as_str) == Some("true")
}

/* ============================= NAMESPACE HELPERS ============================= */

pub fn labels_of(namespace: &Namespace) -> BTreeMap<String, String> {
    namespace.metadata.labels.clone().unwrap_or_default()
}

fn name_of(namespace: &Namespace) -> &str {
    namespace.metadata.name.as_deref().unwrap_or_default()
}

/// Select the namespaces a quota spans: matched by the selector and not
/// excluded. The result is ordered by namespace name.
pub fn select<'a>(
    selector: &NamespaceSelector,
    namespaces: &'a [Namespace],
    exclusion_key: &str,
) -> Vec<&'a Namespace> {
    let mut selected: Vec<&Namespace> = namespaces
        .iter()
        .filter(|ns| {
            let labels = ns.metadata.labels.clone().unwrap_or_default();
            !is_excluded(&labels, exclusion_key) && matches(selector, &labels)
        })
        .collect();
    selected.sort_by(|a, b| name_of(a).cmp(name_of(b)));
    selected
}

/// Which quotas select a namespace with the given labels, ordered by quota
/// name. More than one entry is an ownership-invariant violation.
pub fn selecting_quotas<'a>(
    quotas: &'a [ClusterResourceQuota],
    labels: &BTreeMap<String, String>,
    exclusion_key: &str,
) -> Vec<&'a ClusterResourceQuota> {
    if is_excluded(labels, exclusion_key) {
        return Vec::new();
    }
    let mut selecting: Vec<&ClusterResourceQuota> = quotas
        .iter()
        .filter(|q| matches(&q.spec.namespace_selector, labels))
        .collect();
    selecting.sort_by(|a, b| {
        a.metadata
            .name
            .as_deref()
            .unwrap_or_default()
            .cmp(b.metadata.name.as_deref().unwrap_or_default())
    });
    selecting
}

/* ============================= TESTS ============================= */
