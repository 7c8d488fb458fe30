use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::reflector::ObjectRef;

use crate::admission::SpecError;
use crate::crd::{
    CONDITION_OWNERSHIP_CONFLICT, ClusterResourceQuota, ClusterResourceQuotaSpec,
    ClusterResourceQuotaStatus, NamespaceUsage, QuotaCondition, QuotaTotals,
};
use crate::selector;
use crate::usage::{self, ResourceUsage};

/* ============================= BACKOFF ============================= */

pub const BACKOFF_BASE: Duration = Duration::from_millis(250);
pub const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Exponential requeue delay for the nth consecutive failure of one quota.
pub fn backoff_for_attempt(attempt: u32) -> Duration {
    BACKOFF_BASE
        .saturating_mul(1u32 << attempt.min(16))
        .min(BACKOFF_MAX)
}

/* ============================= STATUS CONSTRUCTION ============================= */

/// Aggregate per-namespace usage vectors into the cluster-wide total.
pub fn aggregate_usage<'a>(
    per_namespace: impl IntoIterator<Item = &'a ResourceUsage>,
) -> ResourceUsage {
    let mut total = ResourceUsage::new();
    for usage in per_namespace {
        usage::add_assign(&mut total, usage);
    }
    total
}

/// Build the status published after a successful accounting pass.
///
/// Namespace records are sorted by name so repeated runs over an unchanged
/// cluster serialize identically. `total.hard` mirrors the spec with keys
/// normalized; `total.used` carries every observed key plus a zero for
/// every hard key never observed. Ownership conflicts become a condition,
/// never a winner.
pub fn build_status(
    spec: &ClusterResourceQuotaSpec,
    per_namespace: Vec<(String, ResourceUsage)>,
    conflicts: &BTreeMap<String, Vec<String>>,
    now: &str,
) -> ClusterResourceQuotaStatus {
    let mut per_namespace = per_namespace;
    per_namespace.sort_by(|a, b| a.0.cmp(&b.0));

    let hard: BTreeMap<String, String> = spec
        .hard
        .iter()
        .map(|(key, value)| (usage::normalize_key(key), value.clone()))
        .collect();

    let mut total = aggregate_usage(per_namespace.iter().map(|(_, u)| u));
    total.retain(|_, qty| !qty.is_zero());
    let mut used = usage::to_wire(&total);
    for key in hard.keys() {
        used.entry(key.clone()).or_insert_with(|| "0".to_string());
    }

    let namespaces = per_namespace
        .into_iter()
        .map(|(namespace, used)| NamespaceUsage {
            namespace,
            used: usage::to_wire(&used),
        })
        .collect();

    let mut conditions = Vec::new();
    if !conflicts.is_empty() {
        let detail: Vec<String> = conflicts
            .iter()
            .map(|(ns, owners)| format!("namespace \"{ns}\" is also selected by {}", owners.join(", ")))
            .collect();
        conditions.push(QuotaCondition {
            type_: CONDITION_OWNERSHIP_CONFLICT.to_string(),
            status: "True".to_string(),
            reason: Some(CONDITION_OWNERSHIP_CONFLICT.to_string()),
            message: Some(detail.join("; ")),
            last_transition_time: Some(now.to_string()),
        });
    }

    ClusterResourceQuotaStatus {
        namespaces,
        total: Some(QuotaTotals { hard, used }),
        conditions,
    }
}

/// Status for a quota whose spec cannot be acted on: a single condition,
/// no namespace listing, no totals.
pub fn invalid_spec_status(error: &SpecError, now: &str) -> ClusterResourceQuotaStatus {
    ClusterResourceQuotaStatus {
        namespaces: Vec::new(),
        total: None,
        conditions: vec![QuotaCondition {
            type_: error.condition_type().to_string(),
            status: "True".to_string(),
            reason: Some(error.condition_type().to_string()),
            message: Some(error.to_string()),
            last_transition_time: Some(now.to_string()),
        }],
    }
}

/* ============================= CONFLICT DETECTION ============================= */

/// Which other quotas also select namespaces this quota selects. The
/// reconciler reports these as a condition; only admission prevents them.
pub fn detect_conflicts(
    quota_name: &str,
    selected: &[(String, BTreeMap<String, String>)],
    all_quotas: &[ClusterResourceQuota],
    exclusion_key: &str,
) -> BTreeMap<String, Vec<String>> {
    let mut conflicts = BTreeMap::new();
    for (ns_name, labels) in selected {
        let mut owners: Vec<String> = selector::selecting_quotas(all_quotas, labels, exclusion_key)
            .into_iter()
            .filter_map(|q| q.metadata.name.clone())
            .filter(|name| name != quota_name)
            .collect();
        if !owners.is_empty() {
            owners.sort();
            conflicts.insert(ns_name.clone(), owners);
        }
    }
    conflicts
}

/* ============================= EVENT FAN-OUT ============================= */

fn status_lists_namespace(quota: &ClusterResourceQuota, namespace: &str) -> bool {
    quota
        .status
        .as_ref()
        .is_some_and(|s| s.namespaces.iter().any(|n| n.namespace == namespace))
}

/// Map a namespace watch event to the quotas needing reconciliation: every
/// quota whose selector matches the new labels, plus every quota that
/// listed the namespace before (covers label changes that drop a match).
pub fn quotas_for_namespace_event(
    quotas: &[Arc<ClusterResourceQuota>],
    namespace: &Namespace,
    exclusion_key: &str,
) -> Vec<ObjectRef<ClusterResourceQuota>> {
    let ns_name = namespace.metadata.name.as_deref().unwrap_or_default();
    let labels = selector::labels_of(namespace);
    let excluded = selector::is_excluded(&labels, exclusion_key);

    quotas
        .iter()
        .filter(|quota| {
            let matches_now = !excluded && selector::matches(&quota.spec.namespace_selector, &labels);
            matches_now || status_lists_namespace(quota, ns_name)
        })
        .map(|quota| ObjectRef::from_obj(quota.as_ref()))
        .collect()
}

/// Map a workload watch event to the quotas spanning its namespace. The
/// namespace labels come from the reflector cache; when the namespace is
/// not cached yet, only quotas already listing it are enqueued (its own
/// watch event covers the rest).
pub fn quotas_for_workload_event(
    quotas: &[Arc<ClusterResourceQuota>],
    namespace: &str,
    labels: Option<&BTreeMap<String, String>>,
    exclusion_key: &str,
) -> Vec<ObjectRef<ClusterResourceQuota>> {
    quotas
        .iter()
        .filter(|quota| {
            let matches_now = labels.is_some_and(|l| {
                !selector::is_excluded(l, exclusion_key)
                    && selector::matches(&quota.spec.namespace_selector, l)
            });
            matches_now || status_lists_namespace(quota, namespace)
        })
        .map(|quota| ObjectRef::from_obj(quota.as_ref()))
        .collect()
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::NamespaceSelector;
    use crate::quantity::Quantity;
    use crate::selector::DEFAULT_EXCLUSION_LABEL;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    const NOW: &str = "2026-01-01T00:00:00Z";

    fn usage_of(pairs: &[(&str, &str)]) -> ResourceUsage {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Quantity::parse(v).unwrap()))
            .collect()
    }

    fn spec(selector_pairs: &[(&str, &str)], hard: &[(&str, &str)]) -> ClusterResourceQuotaSpec {
        ClusterResourceQuotaSpec {
            namespace_selector: NamespaceSelector {
                match_labels: Some(
                    selector_pairs
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                match_expressions: None,
            },
            hard: hard
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn quota_with_status(name: &str, selector_pairs: &[(&str, &str)], listed: &[&str]) -> Arc<ClusterResourceQuota> {
        let mut quota = ClusterResourceQuota {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: spec(selector_pairs, &[]),
            status: None,
        };
        if !listed.is_empty() {
            quota.status = Some(ClusterResourceQuotaStatus {
                namespaces: listed
                    .iter()
                    .map(|ns| NamespaceUsage {
                        namespace: ns.to_string(),
                        used: BTreeMap::new(),
                    })
                    .collect(),
                total: None,
                conditions: vec![],
            });
        }
        Arc::new(quota)
    }

    fn namespace(name: &str, pairs: &[(&str, &str)]) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(
                    pairs
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    // ── backoff ──

    #[test]
    fn test_backoff_starts_at_base() {
        assert_eq!(backoff_for_attempt(0), Duration::from_millis(250));
        assert_eq!(backoff_for_attempt(1), Duration::from_millis(500));
        assert_eq!(backoff_for_attempt(2), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_caps_at_five_seconds() {
        assert_eq!(backoff_for_attempt(5), Duration::from_secs(5));
        assert_eq!(backoff_for_attempt(30), Duration::from_secs(5));
    }

    // ── status construction ──

    #[test]
    fn test_status_namespaces_sorted() {
        let status = build_status(
            &spec(&[], &[]),
            vec![
                ("zeta".to_string(), usage_of(&[("pods", "1")])),
                ("alpha".to_string(), usage_of(&[("pods", "2")])),
            ],
            &BTreeMap::new(),
            NOW,
        );
        let names: Vec<&str> = status.namespaces.iter().map(|n| n.namespace.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_status_total_is_sum_of_namespaces() {
        let status = build_status(
            &spec(&[], &[("requests.cpu", "1000m"), ("requests.memory", "2Gi")]),
            vec![
                (
                    "a".to_string(),
                    usage_of(&[("requests.cpu", "200m"), ("requests.memory", "512Mi")]),
                ),
                (
                    "b".to_string(),
                    usage_of(&[("requests.cpu", "300m"), ("requests.memory", "1Gi")]),
                ),
            ],
            &BTreeMap::new(),
            NOW,
        );
        let total = status.total.expect("totals present");
        assert_eq!(total.used.get("requests.cpu").map(String::as_str), Some("500m"));
        assert_eq!(
            total.used.get("requests.memory").map(String::as_str),
            Some("1536Mi")
        );
    }

    #[test]
    fn test_status_zero_fills_hard_keys() {
        let status = build_status(
            &spec(&[], &[("pods", "5"), ("requests.cpu", "1")]),
            vec![("a".to_string(), usage_of(&[("pods", "1")]))],
            &BTreeMap::new(),
            NOW,
        );
        let total = status.total.expect("totals present");
        assert_eq!(total.used.get("pods").map(String::as_str), Some("1"));
        assert_eq!(total.used.get("requests.cpu").map(String::as_str), Some("0"));
    }

    #[test]
    fn test_status_hard_mirrors_spec_normalized() {
        let status = build_status(
            &spec(&[], &[("cpu", "2"), ("count/configmaps", "10")]),
            vec![],
            &BTreeMap::new(),
            NOW,
        );
        let total = status.total.expect("totals present");
        assert_eq!(total.hard.get("requests.cpu").map(String::as_str), Some("2"));
        assert_eq!(total.hard.get("configmaps").map(String::as_str), Some("10"));
        assert!(!total.hard.contains_key("cpu"));
    }

    #[test]
    fn test_status_observed_keys_survive_without_hard() {
        let status = build_status(
            &spec(&[], &[("pods", "5")]),
            vec![("a".to_string(), usage_of(&[("requests.cpu", "100m")]))],
            &BTreeMap::new(),
            NOW,
        );
        let total = status.total.expect("totals present");
        assert_eq!(total.used.get("requests.cpu").map(String::as_str), Some("100m"));
    }

    #[test]
    fn test_status_idempotent_for_unchanged_input() {
        let build = || {
            build_status(
                &spec(&[("team", "t")], &[("pods", "5")]),
                vec![
                    ("b".to_string(), usage_of(&[("pods", "2")])),
                    ("a".to_string(), usage_of(&[("pods", "1")])),
                ],
                &BTreeMap::new(),
                NOW,
            )
        };
        let first = serde_json::to_string(&build()).unwrap();
        let second = serde_json::to_string(&build()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_status_conflict_condition() {
        let conflicts = BTreeMap::from([(
            "ns-a".to_string(),
            vec!["other-quota".to_string()],
        )]);
        let status = build_status(&spec(&[], &[]), vec![], &conflicts, NOW);
        assert_eq!(status.conditions.len(), 1);
        let cond = &status.conditions[0];
        assert_eq!(cond.type_, CONDITION_OWNERSHIP_CONFLICT);
        assert_eq!(cond.status, "True");
        assert!(cond.message.as_deref().unwrap().contains("other-quota"));
        assert!(cond.message.as_deref().unwrap().contains("ns-a"));
    }

    #[test]
    fn test_invalid_spec_status_has_condition_only() {
        let err = SpecError::UnrecognizedKey("bananas".to_string());
        let status = invalid_spec_status(&err, NOW);
        assert!(status.namespaces.is_empty());
        assert!(status.total.is_none());
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].type_, crate::crd::CONDITION_INVALID_SPEC);
        assert!(status.conditions[0].message.as_deref().unwrap().contains("bananas"));
    }

    // ── conflict detection ──

    #[test]
    fn test_detect_conflicts_reports_other_owners() {
        let quotas = vec![
            ClusterResourceQuota {
                metadata: ObjectMeta {
                    name: Some("mine".to_string()),
                    ..Default::default()
                },
                spec: spec(&[("team", "x")], &[]),
                status: None,
            },
            ClusterResourceQuota {
                metadata: ObjectMeta {
                    name: Some("other".to_string()),
                    ..Default::default()
                },
                spec: spec(&[("team", "x")], &[]),
                status: None,
            },
        ];
        let selected = vec![(
            "ns-a".to_string(),
            BTreeMap::from([("team".to_string(), "x".to_string())]),
        )];
        let conflicts = detect_conflicts("mine", &selected, &quotas, DEFAULT_EXCLUSION_LABEL);
        assert_eq!(conflicts.get("ns-a"), Some(&vec!["other".to_string()]));
    }

    #[test]
    fn test_detect_conflicts_empty_when_sole_owner() {
        let quotas = vec![ClusterResourceQuota {
            metadata: ObjectMeta {
                name: Some("mine".to_string()),
                ..Default::default()
            },
            spec: spec(&[("team", "x")], &[]),
            status: None,
        }];
        let selected = vec![(
            "ns-a".to_string(),
            BTreeMap::from([("team".to_string(), "x".to_string())]),
        )];
        assert!(detect_conflicts("mine", &selected, &quotas, DEFAULT_EXCLUSION_LABEL).is_empty());
    }

    // ── fan-out ──

    #[test]
    fn test_namespace_event_enqueues_matching_quota() {
        let quotas = vec![
            quota_with_status("matching", &[("team", "x")], &[]),
            quota_with_status("unrelated", &[("team", "y")], &[]),
        ];
        let ns = namespace("ns-a", &[("team", "x")]);
        let refs = quotas_for_namespace_event(&quotas, &ns, DEFAULT_EXCLUSION_LABEL);
        let names: Vec<String> = refs.iter().map(|r| r.name.clone()).collect();
        assert_eq!(names, vec!["matching".to_string()]);
    }

    #[test]
    fn test_namespace_event_enqueues_previous_owner_on_label_change() {
        // Labels moved off team=x; the quota still lists ns-a and must
        // reconcile to drop it.
        let quotas = vec![quota_with_status("was-owner", &[("team", "x")], &["ns-a"])];
        let ns = namespace("ns-a", &[("team", "z")]);
        let refs = quotas_for_namespace_event(&quotas, &ns, DEFAULT_EXCLUSION_LABEL);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "was-owner");
    }

    #[test]
    fn test_namespace_event_excluded_only_previous_owners() {
        let quotas = vec![
            quota_with_status("selector-match", &[("team", "x")], &[]),
            quota_with_status("previous-owner", &[("team", "x")], &["ns-a"]),
        ];
        let ns = namespace("ns-a", &[("team", "x"), (DEFAULT_EXCLUSION_LABEL, "true")]);
        let refs = quotas_for_namespace_event(&quotas, &ns, DEFAULT_EXCLUSION_LABEL);
        let names: Vec<String> = refs.iter().map(|r| r.name.clone()).collect();
        assert_eq!(names, vec!["previous-owner".to_string()]);
    }

    #[test]
    fn test_workload_event_uses_cached_labels() {
        let quotas = vec![quota_with_status("matching", &[("team", "x")], &[])];
        let labels = BTreeMap::from([("team".to_string(), "x".to_string())]);
        let refs = quotas_for_workload_event(&quotas, "ns-a", Some(&labels), DEFAULT_EXCLUSION_LABEL);
        assert_eq!(refs.len(), 1);
    }

    #[test]
    fn test_workload_event_without_cache_falls_back_to_status() {
        let quotas = vec![
            quota_with_status("lists-it", &[("team", "x")], &["ns-a"]),
            quota_with_status("does-not", &[("team", "x")], &[]),
        ];
        let refs = quotas_for_workload_event(&quotas, "ns-a", None, DEFAULT_EXCLUSION_LABEL);
        let names: Vec<String> = refs.iter().map(|r| r.name.clone()).collect();
        assert_eq!(names, vec!["lists-it".to_string()]);
    }
}
