mod common;

use std::collections::BTreeMap;

use common::{make_container, make_namespace, make_pod, make_pvc, make_quota, make_service};

use pac_quota_controller::quantity::Quantity;
use pac_quota_controller::reconciler;
use pac_quota_controller::selector::{self, DEFAULT_EXCLUSION_LABEL};
use pac_quota_controller::usage::{self, ResourceUsage};

const NOW: &str = "2026-01-01T00:00:00Z";

/// Run the accounting half of a reconcile over in-memory objects: select
/// namespaces, fold pod usage per namespace, build the status.
fn account_pods(
    quota: &pac_quota_controller::crd::ClusterResourceQuota,
    namespaces: &[k8s_openapi::api::core::v1::Namespace],
    pods: &[k8s_openapi::api::core::v1::Pod],
) -> pac_quota_controller::crd::ClusterResourceQuotaStatus {
    let selected = selector::select(
        &quota.spec.namespace_selector,
        namespaces,
        DEFAULT_EXCLUSION_LABEL,
    );

    let per_namespace: Vec<(String, ResourceUsage)> = selected
        .iter()
        .map(|ns| {
            let ns_name = ns.metadata.name.clone().unwrap_or_default();
            let mut total = ResourceUsage::new();
            for pod in pods
                .iter()
                .filter(|p| p.metadata.namespace.as_deref() == Some(ns_name.as_str()))
            {
                usage::add_assign(&mut total, &usage::pod_usage(pod));
            }
            (ns_name, total)
        })
        .collect();

    reconciler::build_status(&quota.spec, per_namespace, &BTreeMap::new(), NOW)
}

/* ============================= END-TO-END SCENARIOS ============================= */

#[test]
fn test_single_pod_counted_in_selected_namespace() {
    let quota = make_quota("team-quota", &[("team", "test")], &[("pods", "5")]);
    let namespaces = vec![make_namespace("ns-a", &[("team", "test")])];
    let pods = vec![make_pod(
        "p1",
        "ns-a",
        vec![make_container("main", "busybox", &[])],
        vec![],
        "Running",
    )];

    let status = account_pods(&quota, &namespaces, &pods);

    let listed: Vec<&str> = status
        .namespaces
        .iter()
        .map(|n| n.namespace.as_str())
        .collect();
    assert_eq!(listed, vec!["ns-a"]);

    let total = status.total.expect("totals present");
    assert_eq!(total.used.get("pods").map(String::as_str), Some("1"));
    assert_eq!(total.hard.get("pods").map(String::as_str), Some("5"));
}

#[test]
fn test_compute_aggregation_across_two_namespaces() {
    let quota = make_quota(
        "team-quota",
        &[("team", "test")],
        &[
            ("requests.cpu", "1000m"),
            ("requests.memory", "2Gi"),
            ("limits.cpu", "2000m"),
            ("limits.memory", "4Gi"),
        ],
    );
    let namespaces = vec![
        make_namespace("ns-a", &[("team", "test")]),
        make_namespace("ns-b", &[("team", "test")]),
    ];
    let pods = vec![
        make_pod(
            "pod-a",
            "ns-a",
            vec![make_container(
                "main",
                "app:1",
                &[("cpu", "200m"), ("memory", "512Mi")],
            )],
            vec![],
            "Running",
        ),
        make_pod(
            "pod-b",
            "ns-b",
            vec![make_container(
                "main",
                "app:1",
                &[("cpu", "300m"), ("memory", "1Gi")],
            )],
            vec![],
            "Running",
        ),
    ];

    let status = account_pods(&quota, &namespaces, &pods);
    let total = status.total.expect("totals present");

    assert_eq!(
        total.used.get("requests.cpu").map(String::as_str),
        Some("500m")
    );
    assert_eq!(
        total.used.get("requests.memory").map(String::as_str),
        Some("1536Mi")
    );
    // Limits were never set on the pods, so the hard keys zero-fill.
    assert_eq!(total.used.get("limits.cpu").map(String::as_str), Some("0"));
    assert_eq!(
        total.used.get("limits.memory").map(String::as_str),
        Some("0")
    );
}

#[test]
fn test_hugepages_tracked_under_bare_key() {
    let quota = make_quota("hp-quota", &[("team", "test")], &[("hugepages-2Mi", "2Gi")]);
    let namespaces = vec![make_namespace("ns-a", &[("team", "test")])];
    let pods = vec![make_pod(
        "p1",
        "ns-a",
        vec![make_container(
            "main",
            "app:1",
            &[("cpu", "100m"), ("memory", "128Mi"), ("hugepages-2Mi", "1Gi")],
        )],
        vec![],
        "Running",
    )];

    let status = account_pods(&quota, &namespaces, &pods);
    let total = status.total.expect("totals present");
    assert_eq!(
        total.used.get("hugepages-2Mi").map(String::as_str),
        Some("1Gi")
    );
}

/* ============================= INVARIANTS ============================= */

#[test]
fn test_total_equals_sum_of_namespace_records() {
    let quota = make_quota("q", &[("team", "test")], &[]);
    let namespaces = vec![
        make_namespace("ns-a", &[("team", "test")]),
        make_namespace("ns-b", &[("team", "test")]),
    ];
    let pods = vec![
        make_pod(
            "a1",
            "ns-a",
            vec![make_container("c", "i", &[("cpu", "150m"), ("memory", "256Mi")])],
            vec![],
            "Running",
        ),
        make_pod(
            "a2",
            "ns-a",
            vec![make_container("c", "i", &[("cpu", "50m")])],
            vec![],
            "Running",
        ),
        make_pod(
            "b1",
            "ns-b",
            vec![make_container("c", "i", &[("memory", "1Gi")])],
            vec![],
            "Running",
        ),
    ];

    let status = account_pods(&quota, &namespaces, &pods);
    let total = usage::parse_wire(&status.total.expect("totals present").used)
        .expect("status quantities parse");

    let mut summed = ResourceUsage::new();
    for record in &status.namespaces {
        let ns_usage = usage::parse_wire(&record.used).expect("status quantities parse");
        usage::add_assign(&mut summed, &ns_usage);
    }

    for (key, qty) in &total {
        if qty.is_zero() {
            continue;
        }
        assert_eq!(summed.get(key), Some(qty), "additivity broken for {key}");
    }
}

#[test]
fn test_terminal_pods_contribute_zero() {
    let quota = make_quota("q", &[("team", "test")], &[("pods", "5")]);
    let namespaces = vec![make_namespace("ns-a", &[("team", "test")])];
    let pods = vec![
        make_pod(
            "done",
            "ns-a",
            vec![make_container("c", "i", &[("cpu", "4")])],
            vec![],
            "Succeeded",
        ),
        make_pod(
            "crashed",
            "ns-a",
            vec![make_container("c", "i", &[("cpu", "4")])],
            vec![],
            "Failed",
        ),
        make_pod(
            "running",
            "ns-a",
            vec![make_container("c", "i", &[("cpu", "100m")])],
            vec![],
            "Running",
        ),
    ];

    let status = account_pods(&quota, &namespaces, &pods);
    let total = status.total.expect("totals present");
    assert_eq!(total.used.get("pods").map(String::as_str), Some("1"));
    assert_eq!(
        total.used.get("requests.cpu").map(String::as_str),
        Some("100m")
    );
}

#[test]
fn test_excluded_namespace_invisible() {
    let quota = make_quota("q", &[("team", "test")], &[("pods", "5")]);
    let namespaces = vec![
        make_namespace("ns-kept", &[("team", "test")]),
        make_namespace(
            "ns-hidden",
            &[("team", "test"), (DEFAULT_EXCLUSION_LABEL, "true")],
        ),
    ];
    let pods = vec![make_pod(
        "p1",
        "ns-hidden",
        vec![make_container("c", "i", &[])],
        vec![],
        "Running",
    )];

    let status = account_pods(&quota, &namespaces, &pods);
    let listed: Vec<&str> = status
        .namespaces
        .iter()
        .map(|n| n.namespace.as_str())
        .collect();
    assert_eq!(listed, vec!["ns-kept"]);
    assert_eq!(
        status.total.expect("totals present").used.get("pods").map(String::as_str),
        Some("0")
    );
}

#[test]
fn test_reconcile_is_idempotent() {
    let quota = make_quota("q", &[("team", "test")], &[("pods", "5")]);
    let namespaces = vec![
        make_namespace("ns-b", &[("team", "test")]),
        make_namespace("ns-a", &[("team", "test")]),
    ];
    let pods = vec![
        make_pod("p1", "ns-a", vec![make_container("c", "i", &[])], vec![], "Running"),
        make_pod("p2", "ns-b", vec![make_container("c", "i", &[])], vec![], "Running"),
    ];

    let first = serde_json::to_string(&account_pods(&quota, &namespaces, &pods)).unwrap();
    let second = serde_json::to_string(&account_pods(&quota, &namespaces, &pods)).unwrap();
    assert_eq!(first, second);
}

/* ============================= PVC & SERVICE ACCOUNTING ============================= */

#[test]
fn test_pvc_storage_class_accounting() {
    let pvcs = vec![
        make_pvc("data-1", "ns-a", "5Gi", Some("fast-ssd")),
        make_pvc("data-2", "ns-a", "3Gi", Some("fast-ssd")),
        make_pvc("scratch", "ns-a", "2Gi", None),
    ];

    let mut total = ResourceUsage::new();
    for pvc in &pvcs {
        usage::add_assign(&mut total, &usage::pvc_usage(pvc));
    }

    assert_eq!(
        total.get("requests.storage"),
        Some(&Quantity::parse("10Gi").unwrap())
    );
    assert_eq!(
        total.get("persistentvolumeclaims"),
        Some(&Quantity::parse("3").unwrap())
    );
    assert_eq!(
        total.get("fast-ssd.storageclass.storage.k8s.io/requests.storage"),
        Some(&Quantity::parse("8Gi").unwrap())
    );
    assert_eq!(
        total.get("fast-ssd.storageclass.storage.k8s.io/persistentvolumeclaims"),
        Some(&Quantity::parse("2").unwrap())
    );
}

#[test]
fn test_service_type_accounting() {
    let services = vec![
        make_service("api", "ns-a", "ClusterIP"),
        make_service("ingress-lb", "ns-a", "LoadBalancer"),
        make_service("debug", "ns-a", "NodePort"),
        make_service("external", "ns-a", "ExternalName"),
    ];

    let mut total = ResourceUsage::new();
    for service in &services {
        usage::add_assign(&mut total, &usage::service_usage(service));
    }

    assert_eq!(total.get("services"), Some(&Quantity::parse("4").unwrap()));
    assert_eq!(
        total.get("services.loadbalancers"),
        Some(&Quantity::parse("1").unwrap())
    );
    assert_eq!(
        total.get("services.nodeports"),
        Some(&Quantity::parse("1").unwrap())
    );
}
