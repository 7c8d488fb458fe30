use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{
    ConfigMap, Namespace, PersistentVolumeClaim, Pod, ReplicationController, Secret, Service,
};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, ListParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher;
use kube::{Client, Resource, ResourceExt};
use prometheus::{Encoder, Histogram, IntCounter, IntGaugeVec, Registry, TextEncoder};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use pac_quota_controller::admission;
use pac_quota_controller::crd::{ClusterResourceQuota, ClusterResourceQuotaStatus};
use pac_quota_controller::ownership::OwnershipIndex;
use pac_quota_controller::quantity::Quantity;
use pac_quota_controller::reconciler;
use pac_quota_controller::selector;
use pac_quota_controller::usage::{self, ResourceUsage, TrackedKind};

use super::webhook::{self, WebhookState};
use crate::cli::RunArgs;

/* ============================= CONFIG ============================= */

const STATUS_WRITE_RETRIES: u32 = 3;
const FIELD_MANAGER: &str = "pac-quota-controller";

/* ============================= PROMETHEUS ============================= */

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILE_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "crq_reconcile_total",
        "Total ClusterResourceQuota reconciliation cycles",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static RECONCILE_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "crq_reconcile_errors_total",
        "Total ClusterResourceQuota reconciliation errors",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static RECONCILE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "crq_reconcile_duration_seconds",
        "Duration of each reconciliation cycle in seconds",
    ))
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(h.clone()))
        .expect("metric not yet registered");
    h
});

static SELECTED_NAMESPACES: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let g = IntGaugeVec::new(
        prometheus::Opts::new(
            "crq_selected_namespaces",
            "Namespaces currently selected per quota",
        ),
        &["quota"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

static OWNERSHIP_CONFLICTS: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let g = IntGaugeVec::new(
        prometheus::Opts::new(
            "crq_ownership_conflicts",
            "Namespaces selected by this quota and at least one other",
        ),
        &["quota"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

/* ============================= ERRORS ============================= */

#[derive(Debug)]
enum ReconcileError {
    Kube(kube::Error),
    Timeout,
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileError::Kube(e) => write!(f, "{e}"),
            ReconcileError::Timeout => write!(f, "reconcile deadline elapsed"),
        }
    }
}

impl std::error::Error for ReconcileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReconcileError::Kube(e) => Some(e),
            ReconcileError::Timeout => None,
        }
    }
}

impl From<kube::Error> for ReconcileError {
    fn from(e: kube::Error) -> Self {
        ReconcileError::Kube(e)
    }
}

/* ============================= STATE ============================= */

pub(crate) struct RunState {
    pub(crate) ready: bool,
}

struct ReconcileContext {
    client: Client,
    namespaces: Store<Namespace>,
    ownership: OwnershipIndex,
    exclusion_label_key: String,
    kinds: BTreeSet<TrackedKind>,
    reconcile_timeout: Duration,
    resync: Duration,
    attempts: Mutex<HashMap<String, u32>>,
}

/// Resolve the enabled kind set from repeated `--disable-kind` flags.
fn enabled_kinds(disable: &[String]) -> Result<BTreeSet<TrackedKind>> {
    let mut kinds: BTreeSet<TrackedKind> = TrackedKind::ALL.into_iter().collect();
    for flag in disable {
        let kind = TrackedKind::from_name(flag)
            .with_context(|| format!("unknown kind {flag:?} in --disable-kind"))?;
        kinds.remove(&kind);
    }
    Ok(kinds)
}

/* ============================= ENTRY ============================= */

pub async fn run(args: RunArgs) -> Result<()> {
    println!("Starting pac-quota-controller operator...\n");

    let client = Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    print!("  TLS ......................... ");
    webhook::validate_tls_files(&args.tls_cert, &args.tls_key)?;
    println!("loaded ({}, {})", args.tls_cert, args.tls_key);

    let kinds = enabled_kinds(&args.disable_kinds)?;
    let metrics_addr: SocketAddr = args
        .metrics_addr
        .parse()
        .context("Invalid metrics address")?;
    let webhook_addr: SocketAddr = args
        .webhook_addr
        .parse()
        .context("Invalid webhook address")?;

    LazyLock::force(&RECONCILE_TOTAL);
    LazyLock::force(&RECONCILE_ERRORS);
    LazyLock::force(&RECONCILE_DURATION);
    LazyLock::force(&SELECTED_NAMESPACES);
    LazyLock::force(&OWNERSHIP_CONFLICTS);
    webhook::force_webhook_metrics();

    println!("  CRD watch ................... ClusterResourceQuota.quota.powerapp.cloud/v1alpha1");
    println!("  Exclusion label ............. {}", args.exclusion_label_key);
    println!(
        "  Tracked kinds ............... {}/{}",
        kinds.len(),
        TrackedKind::ALL.len()
    );
    println!("  Webhook server .............. https://{webhook_addr}");
    println!("  Metrics server .............. http://{metrics_addr}");
    println!();
    println!("  Available endpoints:");
    println!("    POST /validate ............ Admission review handler (webhook)");
    println!("    GET  /healthz ............. Liveness probe");
    println!("    GET  /readyz .............. Readiness probe (503 until first reconcile)");
    println!("    GET  /metrics ............. Prometheus metrics scrape endpoint");
    println!();
    println!("Operator running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    info!("operator_started");

    let ownership = OwnershipIndex::new();
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Namespace reflector: the cache behind namespace selection and
    // workload-event fan-out.
    let ns_api: Api<Namespace> = Api::all(client.clone());
    let (ns_reader, ns_writer) = reflector::store::<Namespace>();
    let ns_reflector = reflector::reflector(
        ns_writer,
        watcher::watcher(ns_api.clone(), watcher::Config::default()),
    );
    tokio::spawn(async move {
        ns_reflector
            .for_each(|event| {
                if let Err(e) = event {
                    warn!(error = %e, "namespace_reflector_error");
                }
                futures::future::ready(())
            })
            .await;
    });

    let quotas_api: Api<ClusterResourceQuota> = Api::all(client.clone());
    let controller = Controller::new(quotas_api.clone(), watcher::Config::default());
    let quota_store = controller.store();

    // Namespace events fan out to every quota that matches the new labels
    // or previously listed the namespace.
    let mut controller = {
        let store = quota_store.clone();
        let exclusion = args.exclusion_label_key.clone();
        controller.watches(ns_api, watcher::Config::default(), move |ns: Namespace| {
            reconciler::quotas_for_namespace_event(&store.state(), &ns, &exclusion)
        })
    };

    let excl = &args.exclusion_label_key;
    controller = watch_workload::<Pod>(controller, &client, &quota_store, &ns_reader, excl, kinds.contains(&TrackedKind::Pod));
    controller = watch_workload::<PersistentVolumeClaim>(controller, &client, &quota_store, &ns_reader, excl, kinds.contains(&TrackedKind::PersistentVolumeClaim));
    controller = watch_workload::<Service>(controller, &client, &quota_store, &ns_reader, excl, kinds.contains(&TrackedKind::Service));
    controller = watch_workload::<ConfigMap>(controller, &client, &quota_store, &ns_reader, excl, kinds.contains(&TrackedKind::ConfigMap));
    controller = watch_workload::<Secret>(controller, &client, &quota_store, &ns_reader, excl, kinds.contains(&TrackedKind::Secret));
    controller = watch_workload::<Deployment>(controller, &client, &quota_store, &ns_reader, excl, kinds.contains(&TrackedKind::Deployment));
    controller = watch_workload::<StatefulSet>(controller, &client, &quota_store, &ns_reader, excl, kinds.contains(&TrackedKind::StatefulSet));
    controller = watch_workload::<DaemonSet>(controller, &client, &quota_store, &ns_reader, excl, kinds.contains(&TrackedKind::DaemonSet));
    controller = watch_workload::<ReplicationController>(controller, &client, &quota_store, &ns_reader, excl, kinds.contains(&TrackedKind::ReplicationController));
    controller = watch_workload::<Job>(controller, &client, &quota_store, &ns_reader, excl, kinds.contains(&TrackedKind::Job));
    controller = watch_workload::<CronJob>(controller, &client, &quota_store, &ns_reader, excl, kinds.contains(&TrackedKind::CronJob));
    controller = watch_workload::<HorizontalPodAutoscaler>(controller, &client, &quota_store, &ns_reader, excl, kinds.contains(&TrackedKind::HorizontalPodAutoscaler));
    controller = watch_workload::<Ingress>(controller, &client, &quota_store, &ns_reader, excl, kinds.contains(&TrackedKind::Ingress));

    let ctx = Arc::new(ReconcileContext {
        client: client.clone(),
        namespaces: ns_reader.clone(),
        ownership: ownership.clone(),
        exclusion_label_key: args.exclusion_label_key.clone(),
        kinds: kinds.clone(),
        reconcile_timeout: Duration::from_secs(args.reconcile_timeout_seconds),
        resync: Duration::from_secs(args.resync_seconds),
        attempts: Mutex::new(HashMap::new()),
    });

    let run_state = Arc::new(tokio::sync::Mutex::new(RunState { ready: false }));

    let http_state = run_state.clone();
    let http_shutdown = shutdown_tx.subscribe();
    let http_handle = tokio::spawn(async move {
        start_metrics_server(http_state, http_shutdown, metrics_addr).await
    });

    let webhook_state = WebhookState {
        client: client.clone(),
        ownership: ownership.clone(),
        exclusion_label_key: args.exclusion_label_key.clone(),
        kinds: Arc::new(kinds.clone()),
        timeout: Duration::from_secs(args.webhook_timeout_seconds),
        ready: true,
    };
    let webhook_shutdown = shutdown_tx.subscribe();
    let tls_cert = args.tls_cert.clone();
    let tls_key = args.tls_key.clone();
    let webhook_handle = tokio::spawn(async move {
        webhook::start_https_server(webhook_state, webhook_shutdown, webhook_addr, &tls_cert, &tls_key)
            .await
    });

    if ns_reader.wait_until_ready().await.is_err() {
        anyhow::bail!("namespace cache never became ready");
    }
    info!("namespace_cache_ready");

    let controller_state = run_state.clone();
    let controller = controller
        .run(reconcile, error_policy, ctx)
        .for_each(move |result| {
            let state = controller_state.clone();
            async move {
                {
                    let mut s = state.lock().await;
                    if !s.ready {
                        s.ready = true;
                    }
                }
                match result {
                    Ok((_obj, _action)) => {}
                    Err(e) => {
                        warn!(error = %e, "reconcile_dispatch_error");
                    }
                }
            }
        });

    // Use select! so Ctrl+C drops (cancels) the controller stream.
    tokio::select! {
        _ = controller => {
            info!("controller_stream_ended");
            println!("\nController stream ended unexpectedly.");
        }
        _ = signal::ctrl_c() => {
            info!("shutdown_signal_received");
            println!("\n{}", "=".repeat(70));
            println!("Shutdown signal received. Stopping operator...");
            println!("{}", "=".repeat(70));
        }
    }

    let _ = shutdown_tx.send(());
    let _ = http_handle.await?;
    let _ = webhook_handle.await?;

    info!("operator_stopped");
    println!("Operator stopped.");

    Ok(())
}

/// Add a watch for one workload kind that fans events out to the quotas
/// spanning the object's namespace.
fn watch_workload<K>(
    controller: Controller<ClusterResourceQuota>,
    client: &Client,
    quotas: &Store<ClusterResourceQuota>,
    namespaces: &Store<Namespace>,
    exclusion_key: &str,
    enabled: bool,
) -> Controller<ClusterResourceQuota>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug
        + Send
        + 'static,
{
    if !enabled {
        return controller;
    }
    let quotas = quotas.clone();
    let namespaces = namespaces.clone();
    let exclusion_key = exclusion_key.to_string();
    controller.watches(
        Api::<K>::all(client.clone()),
        watcher::Config::default(),
        move |obj: K| {
            let Some(ns_name) = obj.meta().namespace.clone() else {
                return Vec::new();
            };
            let labels = namespaces
                .get(&ObjectRef::new(&ns_name))
                .map(|ns| selector::labels_of(&ns));
            reconciler::quotas_for_workload_event(
                &quotas.state(),
                &ns_name,
                labels.as_ref(),
                &exclusion_key,
            )
        },
    )
}

/* ============================= RECONCILE ============================= */

async fn reconcile(
    quota: Arc<ClusterResourceQuota>,
    ctx: Arc<ReconcileContext>,
) -> std::result::Result<Action, ReconcileError> {
    let name = quota.name_any();
    RECONCILE_TOTAL.inc();
    let _timer = RECONCILE_DURATION.start_timer();

    let action = match tokio::time::timeout(ctx.reconcile_timeout, reconcile_inner(&name, &ctx)).await
    {
        Ok(result) => result?,
        Err(_) => return Err(ReconcileError::Timeout),
    };

    ctx.attempts.lock().expect("attempt map lock").remove(&name);
    Ok(action)
}

async fn reconcile_inner(
    name: &str,
    ctx: &ReconcileContext,
) -> std::result::Result<Action, ReconcileError> {
    let api: Api<ClusterResourceQuota> = Api::all(ctx.client.clone());

    // A deleted quota releases its ownership entries; nothing else to do.
    let Some(current) = api.get_opt(name).await? else {
        ctx.ownership.release_quota(name);
        let _ = SELECTED_NAMESPACES.remove_label_values(&[name]);
        let _ = OWNERSHIP_CONFLICTS.remove_label_values(&[name]);
        info!(quota = %name, "quota_gone");
        return Ok(Action::await_change());
    };

    let now = chrono::Utc::now().to_rfc3339();

    if let Err(spec_err) = admission::validate_quota_spec(&current.spec) {
        warn!(quota = %name, error = %spec_err, "quota_spec_invalid");
        let status = reconciler::invalid_spec_status(&spec_err, &now);
        write_status(&api, name, status).await?;
        return Ok(Action::requeue(ctx.resync));
    }

    // Selected namespaces come from the reflector cache, sorted by name.
    let mut selected: Vec<Arc<Namespace>> = ctx
        .namespaces
        .state()
        .into_iter()
        .filter(|ns| {
            let labels = selector::labels_of(ns);
            !selector::is_excluded(&labels, &ctx.exclusion_label_key)
                && selector::matches(&current.spec.namespace_selector, &labels)
        })
        .collect();
    selected.sort_by_key(|ns| ns.name_any());

    let mut per_namespace: Vec<(String, ResourceUsage)> = Vec::new();
    for ns in &selected {
        let ns_name = ns.name_any();
        let usage = namespace_usage(ctx, &ns_name).await?;
        per_namespace.push((ns_name, usage));
    }

    let all_quotas = api.list(&ListParams::default()).await?.items;
    let selected_meta: Vec<(String, BTreeMap<String, String>)> = selected
        .iter()
        .map(|ns| (ns.name_any(), selector::labels_of(ns)))
        .collect();
    let conflicts =
        reconciler::detect_conflicts(name, &selected_meta, &all_quotas, &ctx.exclusion_label_key);
    if !conflicts.is_empty() {
        warn!(quota = %name, conflicts = ?conflicts, "namespace_ownership_conflict_observed");
    }

    let status = reconciler::build_status(&current.spec, per_namespace, &conflicts, &now);
    write_status(&api, name, status).await?;

    let selected_names: Vec<String> = selected_meta.into_iter().map(|(n, _)| n).collect();
    ctx.ownership.apply(name, &selected_names);

    SELECTED_NAMESPACES
        .with_label_values(&[name])
        .set(selected_names.len() as i64);
    OWNERSHIP_CONFLICTS
        .with_label_values(&[name])
        .set(conflicts.len() as i64);

    info!(
        quota = %name,
        namespaces = selected_names.len(),
        "reconcile_complete"
    );

    Ok(Action::requeue(ctx.resync))
}

/// Aggregate usage of every enabled tracked kind in one namespace.
async fn namespace_usage(
    ctx: &ReconcileContext,
    namespace: &str,
) -> std::result::Result<ResourceUsage, kube::Error> {
    let mut total = ResourceUsage::new();

    if ctx.kinds.contains(&TrackedKind::Pod) {
        let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace);
        for pod in pods.list(&ListParams::default()).await?.items {
            usage::add_assign(&mut total, &usage::pod_usage(&pod));
        }
    }

    if ctx.kinds.contains(&TrackedKind::PersistentVolumeClaim) {
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), namespace);
        for pvc in pvcs.list(&ListParams::default()).await?.items {
            usage::add_assign(&mut total, &usage::pvc_usage(&pvc));
        }
    }

    if ctx.kinds.contains(&TrackedKind::Service) {
        let services: Api<Service> = Api::namespaced(ctx.client.clone(), namespace);
        for service in services.list(&ListParams::default()).await?.items {
            usage::add_assign(&mut total, &usage::service_usage(&service));
        }
    }

    accumulate_count::<ConfigMap>(ctx, namespace, TrackedKind::ConfigMap, &mut total).await?;
    accumulate_count::<Secret>(ctx, namespace, TrackedKind::Secret, &mut total).await?;
    accumulate_count::<Deployment>(ctx, namespace, TrackedKind::Deployment, &mut total).await?;
    accumulate_count::<StatefulSet>(ctx, namespace, TrackedKind::StatefulSet, &mut total).await?;
    accumulate_count::<DaemonSet>(ctx, namespace, TrackedKind::DaemonSet, &mut total).await?;
    accumulate_count::<ReplicationController>(
        ctx,
        namespace,
        TrackedKind::ReplicationController,
        &mut total,
    )
    .await?;
    accumulate_count::<Job>(ctx, namespace, TrackedKind::Job, &mut total).await?;
    accumulate_count::<CronJob>(ctx, namespace, TrackedKind::CronJob, &mut total).await?;
    accumulate_count::<HorizontalPodAutoscaler>(
        ctx,
        namespace,
        TrackedKind::HorizontalPodAutoscaler,
        &mut total,
    )
    .await?;
    accumulate_count::<Ingress>(ctx, namespace, TrackedKind::Ingress, &mut total).await?;

    Ok(total)
}

async fn accumulate_count<K>(
    ctx: &ReconcileContext,
    namespace: &str,
    kind: TrackedKind,
    total: &mut ResourceUsage,
) -> std::result::Result<(), kube::Error>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
{
    if !ctx.kinds.contains(&kind) {
        return Ok(());
    }
    let api: Api<K> = Api::namespaced(ctx.client.clone(), namespace);
    let count = api.list(&ListParams::default()).await?.items.len();
    if count > 0 {
        *total
            .entry(kind.count_key().to_string())
            .or_insert_with(Quantity::zero) += Quantity::from_count(count as u64);
    }
    Ok(())
}

/// Replace the status subresource carrying the fetched resourceVersion so
/// concurrent writers conflict instead of clobbering each other. Unchanged
/// statuses are not rewritten; that keeps the resync loop quiet.
async fn write_status(
    api: &Api<ClusterResourceQuota>,
    name: &str,
    status: ClusterResourceQuotaStatus,
) -> std::result::Result<(), kube::Error> {
    for _ in 0..STATUS_WRITE_RETRIES {
        let mut latest = api.get(name).await?;
        if latest.status.as_ref() == Some(&status) {
            return Ok(());
        }
        latest.status = Some(status.clone());
        latest.metadata.managed_fields = None;
        let payload = serde_json::to_vec(&latest).map_err(kube::Error::SerdeError)?;

        match api
            .replace_status(name, &PostParams::default(), payload)
            .await
        {
            Ok(_) => {
                info!(quota = %name, manager = FIELD_MANAGER, "status_updated");
                return Ok(());
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => continue,
            Err(e) => return Err(e),
        }
    }

    Err(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("status write for {name} kept conflicting"),
        reason: "Conflict".to_string(),
        code: 409,
    }))
}

fn error_policy(
    quota: Arc<ClusterResourceQuota>,
    error: &ReconcileError,
    ctx: Arc<ReconcileContext>,
) -> Action {
    RECONCILE_ERRORS.inc();
    let name = quota.name_any();

    let attempt = {
        let mut attempts = ctx.attempts.lock().expect("attempt map lock");
        let entry = attempts.entry(name.clone()).or_insert(0);
        let current = *entry;
        *entry = entry.saturating_add(1);
        current
    };

    let delay = reconciler::backoff_for_attempt(attempt);
    warn!(
        quota = %name,
        error = %error,
        attempt,
        delay_ms = delay.as_millis() as u64,
        "reconcile_error"
    );
    Action::requeue(delay)
}

/* ============================= HTTP SERVER ============================= */

pub(crate) fn build_metrics_router(state: Arc<tokio::sync::Mutex<RunState>>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get({
                let state = state.clone();
                move || ready_handler(state.clone())
            }),
        )
}

async fn start_metrics_server(
    state: Arc<tokio::sync::Mutex<RunState>>,
    mut shutdown: broadcast::Receiver<()>,
    addr: SocketAddr,
) -> Result<()> {
    let app = build_metrics_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics server on {addr}"))?;

    info!(addr = %addr, "metrics_server_started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}

async fn ready_handler(state: Arc<tokio::sync::Mutex<RunState>>) -> impl IntoResponse {
    let state = state.lock().await;
    if state.ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "metrics encoding error".to_string(),
            ),
        },
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics encoding error".to_string(),
        ),
    }
}

/* ============================= TESTS ============================= */
