use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use k8s_openapi::api::core::v1::{Namespace, PersistentVolumeClaim, Pod, Service};
use kube::api::ListParams;
use kube::{Api, Client};
use prometheus::{Encoder, Histogram, IntCounterVec, Registry, TextEncoder};
use tokio::sync::broadcast;
use tracing::info;

use pac_quota_controller::admission::{self, AdmissionVerdict};
use pac_quota_controller::crd::ClusterResourceQuota;
use pac_quota_controller::ownership::OwnershipIndex;
use pac_quota_controller::selector;
use pac_quota_controller::usage::{self, ResourceUsage, TrackedKind};

/* ============================= PROMETHEUS ============================= */

static WEBHOOK_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static WEBHOOK_REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("webhook_requests_total", "Total admission webhook requests"),
        &["kind", "operation", "allowed"],
    )
    .expect("metric definition is valid");
    WEBHOOK_REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static WEBHOOK_DENIALS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("webhook_denials_total", "Total admission webhook denials by kind"),
        &["kind"],
    )
    .expect("metric definition is valid");
    WEBHOOK_REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static WEBHOOK_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "webhook_request_duration_seconds",
        "Duration of admission webhook request processing in seconds",
    ))
    .expect("metric definition is valid");
    WEBHOOK_REGISTRY
        .register(Box::new(h.clone()))
        .expect("metric not yet registered");
    h
});

pub(crate) fn force_webhook_metrics() {
    LazyLock::force(&WEBHOOK_REQUESTS);
    LazyLock::force(&WEBHOOK_DENIALS);
    LazyLock::force(&WEBHOOK_DURATION);
}

/* ============================= STATE ============================= */

#[derive(Clone)]
pub(crate) struct WebhookState {
    pub(crate) client: Client,
    pub(crate) ownership: OwnershipIndex,
    pub(crate) exclusion_label_key: String,
    pub(crate) kinds: Arc<BTreeSet<TrackedKind>>,
    pub(crate) timeout: Duration,
    pub(crate) ready: bool,
}

/* ============================= HTTPS SERVER ============================= */

pub(crate) fn build_webhook_router(state: WebhookState) -> Router {
    Router::new()
        .route("/validate", post(admission_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get({
                let state = state.clone();
                move || ready_handler(state.clone())
            }),
        )
        .route("/metrics", get(webhook_metrics_handler))
        .with_state(state)
}

pub(crate) async fn start_https_server(
    state: WebhookState,
    mut shutdown: broadcast::Receiver<()>,
    addr: SocketAddr,
    tls_cert: &str,
    tls_key: &str,
) -> Result<()> {
    let app = build_webhook_router(state);

    let rustls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(tls_cert, tls_key)
        .await
        .context("Failed to load TLS configuration")?;

    info!(addr = %addr, "webhook_https_server_started");

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();

    tokio::spawn(async move {
        let _ = shutdown.recv().await;
        shutdown_handle.graceful_shutdown(Some(Duration::from_secs(5)));
    });

    axum_server::bind_rustls(addr, rustls_config)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}

async fn ready_handler(state: WebhookState) -> impl IntoResponse {
    if state.ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn webhook_metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = WEBHOOK_REGISTRY.gather();
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

/* ============================= TLS PREFLIGHT ============================= */

pub(crate) fn validate_tls_files(cert_path: &str, key_path: &str) -> Result<()> {
    let cert_pem = std::fs::read(cert_path)
        .with_context(|| format!("TLS certificate file not found: {cert_path}"))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<std::result::Result<_, _>>()
        .with_context(|| format!("Failed to parse TLS certificate {cert_path}"))?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found in {cert_path}");
    }

    let key_pem =
        std::fs::read(key_path).with_context(|| format!("TLS key file not found: {key_path}"))?;
    rustls_pemfile::private_key(&mut key_pem.as_slice())
        .with_context(|| format!("Failed to parse TLS key {key_path}"))?
        .ok_or_else(|| anyhow::anyhow!("No private key found in {key_path}"))?;

    Ok(())
}

/* ============================= ADMISSION HANDLER ============================= */

async fn admission_handler(State(state): State<WebhookState>, body: String) -> impl IntoResponse {
    let _timer = WEBHOOK_DURATION.start_timer();

    let review: serde_json::Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(e) => {
            info!(error = %e, "invalid_admission_review");
            return (
                StatusCode::BAD_REQUEST,
                build_admission_response("", false, Some(&format!("malformed AdmissionReview: {e}"))),
            );
        }
    };

    let request = &review["request"];
    let uid = request["uid"].as_str().unwrap_or("").to_string();
    let kind = request["kind"]["kind"].as_str().unwrap_or("").to_string();
    let operation = request["operation"].as_str().unwrap_or("UNKNOWN").to_string();

    // Infrastructure failures and deadline overruns deny with an explicit
    // error; a quota gate that silently allows is not a gate.
    let verdict = match tokio::time::timeout(
        state.timeout,
        evaluate(&state, &kind, &operation, request),
    )
    .await
    {
        Ok(Ok(verdict)) => verdict,
        Ok(Err(e)) => {
            info!(error = %e, kind = %kind, "admission_infrastructure_error");
            AdmissionVerdict::deny(format!("admission infrastructure error: {e:#}"))
        }
        Err(_) => AdmissionVerdict::deny("admission evaluation timed out"),
    };

    let allowed_str = if verdict.allowed { "true" } else { "false" };
    WEBHOOK_REQUESTS
        .with_label_values(&[&kind, &operation, allowed_str])
        .inc();

    if !verdict.allowed {
        WEBHOOK_DENIALS.with_label_values(&[&kind]).inc();
        info!(
            kind = %kind,
            operation = %operation,
            denial = verdict.message.as_deref().unwrap_or_default(),
            "admission_denied"
        );
    }

    (
        StatusCode::OK,
        build_admission_response(&uid, verdict.allowed, verdict.message.as_deref()),
    )
}

async fn evaluate(
    state: &WebhookState,
    kind: &str,
    operation: &str,
    request: &serde_json::Value,
) -> Result<AdmissionVerdict> {
    // Deletions only ever lower usage.
    if operation == "DELETE" {
        return Ok(AdmissionVerdict::allow());
    }

    match kind {
        "ClusterResourceQuota" => evaluate_quota(state, request).await,
        "Namespace" => evaluate_namespace(state, operation, request).await,
        _ => evaluate_workload(state, kind, request).await,
    }
}

/* ============================= QUOTA ADMISSION ============================= */

async fn evaluate_quota(
    state: &WebhookState,
    request: &serde_json::Value,
) -> Result<AdmissionVerdict> {
    let candidate: ClusterResourceQuota = serde_json::from_value(request["object"].clone())
        .context("could not parse ClusterResourceQuota from admission request")?;

    if let Err(spec_err) = admission::validate_quota_spec(&candidate.spec) {
        return Ok(AdmissionVerdict::deny(spec_err.to_string()));
    }

    let quotas = Api::<ClusterResourceQuota>::all(state.client.clone())
        .list(&ListParams::default())
        .await
        .context("listing ClusterResourceQuotas")?
        .items;
    let namespaces = Api::<Namespace>::all(state.client.clone())
        .list(&ListParams::default())
        .await
        .context("listing namespaces")?
        .items;

    Ok(admission::check_quota_overlap(
        &candidate,
        &quotas,
        &namespaces,
        &state.ownership.snapshot(),
        &state.exclusion_label_key,
    ))
}

/* ============================= NAMESPACE ADMISSION ============================= */

async fn evaluate_namespace(
    state: &WebhookState,
    operation: &str,
    request: &serde_json::Value,
) -> Result<AdmissionVerdict> {
    let namespace: Namespace = serde_json::from_value(request["object"].clone())
        .context("could not parse Namespace from admission request")?;
    let name = namespace
        .metadata
        .name
        .clone()
        .or_else(|| request["name"].as_str().map(str::to_string))
        .unwrap_or_default();
    let new_labels = selector::labels_of(&namespace);

    if operation == "UPDATE"
        && let Ok(old) = serde_json::from_value::<Namespace>(request["oldObject"].clone())
        && selector::labels_of(&old) == new_labels
    {
        return Ok(AdmissionVerdict::allow());
    }

    let quotas = Api::<ClusterResourceQuota>::all(state.client.clone())
        .list(&ListParams::default())
        .await
        .context("listing ClusterResourceQuotas")?
        .items;

    Ok(admission::check_namespace_multi_match(
        &name,
        &new_labels,
        &quotas,
        &state.exclusion_label_key,
    ))
}

/* ============================= WORKLOAD ADMISSION ============================= */

async fn evaluate_workload(
    state: &WebhookState,
    kind: &str,
    request: &serde_json::Value,
) -> Result<AdmissionVerdict> {
    let Some(tracked) = TrackedKind::from_kind(kind) else {
        return Ok(AdmissionVerdict::allow());
    };
    if !state.kinds.contains(&tracked) {
        return Ok(AdmissionVerdict::allow());
    }

    let ns_name = request["namespace"].as_str().unwrap_or_default();
    if ns_name.is_empty() {
        return Ok(AdmissionVerdict::allow());
    }

    let Some(namespace) = Api::<Namespace>::all(state.client.clone())
        .get_opt(ns_name)
        .await
        .with_context(|| format!("fetching namespace {ns_name}"))?
    else {
        return Ok(AdmissionVerdict::allow());
    };
    let labels = selector::labels_of(&namespace);
    if selector::is_excluded(&labels, &state.exclusion_label_key) {
        return Ok(AdmissionVerdict::allow());
    }

    let quotas = Api::<ClusterResourceQuota>::all(state.client.clone())
        .list(&ListParams::default())
        .await
        .context("listing ClusterResourceQuotas")?
        .items;
    let selecting = selector::selecting_quotas(&quotas, &labels, &state.exclusion_label_key);
    if selecting.is_empty() {
        return Ok(AdmissionVerdict::allow());
    }

    let delta = workload_delta(tracked, &request["object"], &request["oldObject"])?;
    if delta.is_empty() {
        return Ok(AdmissionVerdict::allow());
    }

    for quota in selecting {
        let verdict = admission::check_usage_delta(quota, &delta);
        if !verdict.allowed {
            return Ok(verdict);
        }
    }
    Ok(AdmissionVerdict::allow())
}

/// Candidate usage change of one admission request. For creates the old
/// object is null and the delta is the full usage of the new object; for
/// updates equal contributions cancel out (object counts in particular).
fn workload_delta(
    kind: TrackedKind,
    object: &serde_json::Value,
    old_object: &serde_json::Value,
) -> Result<ResourceUsage> {
    fn parse<T: serde::de::DeserializeOwned>(
        value: &serde_json::Value,
        kind: &str,
    ) -> Result<Option<T>> {
        if value.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(value.clone()).with_context(
            || format!("could not parse {kind} from admission request"),
        )?))
    }

    match kind {
        TrackedKind::Pod => {
            let new: Pod = parse(object, "Pod")?.context("admission request without object")?;
            let old = parse::<Pod>(old_object, "Pod")?
                .map(|p| usage::pod_usage(&p))
                .unwrap_or_default();
            Ok(usage::delta(&usage::pod_usage(&new), &old))
        }
        TrackedKind::PersistentVolumeClaim => {
            let new: PersistentVolumeClaim =
                parse(object, "PersistentVolumeClaim")?.context("admission request without object")?;
            let old = parse::<PersistentVolumeClaim>(old_object, "PersistentVolumeClaim")?
                .map(|p| usage::pvc_usage(&p))
                .unwrap_or_default();
            Ok(usage::delta(&usage::pvc_usage(&new), &old))
        }
        TrackedKind::Service => {
            let new: Service =
                parse(object, "Service")?.context("admission request without object")?;
            let old = parse::<Service>(old_object, "Service")?
                .map(|s| usage::service_usage(&s))
                .unwrap_or_default();
            Ok(usage::delta(&usage::service_usage(&new), &old))
        }
        _ => {
            if old_object.is_null() {
                Ok(kind.count_usage())
            } else {
                Ok(ResourceUsage::new())
            }
        }
    }
}

fn build_admission_response(uid: &str, allowed: bool, message: Option<&str>) -> String {
    let mut response = serde_json::json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "response": {
            "uid": uid,
            "allowed": allowed
        }
    });

    if let Some(msg) = message {
        response["response"]["status"] = serde_json::json!({
            "message": msg
        });
    }

    response.to_string()
}

/* ============================= CERT GENERATION ============================= */

pub fn generate_certs(
    service_name: &str,
    namespace: &str,
    output_dir: &str,
    ip_sans: &[String],
) -> Result<()> {
    println!("Generating self-signed TLS certificates...\n");

    let (ca_pem, cert_pem, key_pem) = generate_self_signed_certs(service_name, namespace, ip_sans)?;

    let output_path = std::path::Path::new(output_dir);
    if !output_path.exists() {
        std::fs::create_dir_all(output_path).context("Failed to create output directory")?;
    }

    let ca_path = output_path.join("ca.crt");
    let cert_path = output_path.join("tls.crt");
    let key_path = output_path.join("tls.key");

    std::fs::write(&ca_path, &ca_pem).context("Failed to write ca.crt")?;
    std::fs::write(&cert_path, &cert_pem).context("Failed to write tls.crt")?;
    std::fs::write(&key_path, &key_pem).context("Failed to write tls.key")?;

    println!("  CA certificate .............. {}", ca_path.display());
    println!("  Server certificate .......... {}", cert_path.display());
    println!("  Server key .................. {}", key_path.display());
    println!();
    println!("  Service name ................ {service_name}");
    println!("  Namespace ................... {namespace}");
    println!("  SANs:");
    println!("    - {service_name}.{namespace}.svc");
    println!("    - {service_name}.{namespace}.svc.cluster.local");
    for ip in ip_sans {
        println!("    - {ip} (IP)");
    }
    println!();
    println!("TLS certificates generated successfully.");

    Ok(())
}

pub fn generate_self_signed_certs(
    service_name: &str,
    namespace: &str,
    ip_sans: &[String],
) -> Result<(String, String, String)> {
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
    use std::net::IpAddr;

    // Generate CA key pair and certificate
    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let mut ca_dn = DistinguishedName::new();
    ca_dn.push(DnType::CommonName, "pac-quota-controller-webhook-ca");
    ca_dn.push(DnType::OrganizationName, "pac-quota-controller");
    ca_params.distinguished_name = ca_dn;

    let ca_key = KeyPair::generate().context("Failed to generate CA key pair")?;
    let ca_cert = ca_params
        .self_signed(&ca_key)
        .context("Failed to self-sign CA certificate")?;

    // Generate server key pair and certificate signed by the CA
    let mut server_params = CertificateParams::default();
    let mut server_dn = DistinguishedName::new();
    server_dn.push(DnType::CommonName, format!("{service_name}.{namespace}.svc"));
    server_params.distinguished_name = server_dn;

    let mut sans = vec![
        SanType::DnsName(
            format!("{service_name}.{namespace}.svc")
                .try_into()
                .context("Invalid DNS name for SAN")?,
        ),
        SanType::DnsName(
            format!("{service_name}.{namespace}.svc.cluster.local")
                .try_into()
                .context("Invalid DNS name for SAN")?,
        ),
    ];

    for ip_str in ip_sans {
        let ip: IpAddr = ip_str
            .parse()
            .context(format!("Invalid IP address for SAN: {ip_str}"))?;
        sans.push(SanType::IpAddress(ip));
    }

    server_params.subject_alt_names = sans;

    let server_key = KeyPair::generate().context("Failed to generate server key pair")?;
    let server_cert = server_params
        .signed_by(&server_key, &ca_cert, &ca_key)
        .context("Failed to sign server certificate")?;

    let ca_pem = ca_cert.pem();
    let cert_pem = server_cert.pem();
    let key_pem = server_key.serialize_pem();

    Ok((ca_pem, cert_pem, key_pem))
}

/* ============================= INSTALL CONFIG ============================= */

pub fn install_config(service_name: &str, namespace: &str, ca_bundle_path: &str) -> Result<()> {
    use base64::Engine;

    let ca_bytes = std::fs::read(ca_bundle_path).context("Failed to read CA bundle file")?;
    let ca_b64 = base64::engine::general_purpose::STANDARD.encode(&ca_bytes);

    let yaml = format!(
        r#"apiVersion: admissionregistration.k8s.io/v1
kind: ValidatingWebhookConfiguration
metadata:
  name: {service_name}
webhooks:
  - name: validate.quota.powerapp.cloud
    rules:
      - apiGroups: ["quota.powerapp.cloud"]
        resources: ["clusterresourcequotas"]
        apiVersions: ["v1alpha1"]
        operations: ["CREATE", "UPDATE"]
      - apiGroups: [""]
        resources: ["namespaces"]
        apiVersions: ["v1"]
        operations: ["CREATE", "UPDATE"]
      - apiGroups: [""]
        resources:
          - "pods"
          - "persistentvolumeclaims"
          - "services"
          - "configmaps"
          - "secrets"
          - "replicationcontrollers"
        apiVersions: ["v1"]
        operations: ["CREATE", "UPDATE"]
      - apiGroups: ["apps"]
        resources: ["deployments", "statefulsets", "daemonsets"]
        apiVersions: ["v1"]
        operations: ["CREATE", "UPDATE"]
      - apiGroups: ["batch"]
        resources: ["jobs", "cronjobs"]
        apiVersions: ["v1"]
        operations: ["CREATE", "UPDATE"]
      - apiGroups: ["autoscaling"]
        resources: ["horizontalpodautoscalers"]
        apiVersions: ["v2"]
        operations: ["CREATE", "UPDATE"]
      - apiGroups: ["networking.k8s.io"]
        resources: ["ingresses"]
        apiVersions: ["v1"]
        operations: ["CREATE", "UPDATE"]
    clientConfig:
      service:
        name: {service_name}
        namespace: {namespace}
        path: /validate
      caBundle: {ca_b64}
    failurePolicy: Fail
    sideEffects: None
    timeoutSeconds: 10
    admissionReviewVersions: ["v1"]
"#
    );

    println!("{yaml}");
    Ok(())
}

/* ============================= TESTS ============================= */
