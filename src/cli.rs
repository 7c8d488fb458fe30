use clap::{Args, Parser, Subcommand};

use pac_quota_controller::selector::DEFAULT_EXCLUSION_LABEL;

#[derive(Parser)]
#[command(name = "pac-quota-controller")]
#[command(about = "Cluster-scoped resource quotas for Kubernetes")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display application version
    Version,

    /// Check cluster connectivity and permissions
    Check,

    /// Manage the ClusterResourceQuota CRD
    Crd {
        #[command(subcommand)]
        action: CrdAction,
    },

    /// Run the operator: reconciler and admission webhook in one process
    Run(RunArgs),

    /// Webhook TLS and registration utilities
    Webhook {
        #[command(subcommand)]
        action: WebhookAction,
    },
}

#[derive(Args)]
pub struct RunArgs {
    /// Label key that hides a namespace from every quota when set to "true"
    #[arg(long, default_value = DEFAULT_EXCLUSION_LABEL)]
    pub exclusion_label_key: String,

    /// Address for the admission webhook HTTPS server
    #[arg(long, default_value = "0.0.0.0:8443")]
    pub webhook_addr: String,

    #[arg(long, default_value = "tls.crt")]
    pub tls_cert: String,

    #[arg(long, default_value = "tls.key")]
    pub tls_key: String,

    /// Address for the plaintext health/metrics server
    #[arg(long, default_value = "0.0.0.0:9090")]
    pub metrics_addr: String,

    /// Deadline for one admission evaluation
    #[arg(long, default_value_t = 10)]
    pub webhook_timeout_seconds: u64,

    /// Deadline for one reconcile pass
    #[arg(long, default_value_t = 30)]
    pub reconcile_timeout_seconds: u64,

    /// Periodic requeue interval after a successful reconcile
    #[arg(long, default_value_t = 300)]
    pub resync_seconds: u64,

    /// Stop tracking a kind (repeatable), e.g. --disable-kind services
    #[arg(long = "disable-kind", value_name = "KIND")]
    pub disable_kinds: Vec<String>,
}

#[derive(Subcommand)]
pub enum CrdAction {
    /// Print the CRD YAML to stdout
    Generate,

    /// Install the CRD into the connected cluster
    Install,
}

#[derive(Subcommand)]
pub enum WebhookAction {
    /// Generate self-signed TLS certificates for development
    CertGenerate {
        #[arg(long, default_value = "pac-quota-controller-webhook")]
        service_name: String,
        #[arg(long, default_value = "default")]
        namespace: String,
        #[arg(long, default_value = ".")]
        output_dir: String,
        /// Additional IP SANs (e.g. --ip-san 192.168.1.26)
        #[arg(long = "ip-san")]
        ip_sans: Vec<String>,
    },
    /// Print the ValidatingWebhookConfiguration YAML
    InstallConfig {
        #[arg(long, default_value = "pac-quota-controller-webhook")]
        service_name: String,
        #[arg(long, default_value = "default")]
        namespace: String,
        #[arg(long)]
        ca_bundle_path: String,
    },
}
