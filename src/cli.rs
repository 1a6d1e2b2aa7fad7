use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "sandbox-operator")]
#[command(about = "Reconciliation control plane for Sandbox/SandboxClaim/SandboxWarmPool")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the three reconcilers plus the health/metrics HTTP server
    Run {
        /// Address the /healthz, /readyz, /metrics HTTP server binds to
        #[arg(long, default_value = "0.0.0.0:9090")]
        metrics_addr: String,

        /// Steady-state reconcile requeue interval, in seconds
        #[arg(long, default_value_t = 30)]
        requeue_interval_secs: u64,
    },

    /// Check cluster connectivity and RBAC permissions for the four CRDs
    Check,

    /// List sandboxes, claims, or warm pools across all namespaces
    List {
        /// Resource type: sandboxes | claims | warmpools
        resource: String,
    },

    /// Manage the Sandbox/SandboxClaim/SandboxTemplate/SandboxWarmPool CRDs
    Crd {
        #[command(subcommand)]
        action: CrdAction,
    },
}

#[derive(Subcommand)]
pub enum CrdAction {
    /// Print all four CRD manifests as YAML
    Generate,

    /// Install all four CRDs into the connected cluster
    Install,
}
