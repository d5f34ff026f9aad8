//! jupyter-operator - Kubernetes operator for Jupyter Notebook instances

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use jupyter_operator::controller::{Controller, ControllerConfig};
use jupyter_operator::crd::Notebook;
use jupyter_operator::pki::CertificateAuthority;

/// jupyter-operator - manage Jupyter notebooks as Kubernetes resources
#[derive(Parser, Debug)]
#[command(name = "jupyter-operator", version, about, long_about = None)]
struct Cli {
    /// Path to a kubeconfig file; in-cluster configuration is used when
    /// omitted
    #[arg(long, short = 'k')]
    kubeconfig: Option<PathBuf>,

    /// Logging verbosity (overridden by RUST_LOG when set)
    #[arg(long = "log-level", short = 'l', default_value = "info")]
    log_level: String,

    /// Namespace to watch; leave empty to watch all namespaces
    #[arg(long, short = 'n', default_value = "")]
    namespace: String,

    /// Number of reconcile workers
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Resync interval in seconds; 0 disables the periodic resync
    #[arg(long, default_value_t = 300)]
    resync: u64,

    /// Print the Notebook CRD manifest and exit
    #[arg(long)]
    crd: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .map_err(|e| anyhow::anyhow!("{:?} is not a valid log level: {}", cli.log_level, e))?;
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    if cli.crd {
        let crd = serde_yaml::to_string(&Notebook::crd())
            .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {}", e))?;
        print!("{crd}");
        return Ok(());
    }

    let client = match &cli.kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .map_err(|e| anyhow::anyhow!("failed to read kubeconfig {path:?}: {}", e))?;
            let config =
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| anyhow::anyhow!("failed to load kubeconfig {path:?}: {}", e))?;
            Client::try_from(config)
                .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {}", e))?
        }
        None => Client::try_default()
            .await
            .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {}", e))?,
    };

    let ca = CertificateAuthority::new("jupyter-operator-ca")
        .map_err(|e| anyhow::anyhow!("failed to generate CA certificate: {}", e))?;
    tracing::info!("certificate authority initialized");

    let stop = CancellationToken::new();
    let signal_stop = stop.clone();
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
            _ = signal_stop.cancelled() => return,
        }
        tracing::info!("received shutdown signal, exiting gracefully");
        signal_stop.cancel();
    });

    let controller = Controller::new(
        client,
        ca,
        ControllerConfig {
            namespace: cli.namespace,
            workers: cli.workers,
            resync_interval: Duration::from_secs(cli.resync),
        },
    );
    controller.run(stop).await?;

    Ok(())
}
