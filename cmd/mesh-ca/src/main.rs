mod options;

use anyhow::Context;
use clap::Parser;
use pkg_api::AppState;
use pkg_api::server::start_monitoring_server;
use pkg_cluster::KubeCluster;
use pkg_constants::paths::NAMESPACE_ENV;
use pkg_controllers::SecretController;
use pkg_metrics::MetricsRegistry;
use pkg_pki::CertificateAuthority;
use pkg_types::config::{CaConfigFile, load_config_file};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::options::{Cli, resolve};

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    // Kubernetes client TLS needs a process-wide crypto provider.
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("A rustls crypto provider is already installed");
    }

    // Load config file (returns defaults if file not found)
    let file_cfg: CaConfigFile = load_config_file(&cli.config)
        .with_context(|| format!("failed to load config file {}", cli.config))?;
    info!("Config file: {}", cli.config);

    let options = resolve(cli, file_cfg, std::env::var(NAMESPACE_ENV).ok())?;

    let ca = Arc::new(
        CertificateAuthority::from_config(&options.key_material)
            .context("failed to create the certificate authority")?,
    );
    let cluster = KubeCluster::connect(options.kube_config.as_deref())
        .await
        .context("failed to create a cluster client")?;
    let metrics = Arc::new(MetricsRegistry::mesh_ca());
    let cancel = CancellationToken::new();

    info!("Starting mesh-ca");
    info!("  CA mode:      {}", ca.mode());
    info!("  Root expires: {}", ca.root_not_after());
    info!("  Scope:        {}", options.controller.scope);

    let monitoring = if options.monitoring_port == 0 {
        info!("Monitoring endpoint disabled");
        None
    } else {
        let addr = SocketAddr::from(([0, 0, 0, 0], options.monitoring_port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind monitoring endpoint {}", addr))?;
        let state = AppState {
            ca: ca.clone(),
            metrics: metrics.clone(),
        };
        Some(tokio::spawn(start_monitoring_server(
            listener,
            state,
            cancel.clone(),
        )))
    };

    let controller =
        SecretController::new(Arc::new(cluster), ca.clone(), metrics, options.controller);
    let controller_task = tokio::spawn(controller.run(cancel.clone()));

    shutdown_signal().await;
    info!("Shutdown signal received");
    cancel.cancel();

    controller_task.await?;
    if let Some(monitoring) = monitoring {
        monitoring.await??;
    }
    warn!("mesh-ca has stopped");
    Ok(())
}
