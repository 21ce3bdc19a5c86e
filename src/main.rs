//! HostForge Kubernetes Operator
//!
//! This operator manages the lifecycle of bare-metal hosts on Kubernetes.
//!
//! ## Usage
//!
//! ```bash
//! # Run the operator (requires kubeconfig)
//! hostforge-operator
//!
//! # Run with custom log level
//! RUST_LOG=debug hostforge-operator
//! ```

use clap::Parser;
use hostforge_operator::leader_election::{self, LeaderElector};
use hostforge_operator::provisioner::{FixtureProvisioner, Provisioner};
use hostforge_operator::{metrics, HostController};
use kube::Client;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// HostForge Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "hostforge-operator")]
#[command(version, about = "Kubernetes Operator for bare-metal host lifecycle management")]
struct Args {
    /// Enable leader election for HA deployments
    #[arg(long, default_value = "false")]
    leader_election: bool,

    /// Namespace for the leader election Lease (auto-detected if empty)
    #[arg(long, default_value = "")]
    leader_election_namespace: String,

    /// Namespace to watch (empty for all namespaces)
    #[arg(long, default_value = "")]
    namespace: String,

    /// Provisioner backend ("fixture" runs without real hardware)
    #[arg(long, default_value = "fixture")]
    provisioner: String,

    /// Metrics bind address
    #[arg(long, default_value = "0.0.0.0:8080")]
    metrics_bind_address: String,

    /// Health probe bind address
    #[arg(long, default_value = "0.0.0.0:8081")]
    health_probe_bind_address: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args = Args::parse();

    info!("Starting HostForge Kubernetes Operator");
    info!("Leader election: {}", args.leader_election);
    info!(
        "Watching namespace: {}",
        if args.namespace.is_empty() {
            "all"
        } else {
            &args.namespace
        }
    );

    let provisioner: Arc<dyn Provisioner> = match args.provisioner.as_str() {
        "fixture" => Arc::new(FixtureProvisioner::new()),
        other => anyhow::bail!("unknown provisioner backend: {other}"),
    };
    info!("Provisioner backend: {}", args.provisioner);

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    // Leader election — acquire lease before starting the controller
    let elector = if args.leader_election {
        let ns = leader_election::detect_namespace(&args.leader_election_namespace);
        info!("Leader election namespace: {}", ns);
        let elector = LeaderElector::new(client.clone(), &ns);
        elector.acquire().await?;
        Some(Arc::new(elector))
    } else {
        None
    };

    let namespace = if args.namespace.is_empty() {
        None
    } else {
        Some(args.namespace.clone())
    };
    let host_controller = Arc::new(HostController::new(client.clone(), provisioner, namespace));

    // Serve metrics and health probes
    let metrics_handle = tokio::spawn(serve_metrics(args.metrics_bind_address.clone()));
    let health_handle = tokio::spawn(serve_probes(args.health_probe_bind_address.clone()));

    // Run the controller
    let controller_handle = {
        let controller = Arc::clone(&host_controller);
        tokio::spawn(async move {
            if let Err(e) = controller.run().await {
                error!("Host controller error: {}", e);
            }
        })
    };

    // Periodic lease renewal (no-op future when leader election is disabled)
    let elector_for_renew = elector.clone();
    let renew_handle = tokio::spawn(async move {
        match elector_for_renew {
            Some(e) => loop {
                tokio::time::sleep(e.renew_interval()).await;
                match e.renew().await {
                    Ok(true) => {}
                    Ok(false) => {
                        error!("Lost leader lease");
                        break;
                    }
                    Err(err) => {
                        error!("Failed to renew leader lease: {}", err);
                        break;
                    }
                }
            },
            None => std::future::pending::<()>().await,
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = controller_handle => {
            if let Err(e) = result {
                error!("Host controller task failed: {}", e);
            }
        }
        result = metrics_handle => {
            if let Ok(Err(e)) = result {
                error!("Metrics server failed: {}", e);
            }
        }
        result = health_handle => {
            if let Ok(Err(e)) = result {
                error!("Health probe server failed: {}", e);
            }
        }
        _ = renew_handle => {
            error!("Leader lease lost, initiating shutdown");
        }
    }

    // Release the lease before exiting so a standby replica can take over immediately
    if let Some(e) = &elector {
        e.release().await;
    }

    info!("HostForge Operator shutting down");
    Ok(())
}

/// Serve Prometheus metrics on the given address
async fn serve_metrics(addr: String) -> anyhow::Result<()> {
    let app = axum::Router::new().route("/metrics", axum::routing::get(|| async { metrics::render() }));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Serving metrics on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Serve liveness and readiness probes on the given address
async fn serve_probes(addr: String) -> anyhow::Result<()> {
    let app = axum::Router::new()
        .route("/healthz", axum::routing::get(|| async { "ok" }))
        .route("/readyz", axum::routing::get(|| async { "ok" }));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Serving health probes on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}
