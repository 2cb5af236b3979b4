//! tikv-operator - A Kubernetes operator for TiKV clusters.
//!
//! This is the main entry point that:
//! - Parses the operator configuration
//! - Initializes structured logging
//! - Runs leader election (required for HA deployments)
//! - Starts the controller and the health server

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::{Client, CustomResourceExt};
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tikv_operator::controller::config::ControllerConfig;
use tikv_operator::crd::TikvCluster;
use tikv_operator::health::{HealthState, run_health_server};
use tikv_operator::run_controller;

/// Lease configuration
const LEASE_NAME: &str = "tikv-operator-leader";
const LEASE_TTL_SECS: u64 = 15;
const LEASE_RENEW_INTERVAL_SECS: u64 = 5;

/// Longest wait for in-flight reconciles to finish during shutdown
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 10;

fn lease_lock(client: Client, namespace: &str, holder_id: String) -> LeaseLock {
    LeaseLock::new(
        client,
        namespace,
        LeaseLockParams {
            holder_id,
            lease_name: LEASE_NAME.to_string(),
            lease_ttl: Duration::from_secs(LEASE_TTL_SECS),
        },
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ControllerConfig::parse();

    if config.crd {
        print!("{}", serde_yaml::to_string(&TikvCluster::crd())?);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tikv_operator=info".parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .json()
        .init();

    info!(workers = config.workers, auto_failover = config.auto_failover, "Starting tikv-operator");

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let pod_name = std::env::var("POD_NAME").unwrap_or_else(|_| {
        warn!("POD_NAME not set, using hostname");
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    });
    let namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| {
        warn!("POD_NAMESPACE not set, using 'default'");
        "default".to_string()
    });

    info!(
        holder_id = %pod_name,
        namespace = %namespace,
        lease_name = LEASE_NAME,
        "Initializing leader election"
    );

    let health_state = Arc::new(HealthState::new());

    // Probes answer even while this instance is not the leader.
    let health_handle = {
        let health_state = health_state.clone();
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state).await {
                error!(error = %e, "Health server error");
            }
        })
    };

    let lock = lease_lock(client.clone(), &namespace, pod_name.clone());
    info!("Waiting to acquire leadership...");
    loop {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("Received shutdown signal before acquiring leadership");
                return Ok(());
            }
            result = lock.try_acquire_or_renew() => match result {
                Ok(result) if result.acquired_lease => {
                    info!("Acquired leadership");
                    break;
                }
                Ok(_) => info!("Another instance is leader, waiting..."),
                Err(e) => warn!(error = %e, "Failed to acquire lease, retrying..."),
            },
        }
        tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
    }

    let cancel = CancellationToken::new();

    let lease_renewal_handle = {
        let lock = lease_lock(client.clone(), &namespace, pod_name);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)) => {}
                }
                match lock.try_acquire_or_renew().await {
                    Ok(result) if result.acquired_lease => {}
                    Ok(_) => {
                        error!("Lost leadership, stopping controller");
                        cancel.cancel();
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to renew lease, stopping controller");
                        cancel.cancel();
                        break;
                    }
                }
            }
        })
    };

    let mut controller_handle = {
        let health_state = health_state.clone();
        let cancel = cancel.clone();
        tokio::spawn(run_controller(client, config, Some(health_state), cancel))
    };

    tokio::select! {
        result = &mut controller_handle => {
            if let Err(e) = result {
                error!(error = %e, "Controller task panicked");
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!(error = %e, "Health server task panicked");
            }
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");
            health_state.set_ready(false).await;
            cancel.cancel();
            if tokio::time::timeout(Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS), &mut controller_handle)
                .await
                .is_err()
            {
                warn!("Controller did not stop within the grace period");
            }
        }
    }

    cancel.cancel();
    if let Err(e) = lease_renewal_handle.await {
        error!(error = %e, "Lease renewal task panicked");
    }

    info!("Operator stopped");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
///
/// Signal handler setup failures are fatal.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
