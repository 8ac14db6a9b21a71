//! XenOrchestra Cloud Controller Manager
//!
//! Registers the XenOrchestra cloud provider, builds it from the cloud-config
//! file and runs:
//! - the Service watcher: one load balancer VM per `type: LoadBalancer` Service
//! - the node sync: Provider IDs, topology labels, addresses and shutdown taints
//!
//! Configuration comes from environment variables:
//! - `CLOUD_CONFIG`: path of the cloud-config file (required)
//! - `CLUSTER_NAME`: cluster name handed to the provider (default `kubernetes`)
//! - `ALLOW_UNTAGGED_CLOUD`: run without a `clusterId` in the cloud-config
//! - `NODE_SYNC_PERIOD_SECONDS`: node sync and Service resync period (default 60)

mod controller;
mod error;
mod node_sync;
mod watcher;

use crate::controller::{Controller, ControllerSettings};
use crate::error::ControllerError;
use std::env;
use std::fs::File;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use xo_cloud_provider::ProviderRegistry;
use xo_cloud_provider::provider::{self, REGISTERED_PROVIDER_NAME};

const DEFAULT_CLUSTER_NAME: &str = "kubernetes";
const DEFAULT_NODE_SYNC_PERIOD_SECONDS: u64 = 60;

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn node_sync_period() -> Result<Duration, ControllerError> {
    match env::var("NODE_SYNC_PERIOD_SECONDS") {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
            .ok_or_else(|| {
                ControllerError::InvalidConfig(format!(
                    "NODE_SYNC_PERIOD_SECONDS must be a positive integer, got {:?}",
                    raw
                ))
            }),
        Err(_) => Ok(Duration::from_secs(DEFAULT_NODE_SYNC_PERIOD_SECONDS)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting XenOrchestra Cloud Controller Manager");

    // Load configuration from environment variables
    let config_path = env::var("CLOUD_CONFIG").map_err(|_| {
        ControllerError::InvalidConfig("CLOUD_CONFIG environment variable is required".to_string())
    })?;
    let cluster_name = env::var("CLUSTER_NAME").unwrap_or_else(|_| DEFAULT_CLUSTER_NAME.to_string());
    let allow_untagged_cloud = env_flag("ALLOW_UNTAGGED_CLOUD");
    let node_sync_period = node_sync_period()?;

    info!("Configuration:");
    info!("  Cloud config: {}", config_path);
    info!("  Cluster name: {}", cluster_name);
    info!("  Node sync period: {:?}", node_sync_period);

    let mut registry = ProviderRegistry::new();
    provider::register(&mut registry);

    let config = File::open(&config_path).map_err(|e| {
        ControllerError::InvalidConfig(format!("cannot open cloud-config {}: {}", config_path, e))
    })?;
    let cloud = registry
        .init_cloud_provider(REGISTERED_PROVIDER_NAME, config)
        .map_err(|e| {
            error!("Cloud provider could not be initialized: {}", e);
            ControllerError::from(e)
        })?;

    if !cloud.has_cluster_id() {
        if allow_untagged_cloud {
            warn!("Detected a cluster without a ClusterID. A ClusterID will be required in the future. Please tag your cluster to avoid any future issues");
        } else {
            return Err(ControllerError::InvalidConfig(
                "no ClusterID found. A ClusterID is required for the cloud provider to function properly. This check can be bypassed by setting ALLOW_UNTAGGED_CLOUD=true".to_string(),
            )
            .into());
        }
    }

    let stop = CancellationToken::new();
    let settings = ControllerSettings {
        cluster_name,
        node_sync_period,
    };
    let controller = Controller::new(cloud, settings, stop.clone()).await?;

    let signal_stop = stop.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for interrupts: {}", e);
            return;
        }
        info!("Interrupt received");
        signal_stop.cancel();
    });

    controller.run().await?;
    Ok(())
}
