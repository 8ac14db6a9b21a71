//! Main controller implementation.
//!
//! The `Controller` initializes the cloud provider and runs the Service
//! watcher and the node sync side by side until the stop token fires.

use crate::error::ControllerError;
use crate::node_sync::NodeSync;
use crate::watcher::{ServiceContext, watch_services};
use async_trait::async_trait;
use kube::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use xo_cloud_provider::{CloudProvider, CloudResult, ControllerClientBuilder};

/// Builds in-cluster (or kubeconfig) clients for the provider
#[derive(Debug, Default)]
pub struct KubeClientBuilder;

#[async_trait]
impl ControllerClientBuilder for KubeClientBuilder {
    async fn client(&self, name: &str) -> CloudResult<Client> {
        debug!("Building Kubernetes client for {}", name);
        Ok(Client::try_default().await?)
    }
}

/// Runtime settings of the controller
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub cluster_name: String,
    pub node_sync_period: Duration,
}

/// Cloud controller manager for the XenOrchestra provider.
pub struct Controller {
    service_watcher: JoinHandle<Result<(), ControllerError>>,
    node_sync: JoinHandle<Result<(), ControllerError>>,
    stop: CancellationToken,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller").finish_non_exhaustive()
    }
}

impl Controller {
    /// Initializes the provider and starts the loops.
    pub async fn new(
        provider: Arc<dyn CloudProvider>,
        settings: ControllerSettings,
        stop: CancellationToken,
    ) -> Result<Self, ControllerError> {
        info!("Initializing cloud provider {}", provider.provider_name());
        provider
            .initialize(Arc::new(KubeClientBuilder), stop.clone())
            .await?;

        let client = Client::try_default().await?;

        let load_balancer = provider
            .load_balancer()
            .ok_or_else(|| ControllerError::Unsupported("LoadBalancer".to_string()))?;
        let instances = provider
            .instances_v2()
            .ok_or_else(|| ControllerError::Unsupported("InstancesV2".to_string()))?;

        let context = Arc::new(ServiceContext {
            client: client.clone(),
            load_balancer,
            cluster_name: settings.cluster_name.clone(),
            resync: settings.node_sync_period,
        });
        let service_watcher = tokio::spawn(watch_services(context));

        let node_sync = NodeSync::new(client, instances, settings.node_sync_period);
        let node_stop = stop.clone();
        let node_sync = tokio::spawn(async move { node_sync.run(node_stop).await });

        Ok(Self {
            service_watcher,
            node_sync,
            stop,
        })
    }

    /// Runs until the stop token fires or a loop exits.
    pub async fn run(self) -> Result<(), ControllerError> {
        info!("Cloud controller manager running");
        let Self {
            mut service_watcher,
            node_sync,
            stop,
        } = self;

        let watcher_done = tokio::select! {
            _ = stop.cancelled() => {
                info!("Shutting down");
                false
            }
            res = &mut service_watcher => {
                error!("Service watcher exited: {:?}", res);
                stop.cancel();
                true
            }
        };
        if !watcher_done {
            service_watcher.abort();
        }

        node_sync.await?
    }
}
