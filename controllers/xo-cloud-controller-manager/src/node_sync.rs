//! Periodic node sync.
//!
//! Every period, each Node is checked against its VM:
//! - a Node without a Provider ID is initialized from its VM (Provider ID,
//!   topology labels, addresses)
//! - a Node whose VM is gone is deleted
//! - a Node whose VM is not running carries the shutdown taint

use crate::error::ControllerError;
use k8s_openapi::api::core::v1::{Node, NodeAddress, Taint};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use xo_cloud_provider::{InstanceMetadata, InstancesV2};

pub const ZONE_LABEL: &str = "topology.kubernetes.io/zone";
pub const REGION_LABEL: &str = "topology.kubernetes.io/region";
pub const INSTANCE_TYPE_LABEL: &str = "node.kubernetes.io/instance-type";
pub const SHUTDOWN_TAINT: &str = "node.cloudprovider.kubernetes.io/shutdown";

/// Label values must be at most 63 characters of `[A-Za-z0-9._-]`
fn label_value(raw: &str) -> String {
    let mut value: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect();
    value.truncate(63);
    value
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// Metadata patch initializing a Node from its VM
pub fn initialization_patch(metadata: &InstanceMetadata) -> Value {
    json!({
        "metadata": {
            "labels": {
                ZONE_LABEL: label_value(&metadata.zone),
                REGION_LABEL: label_value(&metadata.region),
                INSTANCE_TYPE_LABEL: label_value(&metadata.instance_type),
            }
        },
        "spec": { "providerID": metadata.provider_id },
    })
}

/// Taints with the shutdown taint set or cleared; `None` when nothing changes
pub fn shutdown_taints(node: &Node, shutdown: bool) -> Option<Vec<Taint>> {
    let taints = node
        .spec
        .as_ref()
        .and_then(|s| s.taints.clone())
        .unwrap_or_default();
    let tainted = taints.iter().any(|t| t.key == SHUTDOWN_TAINT);

    match (shutdown, tainted) {
        (true, false) => {
            let mut taints = taints;
            taints.push(Taint {
                key: SHUTDOWN_TAINT.to_string(),
                effect: "NoSchedule".to_string(),
                ..Default::default()
            });
            Some(taints)
        }
        (false, true) => Some(taints.into_iter().filter(|t| t.key != SHUTDOWN_TAINT).collect()),
        _ => None,
    }
}

fn has_provider_id(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.provider_id.as_deref())
        .is_some_and(|id| !id.is_empty())
}

fn current_addresses(node: &Node) -> Vec<NodeAddress> {
    node.status
        .as_ref()
        .and_then(|s| s.addresses.clone())
        .unwrap_or_default()
}

/// Keeps Nodes in step with their VMs
pub struct NodeSync {
    client: Client,
    instances: Arc<dyn InstancesV2>,
    period: Duration,
}

impl std::fmt::Debug for NodeSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSync")
            .field("period", &self.period)
            .finish_non_exhaustive()
    }
}

impl NodeSync {
    pub fn new(client: Client, instances: Arc<dyn InstancesV2>, period: Duration) -> Self {
        Self {
            client,
            instances,
            period,
        }
    }

    /// Sync every period until `stop` fires
    pub async fn run(&self, stop: CancellationToken) -> Result<(), ControllerError> {
        info!("Starting node sync every {:?}", self.period);
        let mut ticker = tokio::time::interval(self.period);
        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    info!("Node sync stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sync_all().await {
                        warn!("Node sync pass failed: {}", e);
                    }
                }
            }
        }
    }

    /// One pass over all Nodes. A failing Node does not stop the pass.
    pub async fn sync_all(&self) -> Result<(), ControllerError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await?;
        debug!("Syncing {} node(s)", nodes.items.len());

        for node in &nodes.items {
            if let Err(e) = self.sync_node(&api, node).await {
                warn!("Failed to sync node {}: {}", node.name_any(), e);
            }
        }
        Ok(())
    }

    async fn sync_node(&self, api: &Api<Node>, node: &Node) -> Result<(), ControllerError> {
        let name = node.name_any();
        let params = PatchParams::default();

        if !self.instances.instance_exists(node).await? {
            if has_provider_id(node) {
                warn!("VM of node {} no longer exists, deleting the node", name);
                api.delete(&name, &DeleteParams::default()).await?;
            } else {
                debug!("No VM named {} yet, leaving the node uninitialized", name);
            }
            return Ok(());
        }

        let metadata = self.instances.instance_metadata(node).await?;
        if !has_provider_id(node) {
            info!("Initializing node {} as {}", name, metadata.provider_id);
            api.patch(&name, &params, &Patch::Merge(&initialization_patch(&metadata)))
                .await?;
        }

        if current_addresses(node) != metadata.node_addresses {
            debug!("Updating addresses of node {}", name);
            api.patch_status(
                &name,
                &params,
                &Patch::Merge(&json!({ "status": { "addresses": metadata.node_addresses } })),
            )
            .await?;
        }

        let shutdown = self.instances.instance_shutdown(node).await?;
        if let Some(taints) = shutdown_taints(node, shutdown) {
            if shutdown {
                info!("VM of node {} is not running, tainting the node", name);
            } else {
                info!("VM of node {} is running again, removing the shutdown taint", name);
            }
            api.patch(&name, &params, &Patch::Merge(&json!({ "spec": { "taints": taints } })))
                .await?;
        }
        Ok(())
    }
}
