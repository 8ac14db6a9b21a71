//! Where a Service's ready endpoints run.
//!
//! The reconciler narrows its candidate nodes to the ones hosting ready
//! endpoints. Without a Kubernetes client every candidate node is used.

use crate::error::ProviderError;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::Api;
use kube::api::ListParams;
use std::collections::BTreeSet;
use tracing::debug;

/// Label linking an EndpointSlice to its Service
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// Source of ready-endpoint placement
#[async_trait]
pub trait EndpointSource: Send + Sync {
    /// Names of the nodes hosting at least one ready endpoint of `service`.
    ///
    /// `None` means the placement is unknown and all candidates apply.
    async fn ready_node_names(&self, service: &Service) -> Result<Option<BTreeSet<String>>, ProviderError>;
}

/// Reads EndpointSlices from the API server
#[derive(Clone)]
pub struct KubeEndpointSource {
    client: kube::Client,
}

impl std::fmt::Debug for KubeEndpointSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeEndpointSource").finish_non_exhaustive()
    }
}

impl KubeEndpointSource {
    /// Read EndpointSlices through `client`
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

/// Nodes of ready endpoints across slices.
///
/// An endpoint whose readiness is unknown counts as ready.
pub fn ready_nodes<'a>(slices: impl IntoIterator<Item = &'a EndpointSlice>) -> BTreeSet<String> {
    slices
        .into_iter()
        .flat_map(|slice| slice.endpoints.iter())
        .filter(|ep| ep.conditions.as_ref().and_then(|c| c.ready) != Some(false))
        .filter_map(|ep| ep.node_name.clone())
        .collect()
}

#[async_trait]
impl EndpointSource for KubeEndpointSource {
    async fn ready_node_names(&self, service: &Service) -> Result<Option<BTreeSet<String>>, ProviderError> {
        let (Some(namespace), Some(name)) = (
            service.metadata.namespace.as_deref(),
            service.metadata.name.as_deref(),
        ) else {
            return Ok(None);
        };

        let api: Api<EndpointSlice> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&format!("{}={}", SERVICE_NAME_LABEL, name));
        let slices = api.list(&params).await?;

        let nodes = ready_nodes(&slices.items);
        debug!(
            "Service {}/{} has ready endpoints on {} node(s)",
            namespace,
            name,
            nodes.len()
        );
        Ok(Some(nodes))
    }
}
