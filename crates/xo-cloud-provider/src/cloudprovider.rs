//! Cloud provider plugin contract.
//!
//! These traits are the fixed surface the cloud-controller-manager host calls
//! into. A capability accessor returning `None` means "not supported".

use crate::error::ProviderError;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{LoadBalancerStatus, Node, NodeAddress, Service};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Result type used across the plugin contract
pub type CloudResult<T> = Result<T, ProviderError>;

/// Optional capability slots of a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Instances (v1)
    Instances,
    InstancesV2,
    /// Load balancers
    LoadBalancer,
    /// Zones
    Zones,
    /// Clusters
    Clusters,
    /// Routes
    Routes,
}

impl Capability {
    /// Every capability slot, in host accessor order
    pub const ALL: [Capability; 6] = [
        Capability::LoadBalancer,
        Capability::Instances,
        Capability::InstancesV2,
        Capability::Zones,
        Capability::Clusters,
        Capability::Routes,
    ];
}

/// Hands out Kubernetes clients to the provider
#[async_trait]
pub trait ControllerClientBuilder: Send + Sync {
    /// Build a client identified by `name` (the user agent)
    async fn client(&self, name: &str) -> CloudResult<kube::Client>;
}

/// Top-level provider interface held by the host
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Connect to the platform and start background work. Everything started
    /// here stops when `stop` fires.
    async fn initialize(
        &self,
        client_builder: Arc<dyn ControllerClientBuilder>,
        stop: CancellationToken,
    ) -> CloudResult<()>;

    fn load_balancer(&self) -> Option<Arc<dyn LoadBalancer>>;

    fn instances(&self) -> Option<Arc<dyn Instances>>;

    fn instances_v2(&self) -> Option<Arc<dyn InstancesV2>>;

    fn zones(&self) -> Option<Arc<dyn Zones>>;

    fn clusters(&self) -> Option<Arc<dyn Clusters>>;

    fn routes(&self) -> Option<Arc<dyn Routes>>;

    /// Cloud provider ID
    fn provider_name(&self) -> &str;

    /// True if a cluster ID was configured
    fn has_cluster_id(&self) -> bool;

    /// Whether a capability slot is supported
    fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Instances => self.instances().is_some(),
            Capability::InstancesV2 => self.instances_v2().is_some(),
            Capability::LoadBalancer => self.load_balancer().is_some(),
            Capability::Zones => self.zones().is_some(),
            Capability::Clusters => self.clusters().is_some(),
            Capability::Routes => self.routes().is_some(),
        }
    }
}

/// Per-node facts returned by [`InstancesV2::instance_metadata`]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InstanceMetadata {
    /// `xenorchestra://<vm-uuid>`
    pub provider_id: String,
    /// Template name or `unknown`
    pub instance_type: String,
    /// Internal addresses first, then external, then the hostname
    pub node_addresses: Vec<NodeAddress>,
    /// Host (or pool) of the VM
    pub zone: String,
    /// Pool of the VM
    pub region: String,
}

/// Node lookups by name or provider ID
#[async_trait]
pub trait Instances: Send + Sync {
    async fn node_addresses(&self, name: &str) -> CloudResult<Vec<NodeAddress>>;

    async fn node_addresses_by_provider_id(&self, provider_id: &str) -> CloudResult<Vec<NodeAddress>>;

    /// Cloud instance ID of the named node
    async fn instance_id(&self, name: &str) -> CloudResult<String>;

    async fn instance_type(&self, name: &str) -> CloudResult<String>;

    async fn instance_type_by_provider_id(&self, provider_id: &str) -> CloudResult<String>;

    async fn add_ssh_key_to_all_instances(&self, user: &str, key: &[u8]) -> CloudResult<()>;

    /// Node name for the host this process runs on
    async fn current_node_name(&self, hostname: &str) -> CloudResult<String>;

    /// `false` (not an error) once the instance is gone
    async fn instance_exists_by_provider_id(&self, provider_id: &str) -> CloudResult<bool>;

    async fn instance_shutdown_by_provider_id(&self, provider_id: &str) -> CloudResult<bool>;
}

/// Node lookups driven by the whole Node object
#[async_trait]
pub trait InstancesV2: Send + Sync {
    async fn instance_exists(&self, node: &Node) -> CloudResult<bool>;

    async fn instance_shutdown(&self, node: &Node) -> CloudResult<bool>;

    async fn instance_metadata(&self, node: &Node) -> CloudResult<InstanceMetadata>;
}

/// Load balancers for `type: LoadBalancer` Services
#[async_trait]
pub trait LoadBalancer: Send + Sync {
    /// Status of the Service's balancer, `None` when it does not exist
    async fn get_load_balancer(
        &self,
        cluster_name: &str,
        service: &Service,
    ) -> CloudResult<Option<LoadBalancerStatus>>;

    /// Platform-side name of the Service's balancer
    fn get_load_balancer_name(&self, cluster_name: &str, service: &Service) -> String;

    async fn ensure_load_balancer(
        &self,
        cluster_name: &str,
        service: &Service,
        nodes: &[Node],
    ) -> CloudResult<LoadBalancerStatus>;

    async fn update_load_balancer(
        &self,
        cluster_name: &str,
        service: &Service,
        nodes: &[Node],
    ) -> CloudResult<()>;

    /// Succeeds when the balancer is already gone
    async fn ensure_load_balancer_deleted(&self, cluster_name: &str, service: &Service) -> CloudResult<()>;
}

/// Failure domain of an instance
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Zone {
    /// Zone name
    pub failure_domain: String,
    /// Region name
    pub region: String,
}

/// Zone lookups; superseded by [`InstancesV2`]
#[async_trait]
pub trait Zones: Send + Sync {
    async fn get_zone_by_provider_id(&self, provider_id: &str) -> CloudResult<Zone>;

    async fn get_zone_by_node_name(&self, node_name: &str) -> CloudResult<Zone>;
}

/// Multi-cluster listing
#[async_trait]
pub trait Clusters: Send + Sync {
    async fn list_clusters(&self) -> CloudResult<Vec<String>>;

    async fn master(&self, cluster_name: &str) -> CloudResult<String>;
}

/// A pod CIDR routed to a node
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Route {
    /// Route name
    pub name: String,
    /// Node the route points at
    pub target_node: String,
    /// Destination CIDR
    pub destination_cidr: String,
}

/// Pod network routes
#[async_trait]
pub trait Routes: Send + Sync {
    async fn list_routes(&self, cluster_name: &str) -> CloudResult<Vec<Route>>;

    async fn create_route(&self, cluster_name: &str, name_hint: &str, route: &Route) -> CloudResult<()>;

    async fn delete_route(&self, cluster_name: &str, route: &Route) -> CloudResult<()>;
}
