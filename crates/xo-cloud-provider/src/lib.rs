//! XenOrchestra Cloud Provider
//!
//! Kubernetes cloud provider for clusters running on XenOrchestra-managed
//! pools (XCP-ng / XenServer).
//!
//! - [`instances`]: maps Nodes to VMs (Provider ID `xenorchestra://<uuid>`)
//!   and answers existence, shutdown and metadata queries
//! - [`loadbalancer`]: one appliance VM per `type: LoadBalancer` Service,
//!   kept in sync with the Service's ready backends
//! - [`provider`]: the object the cloud-controller-manager host holds
//!
//! # Example
//!
//! ```no_run
//! use xo_cloud_provider::{ProviderRegistry, provider};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut registry = ProviderRegistry::new();
//! provider::register(&mut registry);
//!
//! let config = std::fs::File::open("/etc/kubernetes/cloud-config")?;
//! let cloud = registry.init_cloud_provider(provider::REGISTERED_PROVIDER_NAME, config)?;
//! println!("{} (cluster ID set: {})", cloud.provider_name(), cloud.has_cluster_id());
//! # Ok(())
//! # }
//! ```

pub mod cloudprovider;
pub mod error;
pub mod instances;
pub mod loadbalancer;
pub mod provider;
pub mod provider_id;
pub mod registry;

#[cfg(test)]
mod test_utils;

pub use cloudprovider::{
    Capability, CloudProvider, CloudResult, Clusters, ControllerClientBuilder, InstanceMetadata, Instances,
    InstancesV2, LoadBalancer, Route, Routes, Zone, Zones,
};
pub use error::ProviderError;
pub use instances::InstanceResolver;
pub use loadbalancer::{BalancerState, LoadBalancerReconciler};
pub use provider::XenOrchestra;
pub use provider_id::{PROVIDER_ID_SCHEME, format_provider_id, parse_provider_id};
pub use registry::{ProviderFactory, ProviderRegistry};
