//! Instance resolution.
//!
//! Maps Kubernetes Nodes to XenOrchestra VMs and answers the node lifecycle
//! controller's identity, metadata and liveness questions.
//!
//! The Provider ID is authoritative: a renamed VM still resolves through its
//! UUID. A Node without a Provider ID is resolved by name once, to bootstrap.
//! VM records are cached for a short TTL; a `NotFound` evicts the entry.

use crate::cloudprovider::{CloudResult, InstanceMetadata, Instances, InstancesV2};
use crate::error::ProviderError;
use crate::provider_id::{format_provider_id, parse_provider_id};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, NodeAddress};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;
use xo_client::{AddressScope, Session, VmRecord, XoError};

/// Instance type reported when the VM's template is unknown
pub const UNKNOWN_INSTANCE_TYPE: &str = "unknown";

/// Kubernetes node address types
pub const NODE_INTERNAL_IP: &str = "InternalIP";
/// Address type of public addresses
pub const NODE_EXTERNAL_IP: &str = "ExternalIP";
/// Address type of the node hostname
pub const NODE_HOSTNAME: &str = "Hostname";

#[derive(Debug, Clone)]
struct CachedVm {
    vm: VmRecord,
    fetched_at: Instant,
}

/// Resolves Nodes to VM facts
#[derive(Debug)]
pub struct InstanceResolver {
    session: Arc<Session>,
    dual_stack: bool,
    cache_ttl: Duration,
    cache: Mutex<HashMap<String, CachedVm>>,
}

impl InstanceResolver {
    /// `cache_ttl` of zero disables caching
    pub fn new(session: Arc<Session>, dual_stack: bool, cache_ttl: Duration) -> Self {
        Self {
            session,
            dual_stack,
            cache_ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<String, CachedVm>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cached(&self, id: &str) -> Option<VmRecord> {
        if self.cache_ttl.is_zero() {
            return None;
        }
        let mut cache = self.cache();
        match cache.get(id) {
            Some(entry) if entry.fetched_at.elapsed() < self.cache_ttl => Some(entry.vm.clone()),
            Some(_) => {
                cache.remove(id);
                None
            }
            None => None,
        }
    }

    fn remember(&self, vm: &VmRecord) {
        if !self.cache_ttl.is_zero() {
            self.cache().insert(
                vm.id.clone(),
                CachedVm {
                    vm: vm.clone(),
                    fetched_at: Instant::now(),
                },
            );
        }
    }

    /// Drop a cached VM so the next lookup hits the platform
    pub fn invalidate(&self, vm_id: &str) {
        self.cache().remove(vm_id);
    }

    /// Look a VM up by UUID or name, through the cache
    async fn find(&self, identifier: &str, cache_key: Option<&str>) -> CloudResult<VmRecord> {
        if let Some(vm) = cache_key.and_then(|key| self.cached(key)) {
            return Ok(vm);
        }

        match self.session.find_vm(identifier).await {
            Ok(vm) => {
                self.remember(&vm);
                Ok(vm)
            }
            Err(XoError::NotFound(message)) => {
                if let Some(key) = cache_key {
                    self.invalidate(key);
                }
                Err(ProviderError::InstanceNotFound(message))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// VM behind a Provider ID
    pub async fn vm_by_provider_id(&self, provider_id: &str) -> CloudResult<VmRecord> {
        let vm_id = parse_provider_id(provider_id)?;
        self.find(&vm_id, Some(&vm_id)).await
    }

    /// VM whose name matches the node name
    pub async fn vm_by_node_name(&self, name: &str) -> CloudResult<VmRecord> {
        self.find(name, None).await
    }

    /// VM behind a Node: its Provider ID when set, its name otherwise
    pub async fn vm_for_node(&self, node: &Node) -> CloudResult<VmRecord> {
        match node_provider_id(node) {
            Some(provider_id) => self.vm_by_provider_id(provider_id).await,
            None => {
                let name = node.metadata.name.as_deref().unwrap_or_default();
                debug!("Node {} has no provider ID yet, resolving by name", name);
                self.vm_by_node_name(name).await
            }
        }
    }

    /// True iff the VM exists; a missing VM is `false`, not an error
    pub async fn exists_by_provider_id(&self, provider_id: &str) -> CloudResult<bool> {
        exists(self.vm_by_provider_id(provider_id).await)
    }

    /// True iff the VM is not running
    pub async fn shutdown_by_provider_id(&self, provider_id: &str) -> CloudResult<bool> {
        Ok(!self.vm_by_provider_id(provider_id).await?.is_running())
    }

    /// Identity, addresses and topology of the VM
    pub async fn metadata_by_provider_id(&self, provider_id: &str) -> CloudResult<InstanceMetadata> {
        let vm = self.vm_by_provider_id(provider_id).await?;
        Ok(self.metadata(&vm))
    }

    /// Metadata of an already resolved VM
    pub fn metadata(&self, vm: &VmRecord) -> InstanceMetadata {
        InstanceMetadata {
            provider_id: format_provider_id(&vm.id),
            instance_type: instance_type(vm),
            node_addresses: self.node_addresses_of(vm),
            zone: vm.host_id.clone().unwrap_or_else(|| vm.pool_id.clone()),
            region: vm.pool_id.clone(),
        }
    }

    /// Node addresses: internal before external, each group in interface
    /// creation order, then the VM name as hostname.
    ///
    /// IPv6 addresses are only reported with dual-stack enabled.
    pub fn node_addresses_of(&self, vm: &VmRecord) -> Vec<NodeAddress> {
        let mut addresses: Vec<NodeAddress> = vm
            .ordered_addresses()
            .into_iter()
            .filter(|a| self.usable_ip(&a.ip))
            .map(|a| NodeAddress {
                address: a.ip.to_string(),
                type_: match a.scope {
                    AddressScope::Internal => NODE_INTERNAL_IP,
                    AddressScope::External => NODE_EXTERNAL_IP,
                }
                .to_string(),
            })
            .collect();

        if !vm.name.is_empty() {
            addresses.push(NodeAddress {
                address: vm.name.clone(),
                type_: NODE_HOSTNAME.to_string(),
            });
        }
        addresses
    }

    /// Keep only the address families the cluster uses
    pub fn usable_ip(&self, ip: &IpAddr) -> bool {
        self.dual_stack || ip.is_ipv4()
    }
}

fn node_provider_id(node: &Node) -> Option<&str> {
    node.spec
        .as_ref()
        .and_then(|s| s.provider_id.as_deref())
        .filter(|id| !id.is_empty())
}

fn instance_type(vm: &VmRecord) -> String {
    vm.template
        .clone()
        .unwrap_or_else(|| UNKNOWN_INSTANCE_TYPE.to_string())
}

fn exists(lookup: CloudResult<VmRecord>) -> CloudResult<bool> {
    match lookup {
        Ok(_) => Ok(true),
        Err(e) if e.is_instance_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl Instances for InstanceResolver {
    async fn node_addresses(&self, name: &str) -> CloudResult<Vec<NodeAddress>> {
        let vm = self.vm_by_node_name(name).await?;
        Ok(self.node_addresses_of(&vm))
    }

    async fn node_addresses_by_provider_id(&self, provider_id: &str) -> CloudResult<Vec<NodeAddress>> {
        let vm = self.vm_by_provider_id(provider_id).await?;
        Ok(self.node_addresses_of(&vm))
    }

    async fn instance_id(&self, name: &str) -> CloudResult<String> {
        Ok(self.vm_by_node_name(name).await?.id)
    }

    async fn instance_type(&self, name: &str) -> CloudResult<String> {
        Ok(instance_type(&self.vm_by_node_name(name).await?))
    }

    async fn instance_type_by_provider_id(&self, provider_id: &str) -> CloudResult<String> {
        Ok(instance_type(&self.vm_by_provider_id(provider_id).await?))
    }

    async fn add_ssh_key_to_all_instances(&self, _user: &str, _key: &[u8]) -> CloudResult<()> {
        Err(ProviderError::NotImplemented(
            "adding SSH keys to instances".to_string(),
        ))
    }

    async fn current_node_name(&self, hostname: &str) -> CloudResult<String> {
        Ok(hostname.to_string())
    }

    async fn instance_exists_by_provider_id(&self, provider_id: &str) -> CloudResult<bool> {
        self.exists_by_provider_id(provider_id).await
    }

    async fn instance_shutdown_by_provider_id(&self, provider_id: &str) -> CloudResult<bool> {
        self.shutdown_by_provider_id(provider_id).await
    }
}

#[async_trait]
impl InstancesV2 for InstanceResolver {
    async fn instance_exists(&self, node: &Node) -> CloudResult<bool> {
        exists(self.vm_for_node(node).await)
    }

    async fn instance_shutdown(&self, node: &Node) -> CloudResult<bool> {
        Ok(!self.vm_for_node(node).await?.is_running())
    }

    async fn instance_metadata(&self, node: &Node) -> CloudResult<InstanceMetadata> {
        let vm = self.vm_for_node(node).await?;
        Ok(self.metadata(&vm))
    }
}
