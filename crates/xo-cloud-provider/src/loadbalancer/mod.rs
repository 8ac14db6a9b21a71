//! Load balancer reconciliation.
//!
//! Each `type: LoadBalancer` Service gets one balancer target: a dedicated
//! appliance VM whose XO tags carry the listeners and backend VMs. Per Service
//! the reconciler walks
//!
//! ```text
//! Absent -> Provisioning -> Ready -> Updating -> Ready ... -> Deleting -> Absent
//! ```
//!
//! The platform is the source of truth. In memory there is only a
//! reconciliation cache keyed by Service UID, holding the lifecycle state and
//! any terminal provisioning failure. Calls for one Service are serialized by a
//! key-scoped lock; different Services run in parallel.

pub mod endpoints;
pub mod key_lock;


use crate::cloudprovider::{CloudResult, LoadBalancer};
use crate::error::ProviderError;
use crate::instances::InstanceResolver;
use async_trait::async_trait;
use endpoints::EndpointSource;
use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, Node, Service};
use key_lock::KeyLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use xo_client::{BalancerPort, BalancerTarget, BalancerTargetSpec, Protocol, Session, XoError};

/// Name prefix used when no load balancer settings are configured
pub const DEFAULT_NAME_PREFIX: &str = "k8s-lb";

/// Lifecycle of one Service's balancer target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalancerState {
    Absent,
    Provisioning,
    Ready,
    Updating,
    Deleting,
}

/// Reconciliation cache entry
#[derive(Debug, Clone)]
struct ServiceEntry {
    state: BalancerState,
    target_id: Option<String>,
    /// Terminal platform failure and the spec that caused it
    failure: Option<(BalancerTargetSpec, XoError)>,
}

impl Default for ServiceEntry {
    fn default() -> Self {
        Self {
            state: BalancerState::Absent,
            target_id: None,
            failure: None,
        }
    }
}

/// Reconciles balancer targets for LoadBalancer Services
pub struct LoadBalancerReconciler {
    session: Arc<Session>,
    instances: Arc<InstanceResolver>,
    endpoints: Option<Arc<dyn EndpointSource>>,
    name_prefix: String,
    locks: KeyLock,
    entries: Mutex<HashMap<String, ServiceEntry>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for LoadBalancerReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancerReconciler")
            .field("name_prefix", &self.name_prefix)
            .field("endpoints", &self.endpoints.is_some())
            .finish_non_exhaustive()
    }
}

/// Platform errors that need a human before a retry can succeed
fn is_terminal(error: &XoError) -> bool {
    matches!(error, XoError::Provisioning(_) | XoError::InvalidRequest(_))
}

/// Kubernetes' default balancer name: `a` + the UID without dashes, 32 chars max
pub fn default_load_balancer_name(service: &Service) -> String {
    let uid: String = service
        .metadata
        .uid
        .as_deref()
        .unwrap_or_default()
        .chars()
        .filter(|c| *c != '-')
        .collect();
    let mut name = format!("a{}", uid);
    name.truncate(32);
    name
}

fn service_ref(service: &Service) -> String {
    format!(
        "{}/{}",
        service.metadata.namespace.as_deref().unwrap_or("default"),
        service.metadata.name.as_deref().unwrap_or_default()
    )
}

fn service_uid(service: &Service) -> CloudResult<&str> {
    service
        .metadata
        .uid
        .as_deref()
        .filter(|uid| !uid.is_empty())
        .ok_or_else(|| ProviderError::InvalidService(format!("Service {} has no UID", service_ref(service))))
}

/// Listeners of a Service; every port needs a node port
fn service_ports(service: &Service) -> CloudResult<BTreeSet<BalancerPort>> {
    let ports = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ProviderError::InvalidService(format!("Service {} has no ports", service_ref(service))))?;

    ports
        .iter()
        .map(|p| -> CloudResult<BalancerPort> {
            let protocol = p.protocol.as_deref().unwrap_or("TCP").parse::<Protocol>()?;
            let port = u16::try_from(p.port).map_err(|_| {
                ProviderError::InvalidService(format!("Service {} port {} is out of range", service_ref(service), p.port))
            })?;
            let node_port = p
                .node_port
                .filter(|n| *n > 0)
                .and_then(|n| u16::try_from(n).ok())
                .ok_or_else(|| {
                    ProviderError::InvalidService(format!(
                        "Service {} port {} has no node port",
                        service_ref(service),
                        p.port
                    ))
                })?;
            Ok(BalancerPort {
                protocol,
                port,
                node_port,
            })
        })
        .collect()
}

impl LoadBalancerReconciler {
    pub fn new(
        session: Arc<Session>,
        instances: Arc<InstanceResolver>,
        endpoints: Option<Arc<dyn EndpointSource>>,
        name_prefix: Option<&str>,
    ) -> Self {
        let cancel = session.cancellation_token();
        Self {
            session,
            instances,
            endpoints,
            name_prefix: name_prefix.unwrap_or(DEFAULT_NAME_PREFIX).to_string(),
            locks: KeyLock::new(),
            entries: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, ServiceEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current lifecycle state of a Service's balancer
    pub fn state(&self, uid: &str) -> BalancerState {
        self.entries()
            .get(uid)
            .map_or(BalancerState::Absent, |e| e.state)
    }

    fn transition(&self, uid: &str, next: BalancerState) {
        let mut entries = self.entries();
        let entry = entries.entry(uid.to_string()).or_default();
        if entry.state != next {
            debug!("Balancer for Service UID {}: {:?} -> {:?}", uid, entry.state, next);
            entry.state = next;
        }
    }

    fn update_entry(&self, uid: &str, f: impl FnOnce(&mut ServiceEntry)) {
        f(self.entries().entry(uid.to_string()).or_default());
    }

    fn forget(&self, uid: &str) {
        self.entries().remove(uid);
    }

    /// Serialize work on one Service, unless the provider is stopping
    async fn lock_service(&self, uid: &str) -> CloudResult<key_lock::KeyGuard<'_>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(XoError::Cancelled.into()),
            guard = self.locks.lock(uid) => Ok(guard),
        }
    }

    /// Platform name of the Service's balancer target
    pub fn target_name(&self, service: &Service) -> String {
        format!("{}-{}", self.name_prefix, default_load_balancer_name(service))
    }

    /// VMs that should receive the Service's traffic.
    ///
    /// Nodes that cannot be resolved are left out and logged; only
    /// cancellation aborts the pass.
    async fn backend_vms(&self, service: &Service, nodes: &[Node]) -> CloudResult<BTreeSet<String>> {
        let ready = match &self.endpoints {
            Some(source) => source.ready_node_names(service).await?,
            None => None,
        };

        let mut backends = BTreeSet::new();
        for node in nodes {
            let name = node.metadata.name.as_deref().unwrap_or_default();
            if let Some(ready) = &ready {
                if !ready.contains(name) {
                    continue;
                }
            }

            match self.instances.vm_for_node(node).await {
                Ok(vm) => {
                    backends.insert(vm.id);
                }
                Err(ProviderError::Xo(XoError::Cancelled)) => return Err(XoError::Cancelled.into()),
                Err(e) => warn!(
                    "Excluding node {} from load balancer for Service {}: {}",
                    name,
                    service_ref(service),
                    e
                ),
            }
        }
        Ok(backends)
    }

    async fn desired_spec(&self, service: &Service, nodes: &[Node]) -> CloudResult<BalancerTargetSpec> {
        Ok(BalancerTargetSpec {
            name: self.target_name(service),
            service_uid: service_uid(service)?.to_string(),
            ports: service_ports(service)?,
            backends: self.backend_vms(service, nodes).await?,
        })
    }

    fn ingress(&self, target: &BalancerTarget) -> Vec<LoadBalancerIngress> {
        target
            .ingress
            .iter()
            .filter(|ip| self.instances.usable_ip(ip))
            .map(|ip| LoadBalancerIngress {
                ip: Some(ip.to_string()),
                ..Default::default()
            })
            .collect()
    }

    fn status(&self, service: &Service, target: &BalancerTarget) -> CloudResult<LoadBalancerStatus> {
        let ingress = self.ingress(target);
        if ingress.is_empty() {
            return Err(XoError::Transient(format!(
                "balancer target {} for Service {} has no ingress address yet",
                target.id,
                service_ref(service)
            ))
            .into());
        }

        Ok(LoadBalancerStatus {
            ingress: Some(ingress),
        })
    }

    /// Converge the Service's balancer target and report its status.
    ///
    /// Safe to repeat: a converged target sees no platform mutation.
    pub async fn ensure(&self, service: &Service, nodes: &[Node]) -> CloudResult<LoadBalancerStatus> {
        let uid = service_uid(service)?.to_string();
        let _guard = self.lock_service(&uid).await?;

        let spec = self.desired_spec(service, nodes).await?;

        let remembered = self
            .entries()
            .get(&uid)
            .and_then(|e| e.failure.clone())
            .filter(|(failed_spec, _)| *failed_spec == spec);
        if let Some((_, error)) = remembered {
            debug!(
                "Balancer for Service {} failed before with the same spec, not retrying",
                service_ref(service)
            );
            return Err(error.into());
        }

        let previous = self.state(&uid);
        self.transition(
            &uid,
            match previous {
                BalancerState::Ready | BalancerState::Updating => BalancerState::Updating,
                _ => BalancerState::Provisioning,
            },
        );

        let target = match self.session.create_or_update_balancer_target(&spec).await {
            Ok(target) => target,
            Err(e) => {
                if is_terminal(&e) {
                    warn!(
                        "Balancer for Service {} cannot be provisioned: {}",
                        service_ref(service),
                        e
                    );
                    self.update_entry(&uid, |entry| entry.failure = Some((spec, e.clone())));
                }
                let rollback = if previous == BalancerState::Ready {
                    BalancerState::Ready
                } else {
                    BalancerState::Absent
                };
                self.transition(&uid, rollback);
                return Err(e.into());
            }
        };

        self.update_entry(&uid, |entry| {
            entry.target_id = Some(target.id.clone());
            entry.failure = None;
        });

        let status = self.status(service, &target)?;
        if previous != BalancerState::Ready {
            info!(
                "Balancer {} ({}) ready for Service {} with {} backend(s)",
                target.name,
                target.id,
                service_ref(service),
                target.backends.len()
            );
        }
        self.transition(&uid, BalancerState::Ready);
        Ok(status)
    }

    /// Remove the Service's balancer target; an absent target is success
    pub async fn delete(&self, service: &Service) -> CloudResult<()> {
        let uid = service_uid(service)?.to_string();
        let _guard = self.lock_service(&uid).await?;
        let previous = self.state(&uid);
        self.transition(&uid, BalancerState::Deleting);

        let name = self.target_name(service);
        let target = match self.session.find_balancer_target(&name).await {
            Ok(target) => target,
            Err(e) => {
                self.transition(&uid, previous);
                return Err(e.into());
            }
        };

        let Some(target) = target else {
            debug!("No balancer for Service {}, nothing to delete", service_ref(service));
            self.forget(&uid);
            return Ok(());
        };

        if target.service_uid.as_deref().is_some_and(|owner| owner != uid) {
            self.transition(&uid, previous);
            return Err(XoError::Conflict(format!(
                "VM {} ({}) belongs to another Service, not deleting it",
                target.name, target.id
            ))
            .into());
        }

        if let Err(e) = self.session.delete_balancer_target(&target.id).await {
            self.transition(&uid, previous);
            return Err(e.into());
        }

        info!(
            "Deleted balancer {} ({}) of Service {}",
            target.name,
            target.id,
            service_ref(service)
        );
        self.forget(&uid);
        Ok(())
    }

    /// Status of the Service's balancer target, `None` if it does not exist.
    ///
    /// A target without a usable address yet (halted, booting) still exists
    /// and is reported with no ingress. A VM serving another Service is not
    /// this Service's target.
    pub async fn observe(&self, service: &Service) -> CloudResult<Option<LoadBalancerStatus>> {
        let uid = service_uid(service)?;
        let Some(target) = self.session.find_balancer_target(&self.target_name(service)).await? else {
            return Ok(None);
        };
        if target.service_uid.as_deref().is_some_and(|owner| owner != uid) {
            debug!(
                "VM {} serves another Service, Service {} has no balancer",
                target.id,
                service_ref(service)
            );
            return Ok(None);
        }

        let ingress = self.ingress(&target);
        Ok(Some(LoadBalancerStatus {
            ingress: (!ingress.is_empty()).then_some(ingress),
        }))
    }
}

#[async_trait]
impl LoadBalancer for LoadBalancerReconciler {
    async fn get_load_balancer(
        &self,
        _cluster_name: &str,
        service: &Service,
    ) -> CloudResult<Option<LoadBalancerStatus>> {
        self.observe(service).await
    }

    fn get_load_balancer_name(&self, _cluster_name: &str, service: &Service) -> String {
        self.target_name(service)
    }

    async fn ensure_load_balancer(
        &self,
        _cluster_name: &str,
        service: &Service,
        nodes: &[Node],
    ) -> CloudResult<LoadBalancerStatus> {
        self.ensure(service, nodes).await
    }

    async fn update_load_balancer(
        &self,
        _cluster_name: &str,
        service: &Service,
        nodes: &[Node],
    ) -> CloudResult<()> {
        self.ensure(service, nodes).await.map(|_| ())
    }

    async fn ensure_load_balancer_deleted(&self, _cluster_name: &str, service: &Service) -> CloudResult<()> {
        self.delete(service).await
    }
}
