//! Mock XoClient for unit testing
//!
//! This module provides an in-memory implementation of [`XoClientTrait`] so the
//! session, the instance resolver and the load balancer reconciler can be
//! tested without a running XenOrchestra.
//!
//! Besides storing VMs, the mock counts calls and mutations, injects failures
//! per operation and can delay an operation's answer after its effect has been
//! applied, which is how a platform call that outlives its timeout looks from
//! the caller's side.

mod helpers;

pub use helpers::VmBuilder;

use crate::balancer::BalancerTargetSpec;
use crate::error::XoError;
use crate::models::{PowerState, VmQuery, VmRecord, XoVm};
use crate::xo_trait::XoClientTrait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Operation names accepted by the failure and delay hooks
pub mod ops {
    /// Session probe
    pub const VALIDATE: &str = "validate";
    /// Single VM fetch
    pub const GET_VM: &str = "get_vm";
    /// VM collection query
    pub const QUERY_VMS: &str = "query_vms";
    /// Appliance creation
    pub const CREATE_BALANCER_VM: &str = "create_balancer_vm";
    /// VM start
    pub const START_VM: &str = "start_vm";
    /// VM deletion
    pub const DELETE_VM: &str = "delete_vm";
    /// Tag addition
    pub const ADD_VM_TAG: &str = "add_vm_tag";
    /// Tag removal
    pub const REMOVE_VM_TAG: &str = "remove_vm_tag";
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mock XoClient for testing
#[derive(Clone)]
pub struct MockXoClient {
    pub(crate) base_url: String,
    pub(crate) vms: Arc<Mutex<HashMap<String, VmRecord>>>,
    balancer_pool: String,
    failures: Arc<Mutex<HashMap<&'static str, VecDeque<XoError>>>>,
    delays: Arc<Mutex<HashMap<&'static str, VecDeque<Duration>>>>,
    latency: Arc<Mutex<Duration>>,
    unreachable: Arc<AtomicBool>,
    calls: Arc<Mutex<HashMap<&'static str, usize>>>,
    mutations: Arc<AtomicUsize>,
    creates: Arc<AtomicUsize>,
    next_address: Arc<AtomicU32>,
}

impl MockXoClient {
    /// Create an empty mock platform
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            vms: Arc::new(Mutex::new(HashMap::new())),
            balancer_pool: "pool-lb".to_string(),
            failures: Arc::new(Mutex::new(HashMap::new())),
            delays: Arc::new(Mutex::new(HashMap::new())),
            latency: Arc::new(Mutex::new(Duration::ZERO)),
            unreachable: Arc::new(AtomicBool::new(false)),
            calls: Arc::new(Mutex::new(HashMap::new())),
            mutations: Arc::new(AtomicUsize::new(0)),
            creates: Arc::new(AtomicUsize::new(0)),
            next_address: Arc::new(AtomicU32::new(1)),
        }
    }

    /// Add a VM to the mock store (for test setup)
    pub fn add_vm(&self, vm: VmRecord) {
        lock(&self.vms).insert(vm.id.clone(), vm);
    }

    /// Add a VM from its raw REST form (for test setup)
    pub fn add_raw_vm(&self, vm: XoVm) {
        self.add_vm(vm.into());
    }

    /// Remove a VM behind the provider's back
    pub fn remove_vm(&self, id: &str) -> Option<VmRecord> {
        lock(&self.vms).remove(id)
    }

    /// Change a VM's power state behind the provider's back
    pub fn set_power_state(&self, id: &str, state: PowerState) {
        if let Some(vm) = lock(&self.vms).get_mut(id) {
            vm.power_state = state;
        }
    }

    /// Snapshot of one VM
    pub fn vm(&self, id: &str) -> Option<VmRecord> {
        lock(&self.vms).get(id).cloned()
    }

    /// Snapshot of every VM, sorted by name
    pub fn vms(&self) -> Vec<VmRecord> {
        let mut vms: Vec<VmRecord> = lock(&self.vms).values().cloned().collect();
        vms.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        vms
    }

    /// Make the next call to `op` fail with `error`. Queued errors are
    /// consumed in order.
    pub fn fail_next(&self, op: &'static str, error: XoError) {
        lock(&self.failures).entry(op).or_default().push_back(error);
    }

    /// Delay the next answer of `op` by `delay`, after its effect is applied
    pub fn delay_next(&self, op: &'static str, delay: Duration) {
        lock(&self.delays).entry(op).or_default().push_back(delay);
    }

    /// Delay every call before it runs
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    /// While set, every call fails with a transient network error
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Number of calls made to `op`, failed ones included
    pub fn call_count(&self, op: &str) -> usize {
        lock(&self.calls).get(op).copied().unwrap_or(0)
    }

    /// Number of successful state-changing calls
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Number of balancer VMs created
    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Bookkeeping, latency and failure injection before an operation
    async fn enter(&self, op: &'static str) -> Result<(), XoError> {
        *lock(&self.calls).entry(op).or_insert(0) += 1;

        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if self.unreachable.load(Ordering::SeqCst) {
            return Err(XoError::Transient(format!("{}: connection refused", op)));
        }

        let injected = lock(&self.failures).get_mut(op).and_then(VecDeque::pop_front);
        match injected {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Late answer after the effect was applied
    async fn leave(&self, op: &'static str) {
        let delay = lock(&self.delays).get_mut(op).and_then(VecDeque::pop_front);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn mutated(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }

    fn not_found(id: &str) -> XoError {
        XoError::NotFound(format!("GET /vms/{} - 404 Not Found", id))
    }
}

#[async_trait::async_trait]
impl XoClientTrait for MockXoClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn validate(&self) -> Result<(), XoError> {
        self.enter(ops::VALIDATE).await?;
        self.leave(ops::VALIDATE).await;
        Ok(())
    }

    async fn get_vm(&self, id: &str) -> Result<VmRecord, XoError> {
        self.enter(ops::GET_VM).await?;
        let vm = lock(&self.vms).get(id).cloned();
        self.leave(ops::GET_VM).await;
        vm.ok_or_else(|| Self::not_found(id))
    }

    async fn query_vms(&self, query: &VmQuery) -> Result<Vec<VmRecord>, XoError> {
        self.enter(ops::QUERY_VMS).await?;
        let vms: Vec<VmRecord> = self.vms().into_iter().filter(|vm| query.matches(vm)).collect();
        self.leave(ops::QUERY_VMS).await;
        Ok(vms)
    }

    async fn create_balancer_vm(&self, spec: &BalancerTargetSpec) -> Result<String, XoError> {
        self.enter(ops::CREATE_BALANCER_VM).await?;
        let id = uuid::Uuid::new_v4().to_string();
        let vm = VmRecord {
            id: id.clone(),
            name: spec.name.clone(),
            power_state: PowerState::Halted,
            interfaces: vec![],
            pool_id: self.balancer_pool.clone(),
            host_id: None,
            template: Some("k8s-lb-appliance".to_string()),
            tags: spec.desired_tags().into_iter().collect(),
        };
        lock(&self.vms).insert(id.clone(), vm);
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.mutated();
        self.leave(ops::CREATE_BALANCER_VM).await;
        Ok(id)
    }

    async fn start_vm(&self, id: &str) -> Result<(), XoError> {
        self.enter(ops::START_VM).await?;
        {
            let mut vms = lock(&self.vms);
            let vm = vms.get_mut(id).ok_or_else(|| Self::not_found(id))?;
            vm.power_state = PowerState::Running;
            if vm.interfaces.is_empty() {
                let n = self.next_address.fetch_add(1, Ordering::SeqCst);
                let raw: BTreeMap<String, String> =
                    [("0/ipv4/0".to_string(), format!("10.0.100.{}", n))].into_iter().collect();
                vm.interfaces = VmBuilder::interfaces_from(&raw);
            }
            if vm.host_id.is_none() {
                vm.host_id = Some("host-lb".to_string());
            }
        }
        self.mutated();
        self.leave(ops::START_VM).await;
        Ok(())
    }

    async fn delete_vm(&self, id: &str) -> Result<(), XoError> {
        self.enter(ops::DELETE_VM).await?;
        let removed = lock(&self.vms).remove(id);
        if removed.is_none() {
            return Err(Self::not_found(id));
        }
        self.mutated();
        self.leave(ops::DELETE_VM).await;
        Ok(())
    }

    async fn add_vm_tag(&self, id: &str, tag: &str) -> Result<(), XoError> {
        self.enter(ops::ADD_VM_TAG).await?;
        {
            let mut vms = lock(&self.vms);
            let vm = vms.get_mut(id).ok_or_else(|| Self::not_found(id))?;
            if !vm.tags.iter().any(|t| t == tag) {
                vm.tags.push(tag.to_string());
            }
        }
        self.mutated();
        self.leave(ops::ADD_VM_TAG).await;
        Ok(())
    }

    async fn remove_vm_tag(&self, id: &str, tag: &str) -> Result<(), XoError> {
        self.enter(ops::REMOVE_VM_TAG).await?;
        {
            let mut vms = lock(&self.vms);
            let vm = vms.get_mut(id).ok_or_else(|| Self::not_found(id))?;
            vm.tags.retain(|t| t != tag);
        }
        self.mutated();
        self.leave(ops::REMOVE_VM_TAG).await;
        Ok(())
    }
}
