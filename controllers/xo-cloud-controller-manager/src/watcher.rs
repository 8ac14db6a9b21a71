//! Service watcher.
//!
//! Drives the provider's LoadBalancer capability from `kube_runtime::Controller`:
//! every `type: LoadBalancer` Service gets a cleanup finalizer, a balancer and
//! its ingress in `status.loadBalancer`. Terminal provisioning failures are
//! written as a Service condition instead of being retried in a tight loop.

use crate::error::ControllerError;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, Service};
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use kube_runtime::{Controller, controller::Action, watcher};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use xo_cloud_provider::LoadBalancer;

/// Finalizer kept on LoadBalancer Services until their balancer is gone
pub const LOAD_BALANCER_CLEANUP_FINALIZER: &str = "service.kubernetes.io/load-balancer-cleanup";

/// Nodes with this label never receive balancer traffic
pub const EXCLUDE_FROM_LB_LABEL: &str = "node.kubernetes.io/exclude-from-external-load-balancers";

/// Service condition reporting terminal provisioning failures
pub const LB_PROVISIONED_CONDITION: &str = "xenorchestra.vates.tech/LoadBalancerProvisioned";

const FIELD_MANAGER: &str = "xo-cloud-controller-manager";
const TERMINAL_REQUEUE: Duration = Duration::from_secs(300);

/// Shared state of the Service reconcile loop
pub struct ServiceContext {
    pub client: Client,
    pub load_balancer: Arc<dyn LoadBalancer>,
    pub cluster_name: String,
    /// Period of the membership refresh for converged Services
    pub resync: Duration,
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("cluster_name", &self.cluster_name)
            .field("resync", &self.resync)
            .finish_non_exhaustive()
    }
}

/// True for Services that should have a balancer
pub fn wants_load_balancer(service: &Service) -> bool {
    service.metadata.deletion_timestamp.is_none()
        && service
            .spec
            .as_ref()
            .and_then(|s| s.type_.as_deref())
            == Some("LoadBalancer")
}

fn has_finalizer(service: &Service) -> bool {
    service
        .finalizers()
        .iter()
        .any(|f| f == LOAD_BALANCER_CLEANUP_FINALIZER)
}

fn is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Nodes that may carry balancer traffic: ready and not opted out
pub fn eligible_nodes(nodes: Vec<Node>) -> Vec<Node> {
    nodes
        .into_iter()
        .filter(|n| !n.labels().contains_key(EXCLUDE_FROM_LB_LABEL))
        .filter(is_ready)
        .collect()
}

/// Service conditions with ours replaced by `condition` (or dropped)
pub fn conditions_with(service: &Service, condition: Option<Value>) -> Vec<Value> {
    let mut conditions: Vec<Value> = service
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .into_iter()
        .flatten()
        .filter(|c| c.type_ != LB_PROVISIONED_CONDITION)
        .filter_map(|c| serde_json::to_value(c).ok())
        .collect();
    conditions.extend(condition);
    conditions
}

fn patch_params() -> PatchParams {
    PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

fn failure_condition(service: &Service, message: &str) -> Value {
    json!({
        "type": LB_PROVISIONED_CONDITION,
        "status": "False",
        "reason": "ProvisioningFailed",
        "message": message,
        "observedGeneration": service.metadata.generation.unwrap_or_default(),
        "lastTransitionTime": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    })
}

async fn set_finalizers(api: &Api<Service>, service: &Service, finalizers: Vec<String>) -> Result<(), ControllerError> {
    let patch = json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": service.resource_version(),
        }
    });
    api.patch(&service.name_any(), &patch_params(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

async fn add_finalizer(api: &Api<Service>, service: &Service) -> Result<(), ControllerError> {
    let mut finalizers = service.finalizers().to_vec();
    finalizers.push(LOAD_BALANCER_CLEANUP_FINALIZER.to_string());
    set_finalizers(api, service, finalizers).await
}

async fn remove_finalizer(api: &Api<Service>, service: &Service) -> Result<(), ControllerError> {
    let finalizers = service
        .finalizers()
        .iter()
        .filter(|f| *f != LOAD_BALANCER_CLEANUP_FINALIZER)
        .cloned()
        .collect();
    set_finalizers(api, service, finalizers).await
}

async fn patch_status(api: &Api<Service>, service: &Service, status: Value) -> Result<(), ControllerError> {
    api.patch_status(
        &service.name_any(),
        &patch_params(),
        &Patch::Merge(&json!({ "status": status })),
    )
    .await?;
    Ok(())
}

/// Tear the balancer down and release the Service
async fn cleanup(service: &Service, api: &Api<Service>, ctx: &ServiceContext) -> Result<Action, ControllerError> {
    ctx.load_balancer
        .ensure_load_balancer_deleted(&ctx.cluster_name, service)
        .await?;
    info!(
        "Load balancer of Service {}/{} deleted",
        service.namespace().unwrap_or_default(),
        service.name_any()
    );

    if service.metadata.deletion_timestamp.is_none() {
        // Type changed away from LoadBalancer: the Service lives on without ingress
        patch_status(
            api,
            service,
            json!({ "loadBalancer": { "ingress": null }, "conditions": conditions_with(service, None) }),
        )
        .await?;
    }
    remove_finalizer(api, service).await?;
    Ok(Action::await_change())
}

/// Reconcile one Service
pub async fn reconcile_service(service: Arc<Service>, ctx: Arc<ServiceContext>) -> Result<Action, ControllerError> {
    let namespace = service.namespace().unwrap_or_default();
    let name = service.name_any();
    let api: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);

    if !wants_load_balancer(&service) {
        if has_finalizer(&service) {
            return cleanup(&service, &api, &ctx).await;
        }
        return Ok(Action::await_change());
    }

    if !has_finalizer(&service) {
        // The finalizer patch triggers the next pass
        add_finalizer(&api, &service).await?;
        return Ok(Action::await_change());
    }

    let nodes = Api::<Node>::all(ctx.client.clone())
        .list(&ListParams::default())
        .await?;
    let nodes = eligible_nodes(nodes.items);
    debug!("Service {}/{}: {} eligible node(s)", namespace, name, nodes.len());

    match ctx
        .load_balancer
        .ensure_load_balancer(&ctx.cluster_name, &service, &nodes)
        .await
    {
        Ok(status) => {
            let observed = service.status.as_ref().and_then(|s| s.load_balancer.as_ref());
            let failed_before = service
                .status
                .as_ref()
                .and_then(|s| s.conditions.as_ref())
                .is_some_and(|c| c.iter().any(|c| c.type_ == LB_PROVISIONED_CONDITION));
            if observed != Some(&status) || failed_before {
                patch_status(
                    &api,
                    &service,
                    json!({ "loadBalancer": status, "conditions": conditions_with(&service, None) }),
                )
                .await?;
                info!("Service {}/{} load balancer status updated", namespace, name);
            }
            Ok(Action::requeue(ctx.resync))
        }
        Err(e) if e.is_terminal() => {
            warn!("Load balancer for Service {}/{} cannot be provisioned: {}", namespace, name, e);
            let condition = failure_condition(&service, &e.to_string());
            patch_status(
                &api,
                &service,
                json!({ "conditions": conditions_with(&service, Some(condition)) }),
            )
            .await?;
            Ok(Action::requeue(TERMINAL_REQUEUE))
        }
        Err(e) => Err(e.into()),
    }
}

/// Requeue policy for failed passes
pub fn error_policy(service: Arc<Service>, error: &ControllerError, _ctx: Arc<ServiceContext>) -> Action {
    let delay = if error.is_transient() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    };
    error!(
        "Reconciliation error for Service {}/{}: {} (retrying in {:?})",
        service.namespace().unwrap_or_default(),
        service.name_any(),
        error,
        delay
    );
    Action::requeue(delay)
}

/// Watch all Services until the stream ends
pub async fn watch_services(ctx: Arc<ServiceContext>) -> Result<(), ControllerError> {
    info!("Starting Service watcher");
    let api: Api<Service> = Api::all(ctx.client.clone());

    Controller::new(api, watcher::Config::default())
        .run(reconcile_service, error_policy, ctx)
        .for_each(|res| async move {
            if let Err(e) = res {
                debug!("Service controller event error: {}", e);
            }
        })
        .await;

    Ok(())
}
