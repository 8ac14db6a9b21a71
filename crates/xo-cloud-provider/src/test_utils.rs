//! Test utilities for the instance and load balancer engines
//!
//! Builders for Nodes and Services plus a connected session over the
//! in-memory XenOrchestra mock.

use crate::cloudprovider::{CloudResult, ControllerClientBuilder};
use crate::error::ProviderError;
use crate::loadbalancer::endpoints::EndpointSource;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, NodeSpec, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use xo_client::{MockXoClient, ReconnectPolicy, Session, SessionSettings, XoError};

pub const UUID_A: &str = "8d2c1f7e-5f0a-4a8e-9b3c-0e6f7a1b200a";
pub const UUID_B: &str = "8d2c1f7e-5f0a-4a8e-9b3c-0e6f7a1b200b";
pub const UUID_C: &str = "8d2c1f7e-5f0a-4a8e-9b3c-0e6f7a1b200c";

/// Fast retries so transient paths finish quickly
pub fn test_settings() -> SessionSettings {
    SessionSettings {
        request_timeout: Duration::from_secs(2),
        max_retries: 2,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        reconnect_policy: ReconnectPolicy::FailFast,
    }
}

/// Session over `mock`, already established
pub async fn connected_session(mock: &MockXoClient, settings: SessionSettings) -> Arc<Session> {
    let session = Session::new(Arc::new(mock.clone()), settings, CancellationToken::new());
    session
        .establish()
        .await
        .expect("mock accepts any credentials");
    Arc::new(session)
}

/// Node, optionally carrying a Provider ID
pub fn create_test_node(name: &str, provider_id: Option<&str>) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            provider_id: provider_id.map(str::to_string),
            ..Default::default()
        }),
        status: None,
    }
}

/// `type: LoadBalancer` Service with `(port, nodePort)` TCP listeners
pub fn create_test_service(namespace: &str, name: &str, uid: &str, ports: &[(i32, i32)]) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(uid.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            ports: Some(
                ports
                    .iter()
                    .map(|(port, node_port)| ServicePort {
                        port: *port,
                        node_port: Some(*node_port),
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        status: None,
    }
}

/// Endpoint placement set by the test
#[derive(Debug, Default)]
pub struct StaticEndpoints {
    ready: Mutex<Option<BTreeSet<String>>>,
}

impl StaticEndpoints {
    pub fn new(nodes: &[&str]) -> Arc<Self> {
        let endpoints = Arc::new(Self::default());
        endpoints.set(nodes);
        endpoints
    }

    pub fn set(&self, nodes: &[&str]) {
        *self.ready.lock().unwrap() = Some(nodes.iter().map(|n| n.to_string()).collect());
    }
}

#[async_trait]
impl EndpointSource for StaticEndpoints {
    async fn ready_node_names(&self, _service: &Service) -> Result<Option<BTreeSet<String>>, ProviderError> {
        Ok(self.ready.lock().unwrap().clone())
    }
}

/// Client builder for hosts without API server access
#[derive(Debug)]
pub struct NoClientBuilder;

#[async_trait]
impl ControllerClientBuilder for NoClientBuilder {
    async fn client(&self, name: &str) -> CloudResult<kube::Client> {
        Err(ProviderError::Xo(XoError::InvalidConfig(format!(
            "no Kubernetes client available for {}",
            name
        ))))
    }
}
