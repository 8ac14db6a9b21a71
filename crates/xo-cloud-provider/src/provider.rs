//! The provider object held by the host.
//!
//! `XenOrchestra` is built from the cloud-config at registration time and
//! stays inert until `initialize`, which opens the platform session and wires
//! the instance and load balancer engines to it. Only the Instances,
//! InstancesV2 and LoadBalancer slots are served.

use crate::cloudprovider::{
    CloudProvider, CloudResult, Clusters, ControllerClientBuilder, Instances, InstancesV2, LoadBalancer,
    Routes, Zones,
};
use crate::error::ProviderError;
use crate::instances::InstanceResolver;
use crate::loadbalancer::LoadBalancerReconciler;
use crate::loadbalancer::endpoints::{EndpointSource, KubeEndpointSource};
use crate::registry::ProviderRegistry;
use async_trait::async_trait;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use xo_client::{Session, XoConfig};

/// Name the provider registers under
pub const REGISTERED_PROVIDER_NAME: &str = "xenorchestra";

/// Cloud provider ID, also the Provider ID scheme
pub const PROVIDER_NAME: &str = "xenorchestra";

/// User agent for Kubernetes clients built for the provider
pub const CLIENT_NAME: &str = "xo-cloud-controller-manager";

/// Everything `initialize` brings up
#[derive(Debug)]
struct Engines {
    session: Arc<Session>,
    instances: Arc<InstanceResolver>,
    load_balancer: Arc<LoadBalancerReconciler>,
}

/// XenOrchestra cloud provider
#[derive(Debug)]
pub struct XenOrchestra {
    config: XoConfig,
    engines: OnceLock<Engines>,
}

impl XenOrchestra {
    /// Provider for a parsed cloud-config; nothing connects until initialize
    pub fn new(config: XoConfig) -> Self {
        Self {
            config,
            engines: OnceLock::new(),
        }
    }

    /// Parse and validate a cloud-config blob
    pub fn from_config(data: &[u8]) -> Result<Self, ProviderError> {
        Ok(Self::new(XoConfig::from_slice(data)?))
    }

    /// Parsed cloud-config
    pub fn config(&self) -> &XoConfig {
        &self.config
    }

    /// Platform session, once initialized
    pub fn session(&self) -> Option<Arc<Session>> {
        self.engines.get().map(|e| Arc::clone(&e.session))
    }

    /// Load balancer reconciler, once initialized
    pub fn reconciler(&self) -> Option<Arc<LoadBalancerReconciler>> {
        self.engines.get().map(|e| Arc::clone(&e.load_balancer))
    }

    /// Wire the engines to an established session.
    ///
    /// The session is closed once `stop` fires. Attaching a second time keeps
    /// the first session and closes the new one.
    pub fn attach(
        &self,
        session: Session,
        endpoints: Option<Arc<dyn EndpointSource>>,
        stop: CancellationToken,
    ) -> CloudResult<()> {
        let session = Arc::new(session);
        let instances = Arc::new(InstanceResolver::new(
            Arc::clone(&session),
            self.config.dual_stack,
            self.config.instance_cache_ttl(),
        ));
        let load_balancer = Arc::new(LoadBalancerReconciler::new(
            Arc::clone(&session),
            Arc::clone(&instances),
            endpoints,
            self.config.load_balancer.as_ref().map(|lb| lb.name_prefix.as_str()),
        ));

        let engines = Engines {
            session: Arc::clone(&session),
            instances,
            load_balancer,
        };
        if self.engines.set(engines).is_err() {
            warn!("Cloud provider already initialized, dropping the new session");
            session.close();
            return Ok(());
        }

        tokio::spawn(async move {
            stop.cancelled().await;
            info!("Stop signal received, closing XenOrchestra session");
            session.close();
        });
        Ok(())
    }

    fn engines(&self) -> Option<&Engines> {
        self.engines.get()
    }
}

#[async_trait]
impl CloudProvider for XenOrchestra {
    async fn initialize(
        &self,
        client_builder: Arc<dyn ControllerClientBuilder>,
        stop: CancellationToken,
    ) -> CloudResult<()> {
        if self.engines.get().is_some() {
            warn!("Cloud provider already initialized");
            return Ok(());
        }

        info!("Connecting to XenOrchestra at {}", self.config.url);
        let session = Session::connect(&self.config, stop.child_token()).await?;
        info!("Connected to XenOrchestra at {}", session.base_url());

        let endpoints: Option<Arc<dyn EndpointSource>> = match client_builder.client(CLIENT_NAME).await {
            Ok(client) => Some(Arc::new(KubeEndpointSource::new(client))),
            Err(e) => {
                warn!(
                    "No Kubernetes client for endpoint lookups, load balancers will use every candidate node: {}",
                    e
                );
                None
            }
        };

        self.attach(session, endpoints, stop)
    }

    fn load_balancer(&self) -> Option<Arc<dyn LoadBalancer>> {
        self.engines()
            .map(|e| Arc::clone(&e.load_balancer) as Arc<dyn LoadBalancer>)
    }

    fn instances(&self) -> Option<Arc<dyn Instances>> {
        self.engines()
            .map(|e| Arc::clone(&e.instances) as Arc<dyn Instances>)
    }

    fn instances_v2(&self) -> Option<Arc<dyn InstancesV2>> {
        self.engines()
            .map(|e| Arc::clone(&e.instances) as Arc<dyn InstancesV2>)
    }

    fn zones(&self) -> Option<Arc<dyn Zones>> {
        None
    }

    fn clusters(&self) -> Option<Arc<dyn Clusters>> {
        None
    }

    fn routes(&self) -> Option<Arc<dyn Routes>> {
        None
    }

    fn provider_name(&self) -> &str {
        PROVIDER_NAME
    }

    fn has_cluster_id(&self) -> bool {
        self.config
            .cluster_id
            .as_deref()
            .is_some_and(|id| !id.is_empty())
    }
}

/// Register the XenOrchestra factory with the host's registry
pub fn register(registry: &mut ProviderRegistry) {
    registry.register(
        REGISTERED_PROVIDER_NAME,
        Box::new(|data: &[u8]| {
            let provider = XenOrchestra::from_config(data)?;
            Ok(Arc::new(provider) as Arc<dyn CloudProvider>)
        }),
    );
}
