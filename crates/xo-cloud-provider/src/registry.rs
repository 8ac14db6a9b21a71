//! Provider registration.
//!
//! Providers register a factory under a name at process start; the host picks
//! one by name and hands it the cloud-config stream.

use crate::cloudprovider::CloudProvider;
use crate::error::ProviderError;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use tracing::{info, warn};

/// Builds a provider from the raw cloud-config contents
pub type ProviderFactory =
    Box<dyn Fn(&[u8]) -> Result<Arc<dyn CloudProvider>, ProviderError> + Send + Sync>;

/// Name -> factory table
#[derive(Default)]
pub struct ProviderRegistry {
    factories: HashMap<String, ProviderFactory>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("ProviderRegistry").field("providers", &names).finish()
    }
}

impl ProviderRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. A second registration under the same name replaces
    /// the first.
    pub fn register(&mut self, name: &str, factory: ProviderFactory) {
        if self.factories.insert(name.to_string(), factory).is_some() {
            warn!("Cloud provider {:?} was registered twice", name);
        } else {
            info!("Registered cloud provider {:?}", name);
        }
    }

    /// Is a factory registered under `name`
    pub fn is_registered(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Read the whole config stream and build the named provider.
    ///
    /// Any error is fatal for the host.
    pub fn init_cloud_provider(
        &self,
        name: &str,
        mut config: impl Read,
    ) -> Result<Arc<dyn CloudProvider>, ProviderError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| ProviderError::UnknownProvider(name.to_string()))?;

        let mut data = Vec::new();
        config.read_to_end(&mut data)?;
        factory(&data)
    }
}
