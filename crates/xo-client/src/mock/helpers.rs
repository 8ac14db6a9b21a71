//! Helpers for building VM records in tests

use crate::models::{NetworkInterface, PowerState, VmRecord, parse_addresses};
use std::collections::BTreeMap;

/// Builder for [`VmRecord`] test fixtures.
///
/// Addresses are given in the REST key format (`<device>/<ipv4|ipv6>/<index>`)
/// and go through the same parsing as real API answers.
#[derive(Debug, Clone)]
pub struct VmBuilder {
    id: String,
    name: String,
    power_state: PowerState,
    addresses: BTreeMap<String, String>,
    pool_id: String,
    host_id: Option<String>,
    template: Option<String>,
    tags: Vec<String>,
}

impl VmBuilder {
    /// A running VM in `pool-1` on `host-1`
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            power_state: PowerState::Running,
            addresses: BTreeMap::new(),
            pool_id: "pool-1".to_string(),
            host_id: Some("host-1".to_string()),
            template: None,
            tags: vec![],
        }
    }

    /// Set the power state
    pub fn power_state(mut self, state: PowerState) -> Self {
        self.power_state = state;
        self
    }

    /// Halted and not resident on any host
    pub fn halted(self) -> Self {
        self.power_state(PowerState::Halted).host(None)
    }

    /// Add an address under an XO key such as `0/ipv4/0`
    pub fn address(mut self, key: &str, ip: &str) -> Self {
        self.addresses.insert(key.to_string(), ip.to_string());
        self
    }

    /// Set the owning pool
    pub fn pool(mut self, pool: &str) -> Self {
        self.pool_id = pool.to_string();
        self
    }

    /// Set (or clear) the resident host
    pub fn host(mut self, host: Option<&str>) -> Self {
        self.host_id = host.map(str::to_string);
        self
    }

    /// Set the template name
    pub fn template(mut self, template: &str) -> Self {
        self.template = Some(template.to_string());
        self
    }

    /// Add a tag
    pub fn tag(mut self, tag: &str) -> Self {
        self.tags.push(tag.to_string());
        self
    }

    /// Finish the record
    pub fn build(self) -> VmRecord {
        VmRecord {
            interfaces: Self::interfaces_from(&self.addresses),
            id: self.id,
            name: self.name,
            power_state: self.power_state,
            pool_id: self.pool_id,
            host_id: self.host_id,
            template: self.template,
            tags: self.tags,
        }
    }

    pub(crate) fn interfaces_from(raw: &BTreeMap<String, String>) -> Vec<NetworkInterface> {
        parse_addresses(raw)
    }
}
