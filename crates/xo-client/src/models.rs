//! XenOrchestra API models
//!
//! `XoVm` matches the VM object served by `/rest/v0/vms`. `VmRecord` is the
//! normalized view the rest of the provider works with.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Fields requested when listing VMs
pub const VM_FIELDS: &str = "id,uuid,name_label,power_state,addresses,$pool,$container,other,tags";

/// VM power state as reported by XAPI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    /// Running
    Running,
    /// Halted
    Halted,
    /// Paused
    Paused,
    /// Suspended
    Suspended,
    /// Any state this client does not know
    #[serde(other)]
    Unknown,
}

/// VM object as returned by the REST API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XoVm {
    /// Object id (the VM UUID)
    pub id: String,
    /// VM UUID, when reported separately
    #[serde(default)]
    pub uuid: Option<String>,
    /// Display name
    pub name_label: String,
    /// Power state
    pub power_state: PowerState,
    /// Guest-reported addresses keyed `<device>/<ipv4|ipv6>/<index>`
    #[serde(default)]
    pub addresses: BTreeMap<String, String>,
    /// Owning pool
    #[serde(rename = "$pool")]
    pub pool: String,
    /// Host the VM is resident on while running, its pool otherwise
    #[serde(rename = "$container", default)]
    pub container: Option<String>,
    /// Free-form metadata such as the base template name
    #[serde(default)]
    pub other: BTreeMap<String, String>,
    /// XO tags
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Whether an address is reachable from inside the cluster network only
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AddressScope {
    /// Private, shared or link-local
    Internal,
    /// Publicly routable
    External,
}

/// One address assigned to a VIF
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceAddress {
    /// Address
    pub ip: IpAddr,
    /// Internal or external
    pub scope: AddressScope,
}

/// A VM network interface, in platform creation order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    /// VIF device index
    pub device: u32,
    /// Addresses in reporting order
    pub addresses: Vec<InterfaceAddress>,
}

/// Normalized VM facts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRecord {
    /// VM UUID
    pub id: String,
    /// Display name
    pub name: String,
    /// Power state
    pub power_state: PowerState,
    /// Sorted by device index
    pub interfaces: Vec<NetworkInterface>,
    /// Owning pool
    pub pool_id: String,
    /// `None` when the VM is not resident on any host
    pub host_id: Option<String>,
    /// Name of the template the VM was created from
    pub template: Option<String>,
    /// XO tags
    pub tags: Vec<String>,
}

impl VmRecord {
    /// True while the VM is running
    pub fn is_running(&self) -> bool {
        self.power_state == PowerState::Running
    }

    /// Exact (case-sensitive) name match
    pub fn is_named(&self, name: &str) -> bool {
        self.name == name
    }

    /// All addresses, internal ones first, each group in interface creation order
    pub fn ordered_addresses(&self) -> Vec<InterfaceAddress> {
        let all = self.interfaces.iter().flat_map(|i| i.addresses.iter().copied());
        let (mut internal, external): (Vec<_>, Vec<_>) =
            all.partition(|a| a.scope == AddressScope::Internal);
        internal.extend(external);
        internal
    }
}

impl From<XoVm> for VmRecord {
    fn from(vm: XoVm) -> Self {
        let host_id = vm.container.filter(|c| *c != vm.pool);
        let template = vm
            .other
            .get("base_template_name")
            .filter(|t| !t.is_empty())
            .cloned();

        Self {
            id: vm.uuid.unwrap_or(vm.id),
            name: vm.name_label,
            power_state: vm.power_state,
            interfaces: parse_addresses(&vm.addresses),
            pool_id: vm.pool,
            host_id,
            template,
            tags: vm.tags,
        }
    }
}

/// Group `<device>/<family>/<index>` entries into interfaces.
///
/// Keys that do not parse and link-local or loopback addresses are dropped.
pub(crate) fn parse_addresses(raw: &BTreeMap<String, String>) -> Vec<NetworkInterface> {
    let mut entries: Vec<(u32, u8, u32, IpAddr)> = raw
        .iter()
        .filter_map(|(key, value)| {
            let mut parts = key.split('/');
            let device = parts.next()?.parse::<u32>().ok()?;
            let family = match parts.next()? {
                "ipv4" => 4,
                "ipv6" => 6,
                _ => return None,
            };
            let index = parts.next()?.parse::<u32>().ok()?;
            let ip = value.parse::<IpAddr>().ok()?;
            Some((device, family, index, ip))
        })
        .collect();
    entries.sort_by_key(|(device, family, index, _)| (*device, *family, *index));

    let mut interfaces: Vec<NetworkInterface> = Vec::new();
    for (device, _, _, ip) in entries {
        let Some(scope) = classify(&ip) else {
            continue;
        };
        match interfaces.last_mut() {
            Some(last) if last.device == device => {
                last.addresses.push(InterfaceAddress { ip, scope });
            }
            _ => interfaces.push(NetworkInterface {
                device,
                addresses: vec![InterfaceAddress { ip, scope }],
            }),
        }
    }
    interfaces
}

/// Private and unique-local ranges are internal, globally routable ones external
fn classify(ip: &IpAddr) -> Option<AddressScope> {
    match ip {
        IpAddr::V4(v4) => {
            if v4.is_loopback() || v4.is_link_local() || v4.is_unspecified() {
                None
            } else if v4.is_private() || is_shared_v4(v4.octets()) {
                Some(AddressScope::Internal)
            } else {
                Some(AddressScope::External)
            }
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            if v6.is_loopback() || v6.is_unspecified() || (first & 0xffc0) == 0xfe80 {
                None
            } else if (first & 0xfe00) == 0xfc00 {
                Some(AddressScope::Internal)
            } else {
                Some(AddressScope::External)
            }
        }
    }
}

// 100.64.0.0/10 (carrier-grade NAT)
fn is_shared_v4(octets: [u8; 4]) -> bool {
    octets[0] == 100 && (octets[1] & 0xc0) == 64
}

/// Filter for VM listings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmQuery {
    /// Name filter
    pub name: Option<String>,
    /// Pool filter
    pub pool: Option<String>,
    /// Tag filter
    pub tag: Option<String>,
}

impl VmQuery {
    /// Query VMs by name.
    ///
    /// XenOrchestra matches the name as a case-insensitive substring, so
    /// callers wanting one VM filter the result with [`VmRecord::is_named`].
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Match VMs in one pool (or all of them)
    pub fn in_pool(pool: Option<&str>) -> Self {
        Self {
            pool: pool.map(str::to_string),
            ..Default::default()
        }
    }

    /// Does a VM satisfy every set criterion, as the server's filter would
    pub fn matches(&self, vm: &VmRecord) -> bool {
        self.name
            .as_deref()
            .is_none_or(|n| vm.name.to_lowercase().contains(&n.to_lowercase()))
            && self.pool.as_deref().is_none_or(|p| vm.pool_id == p)
            && self.tag.as_deref().is_none_or(|t| vm.tags.iter().any(|x| x == t))
    }
}
