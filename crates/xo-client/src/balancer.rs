//! Balancer targets
//!
//! A balancer target is a dedicated appliance VM. Its name identifies the
//! Service it serves; its listeners and backend VMs live in XO tags on the VM
//! so the appliance and the reconciler share one source of truth.

use crate::error::XoError;
use crate::models::{PowerState, VmRecord};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Prefix of every tag the provider manages
pub const TAG_PREFIX: &str = "xo-ccm/";
const SERVICE_TAG: &str = "xo-ccm/service=";
const BACKEND_TAG: &str = "xo-ccm/backend=";
const PORT_TAG: &str = "xo-ccm/port=";

/// Transport protocol of a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    /// TCP
    Tcp,
    /// UDP
    Udp,
    /// SCTP
    Sctp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Sctp => "SCTP",
        };
        f.write_str(s)
    }
}

impl FromStr for Protocol {
    type Err = XoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TCP" => Ok(Protocol::Tcp),
            "UDP" => Ok(Protocol::Udp),
            "SCTP" => Ok(Protocol::Sctp),
            other => Err(XoError::InvalidRequest(format!("unsupported protocol {}", other))),
        }
    }
}

/// One listener: traffic on `port` is forwarded to `node_port` on every backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BalancerPort {
    /// Listener protocol
    pub protocol: Protocol,
    /// Port clients connect to
    pub port: u16,
    /// NodePort traffic is forwarded to
    pub node_port: u16,
}

impl BalancerPort {
    fn tag(&self) -> String {
        format!("{}{}/{}/{}", PORT_TAG, self.protocol, self.port, self.node_port)
    }

    fn parse_tag(tag: &str) -> Option<Self> {
        let rest = tag.strip_prefix(PORT_TAG)?;
        let mut parts = rest.split('/');
        let protocol = parts.next()?.parse().ok()?;
        let port = parts.next()?.parse().ok()?;
        let node_port = parts.next()?.parse().ok()?;
        Some(Self {
            protocol,
            port,
            node_port,
        })
    }
}

/// Desired state of a balancer target
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BalancerTargetSpec {
    /// Appliance VM name, unique per Service
    pub name: String,
    /// UID of the Service the target serves
    pub service_uid: String,
    /// Listeners
    pub ports: BTreeSet<BalancerPort>,
    /// Backend VM UUIDs
    pub backends: BTreeSet<String>,
}

impl BalancerTargetSpec {
    /// Every managed tag the appliance VM should carry
    pub fn desired_tags(&self) -> BTreeSet<String> {
        let mut tags = BTreeSet::new();
        tags.insert(format!("{}{}", SERVICE_TAG, self.service_uid));
        tags.extend(self.ports.iter().map(BalancerPort::tag));
        tags.extend(self.backends.iter().map(|b| format!("{}{}", BACKEND_TAG, b)));
        tags
    }
}

/// Observed state of a balancer target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalancerTarget {
    /// Appliance VM UUID
    pub id: String,
    /// Appliance VM name
    pub name: String,
    /// UID from the service tag, if any
    pub service_uid: Option<String>,
    /// Listeners from the port tags
    pub ports: BTreeSet<BalancerPort>,
    /// Backend VM UUIDs from the backend tags
    pub backends: BTreeSet<String>,
    /// Ingress addresses, internal first
    pub ingress: Vec<IpAddr>,
    /// Power state of the appliance
    pub power_state: PowerState,
    tags: BTreeSet<String>,
}

impl BalancerTarget {
    /// Managed tags currently on the appliance
    pub fn managed_tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    /// Minimal set of changes to converge onto `spec`.
    ///
    /// Only a halted appliance is started: a paused or suspended one needs an
    /// unpause or resume, see [`BalancerTarget::check_startable`].
    pub fn plan(&self, spec: &BalancerTargetSpec) -> TargetUpdate {
        let desired = spec.desired_tags();
        TargetUpdate {
            add_tags: desired.difference(&self.tags).cloned().collect(),
            remove_tags: self.tags.difference(&desired).cloned().collect(),
            start: self.power_state == PowerState::Halted,
        }
    }

    /// `Conflict` when the appliance is in a state `start` cannot leave
    pub fn check_startable(&self) -> Result<(), XoError> {
        match self.power_state {
            PowerState::Running | PowerState::Halted => Ok(()),
            state => Err(XoError::Conflict(format!(
                "balancer VM {} ({}) is {:?}, it must be resumed or halted before it can serve",
                self.name, self.id, state
            ))),
        }
    }
}

impl From<VmRecord> for BalancerTarget {
    fn from(vm: VmRecord) -> Self {
        let tags: BTreeSet<String> = vm
            .tags
            .iter()
            .filter(|t| t.starts_with(TAG_PREFIX))
            .cloned()
            .collect();
        let service_uid = tags
            .iter()
            .find_map(|t| t.strip_prefix(SERVICE_TAG))
            .map(str::to_string);
        let backends = tags
            .iter()
            .filter_map(|t| t.strip_prefix(BACKEND_TAG))
            .map(str::to_string)
            .collect();
        let ports = tags.iter().filter_map(|t| BalancerPort::parse_tag(t)).collect();
        let ingress = vm.ordered_addresses().into_iter().map(|a| a.ip).collect();

        Self {
            id: vm.id,
            name: vm.name,
            service_uid,
            ports,
            backends,
            ingress,
            power_state: vm.power_state,
            tags,
        }
    }
}

/// Tag changes (and a possible start) needed to converge a target
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetUpdate {
    /// Managed tags to add
    pub add_tags: Vec<String>,
    /// Managed tags to remove
    pub remove_tags: Vec<String>,
    /// Start the halted appliance
    pub start: bool,
}

impl TargetUpdate {
    /// Nothing to do
    pub fn is_empty(&self) -> bool {
        self.add_tags.is_empty() && self.remove_tags.is_empty() && !self.start
    }
}
