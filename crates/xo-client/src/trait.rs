//! XoClient trait for mocking
//!
//! This trait abstracts the XenOrchestra transport so the session and the
//! provider can be exercised against an in-memory platform in unit tests.

use crate::balancer::BalancerTargetSpec;
use crate::error::XoError;
use crate::models::{VmQuery, VmRecord};

/// Trait for XenOrchestra transport operations
///
/// Each method is one platform round trip (or a short fixed sequence of them).
/// Retries, timeouts and reconnection are layered on top by
/// [`Session`](crate::session::Session).
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait XoClientTrait: Send + Sync {
    /// Get the base URL
    fn base_url(&self) -> &str;

    /// Check credentials and API availability
    async fn validate(&self) -> Result<(), XoError>;

    /// Fetch one VM by UUID
    async fn get_vm(&self, id: &str) -> Result<VmRecord, XoError>;

    /// List VMs matching a query
    async fn query_vms(&self, query: &VmQuery) -> Result<Vec<VmRecord>, XoError>;

    /// Create the appliance VM for a balancer target and tag it.
    ///
    /// Returns the UUID of the new VM.
    async fn create_balancer_vm(&self, spec: &BalancerTargetSpec) -> Result<String, XoError>;

    /// Start a halted VM
    async fn start_vm(&self, id: &str) -> Result<(), XoError>;

    /// Delete a VM and its disks
    async fn delete_vm(&self, id: &str) -> Result<(), XoError>;

    /// Add a tag to a VM
    async fn add_vm_tag(&self, id: &str, tag: &str) -> Result<(), XoError>;

    /// Remove a tag from a VM
    async fn remove_vm_tag(&self, id: &str, tag: &str) -> Result<(), XoError>;
}
