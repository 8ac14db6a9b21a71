//! Provider IDs: `xenorchestra://<vm-uuid>`

use crate::error::ProviderError;

/// Scheme used for constructing Provider IDs
pub const PROVIDER_ID_SCHEME: &str = "xenorchestra://";

/// Provider ID of a VM
pub fn format_provider_id(vm_id: &str) -> String {
    format!("{}{}", PROVIDER_ID_SCHEME, vm_id)
}

/// Extract the VM UUID from a Provider ID.
///
/// Extra slashes after the scheme (`xenorchestra:///<uuid>`) are tolerated.
pub fn parse_provider_id(provider_id: &str) -> Result<String, ProviderError> {
    let rest = provider_id
        .trim()
        .strip_prefix(PROVIDER_ID_SCHEME)
        .ok_or_else(|| ProviderError::InvalidProviderId(format!("{:?} does not start with {}", provider_id, PROVIDER_ID_SCHEME)))?;

    let raw = rest.trim_start_matches('/');
    uuid::Uuid::parse_str(raw)
        .map(|u| u.hyphenated().to_string())
        .map_err(|e| ProviderError::InvalidProviderId(format!("{:?}: {}", provider_id, e)))
}
