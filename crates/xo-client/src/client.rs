//! XenOrchestra REST API client
//!
//! Implements the XenOrchestra REST API (`/rest/v0`) transport.
//! VM objects come from `/rest/v0/vms`, appliance creation goes through the
//! pool `create_vm` action and tags are managed with `PUT`/`DELETE` on
//! `/rest/v0/vms/<id>/tags/<tag>`.

use crate::balancer::BalancerTargetSpec;
use crate::common::HttpClient;
use crate::common::query::{collection_path, vm_filter};
use crate::config::{LoadBalancerConfig, XoConfig};
use crate::error::XoError;
use crate::models::{VM_FIELDS, VmQuery, VmRecord, XoVm};
use crate::xo_trait::XoClientTrait;
use tracing::{debug, info};

/// XenOrchestra API client
#[derive(Debug, Clone)]
pub struct XoClient {
    http: HttpClient,
    load_balancer: Option<LoadBalancerConfig>,
}

impl XoClient {
    /// Create a new XenOrchestra client.
    ///
    /// No request is sent; use [`XoClientTrait::validate`] to check the
    /// credentials.
    pub fn new(config: &XoConfig) -> Result<Self, XoError> {
        Ok(Self {
            http: HttpClient::from_config(config)?,
            load_balancer: config.load_balancer.clone(),
        })
    }

    fn vm_path(id: &str) -> String {
        format!("/vms/{}", urlencoding::encode(id))
    }

    fn tag_path(id: &str, tag: &str) -> String {
        format!("{}/tags/{}", Self::vm_path(id), urlencoding::encode(tag))
    }

    /// Pull the new object id out of an action answer
    fn created_id(answer: &serde_json::Value) -> Option<String> {
        let raw = match answer {
            serde_json::Value::String(s) => s.as_str(),
            serde_json::Value::Object(map) => map.get("id").and_then(|v| v.as_str())?,
            _ => return None,
        };
        let id = raw.trim().trim_matches('"');
        let id = id.rsplit('/').next().unwrap_or(id);
        (!id.is_empty()).then(|| id.to_string())
    }
}

#[async_trait::async_trait]
impl XoClientTrait for XoClient {
    fn base_url(&self) -> &str {
        self.http.base_url()
    }

    async fn validate(&self) -> Result<(), XoError> {
        debug!("Validating XenOrchestra credentials and API availability");
        let path = collection_path("pools", "id", "");
        match self.http.get::<Vec<serde_json::Value>>(&path).await {
            Ok(_) => Ok(()),
            Err(XoError::NotFound(m)) => Err(XoError::Unsupported(format!(
                "REST API v0 is not available at {}: {}",
                self.http.base_url(),
                m
            ))),
            Err(e) => Err(e),
        }
    }

    async fn get_vm(&self, id: &str) -> Result<VmRecord, XoError> {
        debug!("Fetching VM {} from XenOrchestra", id);
        let vm: XoVm = self.http.get(&Self::vm_path(id)).await?;
        Ok(vm.into())
    }

    async fn query_vms(&self, query: &VmQuery) -> Result<Vec<VmRecord>, XoError> {
        let path = collection_path("vms", VM_FIELDS, &vm_filter(query));
        let vms: Vec<XoVm> = self.http.get(&path).await?;
        debug!("Query {:?} matched {} VMs", query, vms.len());
        Ok(vms.into_iter().map(VmRecord::from).collect())
    }

    async fn create_balancer_vm(&self, spec: &BalancerTargetSpec) -> Result<String, XoError> {
        let lb = self.load_balancer.as_ref().ok_or_else(|| {
            XoError::Provisioning(
                "no load balancer template configured (loadBalancer.template)".to_string(),
            )
        })?;

        let mut body = serde_json::json!({
            "name_label": spec.name,
            "name_description": format!("Load balancer for Kubernetes Service {}", spec.service_uid),
            "template": lb.template,
            "boot": false,
        });
        if let Some(network) = &lb.network {
            body["vifs"] = serde_json::json!([{ "network": network }]);
        }

        let path = format!(
            "/pools/{}/actions/create_vm?sync=true",
            urlencoding::encode(&lb.pool)
        );
        let answer = self.http.post(&path, &body).await?;
        let id = Self::created_id(&answer).ok_or_else(|| {
            XoError::Api(format!("create_vm returned no VM id: {}", answer))
        })?;
        info!("Created load balancer VM {} ({})", spec.name, id);

        for tag in spec.desired_tags() {
            self.add_vm_tag(&id, &tag).await?;
        }
        Ok(id)
    }

    async fn start_vm(&self, id: &str) -> Result<(), XoError> {
        let path = format!("{}/actions/start?sync=true", Self::vm_path(id));
        self.http.post(&path, &serde_json::json!({})).await?;
        Ok(())
    }

    async fn delete_vm(&self, id: &str) -> Result<(), XoError> {
        self.http.delete(&Self::vm_path(id)).await
    }

    async fn add_vm_tag(&self, id: &str, tag: &str) -> Result<(), XoError> {
        self.http.put(&Self::tag_path(id, tag)).await
    }

    async fn remove_vm_tag(&self, id: &str, tag: &str) -> Result<(), XoError> {
        self.http.delete(&Self::tag_path(id, tag)).await
    }
}
