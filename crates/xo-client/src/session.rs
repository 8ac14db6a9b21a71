//! Session manager
//!
//! One [`Session`] per process holds the authenticated transport to
//! XenOrchestra and is shared by reference with every component that talks
//! to the platform. It owns the connection lifecycle:
//!
//! ```text
//! Disconnected -> Authenticating -> Connected <-> Degraded
//!                                        \
//!                                         -> Closed (stop signal)
//! ```
//!
//! Every platform call goes through [`Session::call`], which adds a timeout,
//! bounded retries of transient failures with exponential backoff, transparent
//! reconnection, and cancellation checks. A request that has already been
//! submitted is never interrupted by cancellation; it completes (bounded by the
//! timeout) and reports.

use crate::backoff::ExponentialBackoff;
use crate::balancer::{BalancerTarget, BalancerTargetSpec};
use crate::client::XoClient;
use crate::config::XoConfig;
use crate::error::{ConnectionError, XoError};
use crate::models::{VmQuery, VmRecord};
use crate::xo_trait::XoClientTrait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of the platform session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session yet
    Disconnected,
    /// Authenticating
    Authenticating,
    /// Ready for calls
    Connected,
    /// A call observed a broken session; the next call reconnects
    Degraded,
    /// Shut down by the stop signal
    Closed,
}

/// What a call does when it finds a reconnection in progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReconnectPolicy {
    /// Fail with a transient error
    #[default]
    FailFast,
    /// Wait for the reconnection to finish
    Block,
}

/// Timeout and retry knobs
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Timeout of one platform call
    pub request_timeout: Duration,
    /// Retries after the first attempt, transient failures only
    pub max_retries: u32,
    /// First retry delay
    pub initial_backoff: Duration,
    /// Backoff ceiling
    pub max_backoff: Duration,
    /// Behavior of calls made during a reconnection
    pub reconnect_policy: ReconnectPolicy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            reconnect_policy: ReconnectPolicy::FailFast,
        }
    }
}

/// Authenticated, reconnecting handle to XenOrchestra
pub struct Session {
    transport: Arc<dyn XoClientTrait>,
    settings: SessionSettings,
    state: watch::Sender<ConnectionState>,
    reconnect_lock: Mutex<()>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("base_url", &self.transport.base_url())
            .field("state", &self.state())
            .field("settings", &self.settings)
            .finish()
    }
}

impl Session {
    /// Wrap a transport. The session starts `Disconnected`; call
    /// [`Session::establish`] to authenticate.
    pub fn new(
        transport: Arc<dyn XoClientTrait>,
        settings: SessionSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            settings,
            state: watch::Sender::new(ConnectionState::Disconnected),
            reconnect_lock: Mutex::new(()),
            cancel,
        }
    }

    /// Build the REST transport from `config` and authenticate.
    ///
    /// `cancel` closes the session once fired.
    pub async fn connect(config: &XoConfig, cancel: CancellationToken) -> Result<Self, ConnectionError> {
        let client = XoClient::new(config)?;
        let session = Self::new(Arc::new(client), config.session_settings(), cancel);
        session.establish().await?;
        Ok(session)
    }

    /// Authenticate against the platform and move to `Connected`
    pub async fn establish(&self) -> Result<(), ConnectionError> {
        if self.cancel.is_cancelled() {
            self.close();
            return Err(ConnectionError::Network("session is closed".to_string()));
        }

        self.set_state(ConnectionState::Authenticating);
        debug!("Authenticating to XenOrchestra at {}", self.transport.base_url());

        let outcome = match tokio::time::timeout(self.settings.request_timeout, self.transport.validate()).await {
            Ok(result) => result.map_err(ConnectionError::from),
            Err(_) => Err(ConnectionError::Network(format!(
                "no answer from {} within {:?}",
                self.transport.base_url(),
                self.settings.request_timeout
            ))),
        };

        match outcome {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                info!("Connected to XenOrchestra at {}", self.transport.base_url());
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe lifecycle transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Base URL of the platform
    pub fn base_url(&self) -> &str {
        self.transport.base_url()
    }

    /// Token that fires when the session closes
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// True once the session was shut down
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Shut the session down. Pending and future calls return
    /// [`XoError::Cancelled`] before issuing anything new.
    pub fn close(&self) {
        self.cancel.cancel();
        if self.state.send_replace(ConnectionState::Closed) != ConnectionState::Closed {
            info!("XenOrchestra session closed");
        }
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == ConnectionState::Closed || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn mark_degraded(&self, error: &XoError) {
        let degraded = self.state.send_if_modified(|current| {
            if *current != ConnectionState::Connected {
                return false;
            }
            *current = ConnectionState::Degraded;
            true
        });
        if degraded {
            warn!("XenOrchestra session degraded: {}", error);
        }
    }

    fn ensure_live(&self) -> Result<(), XoError> {
        if self.cancel.is_cancelled() {
            return Err(XoError::Cancelled);
        }
        Ok(())
    }

    /// Sleep unless the session closes first
    async fn pause(&self, delay: Duration) -> Result<(), XoError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(XoError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Make sure the session is usable, reconnecting if needed
    async fn ready(&self) -> Result<(), XoError> {
        loop {
            self.ensure_live()?;
            match self.state() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Closed => return Err(XoError::Cancelled),
                ConnectionState::Disconnected | ConnectionState::Degraded => {
                    return self.reconnect().await;
                }
                ConnectionState::Authenticating => match self.settings.reconnect_policy {
                    ReconnectPolicy::FailFast => {
                        return Err(XoError::Transient(
                            "reconnection to XenOrchestra in progress".to_string(),
                        ));
                    }
                    ReconnectPolicy::Block => {
                        let mut rx = self.state.subscribe();
                        while *rx.borrow_and_update() == ConnectionState::Authenticating {
                            tokio::select! {
                                _ = self.cancel.cancelled() => return Err(XoError::Cancelled),
                                changed = rx.changed() => {
                                    if changed.is_err() {
                                        return Err(XoError::Cancelled);
                                    }
                                }
                            }
                        }
                    }
                },
            }
        }
    }

    /// Single reconnection attempt; the retry loop in [`Session::call`]
    /// provides the backoff between attempts
    async fn reconnect(&self) -> Result<(), XoError> {
        let _guard = match self.settings.reconnect_policy {
            ReconnectPolicy::FailFast => self.reconnect_lock.try_lock().map_err(|_| {
                XoError::Transient("reconnection to XenOrchestra in progress".to_string())
            })?,
            ReconnectPolicy::Block => tokio::select! {
                _ = self.cancel.cancelled() => return Err(XoError::Cancelled),
                guard = self.reconnect_lock.lock() => guard,
            },
        };

        // Someone else may have finished while we waited for the lock
        match self.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Closed => return Err(XoError::Cancelled),
            _ => {}
        }
        self.ensure_live()?;

        warn!("Reconnecting to XenOrchestra at {}", self.transport.base_url());
        self.establish().await.map_err(XoError::from)
    }

    /// Run one platform operation with timeout, retries and reconnection.
    ///
    /// Only [`XoError::Transient`] is retried, at most `max_retries` times.
    pub async fn call<T, F, Fut>(&self, operation: &str, f: F) -> Result<T, XoError>
    where
        F: Fn(Arc<dyn XoClientTrait>) -> Fut,
        Fut: Future<Output = Result<T, XoError>>,
    {
        let mut backoff = ExponentialBackoff::new(self.settings.initial_backoff, self.settings.max_backoff);
        let mut attempt: u32 = 0;

        loop {
            let result = match self.ready().await {
                Ok(()) => {
                    match tokio::time::timeout(self.settings.request_timeout, f(self.transport.clone())).await {
                        Ok(result) => result,
                        Err(_) => Err(XoError::Transient(format!(
                            "{} timed out after {:?}",
                            operation, self.settings.request_timeout
                        ))),
                    }
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.settings.max_retries => {
                    attempt += 1;
                    self.mark_degraded(&e);
                    let delay = backoff.next_backoff();
                    warn!(
                        "{} failed (attempt {}/{}): {}, retrying in {:?}",
                        operation,
                        attempt,
                        self.settings.max_retries + 1,
                        e,
                        delay
                    );
                    self.pause(delay).await?;
                }
                Err(e) => {
                    if e.is_transient() {
                        self.mark_degraded(&e);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Look up a VM.
    ///
    /// A UUID identifier is resolved by UUID only. Anything else is matched
    /// exactly against VM names: no match is `NotFound`, several are a
    /// `Conflict`.
    pub async fn find_vm(&self, identifier: &str) -> Result<VmRecord, XoError> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(XoError::InvalidRequest("empty VM identifier".to_string()));
        }

        if let Ok(uuid) = uuid::Uuid::parse_str(identifier) {
            let id = uuid.hyphenated().to_string();
            return self
                .call("get_vm", |t| {
                    let id = id.clone();
                    async move { t.get_vm(&id).await }
                })
                .await;
        }

        let query = VmQuery::by_name(identifier);
        let mut vms = self
            .call("query_vms", |t| {
                let query = query.clone();
                async move { t.query_vms(&query).await }
            })
            .await?;
        vms.retain(|vm| vm.is_named(identifier));

        match vms.len() {
            0 => Err(XoError::NotFound(format!("no VM named {}", identifier))),
            1 => Ok(vms.remove(0)),
            n => Err(XoError::Conflict(format!("{} VMs are named {}", n, identifier))),
        }
    }

    /// Sweep the VMs of one pool (or every pool).
    ///
    /// Nothing is fetched until the stream is polled; calling again starts a
    /// fresh sweep.
    pub fn list_vms(&self, pool: Option<&str>) -> BoxStream<'_, Result<VmRecord, XoError>> {
        let query = VmQuery::in_pool(pool);
        stream::once(async move {
            self.call("query_vms", |t| {
                let query = query.clone();
                async move { t.query_vms(&query).await }
            })
            .await
        })
        .flat_map(|page| {
            let items: Vec<Result<VmRecord, XoError>> = match page {
                Ok(vms) => vms.into_iter().map(Ok).collect(),
                Err(e) => vec![Err(e)],
            };
            stream::iter(items)
        })
        .boxed()
    }

    /// Find the balancer target VM called `name`
    pub async fn find_balancer_target(&self, name: &str) -> Result<Option<BalancerTarget>, XoError> {
        let name = name.to_string();
        self.call("find_balancer_target", |t| {
            let name = name.clone();
            async move { lookup_target(t.as_ref(), &name).await }
        })
        .await
    }

    /// Create the balancer target for `spec`, or converge the existing one.
    ///
    /// Targets are identified by name, so repeating the call (including after
    /// a timeout) finds the VM created earlier instead of creating another.
    /// Only the tag changes reported by [`BalancerTarget::plan`] are sent.
    pub async fn create_or_update_balancer_target(
        &self,
        spec: &BalancerTargetSpec,
    ) -> Result<BalancerTarget, XoError> {
        self.call("create_or_update_balancer_target", |t| {
            let spec = spec.clone();
            let cancel = self.cancel.clone();
            async move { converge_target(t.as_ref(), &spec, &cancel).await }
        })
        .await
    }

    /// Delete a balancer target; an absent target is not an error
    pub async fn delete_balancer_target(&self, id: &str) -> Result<(), XoError> {
        let id = id.to_string();
        let result = self
            .call("delete_balancer_target", |t| {
                let id = id.clone();
                async move { t.delete_vm(&id).await }
            })
            .await;

        match result {
            Err(e) if e.is_not_found() => {
                debug!("Balancer target {} already gone", id);
                Ok(())
            }
            other => other,
        }
    }
}

async fn lookup_target(transport: &dyn XoClientTrait, name: &str) -> Result<Option<BalancerTarget>, XoError> {
    let mut vms = transport.query_vms(&VmQuery::by_name(name)).await?;
    vms.retain(|vm| vm.is_named(name));
    match vms.len() {
        0 => Ok(None),
        1 => Ok(Some(vms.remove(0).into())),
        n => Err(XoError::Conflict(format!(
            "{} VMs are named {}, refusing to pick one as balancer target",
            n, name
        ))),
    }
}

async fn converge_target(
    transport: &dyn XoClientTrait,
    spec: &BalancerTargetSpec,
    cancel: &CancellationToken,
) -> Result<BalancerTarget, XoError> {
    let live = || {
        if cancel.is_cancelled() {
            Err(XoError::Cancelled)
        } else {
            Ok(())
        }
    };

    let target = match lookup_target(transport, &spec.name).await? {
        Some(existing) => existing,
        None => {
            live()?;
            let id = transport.create_balancer_vm(spec).await?;
            BalancerTarget::from(transport.get_vm(&id).await?)
        }
    };

    if let Some(owner) = &target.service_uid {
        if *owner != spec.service_uid {
            return Err(XoError::Conflict(format!(
                "VM {} ({}) already serves Service {}",
                target.name, target.id, owner
            )));
        }
    }

    target.check_startable()?;

    let update = target.plan(spec);
    if update.is_empty() {
        return Ok(target);
    }
    debug!(
        "Converging balancer target {}: +{:?} -{:?} start={}",
        target.id, update.add_tags, update.remove_tags, update.start
    );

    for tag in &update.add_tags {
        live()?;
        transport.add_vm_tag(&target.id, tag).await?;
    }
    for tag in &update.remove_tags {
        live()?;
        match transport.remove_vm_tag(&target.id, tag).await {
            Err(e) if e.is_not_found() => {}
            other => other?,
        }
    }
    if update.start {
        live()?;
        transport.start_vm(&target.id).await?;
    }

    Ok(transport.get_vm(&target.id).await?.into())
}
