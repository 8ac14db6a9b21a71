//! XenOrchestra REST API Client
//!
//! A Rust client library for the XenOrchestra REST API (`/rest/v0`) and the
//! session manager the XenOrchestra cloud provider shares across all of its
//! components.
//!
//! # Example
//!
//! ```no_run
//! use tokio_util::sync::CancellationToken;
//! use xo_client::{Session, XoConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = XoConfig::from_slice(b"url: https://xo.example.com\ntoken: secret\n")?;
//! let session = Session::connect(&config, CancellationToken::new()).await?;
//!
//! // UUIDs are looked up by UUID, anything else by exact name
//! let vm = session.find_vm("8d2c1f7e-5f0a-4a8e-9b3c-0e6f7a1b2c3d").await?;
//! println!("{} is {:?}", vm.name, vm.power_state);
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Session lifecycle**: authenticate, degrade, reconnect, close
//! - **Retry Logic**: bounded retries of transient failures with exponential backoff
//! - **Balancer targets**: idempotent create-or-converge of load balancer VMs
//! - **Mocking**: [`XoClientTrait`] plus an in-memory mock behind `test-util`

pub mod backoff;
pub mod balancer;
pub mod client;
pub mod common;
pub mod config;
pub mod error;
pub mod models;
pub mod session;
#[path = "trait.rs"]
pub mod xo_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

#[cfg(test)]
mod session_test;

pub use balancer::{BalancerPort, BalancerTarget, BalancerTargetSpec, Protocol, TargetUpdate};
pub use client::XoClient;
pub use common::HttpClient;
pub use config::{DUAL_STACK_ENV, LoadBalancerConfig, XoConfig};
pub use error::{ConnectionError, XoError};
pub use models::*;
pub use session::{ConnectionState, ReconnectPolicy, Session, SessionSettings};
pub use xo_trait::XoClientTrait;
#[cfg(any(test, feature = "test-util"))]
pub use mock::{MockXoClient, VmBuilder};
