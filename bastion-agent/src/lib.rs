//! Bastion management agent library.
//!
//! Tracks the installed plugins, routes policies and actions to them, serves
//! their requests on the management endpoint and publishes the endpoint's
//! aggregated health.

#![forbid(unsafe_code)]

pub mod agent;
pub mod agent_server;
pub mod directory_watcher;
pub mod event_receiver;
pub mod health_status;
pub mod health_task;
pub mod outbreak;
pub mod plugin_manager;
pub mod plugin_proxy;
pub mod policy_files;
pub mod status_cache;

#[cfg(test)]
mod test_support;

pub use agent::Agent;
pub use health_status::{HealthStatus, HealthType, PluginHealthStatus};
pub use plugin_manager::{ManagerError, PluginManager};
pub use plugin_proxy::{PluginConnector, PluginProxy, SocketPluginConnector};
