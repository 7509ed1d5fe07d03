#![forbid(unsafe_code)]

//! bastion-lib: shared library for the Bastion management agent and its plugins.
//!
//! - Configuration management with hierarchical overrides
//! - Logging setup
//! - Local-socket IPC: framed protobuf codec, request/reply server and client
//! - The agent/plugin message protocol
//! - Plugin registry file model
//! - The plugin-side API: `ServiceClient`, `CallbackServer`, telemetry

pub mod config;
pub mod files;
pub mod ipc;
pub mod logging;
pub mod plugin_api;
pub mod protocol;
pub mod registry_entry;
pub mod telemetry;
