//! Plugin-side API.
//!
//! A plugin talks to the management agent through a [`ServiceClient`] and
//! receives policies, actions and queries through a [`CallbackServer`] that
//! forwards them to its [`PluginCallback`] implementation.

pub mod callback;
pub mod callback_server;
pub mod error;
pub mod service_client;

pub use callback::{PluginCallback, StatusInfo};
pub use callback_server::{CallbackServer, is_filename_payload};
pub use error::PluginApiError;
pub use service_client::{PolicyRequest, RetryPolicy, ServiceClient};
