//! sandboxctl - patch and verify a remote development sandbox.
//!
//! The client side (`client`, `workflow`, `verify`, `shell`) drives a sandbox
//! through the sandbox service API. The service side (`http_server`, `state`,
//! `sandbox`) implements that API against local directories.

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod http_server;
pub mod sandbox;
pub mod shell;
pub mod state;
pub mod verify;
pub mod workflow;

pub use error::{Error, Result};
