//! Flotilla daemon - Unix socket server
//!
//! The daemon exposes the operational API on a local Unix socket and runs
//! the background health reporter. All state-changing operations (host
//! provisioning, breaker resets, cache invalidation) flow through here.

mod api;
mod server;

pub use api::{ApiHandler, CreateHostRequest, CredentialItem};
pub use server::FlotillaDaemon;
