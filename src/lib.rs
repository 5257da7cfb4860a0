//! Flotilla - a control plane for fleets of Docker and Swarm engines
//!
//! Flotilla manages connections to many remote container engines. It
//! provides:
//!
//! - A registry of managed hosts with encrypted-at-rest credentials
//! - Three transports: local Unix socket, TCP with mutual TLS, SSH tunnel
//! - A per-host circuit breaker so dead engines cost nothing to skip
//! - A connection manager that caches verified clients and collapses
//!   concurrent attempts into one build
//! - A background health reporter and an operational Unix-socket API

pub mod config;
pub mod connection;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod health;
pub mod host;
pub mod transport;
pub mod vault;

pub use error::{ConnectionError, Result};
