//! Transport strategies
//!
//! Turns a host record plus decrypted credentials into a live, verified
//! [`EngineClient`]. Three strategies exist: local Unix socket, TCP with
//! optional mutual TLS, and an SSH tunnel that forwards a local port to
//! the remote engine socket. Every build ends with a handshake (`/_ping`
//! then `/version`) so a returned client is known-good, and every build
//! accounts for the OS resources it created so they can be released when
//! the connection is retired.

mod ssh;
mod tcp;
mod unix;

use crate::config::ConnectionConfig;
use crate::engine::{EngineClient, EngineVersion};
use crate::error::{ConnectionFailure, TransportError};
use crate::host::{ConnectionType, HostDescriptor};
use crate::vault::CredentialSet;
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, warn};

pub use ssh::TunnelHandle;

/// A verified connection plus everything needed to retire it later
pub struct BuiltConnection {
    /// Ready-to-use engine client
    pub client: EngineClient,
    /// Engine facts from the build-time handshake
    pub engine: EngineVersion,
    /// OS resources backing the connection
    pub resources: TransportResources,
}

impl std::fmt::Debug for BuiltConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltConnection")
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

/// OS resources created for a connection.
///
/// Unix and plain TCP connections own nothing; an SSH connection owns the
/// tunnel process and the on-disk key file. `release` is the orderly path;
/// `Drop` is a backstop that force-kills and unlinks if release was never
/// called.
#[derive(Default)]
pub struct TransportResources {
    tunnel: Option<TunnelHandle>,
    temp_key_path: Option<PathBuf>,
}

impl TransportResources {
    /// Resources for a connection with no external footprint
    pub fn none() -> Self {
        Self::default()
    }

    /// Resources for an SSH-tunneled connection
    pub fn tunnel(tunnel: TunnelHandle, temp_key_path: Option<PathBuf>) -> Self {
        Self {
            tunnel: Some(tunnel),
            temp_key_path,
        }
    }

    /// Tear down in order: terminate the tunnel, then delete the key file.
    ///
    /// Idempotent; never fails. Problems are logged and swallowed because
    /// release runs on eviction paths that must not themselves error.
    pub async fn release(&mut self) {
        if let Some(mut tunnel) = self.tunnel.take() {
            tunnel.shutdown().await;
        }
        self.delete_key_file();
    }

    fn delete_key_file(&mut self) {
        if let Some(path) = self.temp_key_path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to delete key file {}: {}", path.display(), e);
                }
            } else {
                debug!("deleted temp key file {}", path.display());
            }
        }
    }
}

impl Drop for TransportResources {
    fn drop(&mut self) {
        if let Some(tunnel) = self.tunnel.as_mut() {
            tunnel.force_kill();
        }
        self.tunnel = None;
        self.delete_key_file();
    }
}

/// Builds verified engine connections.
///
/// The connection manager depends on this trait, not the concrete
/// builder, so tests can substitute a scripted implementation.
#[async_trait]
pub trait ClientBuilder: Send + Sync {
    /// Build and handshake a connection for a host.
    ///
    /// On failure all partially created resources have already been
    /// released; the caller never has to clean up after a failed build.
    async fn build(
        &self,
        host: &HostDescriptor,
        credentials: CredentialSet,
    ) -> Result<BuiltConnection, ConnectionFailure>;
}

/// The production [`ClientBuilder`], dispatching on the host's
/// connection type
pub struct TransportBuilder {
    config: ConnectionConfig,
}

impl TransportBuilder {
    /// Create a builder with the given connection tunables
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ClientBuilder for TransportBuilder {
    async fn build(
        &self,
        host: &HostDescriptor,
        credentials: CredentialSet,
    ) -> Result<BuiltConnection, ConnectionFailure> {
        debug!(
            "building {} connection for host {} ({})",
            host.connection_type, host.id, host.host_url
        );
        match host.connection_type {
            ConnectionType::Unix => unix::build(host, &self.config).await,
            ConnectionType::Tcp => tcp::build(host, &credentials, &self.config).await,
            ConnectionType::Ssh => ssh::build(host, &credentials, &self.config).await,
        }
    }
}

/// Handshake a freshly connected client: ping, then fetch engine facts
pub(crate) async fn handshake(client: &EngineClient) -> Result<EngineVersion, TransportError> {
    client.ping().await?;
    client.version().await
}

/// Strip a required scheme prefix from a host URL
pub(crate) fn strip_scheme<'a>(url: &'a str, scheme: &str) -> Result<&'a str, ConnectionFailure> {
    url.strip_prefix(scheme).ok_or_else(|| {
        ConnectionFailure::InvalidConfig(format!("host URL {} does not start with {}", url, scheme))
    })
}

/// Split `host[:port]`, accepting bracketed IPv6 literals (`[::1]:2376`).
///
/// An unbracketed address with more than one colon is ambiguous (is the
/// last group a port?) and is rejected instead of silently misparsed.
pub(crate) fn split_host_port(
    authority: &str,
    default_port: u16,
) -> Result<(String, u16), ConnectionFailure> {
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(|| {
            ConnectionFailure::InvalidConfig(format!("unterminated '[' in address {}", authority))
        })?;
        let port = match tail.strip_prefix(':') {
            Some(port) => parse_port(port, authority)?,
            None if tail.is_empty() => default_port,
            None => {
                return Err(ConnectionFailure::InvalidConfig(format!(
                    "trailing garbage after ']' in address {}",
                    authority
                )))
            }
        };
        return Ok((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, _)) if host.contains(':') => Err(ConnectionFailure::InvalidConfig(format!(
            "IPv6 address {} must be bracketed, e.g. [::1]:{}",
            authority, default_port
        ))),
        Some((host, port)) => Ok((host.to_string(), parse_port(port, authority)?)),
        None => Ok((authority.to_string(), default_port)),
    }
}

fn parse_port(port: &str, authority: &str) -> Result<u16, ConnectionFailure> {
    port.parse()
        .map_err(|_| ConnectionFailure::InvalidConfig(format!("invalid port in {}", authority)))
}
