//! Unix socket strategy
//!
//! The simplest transport: the engine socket is on the local filesystem.
//! Nothing to set up and nothing to tear down; the build is just a
//! connect-and-handshake against the socket path.

use super::{handshake, strip_scheme, BuiltConnection, TransportResources};
use crate::config::ConnectionConfig;
use crate::engine::{Connector, EngineClient};
use crate::error::ConnectionFailure;
use crate::host::HostDescriptor;
use std::path::PathBuf;

pub(super) async fn build(
    host: &HostDescriptor,
    config: &ConnectionConfig,
) -> Result<BuiltConnection, ConnectionFailure> {
    let path = PathBuf::from(strip_scheme(&host.host_url, "unix://")?);
    if !path.is_absolute() {
        return Err(ConnectionFailure::InvalidConfig(format!(
            "unix socket path must be absolute: {}",
            path.display()
        )));
    }

    let client = EngineClient::new(Connector::Unix(path), config.handshake_timeout());
    let engine = handshake(&client).await?;

    Ok(BuiltConnection {
        client,
        engine,
        resources: TransportResources::none(),
    })
}
