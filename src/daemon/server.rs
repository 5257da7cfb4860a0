//! Unix socket server for the Flotilla daemon
//!
//! Listens on the operational socket, dispatches requests to the API
//! handler, and owns the lifecycle of the connection layer: on shutdown
//! every cached connection is released so no tunnel process or key file
//! outlives the daemon.

use super::api::{ApiError, ApiHandler};
use crate::config::FlotillaConfig;
use crate::connection::ConnectionManager;
use crate::health::HealthReporter;
use crate::host::{FileHostStore, HostStore};
use crate::transport::TransportBuilder;
use crate::vault::CredentialVault;
use anyhow::Context;
use serde_json::json;
use std::fs;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Flotilla daemon: operational API plus the background health reporter
pub struct FlotillaDaemon {
    config: FlotillaConfig,
    manager: Arc<ConnectionManager>,
    store: Arc<dyn HostStore>,
    api: ApiHandler,
}

impl FlotillaDaemon {
    /// Wire up the store, vault, transports and manager
    pub fn new(config: FlotillaConfig, master_key: &str) -> anyhow::Result<Self> {
        fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;

        let store: Arc<dyn HostStore> = Arc::new(
            FileHostStore::open(config.store_path()).context("opening host store")?,
        );
        let vault = Arc::new(
            CredentialVault::new(master_key, &config.vault).context("initializing vault")?,
        );
        let builder = Arc::new(TransportBuilder::new(config.connection.clone()));
        let manager = Arc::new(ConnectionManager::new(
            store.clone(),
            vault,
            builder,
            config.connection.clone(),
            config.breaker.clone(),
        ));
        let api = ApiHandler::new(manager.clone(), store.clone());

        Ok(Self {
            config,
            manager,
            store,
            api,
        })
    }

    /// Serve until the shutdown signal flips, then release everything
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let socket_path = &self.config.socket_path;
        if socket_path.exists() {
            fs::remove_file(socket_path)
                .with_context(|| format!("removing stale socket {}", socket_path.display()))?;
        }
        if let Some(parent) = socket_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(socket_path)
            .with_context(|| format!("binding {}", socket_path.display()))?;
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(socket_path, fs::Permissions::from_mode(0o660))?;
        }
        info!("flotilla daemon listening on {}", socket_path.display());

        let reporter = HealthReporter::new(
            self.manager.clone(),
            self.store.clone(),
            self.config.health.clone(),
            self.config.connection.cache_freshness(),
        );
        let reporter_task = tokio::spawn(reporter.run(shutdown.clone()));

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let api = self.api.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, api).await {
                                debug!("connection handling error: {}", e);
                            }
                        });
                    }
                    Err(e) => error!("error accepting connection: {}", e),
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("shutting down");
        let _ = reporter_task.await;
        self.manager.shutdown().await;
        if socket_path.exists() {
            let _ = fs::remove_file(socket_path);
        }
        Ok(())
    }
}

/// Read one HTTP request, route it, write one response
async fn handle_connection(stream: UnixStream, api: ApiHandler) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 2 {
        return send_response(&mut write_half, 400, &json!({"message": "Bad Request"}).to_string())
            .await;
    }
    let method = parts[0].to_string();
    let path = parts[1].to_string();

    let mut content_length = 0usize;
    loop {
        let mut header_line = String::new();
        reader.read_line(&mut header_line).await?;
        if header_line.trim().is_empty() {
            break;
        }
        if let Some(value) = header_line
            .to_ascii_lowercase()
            .strip_prefix("content-length:")
            .map(str::trim)
        {
            content_length = value.parse().unwrap_or(0);
        }
    }

    let body = if content_length > 0 {
        let mut buf = vec![0u8; content_length];
        reader.read_exact(&mut buf).await?;
        String::from_utf8_lossy(&buf).into_owned()
    } else {
        String::new()
    };

    match api.handle_request(&method, &path, &body).await {
        Ok(response) => send_response(&mut write_half, 200, &response).await,
        Err(e) => send_error(&mut write_half, &e).await,
    }
}

async fn send_response<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    status: u16,
    body: &str,
) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason_phrase(status),
        body.len(),
        body
    );
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await
}

async fn send_error<W: AsyncWriteExt + Unpin>(writer: &mut W, error: &ApiError) -> std::io::Result<()> {
    let body = json!({ "message": error.to_string() }).to_string();
    send_response(writer, error.status_code(), &body).await
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Internal Server Error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VaultConfig;
    use crate::engine::{Connector, EngineClient};
    use std::time::Duration;

    fn test_config(dir: &tempfile::TempDir) -> FlotillaConfig {
        FlotillaConfig {
            socket_path: dir.path().join("flotilla.sock"),
            data_dir: dir.path().join("data"),
            vault: VaultConfig {
                kdf_iterations: 1000,
                kdf_salt: "test".to_string(),
            },
            ..FlotillaConfig::default()
        }
    }

    #[tokio::test]
    async fn test_daemon_serves_and_shuts_down() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = test_config(&dir);
        let socket_path = config.socket_path.clone();

        let daemon = FlotillaDaemon::new(config, "test-master-key").unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(async move { daemon.run(shutdown_rx).await });

        // wait for the socket to appear
        for _ in 0..50 {
            if socket_path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let client = EngineClient::new(
            Connector::Unix(socket_path.clone()),
            Duration::from_secs(5),
        );
        client.ping().await.unwrap();

        let response = client.get("/hosts").await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"[]");

        let response = client.get("/no/such/endpoint").await.unwrap();
        assert_eq!(response.status, 404);

        shutdown_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_host_lifecycle_over_socket() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = test_config(&dir);
        let socket_path = config.socket_path.clone();

        let daemon = FlotillaDaemon::new(config, "test-master-key").unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(async move { daemon.run(shutdown_rx).await });

        for _ in 0..50 {
            if socket_path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let client = EngineClient::new(
            Connector::Unix(socket_path.clone()),
            Duration::from_secs(5),
        );
        let body = serde_json::json!({
            "name": "edge-1",
            "connection_type": "tcp",
            "host_url": "tcp://10.0.0.1:2375",
        })
        .to_string();
        let response = client
            .request("POST", "/hosts", Some(body.as_bytes()))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        let host: crate::host::HostDescriptor = serde_json::from_slice(&response.body).unwrap();

        let response = client
            .request("DELETE", &format!("/hosts/{}", host.id), None)
            .await
            .unwrap();
        assert_eq!(response.status, 200);

        shutdown_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
    }
}
