//! Operational API handler
//!
//! Routes requests from the daemon's Unix socket to the connection
//! manager and host store. Hosts are provisioned through this API with
//! credentials already encrypted by the caller, so plaintext secrets
//! never transit the socket.

use crate::connection::ConnectionManager;
use crate::error::{ConnectionError, StoreError};
use crate::host::{ConnectionType, Credential, CredentialType, HostDescriptor, HostStore};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// API-level failures, each mapped to an HTTP status
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),

    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    /// HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::UnknownEndpoint(_) => 404,
            ApiError::BadRequest(_) => 400,
            ApiError::Store(StoreError::HostNotFound(_)) => 404,
            ApiError::Store(_) => 500,
            ApiError::Connection(e) if e.is_unavailable() => 503,
            ApiError::Connection(e) => match &e.failure {
                crate::error::ConnectionFailure::Store(StoreError::HostNotFound(_)) => 404,
                _ => 502,
            },
        }
    }
}

/// Request body for `POST /hosts`
#[derive(Debug, Deserialize)]
pub struct CreateHostRequest {
    pub name: String,
    pub connection_type: ConnectionType,
    pub host_url: String,
    #[serde(default)]
    pub allow_insecure: bool,
    /// Vault-encrypted credential blobs
    #[serde(default)]
    pub credentials: Vec<CredentialItem>,
}

/// One encrypted credential in a create request
#[derive(Debug, Serialize, Deserialize)]
pub struct CredentialItem {
    pub credential_type: CredentialType,
    pub encrypted_value: String,
}

/// Daemon version response
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VersionResponse {
    version: String,
    api_version: String,
}

/// Routes operational API requests
#[derive(Clone)]
pub struct ApiHandler {
    manager: Arc<ConnectionManager>,
    store: Arc<dyn HostStore>,
}

impl ApiHandler {
    /// Create a handler over the manager and store
    pub fn new(manager: Arc<ConnectionManager>, store: Arc<dyn HostStore>) -> Self {
        Self { manager, store }
    }

    /// Handle one API request
    pub async fn handle_request(
        &self,
        method: &str,
        path: &str,
        body: &str,
    ) -> Result<String, ApiError> {
        debug!("API request: {} {} body={}", method, path, body.len());

        let path_parts: Vec<&str> = path.trim_start_matches('/').split('/').collect();

        match (method, path_parts.as_slice()) {
            ("GET", ["_ping"]) => Ok("OK".to_string()),
            ("HEAD", ["_ping"]) => Ok("".to_string()),
            ("GET", ["version"]) => self.get_version(),

            ("GET", ["hosts"]) => self.list_hosts(),
            ("POST", ["hosts"]) => self.create_host(body),
            ("GET", ["hosts", id]) => self.get_host(id),
            ("DELETE", ["hosts", id]) => self.remove_host(id).await,
            ("POST", ["hosts", id, "connect"]) => self.connect_host(id).await,
            ("POST", ["hosts", id, "invalidate"]) => self.invalidate_host(id).await,
            ("GET", ["hosts", id, "breaker"]) => self.breaker_status(id),
            ("POST", ["hosts", id, "breaker", "reset"]) => self.reset_breaker(id),

            _ => Err(ApiError::UnknownEndpoint(format!("{} {}", method, path))),
        }
    }

    fn get_version(&self) -> Result<String, ApiError> {
        let response = VersionResponse {
            version: env!("CARGO_PKG_VERSION").to_string(),
            api_version: "1.0".to_string(),
        };
        Ok(serde_json::to_string(&response).map_err(StoreError::from)?)
    }

    fn list_hosts(&self) -> Result<String, ApiError> {
        let hosts = self.store.list_hosts()?;
        Ok(serde_json::to_string(&hosts).map_err(StoreError::from)?)
    }

    fn create_host(&self, body: &str) -> Result<String, ApiError> {
        let request: CreateHostRequest =
            serde_json::from_str(body).map_err(|e| ApiError::BadRequest(e.to_string()))?;
        if request.name.is_empty() {
            return Err(ApiError::BadRequest("host name is required".to_string()));
        }

        let mut host =
            HostDescriptor::new(&request.name, request.connection_type, &request.host_url);
        host.allow_insecure = request.allow_insecure;
        let id = host.id.clone();
        self.store.save_host(host.clone())?;
        for item in request.credentials {
            self.store.put_credential(Credential::new(
                &id,
                item.credential_type,
                item.encrypted_value,
            ))?;
        }
        Ok(serde_json::to_string(&host).map_err(StoreError::from)?)
    }

    fn get_host(&self, id: &str) -> Result<String, ApiError> {
        let host = self
            .store
            .get_host(id)?
            .ok_or_else(|| StoreError::HostNotFound(id.to_string()))?;
        Ok(serde_json::to_string(&host).map_err(StoreError::from)?)
    }

    async fn remove_host(&self, id: &str) -> Result<String, ApiError> {
        self.manager.remove_host(id).await?;
        Ok(json!({ "removed": id }).to_string())
    }

    /// Force a connection attempt and return the refreshed host record
    async fn connect_host(&self, id: &str) -> Result<String, ApiError> {
        self.manager.get_client(id).await?;
        self.get_host(id)
    }

    async fn invalidate_host(&self, id: &str) -> Result<String, ApiError> {
        // check existence so a typo'd id is a 404, not a silent no-op
        self.store
            .get_host(id)?
            .ok_or_else(|| StoreError::HostNotFound(id.to_string()))?;
        self.manager.invalidate(id).await;
        Ok(json!({ "invalidated": id }).to_string())
    }

    fn breaker_status(&self, id: &str) -> Result<String, ApiError> {
        self.store
            .get_host(id)?
            .ok_or_else(|| StoreError::HostNotFound(id.to_string()))?;
        let status = self.manager.breaker_status(id);
        Ok(serde_json::to_string(&status).map_err(StoreError::from)?)
    }

    fn reset_breaker(&self, id: &str) -> Result<String, ApiError> {
        self.store
            .get_host(id)?
            .ok_or_else(|| StoreError::HostNotFound(id.to_string()))?;
        self.manager.reset_breaker(id);
        let status = self.manager.breaker_status(id);
        Ok(serde_json::to_string(&status).map_err(StoreError::from)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, ConnectionConfig, VaultConfig};
    use crate::error::ConnectionFailure;
    use crate::host::FileHostStore;
    use crate::transport::{BuiltConnection, ClientBuilder};
    use crate::vault::{CredentialSet, CredentialVault};
    use async_trait::async_trait;

    struct RefusingBuilder;

    #[async_trait]
    impl ClientBuilder for RefusingBuilder {
        async fn build(
            &self,
            _host: &HostDescriptor,
            _credentials: CredentialSet,
        ) -> Result<BuiltConnection, ConnectionFailure> {
            Err(ConnectionFailure::Transport(
                crate::error::TransportError::new(
                    crate::error::TransportErrorKind::SocketUnavailable,
                    "down",
                ),
            ))
        }
    }

    fn handler() -> (ApiHandler, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(FileHostStore::open(dir.path().join("hosts.json")).unwrap());
        let vault_config = VaultConfig {
            kdf_iterations: 1000,
            kdf_salt: "test".to_string(),
        };
        let vault = Arc::new(CredentialVault::new("test-key", &vault_config).unwrap());
        let manager = Arc::new(ConnectionManager::new(
            store.clone(),
            vault,
            Arc::new(RefusingBuilder),
            ConnectionConfig::default(),
            BreakerConfig::default(),
        ));
        (ApiHandler::new(manager, store), dir)
    }

    async fn create_test_host(handler: &ApiHandler) -> String {
        let body = json!({
            "name": "edge-1",
            "connection_type": "tcp",
            "host_url": "tcp://10.0.0.1:2375",
        })
        .to_string();
        let response = handler.handle_request("POST", "/hosts", &body).await.unwrap();
        let host: HostDescriptor = serde_json::from_str(&response).unwrap();
        host.id
    }

    #[tokio::test]
    async fn test_ping() {
        let (handler, _dir) = handler();
        let result = handler.handle_request("GET", "/_ping", "").await;
        assert_eq!(result.unwrap(), "OK");
    }

    #[tokio::test]
    async fn test_version() {
        let (handler, _dir) = handler();
        let result = handler.handle_request("GET", "/version", "").await.unwrap();
        assert!(result.contains("Version"));
        assert!(result.contains("ApiVersion"));
    }

    #[tokio::test]
    async fn test_unknown_endpoint_is_404() {
        let (handler, _dir) = handler();
        let err = handler
            .handle_request("GET", "/containers/json", "")
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_create_list_get_host() {
        let (handler, _dir) = handler();
        let id = create_test_host(&handler).await;

        let list = handler.handle_request("GET", "/hosts", "").await.unwrap();
        let hosts: Vec<HostDescriptor> = serde_json::from_str(&list).unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].name, "edge-1");

        let detail = handler
            .handle_request("GET", &format!("/hosts/{}", id), "")
            .await
            .unwrap();
        assert!(detail.contains("edge-1"));
    }

    #[tokio::test]
    async fn test_create_with_credentials() {
        let (handler, _dir) = handler();
        let body = json!({
            "name": "edge-2",
            "connection_type": "ssh",
            "host_url": "ssh://root@10.0.0.2",
            "credentials": [
                { "credential_type": "ssh_private_key", "encrypted_value": "CIPHERTEXT" }
            ],
        })
        .to_string();
        let response = handler.handle_request("POST", "/hosts", &body).await.unwrap();
        let host: HostDescriptor = serde_json::from_str(&response).unwrap();
        assert_eq!(handler.store.credentials(&host.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_create_is_400() {
        let (handler, _dir) = handler();
        let err = handler
            .handle_request("POST", "/hosts", "{not json")
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn test_breaker_endpoints() {
        let (handler, _dir) = handler();
        let id = create_test_host(&handler).await;

        let status = handler
            .handle_request("GET", &format!("/hosts/{}/breaker", id), "")
            .await
            .unwrap();
        assert!(status.contains("closed"));

        let reset = handler
            .handle_request("POST", &format!("/hosts/{}/breaker/reset", id), "")
            .await
            .unwrap();
        assert!(reset.contains("closed"));

        let err = handler
            .handle_request("GET", "/hosts/nope/breaker", "")
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_connect_failure_maps_to_bad_gateway() {
        let (handler, _dir) = handler();
        let id = create_test_host(&handler).await;
        let err = handler
            .handle_request("POST", &format!("/hosts/{}/connect", id), "")
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 502);
    }

    #[tokio::test]
    async fn test_invalidate_and_remove() {
        let (handler, _dir) = handler();
        let id = create_test_host(&handler).await;

        let response = handler
            .handle_request("POST", &format!("/hosts/{}/invalidate", id), "")
            .await
            .unwrap();
        assert!(response.contains(&id));

        handler
            .handle_request("DELETE", &format!("/hosts/{}", id), "")
            .await
            .unwrap();
        let err = handler
            .handle_request("GET", &format!("/hosts/{}", id), "")
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 404);
    }
}
