//! Managed host records and credentials
//!
//! A host is a remote Docker or Swarm engine endpoint. These records are
//! owned by the relational store; the connection layer reads them and
//! writes back status and denormalized engine facts.

mod store;

pub use store::{FileHostStore, HostStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a host's engine API is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    /// Local Unix socket
    Unix,
    /// TCP, optionally with mutual TLS
    Tcp,
    /// SSH tunnel to the remote engine socket
    Ssh,
}

impl std::fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionType::Unix => "unix",
            ConnectionType::Tcp => "tcp",
            ConnectionType::Ssh => "ssh",
        };
        write!(f, "{}", s)
    }
}

/// Host health status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    /// Newly created, never probed
    #[default]
    Pending,
    /// Created through onboarding, awaiting remote-side setup
    SetupPending,
    /// Last probe succeeded
    Healthy,
    /// Was healthy, last probe failed
    Unhealthy,
    /// Repeated or cold failures; host considered down
    Unreachable,
}

impl HostStatus {
    /// True if the host has never been successfully probed
    pub fn is_initial(&self) -> bool {
        matches!(self, HostStatus::Pending | HostStatus::SetupPending)
    }

    /// Status after a failed connection attempt.
    ///
    /// A healthy host that fails once is flapping, not dead; anything
    /// else that fails is unreachable.
    pub fn after_failure(&self) -> HostStatus {
        match self {
            HostStatus::Healthy => HostStatus::Unhealthy,
            _ => HostStatus::Unreachable,
        }
    }
}

impl std::fmt::Display for HostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HostStatus::Pending => "pending",
            HostStatus::SetupPending => "setup_pending",
            HostStatus::Healthy => "healthy",
            HostStatus::Unhealthy => "unhealthy",
            HostStatus::Unreachable => "unreachable",
        };
        write!(f, "{}", s)
    }
}

/// A managed engine endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostDescriptor {
    /// Stable opaque identifier
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Transport selection
    pub connection_type: ConnectionType,
    /// Scheme-qualified address (`unix://`, `tcp://`, `https://`, `ssh://`)
    pub host_url: String,
    /// Whether the host participates in probing and traffic
    pub is_active: bool,
    /// Allow TLS without verification (explicit opt-in, never silent)
    #[serde(default)]
    pub allow_insecure: bool,
    /// Health status
    #[serde(default)]
    pub status: HostStatus,
    /// Timestamp of the last health probe
    pub last_health_check: Option<DateTime<Utc>>,
    /// Engine version reported by the last successful handshake
    pub docker_version: Option<String>,
    /// Engine API version
    pub api_version: Option<String>,
    /// Remote operating system
    pub os_type: Option<String>,
    /// Remote CPU architecture
    pub architecture: Option<String>,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

impl HostDescriptor {
    /// Create a new host record in `pending` state
    pub fn new(name: &str, connection_type: ConnectionType, host_url: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            connection_type,
            host_url: host_url.to_string(),
            is_active: true,
            allow_insecure: false,
            status: HostStatus::Pending,
            last_health_check: None,
            docker_version: None,
            api_version: None,
            os_type: None,
            architecture: None,
            created_at: Utc::now(),
        }
    }
}

/// Kind of an encrypted credential attached to a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    TlsCert,
    TlsKey,
    TlsCa,
    SshPrivateKey,
    SshPrivateKeyPassphrase,
    SshPassword,
    SshUser,
}

impl std::fmt::Display for CredentialType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CredentialType::TlsCert => "tls_cert",
            CredentialType::TlsKey => "tls_key",
            CredentialType::TlsCa => "tls_ca",
            CredentialType::SshPrivateKey => "ssh_private_key",
            CredentialType::SshPrivateKeyPassphrase => "ssh_private_key_passphrase",
            CredentialType::SshPassword => "ssh_password",
            CredentialType::SshUser => "ssh_user",
        };
        write!(f, "{}", s)
    }
}

/// An encrypted credential blob, decrypted only in memory for the duration
/// of a connection attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    /// Owning host id
    pub host_id: String,
    /// What this credential is
    pub credential_type: CredentialType,
    /// Opaque ciphertext (vault format)
    pub encrypted_value: String,
    /// Optional descriptive metadata (e.g. key fingerprint); never secret
    pub metadata: Option<String>,
}

impl Credential {
    /// Create a credential for a host
    pub fn new(host_id: &str, credential_type: CredentialType, encrypted_value: String) -> Self {
        Self {
            host_id: host_id.to_string(),
            credential_type,
            encrypted_value,
            metadata: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_host_is_pending() {
        let host = HostDescriptor::new("edge-1", ConnectionType::Ssh, "ssh://root@10.0.0.5");
        assert_eq!(host.status, HostStatus::Pending);
        assert!(host.is_active);
        assert!(!host.allow_insecure);
        assert!(host.status.is_initial());
    }

    #[test]
    fn test_status_after_failure_policy() {
        assert_eq!(HostStatus::Healthy.after_failure(), HostStatus::Unhealthy);
        assert_eq!(
            HostStatus::Unhealthy.after_failure(),
            HostStatus::Unreachable
        );
        assert_eq!(HostStatus::Pending.after_failure(), HostStatus::Unreachable);
        assert_eq!(
            HostStatus::Unreachable.after_failure(),
            HostStatus::Unreachable
        );
    }

    #[test]
    fn test_serde_enum_tags() {
        let host = HostDescriptor::new("h", ConnectionType::Tcp, "tcp://1.2.3.4:2375");
        let json = serde_json::to_string(&host).unwrap();
        assert!(json.contains("\"connection_type\":\"tcp\""));
        assert!(json.contains("\"status\":\"pending\""));

        let cred_type: CredentialType = serde_json::from_str("\"ssh_private_key\"").unwrap();
        assert_eq!(cred_type, CredentialType::SshPrivateKey);
        assert_eq!(cred_type.to_string(), "ssh_private_key");
    }
}
