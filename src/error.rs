//! Error types for Flotilla
//!
//! Every error that can cross the connection-layer boundary is `Clone`:
//! a single in-flight build may be shared by many concurrent callers, and
//! each of them receives the same failure.

use thiserror::Error;

/// Result type for Flotilla operations
pub type Result<T> = std::result::Result<T, ConnectionError>;

/// Classification of a transport-level failure.
///
/// These are retryable remote failures: each one feeds the per-host
/// circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Unix socket path missing or not accessible
    SocketUnavailable,
    /// TLS negotiation or certificate verification failed
    TlsHandshakeFailed,
    /// SSH tunnel process failed to come up or died
    SshTunnelFailed,
    /// Connect or handshake exceeded its bound
    Timeout,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportErrorKind::SocketUnavailable => "socket_unavailable",
            TransportErrorKind::TlsHandshakeFailed => "tls_handshake_failed",
            TransportErrorKind::SshTunnelFailed => "ssh_tunnel_failed",
            TransportErrorKind::Timeout => "timeout",
        };
        write!(f, "{}", s)
    }
}

/// A failure while building or using a transport to a remote engine.
#[derive(Debug, Clone, Error)]
#[error("transport error ({kind}): {message}")]
pub struct TransportError {
    /// Failure classification
    pub kind: TransportErrorKind,
    /// Human-readable detail
    pub message: String,
}

impl TransportError {
    /// Create a new transport error
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }
}

/// Why the circuit breaker short-circuited a connection attempt.
///
/// This is not a remote failure: no network or process work was performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableReason {
    /// Breaker is open; the cooldown has not elapsed
    CircuitOpen,
    /// Breaker is half-open and another caller holds the single probe slot
    ProbeInProgress,
}

impl std::fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UnavailableReason::CircuitOpen => "circuit_open",
            UnavailableReason::ProbeInProgress => "probe_in_progress",
        };
        write!(f, "{}", s)
    }
}

/// The breaker intentionally refused a connection attempt.
#[derive(Debug, Clone, Error)]
#[error("host unavailable ({reason})")]
pub struct HostUnavailableError {
    /// Short-circuit reason
    pub reason: UnavailableReason,
}

/// Credential vault failures.
#[derive(Debug, Clone, Error)]
pub enum VaultError {
    /// Ciphertext is malformed or the master key does not match.
    /// Fatal for that credential; never retried.
    #[error("decryption failed for {credential_type}: {message}")]
    Decryption {
        credential_type: String,
        message: String,
    },

    /// The master key is missing or unusable
    #[error("vault key error: {0}")]
    Key(String),
}

/// Host store failures (the relational-store boundary).
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("host not found: {0}")]
    HostNotFound(String),

    #[error("store IO error: {0}")]
    Io(String),

    #[error("store serialization error: {0}")]
    Serialization(String),

    #[error("invalid host record: {0}")]
    InvalidRecord(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// What went wrong underneath a [`ConnectionError`].
#[derive(Debug, Clone, Error)]
pub enum ConnectionFailure {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Unavailable(#[from] HostUnavailableError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("host is deactivated")]
    HostInactive,

    #[error("invalid host configuration: {0}")]
    InvalidConfig(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// The umbrella error returned to every caller of the connection layer,
/// carrying the host id for context. No raw transport or vault error
/// escapes without being wrapped here.
#[derive(Debug, Clone, Error)]
#[error("engine connection failed for host {host_id}: {failure}")]
pub struct ConnectionError {
    /// The host the attempt was for
    pub host_id: String,
    /// Underlying cause
    pub failure: ConnectionFailure,
}

impl ConnectionError {
    /// Wrap a failure with its host id
    pub fn new(host_id: impl Into<String>, failure: impl Into<ConnectionFailure>) -> Self {
        Self {
            host_id: host_id.into(),
            failure: failure.into(),
        }
    }

    /// True when the breaker short-circuited the attempt (nothing was tried)
    pub fn is_unavailable(&self) -> bool {
        matches!(self.failure, ConnectionFailure::Unavailable(_))
    }

    /// The short-circuit reason, when applicable
    pub fn unavailable_reason(&self) -> Option<UnavailableReason> {
        match &self.failure {
            ConnectionFailure::Unavailable(e) => Some(e.reason),
            _ => None,
        }
    }
}
