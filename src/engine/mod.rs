//! Engine API client
//!
//! A minimal HTTP/1.1 client for the Docker engine API, speaking over
//! whichever stream the transport layer produced: a local Unix socket, a
//! plain TCP connection, or a TLS session. Each request opens a fresh
//! connection and sends `Connection: close`; the handshake endpoints
//! (`/_ping`, `/version`) are small enough that connection reuse buys
//! nothing and connect-per-request keeps the client `Clone` and stateless.

use crate::error::{TransportError, TransportErrorKind};
use rustls::pki_types::ServerName;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio_rustls::TlsConnector;
use tracing::trace;

/// Engine facts reported by `/version`.
///
/// Field names follow the engine API's wire casing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EngineVersion {
    /// Engine version string (e.g. `26.1.0`)
    pub version: String,
    /// Engine API version (e.g. `1.45`)
    pub api_version: String,
    /// Remote operating system
    pub os: String,
    /// Remote CPU architecture
    pub arch: String,
}

/// Where and how the client dials the engine API
#[derive(Clone)]
pub enum Connector {
    /// Unix socket path (local, or the near end of an SSH tunnel)
    Unix(PathBuf),
    /// Plain TCP `host:port`
    Tcp(String),
    /// TLS over TCP
    Tls {
        /// `host:port` to dial
        addr: String,
        /// Name presented for SNI and certificate verification
        server_name: String,
        /// Prepared client configuration (mutual TLS material baked in)
        config: Arc<rustls::ClientConfig>,
    },
}

impl Connector {
    /// Value for the HTTP `Host` header
    fn host_header(&self) -> &str {
        match self {
            Connector::Unix(_) => "localhost",
            Connector::Tcp(addr) => addr,
            Connector::Tls { addr, .. } => addr,
        }
    }

    async fn connect(&self) -> Result<EngineStream, TransportError> {
        match self {
            Connector::Unix(path) => {
                let stream = UnixStream::connect(path).await.map_err(|e| {
                    TransportError::new(
                        TransportErrorKind::SocketUnavailable,
                        format!("connect to {} failed: {}", path.display(), e),
                    )
                })?;
                Ok(EngineStream::Unix(stream))
            }
            Connector::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await.map_err(|e| {
                    TransportError::new(
                        TransportErrorKind::SocketUnavailable,
                        format!("connect to {} failed: {}", addr, e),
                    )
                })?;
                Ok(EngineStream::Tcp(stream))
            }
            Connector::Tls {
                addr,
                server_name,
                config,
            } => {
                let tcp = TcpStream::connect(addr).await.map_err(|e| {
                    TransportError::new(
                        TransportErrorKind::SocketUnavailable,
                        format!("connect to {} failed: {}", addr, e),
                    )
                })?;
                let name = ServerName::try_from(server_name.clone()).map_err(|_| {
                    TransportError::new(
                        TransportErrorKind::TlsHandshakeFailed,
                        format!("invalid server name: {}", server_name),
                    )
                })?;
                let tls = TlsConnector::from(config.clone())
                    .connect(name, tcp)
                    .await
                    .map_err(|e| {
                        TransportError::new(
                            TransportErrorKind::TlsHandshakeFailed,
                            format!("TLS handshake with {} failed: {}", addr, e),
                        )
                    })?;
                Ok(EngineStream::Tls(Box::new(tls)))
            }
        }
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Connector::Unix(path) => write!(f, "unix://{}", path.display()),
            Connector::Tcp(addr) => write!(f, "tcp://{}", addr),
            Connector::Tls { addr, .. } => write!(f, "tls://{}", addr),
        }
    }
}

/// An established stream to the engine API
enum EngineStream {
    Unix(UnixStream),
    Tcp(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

/// A parsed HTTP response
#[derive(Debug)]
pub struct HttpResponse {
    /// Status code
    pub status: u16,
    /// Decoded body bytes
    pub body: Vec<u8>,
}

/// Client for a single engine endpoint.
///
/// Cheap to clone; holds no open connection.
#[derive(Debug, Clone)]
pub struct EngineClient {
    connector: Connector,
    request_timeout: Duration,
}

impl EngineClient {
    /// Create a client for an endpoint
    pub fn new(connector: Connector, request_timeout: Duration) -> Self {
        Self {
            connector,
            request_timeout,
        }
    }

    /// `GET /_ping`: succeeds iff the engine answers 200
    pub async fn ping(&self) -> Result<(), TransportError> {
        let response = self.get("/_ping").await?;
        if response.status != 200 {
            return Err(TransportError::new(
                TransportErrorKind::SocketUnavailable,
                format!("ping returned status {}", response.status),
            ));
        }
        Ok(())
    }

    /// `GET /version`: engine facts
    pub async fn version(&self) -> Result<EngineVersion, TransportError> {
        let response = self.get("/version").await?;
        if response.status != 200 {
            return Err(TransportError::new(
                TransportErrorKind::SocketUnavailable,
                format!("version returned status {}", response.status),
            ));
        }
        serde_json::from_slice(&response.body).map_err(|e| {
            TransportError::new(
                TransportErrorKind::SocketUnavailable,
                format!("version response is not valid JSON: {}", e),
            )
        })
    }

    /// Issue a GET request, bounded by the request timeout
    pub async fn get(&self, path: &str) -> Result<HttpResponse, TransportError> {
        self.request("GET", path, None).await
    }

    /// Issue a request with an optional JSON body, bounded by the
    /// request timeout
    pub async fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<&[u8]>,
    ) -> Result<HttpResponse, TransportError> {
        trace!("{} {} via {:?}", method, path, self.connector);
        tokio::time::timeout(self.request_timeout, self.request_inner(method, path, body))
            .await
            .map_err(|_| {
                TransportError::timeout(format!(
                    "{} {} timed out after {:?}",
                    method, path, self.request_timeout
                ))
            })?
    }

    async fn request_inner(
        &self,
        method: &str,
        path: &str,
        body: Option<&[u8]>,
    ) -> Result<HttpResponse, TransportError> {
        let host = self.connector.host_header().to_string();
        let mut stream = self.connector.connect().await?;
        match &mut stream {
            EngineStream::Unix(s) => exchange(s, method, &host, path, body).await,
            EngineStream::Tcp(s) => exchange(s, method, &host, path, body).await,
            EngineStream::Tls(s) => exchange(s.as_mut(), method, &host, path, body).await,
        }
    }
}

async fn exchange<S>(
    stream: &mut S,
    method: &str,
    host: &str,
    path: &str,
    body: Option<&[u8]>,
) -> Result<HttpResponse, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nAccept: application/json\r\nConnection: close\r\n",
        method, path, host
    );
    if let Some(body) = body {
        request.push_str(&format!(
            "Content-Type: application/json\r\nContent-Length: {}\r\n",
            body.len()
        ));
    }
    request.push_str("\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| io_failed("write request", e))?;
    if let Some(body) = body {
        stream
            .write_all(body)
            .await
            .map_err(|e| io_failed("write request body", e))?;
    }

    // `Connection: close` means the peer ends the stream after the body,
    // so the whole response can be read before parsing.
    let mut raw = Vec::new();
    stream
        .read_to_end(&mut raw)
        .await
        .map_err(|e| io_failed("read response", e))?;

    parse_response(&raw)
}

fn io_failed(what: &str, e: std::io::Error) -> TransportError {
    TransportError::new(
        TransportErrorKind::SocketUnavailable,
        format!("{} failed: {}", what, e),
    )
}

fn protocol_error(message: impl Into<String>) -> TransportError {
    TransportError::new(TransportErrorKind::SocketUnavailable, message.into())
}

/// Parse a complete HTTP/1.1 response
fn parse_response(raw: &[u8]) -> Result<HttpResponse, TransportError> {
    let header_end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| protocol_error("malformed response: no header terminator"))?;
    let header_text = std::str::from_utf8(&raw[..header_end])
        .map_err(|_| protocol_error("malformed response: header is not UTF-8"))?;
    let mut lines = header_text.split("\r\n");

    let status_line = lines
        .next()
        .ok_or_else(|| protocol_error("malformed response: empty header"))?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| protocol_error(format!("malformed status line: {}", status_line)))?;

    let mut content_length: Option<usize> = None;
    let mut chunked = false;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim();
        match name.as_str() {
            "content-length" => {
                content_length = value.parse().ok();
            }
            "transfer-encoding" => {
                chunked = value.eq_ignore_ascii_case("chunked");
            }
            _ => {}
        }
    }

    let body_raw = &raw[header_end + 4..];
    let body = if chunked {
        decode_chunked(body_raw)?
    } else if let Some(len) = content_length {
        if body_raw.len() < len {
            return Err(protocol_error("truncated response body"));
        }
        body_raw[..len].to_vec()
    } else {
        body_raw.to_vec()
    };

    Ok(HttpResponse { status, body })
}

/// Decode a chunked transfer-encoded body
fn decode_chunked(mut raw: &[u8]) -> Result<Vec<u8>, TransportError> {
    let mut body = Vec::new();
    loop {
        let line_end = raw
            .windows(2)
            .position(|w| w == b"\r\n")
            .ok_or_else(|| protocol_error("malformed chunk: no size line"))?;
        let size_text = std::str::from_utf8(&raw[..line_end])
            .map_err(|_| protocol_error("malformed chunk size"))?;
        // chunk extensions after ';' are ignored
        let size_text = size_text.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| protocol_error(format!("malformed chunk size: {}", size_text)))?;

        raw = &raw[line_end + 2..];
        if size == 0 {
            return Ok(body);
        }
        if raw.len() < size + 2 {
            return Err(protocol_error("truncated chunk"));
        }
        body.extend_from_slice(&raw[..size]);
        raw = &raw[size + 2..];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_length_response() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nOK";
        let response = parse_response(raw).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"OK");
    }

    #[test]
    fn test_parse_chunked_response() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let response = parse_response(raw).unwrap();
        assert_eq!(response.body, b"Wikipedia");
    }

    #[test]
    fn test_parse_error_status() {
        let raw = b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n";
        let response = parse_response(raw).unwrap();
        assert_eq!(response.status, 500);
        assert!(response.body.is_empty());
    }

    #[test]
    fn test_parse_without_length_reads_to_end() {
        let raw = b"HTTP/1.1 200 OK\r\n\r\nhello";
        let response = parse_response(raw).unwrap();
        assert_eq!(response.body, b"hello");
    }

    #[test]
    fn test_malformed_responses_rejected() {
        assert!(parse_response(b"garbage with no terminator").is_err());
        assert!(parse_response(b"NOTHTTP\r\n\r\n").is_err());
        assert!(
            parse_response(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort").is_err()
        );
    }

    #[test]
    fn test_version_wire_format() {
        let json = r#"{"Version":"26.1.0","ApiVersion":"1.45","Os":"linux","Arch":"x86_64","GitCommit":"abcdef"}"#;
        let version: EngineVersion = serde_json::from_str(json).unwrap();
        assert_eq!(version.version, "26.1.0");
        assert_eq!(version.api_version, "1.45");
        assert_eq!(version.os, "linux");
        assert_eq!(version.arch, "x86_64");
    }

    #[tokio::test]
    async fn test_ping_against_local_socket() {
        let dir = tempfile::TempDir::new().unwrap();
        let socket = dir.path().join("engine.sock");
        let listener = tokio::net::UnixListener::bind(&socket).unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = stream.read(&mut buf).await.unwrap();
            assert!(std::str::from_utf8(&buf[..n]).unwrap().starts_with("GET /_ping"));
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK")
                .await
                .unwrap();
        });

        let client = EngineClient::new(Connector::Unix(socket), Duration::from_secs(5));
        client.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_is_socket_unavailable() {
        let client = EngineClient::new(
            Connector::Unix(PathBuf::from("/nonexistent/engine.sock")),
            Duration::from_secs(1),
        );
        let err = client.ping().await.unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::SocketUnavailable);
    }
}
