//! TCP strategy, with optional mutual TLS
//!
//! Plain TCP is used only when the host carries no TLS material. When the
//! vault holds a client certificate and key, the build presents them and
//! verifies the server against the stored CA bundle. `allow_insecure`
//! skips server verification; it is an explicit per-host opt-in and is
//! logged loudly every time it takes effect.

use super::{handshake, split_host_port, BuiltConnection, TransportResources};
use crate::config::ConnectionConfig;
use crate::engine::{Connector, EngineClient};
use crate::error::ConnectionFailure;
use crate::host::HostDescriptor;
use crate::vault::CredentialSet;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::sync::Arc;
use tracing::warn;

const DEFAULT_PLAIN_PORT: u16 = 2375;
const DEFAULT_TLS_PORT: u16 = 2376;

pub(super) async fn build(
    host: &HostDescriptor,
    credentials: &CredentialSet,
    config: &ConnectionConfig,
) -> Result<BuiltConnection, ConnectionFailure> {
    let use_tls = credentials.has_mutual_tls()
        || credentials.tls_ca.is_some()
        || host.host_url.starts_with("https://");

    let default_port = if use_tls {
        DEFAULT_TLS_PORT
    } else {
        DEFAULT_PLAIN_PORT
    };
    let (server_name, addr) = parse_addr(&host.host_url, default_port)?;

    let connector = if use_tls {
        let tls_config = client_tls_config(host, credentials)?;
        Connector::Tls {
            addr,
            server_name,
            config: Arc::new(tls_config),
        }
    } else {
        Connector::Tcp(addr)
    };

    let client = EngineClient::new(connector, config.handshake_timeout());
    let engine = handshake(&client).await?;

    Ok(BuiltConnection {
        client,
        engine,
        resources: TransportResources::none(),
    })
}

/// Split a `tcp://` or `https://` host URL into (hostname, `host:port`)
fn parse_addr(url: &str, default_port: u16) -> Result<(String, String), ConnectionFailure> {
    let rest = url
        .strip_prefix("tcp://")
        .or_else(|| url.strip_prefix("https://"))
        .ok_or_else(|| {
            ConnectionFailure::InvalidConfig(format!(
                "host URL {} must use tcp:// or https://",
                url
            ))
        })?;
    let rest = rest.trim_end_matches('/');
    if rest.is_empty() {
        return Err(ConnectionFailure::InvalidConfig(format!(
            "host URL {} has no address",
            url
        )));
    }

    let (name, port) = split_host_port(rest, default_port)?;
    // IPv6 literals go back into brackets for the dial string
    let addr = if name.contains(':') {
        format!("[{}]:{}", name, port)
    } else {
        format!("{}:{}", name, port)
    };
    Ok((name, addr))
}

/// Assemble the rustls client configuration from vault material
fn client_tls_config(
    host: &HostDescriptor,
    credentials: &CredentialSet,
) -> Result<rustls::ClientConfig, ConnectionFailure> {
    // ring is the process-wide crypto provider; installing twice is a no-op
    rustls::crypto::ring::default_provider().install_default().ok();

    let builder = if let Some(ca_pem) = &credentials.tls_ca {
        let mut roots = rustls::RootCertStore::empty();
        for cert in parse_certs(ca_pem, "tls_ca")? {
            roots.add(cert).map_err(|e| {
                ConnectionFailure::InvalidConfig(format!("CA certificate rejected: {}", e))
            })?;
        }
        rustls::ClientConfig::builder().with_root_certificates(roots)
    } else if host.allow_insecure {
        warn!(
            "host {}: TLS server verification DISABLED (allow_insecure)",
            host.id
        );
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(SkipServerVerification::new())
    } else {
        return Err(ConnectionFailure::InvalidConfig(
            "TLS requested but no CA certificate stored and allow_insecure is off".to_string(),
        ));
    };

    match (&credentials.tls_cert, &credentials.tls_key) {
        (Some(cert_pem), Some(key_pem)) => {
            let certs = parse_certs(cert_pem, "tls_cert")?;
            let key = parse_key(key_pem)?;
            builder.with_client_auth_cert(certs, key).map_err(|e| {
                ConnectionFailure::InvalidConfig(format!("client certificate rejected: {}", e))
            })
        }
        (None, None) => Ok(builder.with_no_client_auth()),
        _ => Err(ConnectionFailure::InvalidConfig(
            "mutual TLS requires both tls_cert and tls_key".to_string(),
        )),
    }
}

fn parse_certs(
    pem: &[u8],
    what: &str,
) -> Result<Vec<CertificateDer<'static>>, ConnectionFailure> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<_, _>>()
        .map_err(|e| ConnectionFailure::InvalidConfig(format!("{} is not valid PEM: {}", what, e)))?;
    if certs.is_empty() {
        return Err(ConnectionFailure::InvalidConfig(format!(
            "{} contains no certificates",
            what
        )));
    }
    Ok(certs)
}

fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, ConnectionFailure> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| ConnectionFailure::InvalidConfig(format!("tls_key is not valid PEM: {}", e)))?
        .ok_or_else(|| ConnectionFailure::InvalidConfig("tls_key contains no private key".to_string()))
}

/// Accepts any server certificate. Only reachable behind the per-host
/// `allow_insecure` flag.
#[derive(Debug)]
struct SkipServerVerification(Arc<rustls::crypto::CryptoProvider>);

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self(Arc::new(rustls::crypto::ring::default_provider())))
    }
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ConnectionType;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_parse_addr_with_and_without_port() {
        assert_eq!(
            parse_addr("tcp://10.0.0.1:2380", 2375).unwrap(),
            ("10.0.0.1".to_string(), "10.0.0.1:2380".to_string())
        );
        assert_eq!(
            parse_addr("tcp://engine.internal", 2375).unwrap(),
            ("engine.internal".to_string(), "engine.internal:2375".to_string())
        );
        assert_eq!(
            parse_addr("https://engine.internal/", 2376).unwrap().1,
            "engine.internal:2376"
        );
        assert!(parse_addr("unix:///x", 2375).is_err());
        assert!(parse_addr("tcp://host:notaport", 2375).is_err());
    }

    #[test]
    fn test_parse_addr_ipv6() {
        assert_eq!(
            parse_addr("tcp://[::1]:2380", 2375).unwrap(),
            ("::1".to_string(), "[::1]:2380".to_string())
        );
        assert_eq!(
            parse_addr("tcp://[fe80::1]", 2375).unwrap().1,
            "[fe80::1]:2375"
        );
        assert!(parse_addr("tcp://::1", 2375).is_err());
    }

    #[test]
    fn test_tls_without_ca_requires_opt_in() {
        let mut host =
            HostDescriptor::new("edge", ConnectionType::Tcp, "https://engine.internal:2376");
        let credentials = CredentialSet::default();

        let err = client_tls_config(&host, &credentials).unwrap_err();
        assert!(matches!(err, ConnectionFailure::InvalidConfig(_)));

        host.allow_insecure = true;
        client_tls_config(&host, &credentials).unwrap();
    }

    #[test]
    fn test_cert_without_key_rejected() {
        let mut host =
            HostDescriptor::new("edge", ConnectionType::Tcp, "https://engine.internal:2376");
        host.allow_insecure = true;
        let credentials = CredentialSet {
            tls_cert: Some(zeroize::Zeroizing::new(b"-----BEGIN CERTIFICATE-----".to_vec())),
            ..Default::default()
        };
        assert!(client_tls_config(&host, &credentials).is_err());
    }

    #[tokio::test]
    async fn test_plain_tcp_build() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            for body in [
                "OK".to_string(),
                r#"{"Version":"24.0.7","ApiVersion":"1.43","Os":"linux","Arch":"aarch64"}"#
                    .to_string(),
            ] {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 1024];
                let _ = stream.read(&mut buf).await.unwrap();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                stream.write_all(response.as_bytes()).await.unwrap();
            }
        });

        let host = HostDescriptor::new(
            "edge",
            ConnectionType::Tcp,
            &format!("tcp://{}", addr),
        );
        let built = build(&host, &CredentialSet::default(), &ConnectionConfig::default())
            .await
            .unwrap();
        assert_eq!(built.engine.version, "24.0.7");
        assert_eq!(built.engine.arch, "aarch64");
    }
}
