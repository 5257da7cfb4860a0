//! Flotilla - a control plane for fleets of Docker and Swarm engines
//!
//! This is the main CLI entry point for Flotilla.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use flotilla::config::FlotillaConfig;
use flotilla::daemon::{CredentialItem, FlotillaDaemon};
use flotilla::engine::{Connector, EngineClient};
use flotilla::host::{ConnectionType, CredentialType, HostDescriptor};
use flotilla::vault::CredentialVault;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Flotilla - engine fleet control plane
#[derive(Parser)]
#[command(name = "flotilla")]
#[command(version)]
#[command(about = "A control plane for managing fleets of Docker and Swarm engines", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the Flotilla daemon
    Daemon,

    /// Manage hosts
    #[command(subcommand)]
    Hosts(HostsCommand),

    /// Inspect or reset a host's circuit breaker
    #[command(subcommand)]
    Breaker(BreakerCommand),

    /// Drop a host's cached connection
    Invalidate {
        /// Host ID
        host: String,
    },
}

#[derive(Subcommand)]
enum HostsCommand {
    /// Register a new host
    Add {
        /// Human-readable host name
        name: String,
        /// Connection type: unix, tcp or ssh
        #[arg(long = "type")]
        connection_type: String,
        /// Host URL (unix://, tcp://, https:// or ssh://)
        #[arg(long)]
        url: String,
        /// Allow TLS without server verification
        #[arg(long)]
        allow_insecure: bool,
        /// PEM client certificate file
        #[arg(long)]
        tls_cert: Option<PathBuf>,
        /// PEM client key file
        #[arg(long)]
        tls_key: Option<PathBuf>,
        /// PEM CA bundle file
        #[arg(long)]
        tls_ca: Option<PathBuf>,
        /// SSH private key file
        #[arg(long)]
        ssh_key: Option<PathBuf>,
        /// SSH username
        #[arg(long)]
        ssh_user: Option<String>,
        /// Name of an environment variable holding the SSH password
        #[arg(long)]
        ssh_password_env: Option<String>,
    },

    /// List hosts
    #[command(name = "ls")]
    List,

    /// Remove a host
    #[command(name = "rm")]
    Remove {
        /// Host ID
        host: String,
    },

    /// Force a connection attempt and show the result
    Connect {
        /// Host ID
        host: String,
    },
}

#[derive(Subcommand)]
enum BreakerCommand {
    /// Show breaker state for a host
    Status {
        /// Host ID
        host: String,
    },
    /// Force a host's breaker closed
    Reset {
        /// Host ID
        host: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = FlotillaConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Daemon => run_daemon(config).await,
        Commands::Hosts(command) => run_hosts(config, command).await,
        Commands::Breaker(command) => run_breaker(config, command).await,
        Commands::Invalidate { host } => {
            let response =
                api_request(&config, "POST", &format!("/hosts/{}/invalidate", host), None).await?;
            println!("{}", response);
            Ok(())
        }
    }
}

async fn run_daemon(config: FlotillaConfig) -> anyhow::Result<()> {
    let master_key = config.master_key()?;
    let daemon = FlotillaDaemon::new(config, &master_key)?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    daemon.run(shutdown_rx).await
}

async fn run_hosts(config: FlotillaConfig, command: HostsCommand) -> anyhow::Result<()> {
    match command {
        HostsCommand::Add {
            name,
            connection_type,
            url,
            allow_insecure,
            tls_cert,
            tls_key,
            tls_ca,
            ssh_key,
            ssh_user,
            ssh_password_env,
        } => {
            let connection_type = match connection_type.as_str() {
                "unix" => ConnectionType::Unix,
                "tcp" => ConnectionType::Tcp,
                "ssh" => ConnectionType::Ssh,
                other => bail!("unknown connection type: {} (use unix, tcp or ssh)", other),
            };

            // credentials are encrypted here, client-side; only ciphertext
            // crosses the daemon socket
            let vault = CredentialVault::new(&config.master_key()?, &config.vault)?;
            let mut credentials = Vec::new();
            for (credential_type, path) in [
                (CredentialType::TlsCert, tls_cert),
                (CredentialType::TlsKey, tls_key),
                (CredentialType::TlsCa, tls_ca),
                (CredentialType::SshPrivateKey, ssh_key),
            ] {
                if let Some(path) = path {
                    let value = std::fs::read(&path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    credentials.push(CredentialItem {
                        credential_type,
                        encrypted_value: vault.encrypt(&value),
                    });
                }
            }
            if let Some(user) = ssh_user {
                credentials.push(CredentialItem {
                    credential_type: CredentialType::SshUser,
                    encrypted_value: vault.encrypt(user.as_bytes()),
                });
            }
            if let Some(var) = ssh_password_env {
                let password = std::env::var(&var)
                    .with_context(|| format!("environment variable {} is not set", var))?;
                credentials.push(CredentialItem {
                    credential_type: CredentialType::SshPassword,
                    encrypted_value: vault.encrypt(password.as_bytes()),
                });
            }

            let body = json!({
                "name": name,
                "connection_type": connection_type,
                "host_url": url,
                "allow_insecure": allow_insecure,
                "credentials": credentials,
            })
            .to_string();
            let response = api_request(&config, "POST", "/hosts", Some(&body)).await?;
            let host: HostDescriptor = serde_json::from_str(&response)?;
            println!("{}", host.id);
            Ok(())
        }
        HostsCommand::List => {
            let response = api_request(&config, "GET", "/hosts", None).await?;
            let hosts: Vec<HostDescriptor> = serde_json::from_str(&response)?;
            println!(
                "{:<38} {:<16} {:<6} {:<12} {:<10} ENGINE",
                "ID", "NAME", "TYPE", "STATUS", "ACTIVE"
            );
            for host in hosts {
                println!(
                    "{:<38} {:<16} {:<6} {:<12} {:<10} {}",
                    host.id,
                    host.name,
                    host.connection_type,
                    host.status,
                    host.is_active,
                    host.docker_version.as_deref().unwrap_or("-"),
                );
            }
            Ok(())
        }
        HostsCommand::Remove { host } => {
            api_request(&config, "DELETE", &format!("/hosts/{}", host), None).await?;
            println!("{}", host);
            Ok(())
        }
        HostsCommand::Connect { host } => {
            let response =
                api_request(&config, "POST", &format!("/hosts/{}/connect", host), None).await?;
            let host: HostDescriptor = serde_json::from_str(&response)?;
            println!(
                "{}: {} (engine {} api {}, {}/{})",
                host.name,
                host.status,
                host.docker_version.as_deref().unwrap_or("-"),
                host.api_version.as_deref().unwrap_or("-"),
                host.os_type.as_deref().unwrap_or("-"),
                host.architecture.as_deref().unwrap_or("-"),
            );
            Ok(())
        }
    }
}

async fn run_breaker(config: FlotillaConfig, command: BreakerCommand) -> anyhow::Result<()> {
    let path = match &command {
        BreakerCommand::Status { host } => format!("/hosts/{}/breaker", host),
        BreakerCommand::Reset { host } => format!("/hosts/{}/breaker/reset", host),
    };
    let method = match &command {
        BreakerCommand::Status { .. } => "GET",
        BreakerCommand::Reset { .. } => "POST",
    };
    let response = api_request(&config, method, &path, None).await?;
    println!("{}", response);
    Ok(())
}

/// One request against the daemon's operational socket
async fn api_request(
    config: &FlotillaConfig,
    method: &str,
    path: &str,
    body: Option<&str>,
) -> anyhow::Result<String> {
    let client = EngineClient::new(
        Connector::Unix(config.socket_path.clone()),
        Duration::from_secs(60),
    );
    let response = client
        .request(method, path, body.map(str::as_bytes))
        .await
        .with_context(|| {
            format!(
                "cannot reach the flotilla daemon at {} (is it running?)",
                config.socket_path.display()
            )
        })?;

    let text = String::from_utf8_lossy(&response.body).into_owned();
    if response.status != 200 {
        let message = serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
            .unwrap_or(text);
        bail!("{} (status {})", message, response.status);
    }
    Ok(text)
}
