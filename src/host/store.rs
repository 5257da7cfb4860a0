//! Host store: the boundary to the relational store
//!
//! The connection layer only ever talks to [`HostStore`]. The provided
//! [`FileHostStore`] keeps hosts and credentials in a JSON file; a real
//! deployment can substitute a database-backed implementation behind the
//! same trait. Status writes go through this boundary so the transition
//! invariant (pending never re-entered after a first probe) is enforced
//! in one place.

use super::{Credential, CredentialType, HostDescriptor, HostStatus};
use crate::engine::EngineVersion;
use crate::error::StoreError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, info};

/// Read/write access to host records and credentials
pub trait HostStore: Send + Sync {
    /// All host records
    fn list_hosts(&self) -> Result<Vec<HostDescriptor>, StoreError>;

    /// One host by id
    fn get_host(&self, host_id: &str) -> Result<Option<HostDescriptor>, StoreError>;

    /// Insert or replace a host record
    fn save_host(&self, host: HostDescriptor) -> Result<(), StoreError>;

    /// Delete a host and its credentials
    fn delete_host(&self, host_id: &str) -> Result<(), StoreError>;

    /// Credentials attached to a host
    fn credentials(&self, host_id: &str) -> Result<Vec<Credential>, StoreError>;

    /// Attach or replace a credential (keyed by type)
    fn put_credential(&self, credential: Credential) -> Result<(), StoreError>;

    /// Record a successful connection: status, engine facts, probe time
    fn record_connection_success(
        &self,
        host_id: &str,
        engine: &EngineVersion,
    ) -> Result<(), StoreError>;

    /// Record a failed connection attempt: status per the failure policy,
    /// probe time
    fn record_connection_failure(&self, host_id: &str) -> Result<(), StoreError>;

    /// Update only `last_health_check` (used when the breaker short-circuits
    /// a probe and the last known status stands)
    fn touch_health_check(&self, host_id: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    hosts: HashMap<String, HostDescriptor>,
    /// host id -> credential type -> credential
    credentials: HashMap<String, HashMap<CredentialType, Credential>>,
}

/// JSON-file-backed host store
pub struct FileHostStore {
    path: PathBuf,
    data: RwLock<StoreData>,
}

impl FileHostStore {
    /// Open a store, loading existing data when the file is present
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let data = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            if text.trim().is_empty() {
                StoreData::default()
            } else {
                serde_json::from_str(&text)?
            }
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            StoreData::default()
        };

        info!(
            "host store opened at {} ({} hosts)",
            path.display(),
            data.hosts.len()
        );

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    /// Persist the current state. Writes to a sibling temp file first so a
    /// crash mid-write cannot truncate the store.
    fn persist(&self, data: &StoreData) -> Result<(), StoreError> {
        let text = serde_json::to_string_pretty(data)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn mutate_host<F>(&self, host_id: &str, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut HostDescriptor),
    {
        let mut data = self.data.write().expect("host store lock poisoned");
        let host = data
            .hosts
            .get_mut(host_id)
            .ok_or_else(|| StoreError::HostNotFound(host_id.to_string()))?;
        f(host);
        self.persist(&data)
    }
}

impl HostStore for FileHostStore {
    fn list_hosts(&self) -> Result<Vec<HostDescriptor>, StoreError> {
        let data = self.data.read().expect("host store lock poisoned");
        let mut hosts: Vec<HostDescriptor> = data.hosts.values().cloned().collect();
        hosts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(hosts)
    }

    fn get_host(&self, host_id: &str) -> Result<Option<HostDescriptor>, StoreError> {
        let data = self.data.read().expect("host store lock poisoned");
        Ok(data.hosts.get(host_id).cloned())
    }

    fn save_host(&self, host: HostDescriptor) -> Result<(), StoreError> {
        let mut data = self.data.write().expect("host store lock poisoned");
        data.hosts.insert(host.id.clone(), host);
        self.persist(&data)
    }

    fn delete_host(&self, host_id: &str) -> Result<(), StoreError> {
        let mut data = self.data.write().expect("host store lock poisoned");
        if data.hosts.remove(host_id).is_none() {
            return Err(StoreError::HostNotFound(host_id.to_string()));
        }
        data.credentials.remove(host_id);
        self.persist(&data)
    }

    fn credentials(&self, host_id: &str) -> Result<Vec<Credential>, StoreError> {
        let data = self.data.read().expect("host store lock poisoned");
        Ok(data
            .credentials
            .get(host_id)
            .map(|by_type| by_type.values().cloned().collect())
            .unwrap_or_default())
    }

    fn put_credential(&self, credential: Credential) -> Result<(), StoreError> {
        let mut data = self.data.write().expect("host store lock poisoned");
        if !data.hosts.contains_key(&credential.host_id) {
            return Err(StoreError::HostNotFound(credential.host_id.clone()));
        }
        data.credentials
            .entry(credential.host_id.clone())
            .or_default()
            .insert(credential.credential_type, credential);
        self.persist(&data)
    }

    fn record_connection_success(
        &self,
        host_id: &str,
        engine: &EngineVersion,
    ) -> Result<(), StoreError> {
        self.mutate_host(host_id, |host| {
            host.status = HostStatus::Healthy;
            host.last_health_check = Some(Utc::now());
            host.docker_version = Some(engine.version.clone());
            host.api_version = Some(engine.api_version.clone());
            host.os_type = Some(engine.os.clone());
            host.architecture = Some(engine.arch.clone());
            debug!(
                "host {} marked healthy (engine {})",
                host.id, engine.version
            );
        })
    }

    fn record_connection_failure(&self, host_id: &str) -> Result<(), StoreError> {
        self.mutate_host(host_id, |host| {
            let next = host.status.after_failure();
            debug!("host {} status {} -> {}", host.id, host.status, next);
            host.status = next;
            host.last_health_check = Some(Utc::now());
        })
    }

    fn touch_health_check(&self, host_id: &str) -> Result<(), StoreError> {
        self.mutate_host(host_id, |host| {
            host.last_health_check = Some(Utc::now());
        })
    }
}
