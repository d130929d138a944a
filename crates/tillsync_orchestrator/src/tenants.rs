//! Read-only view of tenant configuration.
//!
//! Tenant configs live as `companies/<tenant>.json` files maintained by the
//! portal UI. This module loads them, computes a content checksum for drift
//! detection, and can mirror them into the store's tenant table so the rest
//! of the core reads from one place.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::warn;

use tillsync_protocol::is_valid_tenant_key;
use tillsync_store::Store;

/// One tenant config as read from disk.
#[derive(Debug, Clone)]
pub struct TenantFileConfig {
    pub tenant_key: String,
    pub display_name: String,
    pub active: bool,
    pub config: Value,
    pub checksum: String,
}

impl TenantFileConfig {
    /// Basename of this tenant's rolling metadata file in the uploaded tree.
    pub fn metadata_basename(&self) -> String {
        format!("last_{}_transform.json", self.tenant_key)
    }
}

/// Whether a tenant config names both sales-source credential env keys.
pub fn has_credential_env_keys(config: &Value) -> bool {
    let epos = config.get("epos").and_then(|v| v.as_object());
    let non_empty = |key: &str| {
        epos.and_then(|map| map.get(key))
            .and_then(|v| v.as_str())
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false)
    };
    non_empty("username_env_key") && non_empty("password_env_key")
}

/// The accounting realm id, when connected.
pub fn realm_id(config: &Value) -> Option<&str> {
    config
        .get("qbo")
        .and_then(|v| v.get("realm_id"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
}

pub struct TenantConfigReader {
    companies_dir: PathBuf,
}

impl TenantConfigReader {
    pub fn new(companies_dir: impl Into<PathBuf>) -> Self {
        Self {
            companies_dir: companies_dir.into(),
        }
    }

    /// Load one tenant's config file. `None` when the file does not exist.
    pub fn load(&self, tenant_key: &str) -> Result<Option<TenantFileConfig>> {
        if !is_valid_tenant_key(tenant_key) {
            anyhow::bail!("invalid tenant key: {tenant_key}");
        }
        let path = self.companies_dir.join(format!("{tenant_key}.json"));
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(self.load_path(&path, tenant_key)?))
    }

    fn load_path(&self, path: &Path, tenant_key: &str) -> Result<TenantFileConfig> {
        let raw = std::fs::read(path)
            .with_context(|| format!("reading tenant config {}", path.display()))?;
        let config: Value = serde_json::from_slice(&raw)
            .with_context(|| format!("parsing tenant config {}", path.display()))?;
        let checksum = format!("{:x}", Sha256::digest(&raw));
        let display_name = config
            .get("display_name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(tenant_key)
            .to_string();
        let active = config.get("active").and_then(|v| v.as_bool()).unwrap_or(true);
        Ok(TenantFileConfig {
            tenant_key: tenant_key.to_string(),
            display_name,
            active,
            config,
            checksum,
        })
    }

    /// All tenant configs, ordered by key. Unparseable files are skipped
    /// with a warning.
    pub fn list(&self) -> Vec<TenantFileConfig> {
        let Ok(entries) = std::fs::read_dir(&self.companies_dir) else {
            return Vec::new();
        };
        let mut keys: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("json"))
            .filter_map(|path| {
                path.file_stem()
                    .and_then(|stem| stem.to_str())
                    .map(str::to_string)
            })
            .filter(|key| is_valid_tenant_key(key))
            .collect();
        keys.sort();

        let mut configs = Vec::new();
        for key in keys {
            match self.load(&key) {
                Ok(Some(config)) => configs.push(config),
                Ok(None) => {}
                Err(e) => warn!("skipping tenant config {key}: {e}"),
            }
        }
        configs
    }

    /// Mirror all on-disk configs into the store. Returns how many records
    /// were written.
    pub async fn import_into(&self, store: &Store) -> Result<usize> {
        let mut imported = 0;
        for tenant in self.list() {
            store
                .upsert_tenant(
                    &tenant.tenant_key,
                    &tenant.display_name,
                    tenant.active,
                    &tenant.config,
                    &tenant.checksum,
                )
                .await?;
            imported += 1;
        }
        Ok(imported)
    }

    /// Whether a store record has drifted from the on-disk file.
    pub async fn has_drifted(&self, store: &Store, tenant_key: &str) -> Result<bool> {
        let Some(on_disk) = self.load(tenant_key)? else {
            return Ok(false);
        };
        let Some(record) = store.get_tenant(tenant_key).await? else {
            return Ok(true);
        };
        Ok(record.checksum != on_disk.checksum)
    }
}
