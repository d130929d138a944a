//! Tenant records. Created and edited by the portal UI; the orchestration
//! core only reads them (the upsert exists for config import and tests).

use chrono::Utc;
use serde_json::Value;

use tillsync_protocol::is_valid_tenant_key;

use crate::error::{Result, StoreError};
use crate::models::Tenant;
use crate::Store;

impl Store {
    pub async fn upsert_tenant(
        &self,
        tenant_key: &str,
        display_name: &str,
        active: bool,
        config: &Value,
        checksum: &str,
    ) -> Result<Tenant> {
        if !is_valid_tenant_key(tenant_key) {
            return Err(StoreError::InvalidJob(format!(
                "invalid tenant key: {tenant_key}"
            )));
        }
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO tenants (tenant_key, display_name, active, config, checksum, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (tenant_key) DO UPDATE SET
                display_name = excluded.display_name,
                active = excluded.active,
                config = excluded.config,
                checksum = excluded.checksum,
                config_version = config_version + 1,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(tenant_key)
        .bind(display_name)
        .bind(active)
        .bind(config.to_string())
        .bind(checksum)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;
        let tenant = sqlx::query_as::<_, Tenant>("SELECT * FROM tenants WHERE tenant_key = ?")
            .bind(tenant_key)
            .fetch_one(self.pool())
            .await?;
        Ok(tenant)
    }

    pub async fn get_tenant(&self, tenant_key: &str) -> Result<Option<Tenant>> {
        let tenant = sqlx::query_as::<_, Tenant>("SELECT * FROM tenants WHERE tenant_key = ?")
            .bind(tenant_key)
            .fetch_optional(self.pool())
            .await?;
        Ok(tenant)
    }

    pub async fn list_active_tenants(&self) -> Result<Vec<Tenant>> {
        let tenants = sqlx::query_as::<_, Tenant>(
            "SELECT * FROM tenants WHERE active = 1 ORDER BY tenant_key",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(tenants)
    }

    pub async fn tenant_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tenants")
            .fetch_one(self.pool())
            .await?;
        Ok(count)
    }
}
