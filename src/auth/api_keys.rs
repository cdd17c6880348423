//! API Key Management
//! Mission: Issue, validate, and revoke machine credentials
//!
//! Key format: `vp_<environment>_<32 lowercase hex>`.

use crate::error::ApiError;
use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::RwLock;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ApiKey {
    pub key_id: String,
    pub api_key: String,
    pub tenant_id: String,
    pub environment: String,
    pub created_at: String,
    pub revoked_at: Option<String>,
}

/// API key manager backed by the api_keys table with a read-through cache.
pub struct ApiKeyManager {
    db_path: String,
    cache: RwLock<HashMap<String, ApiKey>>,
}

impl ApiKeyManager {
    pub fn new(db_path: &str) -> Result<Self> {
        let manager = Self {
            db_path: db_path.to_string(),
            cache: RwLock::new(HashMap::new()),
        };
        if let Err(e) = manager.init_db() {
            tracing::warn!(db_path, error = %e, "API key store init failed - starting degraded");
        }
        Ok(manager)
    }

    fn init_db(&self) -> Result<()> {
        let conn = Connection::open(&self.db_path)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS api_keys (
                key_id TEXT PRIMARY KEY,
                api_key TEXT UNIQUE NOT NULL,
                tenant_id TEXT NOT NULL,
                environment TEXT NOT NULL,
                created_at TEXT NOT NULL,
                revoked_at TEXT
            )",
            [],
        )?;

        Ok(())
    }

    /// Generate and persist a new key for a tenant.
    pub fn generate(&self, tenant_id: &str, environment: &str) -> Result<ApiKey> {
        if environment != "sandbox" && environment != "production" {
            anyhow::bail!("Invalid environment: {environment}");
        }

        let key = ApiKey {
            key_id: Uuid::new_v4().to_string(),
            api_key: format!("vp_{}_{}", environment, Uuid::new_v4().simple()),
            tenant_id: tenant_id.to_string(),
            environment: environment.to_string(),
            created_at: Utc::now().to_rfc3339(),
            revoked_at: None,
        };

        let conn = Connection::open(&self.db_path)?;
        conn.execute(
            "INSERT INTO api_keys (key_id, api_key, tenant_id, environment, created_at, revoked_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
            params![
                key.key_id,
                key.api_key,
                key.tenant_id,
                key.environment,
                key.created_at,
            ],
        )
        .context("Failed to insert API key")?;

        self.cache.write().insert(key.api_key.clone(), key.clone());

        info!(tenant_id, key_id = %key.key_id, environment, "API key generated");
        Ok(key)
    }

    /// Validate a key string, returning `(tenant_id, environment)`.
    pub fn validate(&self, api_key: &str) -> Result<(String, String), ApiError> {
        if let Some(cached) = self.cache.read().get(api_key) {
            if cached.revoked_at.is_some() {
                return Err(ApiError::AuthInvalid("Invalid or revoked API key".into()));
            }
            return Ok((cached.tenant_id.clone(), cached.environment.clone()));
        }

        let key = self
            .lookup(api_key)
            .map_err(ApiError::Internal)?
            .ok_or_else(|| ApiError::AuthInvalid("Invalid or revoked API key".into()))?;

        if key.revoked_at.is_some() {
            return Err(ApiError::AuthInvalid("Invalid or revoked API key".into()));
        }

        let result = (key.tenant_id.clone(), key.environment.clone());
        self.cache.write().insert(api_key.to_string(), key);
        Ok(result)
    }

    fn lookup(&self, api_key: &str) -> Result<Option<ApiKey>> {
        let conn = Connection::open(&self.db_path)?;

        let key = conn
            .query_row(
                "SELECT key_id, api_key, tenant_id, environment, created_at, revoked_at
                 FROM api_keys WHERE api_key = ?1",
                params![api_key],
                |row| {
                    Ok(ApiKey {
                        key_id: row.get(0)?,
                        api_key: row.get(1)?,
                        tenant_id: row.get(2)?,
                        environment: row.get(3)?,
                        created_at: row.get(4)?,
                        revoked_at: row.get(5)?,
                    })
                },
            )
            .optional()?;

        Ok(key)
    }

    /// Revoke by key id; subsequent validation fails.
    pub fn revoke(&self, key_id: &str, tenant_id: &str) -> Result<bool> {
        let conn = Connection::open(&self.db_path)?;

        let rows = conn.execute(
            "UPDATE api_keys SET revoked_at = ?1
             WHERE key_id = ?2 AND tenant_id = ?3 AND revoked_at IS NULL",
            params![Utc::now().to_rfc3339(), key_id, tenant_id],
        )?;

        if rows > 0 {
            // Drop any cached copies of this key.
            self.cache.write().retain(|_, k| k.key_id != key_id);
            info!(key_id, "API key revoked");
        }

        Ok(rows > 0)
    }

    pub fn list_for_tenant(&self, tenant_id: &str) -> Result<Vec<ApiKey>> {
        let conn = Connection::open(&self.db_path)?;

        let mut stmt = conn.prepare(
            "SELECT key_id, api_key, tenant_id, environment, created_at, revoked_at
             FROM api_keys WHERE tenant_id = ?1 ORDER BY created_at DESC",
        )?;

        let keys = stmt
            .query_map(params![tenant_id], |row| {
                Ok(ApiKey {
                    key_id: row.get(0)?,
                    api_key: row.get(1)?,
                    tenant_id: row.get(2)?,
                    environment: row.get(3)?,
                    created_at: row.get(4)?,
                    revoked_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::NamedTempFile;

    fn create_test_manager() -> (ApiKeyManager, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let manager = ApiKeyManager::new(temp_file.path().to_str().unwrap()).unwrap();
        (manager, temp_file)
    }

    fn key_format_ok(key: &str) -> bool {
        let rest = match (key.strip_prefix("vp_sandbox_"), key.strip_prefix("vp_production_")) {
            (Some(rest), _) | (_, Some(rest)) => rest,
            _ => return false,
        };
        rest.len() == 32 && rest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
    }

    #[test]
    fn test_generate_and_validate() {
        let (manager, _temp) = create_test_manager();

        let key = manager.generate("tenant-1", "sandbox").unwrap();
        assert!(key_format_ok(&key.api_key));

        let (tenant, env) = manager.validate(&key.api_key).unwrap();
        assert_eq!(tenant, "tenant-1");
        assert_eq!(env, "sandbox");
    }

    #[test]
    fn test_unknown_key_rejected() {
        let (manager, _temp) = create_test_manager();
        assert!(manager.validate("vp_sandbox_00000000000000000000000000000000").is_err());
    }

    #[test]
    fn test_invalid_environment_rejected() {
        let (manager, _temp) = create_test_manager();
        assert!(manager.generate("tenant-1", "staging").is_err());
    }

    #[test]
    fn test_revoked_key_fails_validation() {
        let (manager, _temp) = create_test_manager();

        let key = manager.generate("tenant-1", "production").unwrap();
        assert!(manager.validate(&key.api_key).is_ok());

        assert!(manager.revoke(&key.key_id, "tenant-1").unwrap());
        assert!(manager.validate(&key.api_key).is_err());
    }

    #[test]
    fn test_revoke_checks_tenant_ownership() {
        let (manager, _temp) = create_test_manager();

        let key = manager.generate("tenant-1", "sandbox").unwrap();
        assert!(!manager.revoke(&key.key_id, "tenant-2").unwrap());
        assert!(manager.validate(&key.api_key).is_ok());
    }

    #[test]
    fn test_survives_cache_miss() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap().to_string();

        let key = {
            let manager = ApiKeyManager::new(&path).unwrap();
            manager.generate("tenant-1", "sandbox").unwrap()
        };

        // Fresh manager, empty cache: must hit the db.
        let manager = ApiKeyManager::new(&path).unwrap();
        let (tenant, _) = manager.validate(&key.api_key).unwrap();
        assert_eq!(tenant, "tenant-1");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_generated_keys_are_well_formed_and_distinct(
            env_production in proptest::bool::ANY
        ) {
            let (manager, _temp) = create_test_manager();
            let environment = if env_production { "production" } else { "sandbox" };

            let a = manager.generate("tenant-x", environment).unwrap();
            let b = manager.generate("tenant-x", environment).unwrap();

            prop_assert!(key_format_ok(&a.api_key));
            prop_assert!(key_format_ok(&b.api_key));
            prop_assert_ne!(&a.api_key, &b.api_key);

            let (tenant, env) = manager.validate(&a.api_key).unwrap();
            prop_assert_eq!(tenant, "tenant-x");
            prop_assert_eq!(env, environment);
        }
    }
}
