//! Tenant & User Storage
//! Mission: Persist tenant accounts, dashboard users, and their credentials

use anyhow::{Context, Result};
use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::{Duration, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};
use uuid::Uuid;

/// Default monthly quota for new (Sandbox) tenants.
const DEFAULT_SANDBOX_QUOTA: i64 = 100;

/// A paying customer account; the unit of isolation, quota, and rate limiting.
#[derive(Debug, Clone)]
pub struct Tenant {
    pub tenant_id: String,
    pub email: String,
    pub subscription_tier: String,
    pub monthly_quota: i64,
    pub current_usage: i64,
    pub billing_cycle_start: NaiveDate,
    pub billing_cycle_end: NaiveDate,
    /// Secret used for webhook signatures.
    pub api_secret: String,
}

/// Dashboard user owned by a tenant.
#[derive(Debug, Clone)]
pub struct User {
    pub user_id: String,
    pub tenant_id: String,
    pub email: String,
    pub password_hash: String,
    pub role: String,
}

pub struct TenantStore {
    db_path: String,
}

impl TenantStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let store = Self {
            db_path: db_path.to_string(),
        };
        // A store that cannot initialize at boot is degraded, not fatal;
        // individual calls surface their own errors.
        if let Err(e) = store.init_db() {
            warn!(db_path, error = %e, "Tenant store init failed - starting degraded");
        }
        Ok(store)
    }

    fn init_db(&self) -> Result<()> {
        let conn = Connection::open(&self.db_path)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS tenants (
                tenant_id TEXT PRIMARY KEY,
                email TEXT NOT NULL,
                subscription_tier TEXT NOT NULL,
                monthly_quota INTEGER NOT NULL,
                current_usage INTEGER NOT NULL DEFAULT 0,
                billing_cycle_start TEXT NOT NULL,
                billing_cycle_end TEXT NOT NULL,
                api_secret TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                email TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                role TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (tenant_id) REFERENCES tenants(tenant_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS branding_configs (
                tenant_id TEXT PRIMARY KEY,
                logo_url TEXT,
                primary_color TEXT NOT NULL DEFAULT '#1E40AF',
                secondary_color TEXT NOT NULL DEFAULT '#3B82F6',
                button_color TEXT NOT NULL DEFAULT '#10B981',
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    /// Create a tenant on a fresh 30-day Sandbox billing cycle.
    pub fn create_tenant(&self, tenant_id: &str, email: &str) -> Result<Tenant> {
        let today = Utc::now().date_naive();
        let tenant = Tenant {
            tenant_id: tenant_id.to_string(),
            email: email.to_string(),
            subscription_tier: "Sandbox".to_string(),
            monthly_quota: DEFAULT_SANDBOX_QUOTA,
            current_usage: 0,
            billing_cycle_start: today,
            billing_cycle_end: today + Duration::days(30),
            api_secret: Uuid::new_v4().simple().to_string(),
        };

        let conn = Connection::open(&self.db_path)?;
        conn.execute(
            "INSERT OR IGNORE INTO tenants (
                tenant_id, email, subscription_tier, monthly_quota,
                current_usage, billing_cycle_start, billing_cycle_end, api_secret
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                tenant.tenant_id,
                tenant.email,
                tenant.subscription_tier,
                tenant.monthly_quota,
                tenant.current_usage,
                tenant.billing_cycle_start.to_string(),
                tenant.billing_cycle_end.to_string(),
                tenant.api_secret,
            ],
        )
        .context("Failed to insert tenant")?;

        info!(tenant_id, "Tenant record created");
        Ok(tenant)
    }

    /// Dev convenience: sessions from tenants minted by in-memory auth still
    /// need a quota row. No-op when the tenant already exists.
    pub fn ensure_tenant_exists(&self, tenant_id: &str) -> Result<()> {
        if self.get_tenant(tenant_id)?.is_some() {
            return Ok(());
        }
        let email = format!("tenant_{}@veraproof.ai", &tenant_id[..tenant_id.len().min(8)]);
        self.create_tenant(tenant_id, &email)?;
        Ok(())
    }

    pub fn get_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>> {
        let conn = Connection::open(&self.db_path)?;

        let tenant = conn
            .query_row(
                "SELECT tenant_id, email, subscription_tier, monthly_quota,
                        current_usage, billing_cycle_start, billing_cycle_end, api_secret
                 FROM tenants WHERE tenant_id = ?1",
                params![tenant_id],
                row_to_tenant,
            )
            .optional()?;

        Ok(tenant)
    }

    /// Webhook-signing secret for a tenant.
    pub fn api_secret(&self, tenant_id: &str) -> Result<Option<String>> {
        Ok(self.get_tenant(tenant_id)?.map(|t| t.api_secret))
    }

    /// Create a user account plus its owning tenant.
    pub fn signup(&self, email: &str, password: &str) -> Result<User> {
        if self.get_user_by_email(email)?.is_some() {
            anyhow::bail!("User already exists");
        }

        let tenant_id = Uuid::new_v4().to_string();
        self.create_tenant(&tenant_id, email)?;

        let password_hash = hash(password, DEFAULT_COST).context("Failed to hash password")?;
        let user = User {
            user_id: Uuid::new_v4().to_string(),
            tenant_id,
            email: email.to_string(),
            password_hash,
            role: "Admin".to_string(),
        };

        let conn = Connection::open(&self.db_path)?;
        conn.execute(
            "INSERT INTO users (user_id, tenant_id, email, password_hash, role, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user.user_id,
                user.tenant_id,
                user.email,
                user.password_hash,
                user.role,
                Utc::now().to_rfc3339(),
            ],
        )
        .context("Failed to insert user")?;

        info!(email, tenant_id = %user.tenant_id, "User created");
        Ok(user)
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let conn = Connection::open(&self.db_path)?;

        let user = conn
            .query_row(
                "SELECT user_id, tenant_id, email, password_hash, role
                 FROM users WHERE email = ?1",
                params![email],
                row_to_user,
            )
            .optional()?;

        Ok(user)
    }

    pub fn get_user_by_id(&self, user_id: &str) -> Result<Option<User>> {
        let conn = Connection::open(&self.db_path)?;

        let user = conn
            .query_row(
                "SELECT user_id, tenant_id, email, password_hash, role
                 FROM users WHERE user_id = ?1",
                params![user_id],
                row_to_user,
            )
            .optional()?;

        Ok(user)
    }

    /// Verify credentials, returning the user on success.
    pub fn login(&self, email: &str, password: &str) -> Result<Option<User>> {
        let Some(user) = self.get_user_by_email(email)? else {
            return Ok(None);
        };

        let valid =
            verify(password, &user.password_hash).context("Failed to verify password")?;
        if !valid {
            warn!(email, "Login with invalid credentials");
            return Ok(None);
        }

        Ok(Some(user))
    }

    /// Branding for a tenant; defaults when no row exists.
    pub fn get_branding(&self, tenant_id: &str) -> Result<crate::models::BrandingConfig> {
        let conn = Connection::open(&self.db_path)?;

        let branding = conn
            .query_row(
                "SELECT logo_url, primary_color, secondary_color, button_color
                 FROM branding_configs WHERE tenant_id = ?1",
                params![tenant_id],
                |row| {
                    Ok(crate::models::BrandingConfig {
                        logo_url: row.get(0)?,
                        primary_color: row.get(1)?,
                        secondary_color: row.get(2)?,
                        button_color: row.get(3)?,
                    })
                },
            )
            .optional()?;

        Ok(branding.unwrap_or_default())
    }

    /// Upsert branding colors after hex validation.
    pub fn update_branding(
        &self,
        tenant_id: &str,
        branding: &crate::models::BrandingConfig,
    ) -> Result<()> {
        for color in [
            &branding.primary_color,
            &branding.secondary_color,
            &branding.button_color,
        ] {
            if !crate::models::BrandingConfig::valid_hex_color(color) {
                anyhow::bail!("Invalid hex color: {color}");
            }
        }

        let conn = Connection::open(&self.db_path)?;
        conn.execute(
            "INSERT INTO branding_configs (
                tenant_id, logo_url, primary_color, secondary_color, button_color, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(tenant_id) DO UPDATE SET
                logo_url = ?2, primary_color = ?3, secondary_color = ?4,
                button_color = ?5, updated_at = ?6",
            params![
                tenant_id,
                branding.logo_url,
                branding.primary_color,
                branding.secondary_color,
                branding.button_color,
                Utc::now().to_rfc3339(),
            ],
        )?;

        Ok(())
    }
}

fn row_to_tenant(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tenant> {
    let start: String = row.get(5)?;
    let end: String = row.get(6)?;
    Ok(Tenant {
        tenant_id: row.get(0)?,
        email: row.get(1)?,
        subscription_tier: row.get(2)?,
        monthly_quota: row.get(3)?,
        current_usage: row.get(4)?,
        billing_cycle_start: start.parse().unwrap_or_else(|_| Utc::now().date_naive()),
        billing_cycle_end: end.parse().unwrap_or_else(|_| Utc::now().date_naive()),
        api_secret: row.get(7)?,
    })
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        user_id: row.get(0)?,
        tenant_id: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        role: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_test_store() -> (TenantStore, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let store = TenantStore::new(temp_file.path().to_str().unwrap()).unwrap();
        (store, temp_file)
    }

    #[test]
    fn test_signup_creates_tenant_and_user() {
        let (store, _temp) = create_test_store();

        let user = store.signup("alice@example.com", "password123").unwrap();
        assert_eq!(user.email, "alice@example.com");
        assert_eq!(user.role, "Admin");

        let tenant = store.get_tenant(&user.tenant_id).unwrap().unwrap();
        assert_eq!(tenant.subscription_tier, "Sandbox");
        assert_eq!(tenant.monthly_quota, DEFAULT_SANDBOX_QUOTA);
        assert_eq!(tenant.current_usage, 0);
        assert!(tenant.billing_cycle_end > tenant.billing_cycle_start);
    }

    #[test]
    fn test_duplicate_signup_fails() {
        let (store, _temp) = create_test_store();

        store.signup("bob@example.com", "pass").unwrap();
        assert!(store.signup("bob@example.com", "other").is_err());
    }

    #[test]
    fn test_login_roundtrip() {
        let (store, _temp) = create_test_store();
        store.signup("carol@example.com", "hunter2hunter2").unwrap();

        let user = store.login("carol@example.com", "hunter2hunter2").unwrap();
        assert!(user.is_some());

        assert!(store.login("carol@example.com", "wrong").unwrap().is_none());
        assert!(store.login("nobody@example.com", "x").unwrap().is_none());
    }

    #[test]
    fn test_password_verification_consistency() {
        let (store, _temp) = create_test_store();
        let user = store.signup("dave@example.com", "s3cret-s3cret").unwrap();

        // Stored hash verifies the original password, repeatedly.
        assert!(verify("s3cret-s3cret", &user.password_hash).unwrap());
        assert!(verify("s3cret-s3cret", &user.password_hash).unwrap());
        assert!(!verify("not-the-password", &user.password_hash).unwrap());
    }

    #[test]
    fn test_ensure_tenant_exists_is_idempotent() {
        let (store, _temp) = create_test_store();

        store.ensure_tenant_exists("tenant-abc-123").unwrap();
        let first = store.get_tenant("tenant-abc-123").unwrap().unwrap();

        store.ensure_tenant_exists("tenant-abc-123").unwrap();
        let second = store.get_tenant("tenant-abc-123").unwrap().unwrap();

        assert_eq!(first.api_secret, second.api_secret);
    }

    #[test]
    fn test_branding_defaults_and_update() {
        let (store, _temp) = create_test_store();

        let branding = store.get_branding("t-1").unwrap();
        assert_eq!(branding.primary_color, "#1E40AF");

        let custom = crate::models::BrandingConfig {
            logo_url: Some("https://cdn.example.com/logo.png".into()),
            primary_color: "#112233".into(),
            secondary_color: "#445566".into(),
            button_color: "#778899".into(),
        };
        store.update_branding("t-1", &custom).unwrap();

        let loaded = store.get_branding("t-1").unwrap();
        assert_eq!(loaded, custom);
    }

    #[test]
    fn test_branding_rejects_invalid_hex() {
        let (store, _temp) = create_test_store();

        let bad = crate::models::BrandingConfig {
            logo_url: None,
            primary_color: "red".into(),
            secondary_color: "#445566".into(),
            button_color: "#778899".into(),
        };
        assert!(store.update_branding("t-1", &bad).is_err());
    }
}
