//! Usage Quotas
//! Mission: Enforce monthly verification quotas with billing-cycle resets

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{info, warn};

const ALERT_80: u8 = 0b01;
const ALERT_100: u8 = 0b10;

#[derive(Debug, Clone, Serialize)]
pub struct UsageStats {
    pub tenant_id: String,
    pub subscription_tier: String,
    pub monthly_quota: i64,
    pub current_usage: i64,
    pub remaining_quota: i64,
    pub billing_cycle_start: String,
    pub billing_cycle_end: String,
    pub usage_percentage: f64,
}

/// Quota gate over the tenants table.
///
/// `fail_open` controls the missing-tenant policy: development deployments
/// admit unknown tenants, production fails closed.
pub struct QuotaManager {
    db_path: String,
    fail_open: bool,
    /// Alert thresholds already fired this cycle, keyed by tenant.
    alerted: Mutex<HashMap<String, u8>>,
}

impl QuotaManager {
    pub fn new(db_path: &str, fail_open: bool) -> Self {
        Self {
            db_path: db_path.to_string(),
            fail_open,
            alerted: Mutex::new(HashMap::new()),
        }
    }

    /// True when the tenant has remaining quota this cycle.
    pub fn check_quota(&self, tenant_id: &str) -> Result<bool> {
        let conn = Connection::open(&self.db_path)?;

        let row: Option<(i64, i64)> = conn
            .query_row(
                "SELECT monthly_quota, current_usage FROM tenants WHERE tenant_id = ?1",
                params![tenant_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((quota, usage)) = row else {
            if self.fail_open {
                warn!(tenant_id, "Tenant not found in database - allowing (fail-open)");
                return Ok(true);
            }
            warn!(tenant_id, "Tenant not found in database - rejecting (fail-closed)");
            return Ok(false);
        };

        let has_quota = usage < quota;
        info!(
            tenant_id,
            usage,
            quota,
            available = has_quota,
            "Quota check"
        );
        Ok(has_quota)
    }

    /// Consume one unit of quota: atomic increment plus threshold alerts,
    /// fired once per crossing per cycle.
    pub fn decrement_quota(&self, tenant_id: &str) -> Result<()> {
        let conn = Connection::open(&self.db_path)?;

        let row: Option<(i64, i64)> = conn
            .query_row(
                "UPDATE tenants SET current_usage = current_usage + 1
                 WHERE tenant_id = ?1
                 RETURNING current_usage, monthly_quota",
                params![tenant_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((usage, quota)) = row else {
            warn!(tenant_id, "Tenant not found for quota decrement - skipping");
            return Ok(());
        };

        info!(tenant_id, usage, quota, "Quota decremented");

        if quota > 0 {
            let pct = (usage as f64 / quota as f64) * 100.0;
            if pct >= 100.0 {
                self.send_alert_once(tenant_id, 100, ALERT_100);
            } else if pct >= 80.0 {
                self.send_alert_once(tenant_id, 80, ALERT_80);
            }
        }

        Ok(())
    }

    fn send_alert_once(&self, tenant_id: &str, percentage: u32, bit: u8) {
        let mut alerted = self.alerted.lock();
        let flags = alerted.entry(tenant_id.to_string()).or_insert(0);
        if *flags & bit != 0 {
            return;
        }
        *flags |= bit;

        // Email/notification integration lives behind this log line.
        warn!(tenant_id, percentage, "QUOTA ALERT: usage threshold reached");
    }

    pub fn usage_stats(&self, tenant_id: &str) -> Result<Option<UsageStats>> {
        let conn = Connection::open(&self.db_path)?;

        let stats = conn
            .query_row(
                "SELECT tenant_id, subscription_tier, monthly_quota, current_usage,
                        billing_cycle_start, billing_cycle_end
                 FROM tenants WHERE tenant_id = ?1",
                params![tenant_id],
                |row| {
                    let quota: i64 = row.get(2)?;
                    let usage: i64 = row.get(3)?;
                    Ok(UsageStats {
                        tenant_id: row.get(0)?,
                        subscription_tier: row.get(1)?,
                        monthly_quota: quota,
                        current_usage: usage,
                        remaining_quota: quota - usage,
                        billing_cycle_start: row.get(4)?,
                        billing_cycle_end: row.get(5)?,
                        usage_percentage: if quota > 0 {
                            (usage as f64 / quota as f64 * 100.0 * 100.0).round() / 100.0
                        } else {
                            0.0
                        },
                    })
                },
            )
            .optional()?;

        Ok(stats)
    }

    /// Scheduled job: zero usage for tenants whose billing cycle has ended.
    /// Alert state for those tenants resets with the cycle.
    pub fn reset_monthly_quotas(&self) -> Result<usize> {
        let conn = Connection::open(&self.db_path)?;
        let today = Utc::now().date_naive().to_string();

        let mut stmt = conn
            .prepare(
                "UPDATE tenants SET current_usage = 0
                 WHERE billing_cycle_end <= ?1
                 RETURNING tenant_id",
            )
            .context("Failed to prepare quota reset")?;

        let reset_tenants = stmt
            .query_map(params![today], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut alerted = self.alerted.lock();
        for tenant_id in &reset_tenants {
            alerted.remove(tenant_id);
        }

        info!(count = reset_tenants.len(), "Monthly quotas reset");
        Ok(reset_tenants.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tenants::TenantStore;
    use tempfile::NamedTempFile;

    fn setup() -> (QuotaManager, TenantStore, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap().to_string();
        let tenants = TenantStore::new(&path).unwrap();
        let quota = QuotaManager::new(&path, true);
        (quota, tenants, temp_file)
    }

    fn set_usage(path: &str, tenant_id: &str, usage: i64, quota: i64) {
        let conn = Connection::open(path).unwrap();
        conn.execute(
            "UPDATE tenants SET current_usage = ?1, monthly_quota = ?2 WHERE tenant_id = ?3",
            params![usage, quota, tenant_id],
        )
        .unwrap();
    }

    #[test]
    fn test_check_quota_available_and_exhausted() {
        let (quota, tenants, temp) = setup();
        tenants.create_tenant("t1", "t1@example.com").unwrap();

        assert!(quota.check_quota("t1").unwrap());

        set_usage(temp.path().to_str().unwrap(), "t1", 100, 100);
        assert!(!quota.check_quota("t1").unwrap());
    }

    #[test]
    fn test_missing_tenant_policy() {
        let temp = NamedTempFile::new().unwrap();
        let path = temp.path().to_str().unwrap().to_string();
        let _tenants = TenantStore::new(&path).unwrap();

        let open = QuotaManager::new(&path, true);
        assert!(open.check_quota("ghost").unwrap());

        let closed = QuotaManager::new(&path, false);
        assert!(!closed.check_quota("ghost").unwrap());
    }

    #[test]
    fn test_decrement_is_monotone() {
        let (quota, tenants, temp) = setup();
        tenants.create_tenant("t1", "t1@example.com").unwrap();

        for expected in 1..=5 {
            quota.decrement_quota("t1").unwrap();
            let stats = quota.usage_stats("t1").unwrap().unwrap();
            assert_eq!(stats.current_usage, expected);
        }

        let _ = temp;
    }

    #[test]
    fn test_monthly_reset_zeroes_usage_keeps_quota() {
        let (quota, tenants, temp) = setup();
        let path = temp.path().to_str().unwrap().to_string();
        tenants.create_tenant("t1", "t1@example.com").unwrap();
        set_usage(&path, "t1", 42, 100);

        // Move the cycle end into the past so the reset picks it up.
        let conn = Connection::open(&path).unwrap();
        conn.execute(
            "UPDATE tenants SET billing_cycle_end = '2000-01-01' WHERE tenant_id = 't1'",
            [],
        )
        .unwrap();

        let reset = quota.reset_monthly_quotas().unwrap();
        assert_eq!(reset, 1);

        let stats = quota.usage_stats("t1").unwrap().unwrap();
        assert_eq!(stats.current_usage, 0);
        assert_eq!(stats.monthly_quota, 100);
    }

    #[test]
    fn test_reset_skips_active_cycles() {
        let (quota, tenants, temp) = setup();
        let path = temp.path().to_str().unwrap().to_string();
        tenants.create_tenant("t1", "t1@example.com").unwrap();
        set_usage(&path, "t1", 7, 100);

        // Cycle end is ~30 days out; nothing to reset.
        let reset = quota.reset_monthly_quotas().unwrap();
        assert_eq!(reset, 0);
        assert_eq!(quota.usage_stats("t1").unwrap().unwrap().current_usage, 7);
    }

    #[test]
    fn test_usage_percentage() {
        let (quota, tenants, temp) = setup();
        let path = temp.path().to_str().unwrap().to_string();
        tenants.create_tenant("t1", "t1@example.com").unwrap();
        set_usage(&path, "t1", 25, 100);

        let stats = quota.usage_stats("t1").unwrap().unwrap();
        assert!((stats.usage_percentage - 25.0).abs() < f64::EPSILON);
        assert_eq!(stats.remaining_quota, 75);
    }
}
