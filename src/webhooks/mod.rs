//! Webhook Dispatcher
//! Mission: Signed, retried delivery of completion events to partner URLs
//!
//! Bodies are signed with HMAC-SHA256 over the canonical JSON encoding
//! (object keys sorted lexicographically) using the tenant API secret, and
//! carried in the `X-VeraProof-Signature` header as lowercase hex.

use anyhow::{Context, Result};
use chrono::Utc;
use hmac::{Hmac, Mac};
use rusqlite::{params, Connection};
use sha2::Sha256;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::models::WebhookPayload;

type HmacSha256 = Hmac<Sha256>;

pub const EVENT_VERIFICATION_COMPLETE: &str = "verification.complete";

/// Per-attempt delivery timeout.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
/// Retries after the initial attempt.
const MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct Webhook {
    pub webhook_id: String,
    pub tenant_id: String,
    pub url: String,
    pub enabled: bool,
    pub events: Vec<String>,
    pub success_count: i64,
    pub failure_count: i64,
    pub last_triggered_at: Option<String>,
}

/// One delivery attempt, as recorded in webhook_logs.
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    pub attempt: u32,
    pub status_code: Option<u16>,
    pub response_time_ms: i64,
    pub success: bool,
    pub error_message: Option<String>,
}

pub struct WebhookDispatcher {
    db_path: String,
    client: reqwest::Client,
    /// First backoff delay; doubles per retry. Production default 1 s.
    backoff_base: Duration,
}

impl WebhookDispatcher {
    pub fn new(db_path: &str, backoff_base: Duration) -> Result<Self> {
        let dispatcher = Self {
            db_path: db_path.to_string(),
            client: reqwest::Client::builder()
                .timeout(ATTEMPT_TIMEOUT)
                .build()
                .context("Failed to build webhook HTTP client")?,
            backoff_base,
        };
        if let Err(e) = dispatcher.init_db() {
            warn!(db_path, error = %e, "Webhook store init failed - starting degraded");
        }
        Ok(dispatcher)
    }

    fn init_db(&self) -> Result<()> {
        let conn = Connection::open(&self.db_path)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS webhooks (
                webhook_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                url TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                events TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_triggered_at TEXT,
                success_count INTEGER NOT NULL DEFAULT 0,
                failure_count INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS webhook_logs (
                log_id INTEGER PRIMARY KEY AUTOINCREMENT,
                webhook_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                session_id TEXT,
                event_type TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                status_code INTEGER,
                response_time_ms INTEGER NOT NULL,
                success INTEGER NOT NULL,
                error_message TEXT,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    /// Register a webhook for a tenant.
    pub fn register(&self, tenant_id: &str, url: &str, events: &[&str]) -> Result<Webhook> {
        let webhook = Webhook {
            webhook_id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            url: url.to_string(),
            enabled: true,
            events: events.iter().map(|e| e.to_string()).collect(),
            success_count: 0,
            failure_count: 0,
            last_triggered_at: None,
        };

        let conn = Connection::open(&self.db_path)?;
        conn.execute(
            "INSERT INTO webhooks (webhook_id, tenant_id, url, enabled, events, created_at)
             VALUES (?1, ?2, ?3, 1, ?4, ?5)",
            params![
                webhook.webhook_id,
                webhook.tenant_id,
                webhook.url,
                serde_json::to_string(&webhook.events)?,
                Utc::now().to_rfc3339(),
            ],
        )?;

        info!(tenant_id, url, "Webhook registered");
        Ok(webhook)
    }

    pub fn set_enabled(&self, webhook_id: &str, enabled: bool) -> Result<()> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute(
            "UPDATE webhooks SET enabled = ?1 WHERE webhook_id = ?2",
            params![enabled as i64, webhook_id],
        )?;
        Ok(())
    }

    pub fn list_for_tenant(&self, tenant_id: &str) -> Result<Vec<Webhook>> {
        let conn = Connection::open(&self.db_path)?;

        let mut stmt = conn.prepare(
            "SELECT webhook_id, tenant_id, url, enabled, events,
                    success_count, failure_count, last_triggered_at
             FROM webhooks WHERE tenant_id = ?1",
        )?;

        let webhooks = stmt
            .query_map(params![tenant_id], row_to_webhook)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(webhooks)
    }

    fn enabled_for_event(&self, tenant_id: &str, event: &str) -> Result<Vec<Webhook>> {
        Ok(self
            .list_for_tenant(tenant_id)?
            .into_iter()
            .filter(|w| w.enabled && w.events.iter().any(|e| e == event))
            .collect())
    }

    /// HMAC-SHA256 hex signature over the canonical JSON body.
    pub fn sign_payload(canonical_body: &str, secret: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(canonical_body.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Canonical encoding: serde_json orders object keys lexicographically,
    /// so serializing through `Value` yields the sorted-key form.
    pub fn canonical_body(payload: &WebhookPayload) -> Result<String> {
        let value = serde_json::to_value(payload)?;
        Ok(serde_json::to_string(&value)?)
    }

    /// Deliver a completion event to every registered webhook of the tenant.
    pub async fn dispatch_completion(
        &self,
        tenant_id: &str,
        payload: &WebhookPayload,
        api_secret: &str,
    ) {
        let webhooks = match self.enabled_for_event(tenant_id, EVENT_VERIFICATION_COMPLETE) {
            Ok(w) => w,
            Err(e) => {
                error!(tenant_id, error = %e, "Failed to load webhooks for dispatch");
                return;
            }
        };

        if webhooks.is_empty() {
            return;
        }

        let body = match Self::canonical_body(payload) {
            Ok(b) => b,
            Err(e) => {
                error!(tenant_id, error = %e, "Failed to encode webhook payload");
                return;
            }
        };
        let signature = Self::sign_payload(&body, api_secret);

        for webhook in webhooks {
            self.deliver_with_retry(&webhook, &payload.session_id, &body, &signature)
                .await;
        }
    }

    /// Attempt delivery with exponential backoff (1 s, 2 s, 4 s by default).
    /// Every attempt is logged; counters reflect the final outcome.
    pub async fn deliver_with_retry(
        &self,
        webhook: &Webhook,
        session_id: &str,
        body: &str,
        signature: &str,
    ) -> bool {
        for attempt in 1..=(MAX_RETRIES + 1) {
            let started = Instant::now();
            let result = self
                .client
                .post(&webhook.url)
                .header("Content-Type", "application/json")
                .header("X-VeraProof-Signature", signature)
                .body(body.to_string())
                .send()
                .await;
            let elapsed_ms = started.elapsed().as_millis() as i64;

            let attempt_record = match &result {
                Ok(response) => {
                    let status = response.status();
                    DeliveryAttempt {
                        attempt,
                        status_code: Some(status.as_u16()),
                        response_time_ms: elapsed_ms,
                        success: status.is_success(),
                        error_message: (!status.is_success())
                            .then(|| format!("HTTP {}", status.as_u16())),
                    }
                }
                Err(e) => DeliveryAttempt {
                    attempt,
                    status_code: None,
                    response_time_ms: elapsed_ms,
                    success: false,
                    error_message: Some(e.to_string()),
                },
            };

            self.log_attempt(webhook, session_id, &attempt_record);

            if attempt_record.success {
                info!(
                    webhook_id = %webhook.webhook_id,
                    url = %webhook.url,
                    attempt,
                    "Webhook delivered"
                );
                self.record_outcome(&webhook.webhook_id, true);
                return true;
            }

            warn!(
                webhook_id = %webhook.webhook_id,
                url = %webhook.url,
                attempt,
                error = ?attempt_record.error_message,
                "Webhook attempt failed"
            );

            if attempt <= MAX_RETRIES {
                let backoff = self.backoff_base * 2u32.pow(attempt - 1);
                tokio::time::sleep(backoff).await;
            }
        }

        error!(
            webhook_id = %webhook.webhook_id,
            url = %webhook.url,
            "Webhook delivery failed after all retries"
        );
        self.record_outcome(&webhook.webhook_id, false);
        false
    }

    fn log_attempt(&self, webhook: &Webhook, session_id: &str, attempt: &DeliveryAttempt) {
        let result = (|| -> Result<()> {
            let conn = Connection::open(&self.db_path)?;
            conn.execute(
                "INSERT INTO webhook_logs (
                    webhook_id, tenant_id, session_id, event_type, attempt,
                    status_code, response_time_ms, success, error_message, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    webhook.webhook_id,
                    webhook.tenant_id,
                    session_id,
                    EVENT_VERIFICATION_COMPLETE,
                    attempt.attempt,
                    attempt.status_code,
                    attempt.response_time_ms,
                    attempt.success as i64,
                    attempt.error_message,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })();

        if let Err(e) = result {
            warn!(error = %e, "Failed to log webhook attempt");
        }
    }

    fn record_outcome(&self, webhook_id: &str, success: bool) {
        let column = if success {
            "success_count"
        } else {
            "failure_count"
        };
        let sql = format!(
            "UPDATE webhooks SET {column} = {column} + 1, last_triggered_at = ?1
             WHERE webhook_id = ?2"
        );

        let result = (|| -> Result<()> {
            let conn = Connection::open(&self.db_path)?;
            conn.execute(&sql, params![Utc::now().to_rfc3339(), webhook_id])?;
            Ok(())
        })();

        if let Err(e) = result {
            warn!(error = %e, "Failed to record webhook outcome");
        }
    }

    pub fn attempts_for_webhook(&self, webhook_id: &str) -> Result<Vec<DeliveryAttempt>> {
        let conn = Connection::open(&self.db_path)?;

        let mut stmt = conn.prepare(
            "SELECT attempt, status_code, response_time_ms, success, error_message
             FROM webhook_logs WHERE webhook_id = ?1 ORDER BY log_id",
        )?;

        let attempts = stmt
            .query_map(params![webhook_id], |row| {
                Ok(DeliveryAttempt {
                    attempt: row.get(0)?,
                    status_code: row.get(1)?,
                    response_time_ms: row.get(2)?,
                    success: row.get::<_, i64>(3)? != 0,
                    error_message: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(attempts)
    }

    /// The default retry schedule, for observability and tests.
    pub fn backoff_schedule(&self) -> Vec<Duration> {
        (0..MAX_RETRIES)
            .map(|i| self.backoff_base * 2u32.pow(i))
            .collect()
    }
}

fn row_to_webhook(row: &rusqlite::Row<'_>) -> rusqlite::Result<Webhook> {
    let events: String = row.get(4)?;
    Ok(Webhook {
        webhook_id: row.get(0)?,
        tenant_id: row.get(1)?,
        url: row.get(2)?,
        enabled: row.get::<_, i64>(3)? != 0,
        events: serde_json::from_str(&events).unwrap_or_default(),
        success_count: row.get(5)?,
        failure_count: row.get(6)?,
        last_triggered_at: row.get(7)?,
    })
}
