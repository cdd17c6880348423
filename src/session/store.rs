//! Session Storage
//! Mission: Durable session records with graceful in-memory fallback
//!
//! Every query is tenant-filterable at the query layer. When the database
//! rejects a write and the fallback is enabled, the record is mirrored into
//! a process-local map so an in-flight verification can still complete.
//! Fallback entries are lost on restart; that is acceptable for the
//! dev/degraded mode the fallback exists for.

use crate::models::{Session, SessionState};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct SessionStore {
    db_path: String,
    fallback_enabled: bool,
    fallback: Mutex<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn new(db_path: &str, fallback_enabled: bool) -> Result<Self> {
        let store = Self {
            db_path: db_path.to_string(),
            fallback_enabled,
            fallback: Mutex::new(HashMap::new()),
        };
        // With the fallback enabled, an unreachable store at boot degrades
        // to the in-memory map. With it disabled (production), fail closed.
        if let Err(e) = store.init_db() {
            if !fallback_enabled {
                return Err(e).context("Session store unavailable and fallback disabled");
            }
            warn!(db_path, error = %e, "Session store init failed - in-memory fallback active");
        }
        Ok(store)
    }

    fn init_db(&self) -> Result<()> {
        let conn = Connection::open(&self.db_path)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                state TEXT NOT NULL,
                return_url TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                tier_1_score INTEGER,
                tier_2_score INTEGER,
                final_trust_score INTEGER,
                correlation_value REAL,
                reasoning TEXT,
                video_key TEXT,
                imu_key TEXT,
                flow_key TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sessions_tenant
             ON sessions (tenant_id, created_at DESC)",
            [],
        )?;

        Ok(())
    }

    /// Create a new IDLE session expiring after `expiration_minutes`.
    pub fn create(
        &self,
        tenant_id: &str,
        return_url: &str,
        metadata: HashMap<String, serde_json::Value>,
        expiration_minutes: i64,
    ) -> Result<Session> {
        let now = Utc::now();
        let session = Session {
            session_id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            created_at: now,
            expires_at: now + Duration::minutes(expiration_minutes),
            state: SessionState::Idle,
            return_url: return_url.to_string(),
            metadata,
            tier_1_score: None,
            tier_2_score: None,
            final_trust_score: None,
            correlation_value: None,
            reasoning: None,
            video_key: None,
            imu_key: None,
            flow_key: None,
            fallback: false,
        };

        let result = self.insert(&session);
        if let Err(e) = result {
            if !self.fallback_enabled {
                return Err(e).context("Failed to insert session");
            }
            warn!(
                session_id = %session.session_id,
                error = %e,
                "Database unavailable, storing session in memory"
            );
            let mut fallback_session = session.clone();
            fallback_session.fallback = true;
            self.fallback
                .lock()
                .insert(session.session_id.clone(), fallback_session);
        }

        info!(
            session_id = %session.session_id,
            tenant_id,
            state = session.state.as_str(),
            "Verification session created"
        );

        Ok(session)
    }

    fn insert(&self, session: &Session) -> Result<()> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute(
            "INSERT INTO sessions (
                session_id, tenant_id, created_at, expires_at, state, return_url, metadata
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session.session_id,
                session.tenant_id,
                session.created_at.to_rfc3339(),
                session.expires_at.to_rfc3339(),
                session.state.as_str(),
                session.return_url,
                serde_json::to_string(&session.metadata)?,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, session_id: &str) -> Result<Option<Session>> {
        let db_result = self.get_from_db(session_id);

        match db_result {
            Ok(Some(session)) => {
                debug!(session_id, "Session retrieved from database");
                Ok(Some(session))
            }
            Ok(None) => {
                if let Some(session) = self.fallback.lock().get(session_id) {
                    debug!(session_id, "Session retrieved from memory fallback");
                    return Ok(Some(session.clone()));
                }
                Ok(None)
            }
            Err(e) => {
                if let Some(session) = self.fallback.lock().get(session_id) {
                    warn!(session_id, error = %e, "Database read failed, using memory fallback");
                    return Ok(Some(session.clone()));
                }
                if self.fallback_enabled {
                    warn!(session_id, error = %e, "Database read failed, no fallback entry");
                    Ok(None)
                } else {
                    Err(e).context("Failed to read session")
                }
            }
        }
    }

    fn get_from_db(&self, session_id: &str) -> Result<Option<Session>> {
        let conn = Connection::open(&self.db_path)?;

        let session = conn
            .query_row(
                "SELECT session_id, tenant_id, created_at, expires_at, state, return_url,
                        metadata, tier_1_score, tier_2_score, final_trust_score,
                        correlation_value, reasoning, video_key, imu_key, flow_key
                 FROM sessions WHERE session_id = ?1",
                params![session_id],
                row_to_session,
            )
            .optional()?;

        Ok(session)
    }

    pub fn set_state(&self, session_id: &str, state: SessionState) -> Result<()> {
        self.update(
            session_id,
            "UPDATE sessions SET state = ?1 WHERE session_id = ?2",
            params![state.as_str(), session_id],
            |s| s.state = state,
        )?;

        info!(session_id, new_state = state.as_str(), "Session state transition recorded");
        Ok(())
    }

    /// Push expiry out by `extension_minutes` from now (verification started).
    pub fn extend_expiry(&self, session_id: &str, extension_minutes: i64) -> Result<()> {
        let new_expiry = Utc::now() + Duration::minutes(extension_minutes);

        self.update(
            session_id,
            "UPDATE sessions SET expires_at = ?1 WHERE session_id = ?2",
            params![new_expiry.to_rfc3339(), session_id],
            |s| s.expires_at = new_expiry,
        )?;

        info!(session_id, %new_expiry, "Session expiration extended");
        Ok(())
    }

    /// Store scoring outputs and mark the session COMPLETE in one write.
    pub fn set_results(
        &self,
        session_id: &str,
        tier_1_score: i64,
        tier_2_score: Option<i64>,
        final_trust_score: i64,
        correlation_value: f64,
        reasoning: &str,
    ) -> Result<()> {
        let reasoning_owned = reasoning.to_string();
        self.update(
            session_id,
            "UPDATE sessions SET
                tier_1_score = ?1, tier_2_score = ?2, final_trust_score = ?3,
                correlation_value = ?4, reasoning = ?5, state = ?6
             WHERE session_id = ?7",
            params![
                tier_1_score,
                tier_2_score,
                final_trust_score,
                correlation_value,
                reasoning,
                SessionState::Complete.as_str(),
                session_id,
            ],
            move |s| {
                s.tier_1_score = Some(tier_1_score);
                s.tier_2_score = tier_2_score;
                s.final_trust_score = Some(final_trust_score);
                s.correlation_value = Some(correlation_value);
                s.reasoning = Some(reasoning_owned.clone());
                s.state = SessionState::Complete;
            },
        )?;

        info!(
            session_id,
            final_score = final_trust_score,
            tier_1 = tier_1_score,
            correlation = correlation_value,
            "Session results recorded, session complete"
        );
        Ok(())
    }

    /// Store artifact keys; existing keys are kept when a new one is None.
    pub fn set_artifact_keys(
        &self,
        session_id: &str,
        video_key: Option<&str>,
        imu_key: Option<&str>,
        flow_key: Option<&str>,
    ) -> Result<()> {
        let (v, i, f) = (
            video_key.map(str::to_string),
            imu_key.map(str::to_string),
            flow_key.map(str::to_string),
        );
        self.update(
            session_id,
            "UPDATE sessions SET
                video_key = COALESCE(?1, video_key),
                imu_key = COALESCE(?2, imu_key),
                flow_key = COALESCE(?3, flow_key)
             WHERE session_id = ?4",
            params![video_key, imu_key, flow_key, session_id],
            move |s| {
                if v.is_some() {
                    s.video_key = v.clone();
                }
                if i.is_some() {
                    s.imu_key = i.clone();
                }
                if f.is_some() {
                    s.flow_key = f.clone();
                }
            },
        )?;

        info!(
            session_id,
            has_video = video_key.is_some(),
            has_imu = imu_key.is_some(),
            "Artifact keys synced to session"
        );
        Ok(())
    }

    /// Shared update path: write to the database, mirror into the fallback
    /// map when the database is unavailable.
    fn update(
        &self,
        session_id: &str,
        sql: &str,
        args: impl rusqlite::Params,
        apply: impl FnOnce(&mut Session),
    ) -> Result<()> {
        let db_result = (|| -> Result<()> {
            let conn = Connection::open(&self.db_path)?;
            conn.execute(sql, args)?;
            Ok(())
        })();

        let mut fallback = self.fallback.lock();
        if let Some(session) = fallback.get_mut(session_id) {
            apply(session);
            return Ok(());
        }
        drop(fallback);

        match db_result {
            Ok(()) => Ok(()),
            Err(e) if self.fallback_enabled => {
                warn!(session_id, error = %e, "Database write failed for session update");
                Ok(())
            }
            Err(e) => Err(e).context("Failed to update session"),
        }
    }

    pub fn list_by_tenant(
        &self,
        tenant_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Session>> {
        let conn = match Connection::open(&self.db_path) {
            Ok(conn) => conn,
            Err(e) if self.fallback_enabled => {
                warn!(tenant_id, error = %e, "Database unavailable during session listing");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e).context("Failed to open session store"),
        };

        let mut stmt = conn.prepare(
            "SELECT session_id, tenant_id, created_at, expires_at, state, return_url,
                    metadata, tier_1_score, tier_2_score, final_trust_score,
                    correlation_value, reasoning, video_key, imu_key, flow_key
             FROM sessions WHERE tenant_id = ?1
             ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
        )?;

        let sessions = stmt
            .query_map(params![tenant_id, limit, offset], row_to_session)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(sessions)
    }

    /// Delete expired, non-complete sessions. Returns the number reaped.
    pub fn reap_expired(&self) -> Result<usize> {
        let now = Utc::now();

        let deleted = (|| -> Result<usize> {
            let conn = Connection::open(&self.db_path)?;
            Ok(conn.execute(
                "DELETE FROM sessions WHERE expires_at < ?1 AND state != ?2",
                params![now.to_rfc3339(), SessionState::Complete.as_str()],
            )?)
        })()
        .unwrap_or_else(|e| {
            warn!(error = %e, "Database unavailable during session reaping");
            0
        });

        let mut fallback = self.fallback.lock();
        let before = fallback.len();
        fallback.retain(|_, s| !s.is_expired(now) || s.state.is_terminal());
        let fallback_reaped = before - fallback.len();

        if deleted > 0 || fallback_reaped > 0 {
            info!(deleted, fallback_reaped, "Expired sessions reaped");
        }
        Ok(deleted + fallback_reaped)
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let created_at: String = row.get(2)?;
    let expires_at: String = row.get(3)?;
    let state: String = row.get(4)?;
    let metadata: String = row.get(6)?;

    Ok(Session {
        session_id: row.get(0)?,
        tenant_id: row.get(1)?,
        created_at: parse_ts(&created_at),
        expires_at: parse_ts(&expires_at),
        state: SessionState::from_str(&state).unwrap_or(SessionState::Idle),
        return_url: row.get(5)?,
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        tier_1_score: row.get(7)?,
        tier_2_score: row.get(8)?,
        final_trust_score: row.get(9)?,
        correlation_value: row.get(10)?,
        reasoning: row.get(11)?,
        video_key: row.get(12)?,
        imu_key: row.get(13)?,
        flow_key: row.get(14)?,
        fallback: false,
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_test_store() -> (SessionStore, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let store = SessionStore::new(temp_file.path().to_str().unwrap(), true).unwrap();
        (store, temp_file)
    }

    fn new_session(store: &SessionStore) -> Session {
        store
            .create("tenant-1", "https://example.com/done", HashMap::new(), 15)
            .unwrap()
    }

    #[test]
    fn test_create_and_get() {
        let (store, _temp) = create_test_store();
        let session = new_session(&store);

        let loaded = store.get(&session.session_id).unwrap().unwrap();
        assert_eq!(loaded.tenant_id, "tenant-1");
        assert_eq!(loaded.state, SessionState::Idle);
        assert!(loaded.expires_at > loaded.created_at);
        assert!(!loaded.has_results());
    }

    #[test]
    fn test_session_ids_are_distinct() {
        let (store, _temp) = create_test_store();
        let a = new_session(&store);
        let b = new_session(&store);
        assert_ne!(a.session_id, b.session_id);
    }

    #[test]
    fn test_state_transitions_persist() {
        let (store, _temp) = create_test_store();
        let session = new_session(&store);

        for state in [
            SessionState::Baseline,
            SessionState::Pan,
            SessionState::Return,
            SessionState::Analyzing,
        ] {
            store.set_state(&session.session_id, state).unwrap();
            let loaded = store.get(&session.session_id).unwrap().unwrap();
            assert_eq!(loaded.state, state);
        }
    }

    #[test]
    fn test_extend_expiry_moves_deadline() {
        let (store, _temp) = create_test_store();
        let session = new_session(&store);

        store.extend_expiry(&session.session_id, 60).unwrap();
        let loaded = store.get(&session.session_id).unwrap().unwrap();

        assert!(loaded.expires_at > session.expires_at);
    }

    #[test]
    fn test_complete_session_has_all_results() {
        let (store, _temp) = create_test_store();
        let session = new_session(&store);

        store
            .set_results(&session.session_id, 92, Some(88), 90, 0.91, "strong correlation")
            .unwrap();

        let loaded = store.get(&session.session_id).unwrap().unwrap();
        assert_eq!(loaded.state, SessionState::Complete);
        assert!(loaded.has_results());
        assert_eq!(loaded.tier_1_score, Some(92));
        assert_eq!(loaded.tier_2_score, Some(88));
        assert_eq!(loaded.final_trust_score, Some(90));
    }

    #[test]
    fn test_artifact_keys_coalesce() {
        let (store, _temp) = create_test_store();
        let session = new_session(&store);

        store
            .set_artifact_keys(&session.session_id, Some("t/sessions/s/video.webm"), None, None)
            .unwrap();
        store
            .set_artifact_keys(&session.session_id, None, Some("t/sessions/s/imu_data.json"), None)
            .unwrap();

        let loaded = store.get(&session.session_id).unwrap().unwrap();
        assert_eq!(loaded.video_key.as_deref(), Some("t/sessions/s/video.webm"));
        assert_eq!(loaded.imu_key.as_deref(), Some("t/sessions/s/imu_data.json"));
        assert!(loaded.flow_key.is_none());
    }

    #[test]
    fn test_list_by_tenant_is_scoped() {
        let (store, _temp) = create_test_store();
        new_session(&store);
        new_session(&store);
        store
            .create("tenant-2", "https://example.com", HashMap::new(), 15)
            .unwrap();

        let mine = store.list_by_tenant("tenant-1", 10, 0).unwrap();
        assert_eq!(mine.len(), 2);
        assert!(mine.iter().all(|s| s.tenant_id == "tenant-1"));

        let paged = store.list_by_tenant("tenant-1", 1, 1).unwrap();
        assert_eq!(paged.len(), 1);
    }

    #[test]
    fn test_reaper_spares_complete_sessions() {
        let (store, _temp) = create_test_store();
        let expired = store
            .create("tenant-1", "https://example.com", HashMap::new(), -1)
            .unwrap();
        let complete = store
            .create("tenant-1", "https://example.com", HashMap::new(), -1)
            .unwrap();
        store
            .set_results(&complete.session_id, 90, None, 90, 0.9, "ok")
            .unwrap();
        let live = new_session(&store);

        let reaped = store.reap_expired().unwrap();
        assert_eq!(reaped, 1);

        assert!(store.get(&expired.session_id).unwrap().is_none());
        assert!(store.get(&complete.session_id).unwrap().is_some());
        assert!(store.get(&live.session_id).unwrap().is_some());
    }

    #[test]
    fn test_fallback_keeps_session_alive_when_db_gone() {
        // Point the store at a path that cannot exist.
        let store = SessionStore {
            db_path: "/proc/nope/sessions.db".to_string(),
            fallback_enabled: true,
            fallback: Mutex::new(HashMap::new()),
        };

        let session = store
            .create("tenant-1", "https://example.com", HashMap::new(), 15)
            .unwrap();

        let loaded = store.get(&session.session_id).unwrap().unwrap();
        assert!(loaded.fallback);

        store
            .set_results(&session.session_id, 80, None, 80, 0.8, "fallback path")
            .unwrap();
        let loaded = store.get(&session.session_id).unwrap().unwrap();
        assert_eq!(loaded.state, SessionState::Complete);
        assert!(loaded.has_results());
    }

    #[test]
    fn test_fail_closed_propagates_store_errors() {
        let store = SessionStore {
            db_path: "/proc/nope/sessions.db".to_string(),
            fallback_enabled: false,
            fallback: Mutex::new(HashMap::new()),
        };

        assert!(store
            .create("tenant-1", "https://example.com", HashMap::new(), 15)
            .is_err());
    }
}
