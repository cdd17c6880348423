//! Artifact Sink
//! Mission: Persist session artifacts and mint time-bounded signed URLs
//!
//! The concrete blob backend is deployment-specific; this module defines the
//! interface plus a filesystem-backed implementation used for development
//! and as the degraded-mode reference. Keys follow the layout
//! `{tenant}/sessions/{session}/<artifact>`.

use crate::models::ImuSample;
use anyhow::Result;
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::path::PathBuf;
use tracing::{error, info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Marker prefix for keys minted while the backend was unreachable.
/// Such keys never resolve; the session record keeps them for audit.
pub const DEGRADED_KEY_PREFIX: &str = "mock://";

/// Persists video bytes, IMU JSON, and optical-flow JSON for sessions.
pub trait ArtifactStore: Send + Sync {
    fn put_video(&self, tenant_id: &str, session_id: &str, data: &[u8]) -> String;
    fn put_imu(&self, tenant_id: &str, session_id: &str, samples: &[ImuSample]) -> String;
    fn put_flow(&self, tenant_id: &str, session_id: &str, values: &[f64]) -> String;
    /// Signed read URL for a stored key, valid for `ttl_seconds`.
    fn signed_url(&self, key: &str, ttl_seconds: u64) -> Result<String>;
    /// Record retention intent; actual deletion is the backend's lifecycle
    /// rule, not an immediate delete.
    fn schedule_deletion(&self, key: &str, days: i64);
}

/// Filesystem-backed artifact store. Writes under `root` and signs URLs
/// with HMAC-SHA256 over `key:expiry`.
pub struct FsArtifactStore {
    root: PathBuf,
    signing_secret: String,
    public_base: String,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>, signing_secret: String, public_base: String) -> Self {
        let root = root.into();
        if let Err(e) = std::fs::create_dir_all(&root) {
            warn!(root = %root.display(), error = %e, "Artifact root not writable - storage degraded");
        }
        Self {
            root,
            signing_secret,
            public_base,
        }
    }

    fn write(&self, key: &str, data: &[u8], what: &str) -> String {
        let path = self.root.join(key);
        let result = match path.parent() {
            Some(parent) => {
                std::fs::create_dir_all(parent).and_then(|_| std::fs::write(&path, data))
            }
            None => std::fs::write(&path, data),
        };

        match result {
            Ok(_) => {
                info!(key, bytes = data.len(), "{what} artifact stored");
                key.to_string()
            }
            Err(e) => {
                error!(key, error = %e, "Failed to store {what} artifact - degraded mode");
                format!("{DEGRADED_KEY_PREFIX}{key}")
            }
        }
    }

    fn sign(&self, key: &str, expires: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(self.signing_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(format!("{key}:{expires}").as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Validate a signature minted by `sign`, for serving artifact reads.
    pub fn verify_signature(&self, key: &str, expires: i64, signature: &str) -> bool {
        if expires < Utc::now().timestamp() {
            return false;
        }
        // Constant-time comparison via the Mac verify API.
        let mut mac = HmacSha256::new_from_slice(self.signing_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(format!("{key}:{expires}").as_bytes());
        hex::decode(signature)
            .ok()
            .map(|sig| mac.verify_slice(&sig).is_ok())
            .unwrap_or(false)
    }

    pub fn artifact_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

fn video_key(tenant_id: &str, session_id: &str) -> String {
    format!("{tenant_id}/sessions/{session_id}/video.webm")
}

fn imu_key(tenant_id: &str, session_id: &str) -> String {
    format!("{tenant_id}/sessions/{session_id}/imu_data.json")
}

fn flow_key(tenant_id: &str, session_id: &str) -> String {
    format!("{tenant_id}/sessions/{session_id}/optical_flow.json")
}

impl ArtifactStore for FsArtifactStore {
    fn put_video(&self, tenant_id: &str, session_id: &str, data: &[u8]) -> String {
        self.write(&video_key(tenant_id, session_id), data, "video")
    }

    fn put_imu(&self, tenant_id: &str, session_id: &str, samples: &[ImuSample]) -> String {
        let json = serde_json::to_vec_pretty(samples).unwrap_or_else(|_| b"[]".to_vec());
        self.write(&imu_key(tenant_id, session_id), &json, "IMU")
    }

    fn put_flow(&self, tenant_id: &str, session_id: &str, values: &[f64]) -> String {
        let json = serde_json::to_vec_pretty(values).unwrap_or_else(|_| b"[]".to_vec());
        self.write(&flow_key(tenant_id, session_id), &json, "optical flow")
    }

    fn signed_url(&self, key: &str, ttl_seconds: u64) -> Result<String> {
        if key.starts_with(DEGRADED_KEY_PREFIX) {
            anyhow::bail!("Artifact was stored in degraded mode and is not resolvable");
        }

        let expires = (Utc::now() + Duration::seconds(ttl_seconds as i64)).timestamp();
        let signature = self.sign(key, expires);

        Ok(format!(
            "{}/artifacts/{key}?expires={expires}&signature={signature}",
            self.public_base.trim_end_matches('/')
        ))
    }

    fn schedule_deletion(&self, key: &str, days: i64) {
        let deletion_date = Utc::now() + Duration::days(days);
        info!(key, %deletion_date, "Artifact scheduled for retention deletion");
    }
}

/// Sink that always degrades; used when storage is disabled by config.
pub struct NullArtifactStore;

impl ArtifactStore for NullArtifactStore {
    fn put_video(&self, tenant_id: &str, session_id: &str, _data: &[u8]) -> String {
        format!("{DEGRADED_KEY_PREFIX}{}", video_key(tenant_id, session_id))
    }

    fn put_imu(&self, tenant_id: &str, session_id: &str, _samples: &[ImuSample]) -> String {
        format!("{DEGRADED_KEY_PREFIX}{}", imu_key(tenant_id, session_id))
    }

    fn put_flow(&self, tenant_id: &str, session_id: &str, _values: &[f64]) -> String {
        format!("{DEGRADED_KEY_PREFIX}{}", flow_key(tenant_id, session_id))
    }

    fn signed_url(&self, _key: &str, _ttl_seconds: u64) -> Result<String> {
        anyhow::bail!("Artifact storage disabled")
    }

    fn schedule_deletion(&self, _key: &str, _days: i64) {}
}
