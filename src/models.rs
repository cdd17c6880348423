//! Domain Models
//! Mission: Define the wire and persistence types for verification sessions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle of a verification session.
///
/// ```text
/// IDLE → BASELINE → PAN → RETURN → ANALYZING → COMPLETE
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Baseline,
    Pan,
    Return,
    Analyzing,
    Complete,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Baseline => "baseline",
            SessionState::Pan => "pan",
            SessionState::Return => "return",
            SessionState::Analyzing => "analyzing",
            SessionState::Complete => "complete",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(SessionState::Idle),
            "baseline" => Some(SessionState::Baseline),
            "pan" => Some(SessionState::Pan),
            "return" => Some(SessionState::Return),
            "analyzing" => Some(SessionState::Analyzing),
            "complete" => Some(SessionState::Complete),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Complete)
    }
}

/// Outcome reported to clients and webhooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Success,
    Failed,
    Timeout,
    Cancelled,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Success => "success",
            VerificationStatus::Failed => "failed",
            VerificationStatus::Timeout => "timeout",
            VerificationStatus::Cancelled => "cancelled",
        }
    }
}

/// Durable session record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub tenant_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: SessionState,
    pub return_url: String,
    pub metadata: HashMap<String, serde_json::Value>,
    pub tier_1_score: Option<i64>,
    pub tier_2_score: Option<i64>,
    pub final_trust_score: Option<i64>,
    pub correlation_value: Option<f64>,
    pub reasoning: Option<String>,
    pub video_key: Option<String>,
    pub imu_key: Option<String>,
    pub flow_key: Option<String>,
    /// True when the record only exists in the in-memory fallback map.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fallback: bool,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// COMPLETE implies all scoring outputs are present.
    pub fn has_results(&self) -> bool {
        self.tier_1_score.is_some()
            && self.final_trust_score.is_some()
            && self.correlation_value.is_some()
            && self.reasoning.is_some()
    }
}

/// Three-axis acceleration sample, m/s^2.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Acceleration {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

/// Device rotation rate in deg/s. Gamma is rotation around the
/// front-to-back axis and drives the sensor-fusion correlation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RotationRate {
    #[serde(default)]
    pub alpha: Option<f64>,
    #[serde(default)]
    pub beta: Option<f64>,
    #[serde(default)]
    pub gamma: Option<f64>,
}

/// One IMU sample as streamed by the client. Field names arrive in
/// camelCase from browsers; snake_case is accepted too.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImuSample {
    #[serde(alias = "ts")]
    pub timestamp: f64,
    #[serde(default)]
    pub acceleration: Acceleration,
    #[serde(default, alias = "rotationRate")]
    pub rotation_rate: RotationRate,
}

/// Tenant branding sent to the client on WebSocket connect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrandingConfig {
    pub logo_url: Option<String>,
    pub primary_color: String,
    pub secondary_color: String,
    pub button_color: String,
}

impl Default for BrandingConfig {
    fn default() -> Self {
        Self {
            logo_url: None,
            primary_color: "#1E40AF".to_string(),
            secondary_color: "#3B82F6".to_string(),
            button_color: "#10B981".to_string(),
        }
    }
}

impl BrandingConfig {
    /// Colors must be #RRGGBB.
    pub fn valid_hex_color(color: &str) -> bool {
        color.len() == 7
            && color.starts_with('#')
            && color[1..].chars().all(|c| c.is_ascii_hexdigit())
    }
}

/// Server → client WebSocket messages, framed as `{"type": ..., "payload": ...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    Branding(BrandingConfig),
    PhaseChange { phase: String },
    Result(ResultPayload),
    Error { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultPayload {
    pub status: VerificationStatus,
    pub final_trust_score: i64,
    pub correlation_value: f64,
    pub reasoning: String,
}

/// Body delivered to registered webhooks on completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub session_id: String,
    pub tier_1_score: i64,
    pub tier_2_score: Option<i64>,
    pub final_trust_score: i64,
    pub verification_status: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: HashMap<String, serde_json::Value>,
}

// ---- HTTP request/response bodies ----

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub return_url: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub session_url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    pub user: UserInfo,
}

#[derive(Debug, Serialize)]
pub struct UserInfo {
    pub user_id: String,
    pub tenant_id: String,
    pub email: String,
    pub role: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyRequest {
    #[serde(default = "default_environment")]
    pub environment: String,
}

fn default_environment() -> String {
    "sandbox".to_string()
}
