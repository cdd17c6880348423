//! Application Settings
//! Mission: Centralize environment-driven configuration with safe defaults

use anyhow::{Context, Result};
use std::env;

/// Runtime environment the service is deployed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "production" | "prod" => Environment::Production,
            _ => Environment::Development,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }
}

/// All tunables loaded once at startup and shared via the application state.
#[derive(Debug, Clone)]
pub struct Settings {
    pub environment: Environment,
    pub bind_addr: String,

    // Persistence
    pub database_path: String,
    pub artifact_root: String,
    pub artifact_signing_secret: String,

    // JWT
    pub jwt_secret: String,
    pub jwt_expiration_hours: i64,
    pub refresh_token_expiration_days: i64,

    // Frontend
    pub frontend_verification_url: String,
    pub cors_origins: Vec<String>,

    // Rate limiting
    pub max_concurrent_sessions: u32,
    pub api_rate_limit_per_minute: u32,

    // Sessions
    pub session_expiration_minutes: i64,
    pub session_extension_minutes: i64,

    // Artifacts
    pub artifact_retention_days: i64,
    pub signed_url_expiration_seconds: u64,

    // Scoring
    pub fraud_threshold: f64,
    pub classifier_timeout_seconds: u64,
    pub classifier_endpoint: Option<String>,

    // Degradation policy. Production deployments should run with both of
    // these false so missing backends fail closed instead of silently
    // degrading.
    pub allow_synthetic_flow: bool,
    pub fail_open_on_missing_tenant: bool,
    pub session_memory_fallback: bool,
}

impl Settings {
    /// Load settings from the environment. Call after `dotenv()`.
    pub fn from_env() -> Result<Self> {
        let environment = Environment::from_str(
            &env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
        );

        let jwt_secret = env::var("JWT_SECRET").unwrap_or_else(|_| {
            "dev-secret-change-in-production-minimum-32-characters".to_string()
        });
        if environment == Environment::Production && jwt_secret.starts_with("dev-secret") {
            anyhow::bail!("JWT_SECRET must be set explicitly in production");
        }

        let cors_origins = env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000,http://localhost:4200".to_string())
            .split(',')
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect();

        // Fallbacks default on in development, off in production.
        let dev = environment == Environment::Development;

        Ok(Self {
            environment,
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string()),
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "veraproof.db".to_string()),
            artifact_root: env::var("ARTIFACT_ROOT")
                .unwrap_or_else(|_| "veraproof_artifacts".to_string()),
            artifact_signing_secret: env::var("ARTIFACT_SIGNING_SECRET")
                .unwrap_or_else(|_| jwt_secret.clone()),
            jwt_secret,
            jwt_expiration_hours: parse_env("JWT_EXPIRATION_HOURS", 1),
            refresh_token_expiration_days: parse_env("REFRESH_TOKEN_EXPIRATION_DAYS", 30),
            frontend_verification_url: env::var("FRONTEND_VERIFICATION_URL")
                .unwrap_or_else(|_| "http://localhost:3000/verify".to_string()),
            cors_origins,
            max_concurrent_sessions: parse_env("MAX_CONCURRENT_SESSIONS", 10),
            api_rate_limit_per_minute: parse_env("API_RATE_LIMIT_PER_MINUTE", 100),
            session_expiration_minutes: parse_env("SESSION_EXPIRATION_MINUTES", 15),
            session_extension_minutes: parse_env("SESSION_EXTENSION_MINUTES", 10),
            artifact_retention_days: parse_env("ARTIFACT_RETENTION_DAYS", 90),
            signed_url_expiration_seconds: parse_env("SIGNED_URL_EXPIRATION_SECONDS", 3600),
            fraud_threshold: parse_env("FRAUD_THRESHOLD", 0.85),
            classifier_timeout_seconds: parse_env("CLASSIFIER_TIMEOUT_SECONDS", 10),
            classifier_endpoint: env::var("CLASSIFIER_ENDPOINT").ok().filter(|s| !s.is_empty()),
            allow_synthetic_flow: parse_flag("ALLOW_SYNTHETIC_FLOW", dev),
            fail_open_on_missing_tenant: parse_flag("FAIL_OPEN_ON_MISSING_TENANT", dev),
            session_memory_fallback: parse_flag("SESSION_MEMORY_FALLBACK", dev),
        })
    }

    /// URL a client device opens to run the guided gesture for a session.
    pub fn session_url(&self, session_id: &str) -> String {
        format!(
            "{}?session_id={}",
            self.frontend_verification_url, session_id
        )
    }
}

fn parse_env<T: std::str::FromStr>(var: &str, default: T) -> T {
    env::var(var)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn parse_flag(var: &str, default: bool) -> bool {
    env::var(var)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

#[cfg(test)]
impl Settings {
    /// Development-shaped settings for unit tests.
    pub(crate) fn for_tests() -> Self {
        Settings {
            environment: Environment::Development,
            bind_addr: "127.0.0.1:0".to_string(),
            database_path: ":memory:".to_string(),
            artifact_root: "/tmp/veraproof-test".to_string(),
            artifact_signing_secret: "test-signing-secret".to_string(),
            jwt_secret: "test-jwt-secret".to_string(),
            jwt_expiration_hours: 1,
            refresh_token_expiration_days: 30,
            frontend_verification_url: "http://localhost:3000/verify".to_string(),
            cors_origins: vec!["http://localhost:3000".to_string()],
            max_concurrent_sessions: 10,
            api_rate_limit_per_minute: 100,
            session_expiration_minutes: 15,
            session_extension_minutes: 10,
            artifact_retention_days: 90,
            signed_url_expiration_seconds: 3600,
            fraud_threshold: 0.85,
            classifier_timeout_seconds: 10,
            classifier_endpoint: None,
            allow_synthetic_flow: true,
            fail_open_on_missing_tenant: true,
            session_memory_fallback: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_parsing() {
        assert_eq!(Environment::from_str("production"), Environment::Production);
        assert_eq!(Environment::from_str("prod"), Environment::Production);
        assert_eq!(Environment::from_str("development"), Environment::Development);
        assert_eq!(Environment::from_str("anything-else"), Environment::Development);
    }

    #[test]
    fn test_session_url_construction() {
        let mut settings = Settings::for_tests();
        settings.frontend_verification_url = "https://verify.example.com".to_string();

        let url = settings.session_url("abc-123");
        assert_eq!(url, "https://verify.example.com?session_id=abc-123");
    }
}
