//! JWT Token Handler
//! Mission: Generate and validate dashboard access and refresh tokens

use crate::error::ApiError;
use anyhow::{Context, Result};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

/// JWT claims payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id).
    pub sub: String,
    pub tenant_id: String,
    pub email: String,
    pub role: String,
    pub token_type: TokenType,
    /// Expiration, unix seconds.
    pub exp: usize,
}

pub struct JwtHandler {
    secret: String,
    access_expiration_hours: i64,
    refresh_expiration_days: i64,
}

impl JwtHandler {
    pub fn new(secret: String, access_expiration_hours: i64, refresh_expiration_days: i64) -> Self {
        Self {
            secret,
            access_expiration_hours,
            refresh_expiration_days,
        }
    }

    pub fn generate_access_token(
        &self,
        user_id: &str,
        tenant_id: &str,
        email: &str,
        role: &str,
    ) -> Result<String> {
        self.generate(
            user_id,
            tenant_id,
            email,
            role,
            TokenType::Access,
            chrono::Duration::hours(self.access_expiration_hours),
        )
    }

    pub fn generate_refresh_token(
        &self,
        user_id: &str,
        tenant_id: &str,
        email: &str,
        role: &str,
    ) -> Result<String> {
        self.generate(
            user_id,
            tenant_id,
            email,
            role,
            TokenType::Refresh,
            chrono::Duration::days(self.refresh_expiration_days),
        )
    }

    fn generate(
        &self,
        user_id: &str,
        tenant_id: &str,
        email: &str,
        role: &str,
        token_type: TokenType,
        lifetime: chrono::Duration,
    ) -> Result<String> {
        let expiration = Utc::now()
            .checked_add_signed(lifetime)
            .context("Invalid timestamp")?
            .timestamp() as usize;

        let claims = Claims {
            sub: user_id.to_string(),
            tenant_id: tenant_id.to_string(),
            email: email.to_string(),
            role: role.to_string(),
            token_type,
            exp: expiration,
        };

        debug!(user_id, tenant_id, ?token_type, "Generating JWT");

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .context("Failed to generate JWT")
    }

    /// Validate a token and return its claims. Expired tokens map to
    /// `AUTH_EXPIRED`, everything else to `AUTH_INVALID`.
    pub fn validate_token(&self, token: &str) -> Result<Claims, ApiError> {
        let decoded = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => ApiError::AuthExpired,
            _ => ApiError::AuthInvalid("Invalid token".to_string()),
        })?;

        Ok(decoded.claims)
    }

    /// Validate a refresh token specifically.
    pub fn validate_refresh_token(&self, token: &str) -> Result<Claims, ApiError> {
        let claims = self.validate_token(token)?;
        if claims.token_type != TokenType::Refresh {
            return Err(ApiError::AuthInvalid("Invalid token type".to_string()));
        }
        Ok(claims)
    }
}
