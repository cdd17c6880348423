//! Authentication Middleware
//! Mission: Resolve bearer credentials to a tenant before handlers run

use crate::auth::jwt::TokenType;
use crate::error::ApiError;
use crate::state::AppState;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

/// Validated caller identity, inserted into request extensions.
#[derive(Debug, Clone)]
pub struct TenantContext {
    pub tenant_id: String,
    /// Set for API-key callers (sandbox|production); None for JWT callers.
    pub environment: Option<String>,
}

fn bearer_token(req: &Request) -> Result<String, ApiError> {
    req.headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|t| t.to_string())
        .ok_or_else(|| ApiError::AuthInvalid("Missing authorization header".to_string()))
}

/// Machine auth: `Authorization: Bearer vp_<env>_<hex>`.
pub async fn api_key_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(&req)?;
    let (tenant_id, environment) = state.api_keys.validate(&token)?;

    req.extensions_mut().insert(TenantContext {
        tenant_id,
        environment: Some(environment),
    });

    Ok(next.run(req).await)
}

/// Dashboard auth: `Authorization: Bearer <jwt>` (access tokens only).
pub async fn jwt_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(&req)?;
    let claims = state.jwt.validate_token(&token)?;

    if claims.token_type != TokenType::Access {
        return Err(ApiError::AuthInvalid("Invalid token type".to_string()));
    }

    req.extensions_mut().insert(TenantContext {
        tenant_id: claims.tenant_id,
        environment: None,
    });

    Ok(next.run(req).await)
}
