//! API Routes
//! Mission: Expose session lifecycle and auth endpoints under /api/v1

use crate::auth::TenantContext;
use crate::error::ApiError;
use crate::models::{
    CreateApiKeyRequest, CreateSessionRequest, CreateSessionResponse, LoginRequest,
    RefreshRequest, SignupRequest, TokenResponse, UserInfo,
};
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    response::Json,
    Extension,
};
use serde_json::json;
use tracing::{info, warn};

/// POST /api/v1/sessions/create (API-key authenticated).
///
/// Admission order: rate window, then quota, then admit. Each rejection
/// carries its own error kind so clients can distinguish 429 causes.
pub async fn create_session(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    let tenant_id = &ctx.tenant_id;

    if !state.rate_limiter.check_api_rate_limit(tenant_id) {
        return Err(ApiError::RateLimited("API rate limit exceeded".to_string()));
    }

    let quota_ok = match state.quota.check_quota(tenant_id) {
        Ok(ok) => ok,
        Err(e) if state.settings.fail_open_on_missing_tenant => {
            warn!(tenant_id, error = %e, "Quota store unreachable - admitting (fail-open)");
            true
        }
        Err(e) => return Err(ApiError::Internal(e)),
    };
    if !quota_ok {
        return Err(ApiError::QuotaExhausted);
    }

    if request.return_url.is_empty() {
        return Err(ApiError::InvalidInput("return_url is required".to_string()));
    }

    // Dev-mode tenants minted by in-memory auth may not have a quota row yet.
    if state.settings.fail_open_on_missing_tenant {
        if let Err(e) = state.tenants.ensure_tenant_exists(tenant_id) {
            warn!(tenant_id, error = %e, "Could not ensure tenant row");
        }
    }

    let session = state.sessions.create(
        tenant_id,
        &request.return_url,
        request.metadata,
        state.settings.session_expiration_minutes,
    )?;

    if let Err(e) = state.quota.decrement_quota(tenant_id) {
        if state.settings.fail_open_on_missing_tenant {
            warn!(tenant_id, error = %e, "Quota decrement failed - continuing (fail-open)");
        } else {
            return Err(ApiError::Internal(e));
        }
    }

    info!(session_id = %session.session_id, tenant_id, "Session created via API");

    Ok(Json(CreateSessionResponse {
        session_url: state.settings.session_url(&session.session_id),
        session_id: session.session_id,
        expires_at: session.expires_at,
    }))
}

/// GET /api/v1/sessions/{id}
pub async fn get_session(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = state
        .sessions
        .get(&session_id)?
        .ok_or(ApiError::NotFound("Session"))?;

    if session.tenant_id != ctx.tenant_id {
        return Err(ApiError::Forbidden);
    }

    Ok(Json(serde_json::to_value(&session).map_err(|e| ApiError::Internal(e.into()))?))
}

/// GET /api/v1/sessions/{id}/results
pub async fn get_session_results(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = state
        .sessions
        .get(&session_id)?
        .ok_or(ApiError::NotFound("Session"))?;

    if session.tenant_id != ctx.tenant_id {
        return Err(ApiError::Forbidden);
    }

    Ok(Json(json!({
        "session_id": session.session_id,
        "state": session.state,
        "tier_1_score": session.tier_1_score,
        "tier_2_score": session.tier_2_score,
        "final_trust_score": session.final_trust_score,
        "correlation_value": session.correlation_value,
        "reasoning": session.reasoning,
    })))
}

async fn artifact_url(
    state: &AppState,
    ctx: &TenantContext,
    session_id: &str,
    pick: impl Fn(&crate::models::Session) -> Option<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = state
        .sessions
        .get(session_id)?
        .ok_or(ApiError::NotFound("Session"))?;

    if session.tenant_id != ctx.tenant_id {
        return Err(ApiError::NotFound("Session"));
    }

    let key = pick(&session).ok_or(ApiError::NotFound("Artifact"))?;

    let url = state
        .artifacts
        .signed_url(&key, state.settings.signed_url_expiration_seconds)
        .map_err(|_| ApiError::NotFound("Artifact"))?;

    Ok(Json(json!({ "url": url })))
}

/// GET /api/v1/sessions/{id}/video
pub async fn get_video_artifact(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    artifact_url(&state, &ctx, &session_id, |s| s.video_key.clone()).await
}

/// GET /api/v1/sessions/{id}/imu-data
pub async fn get_imu_artifact(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    artifact_url(&state, &ctx, &session_id, |s| s.imu_key.clone()).await
}

/// GET /api/v1/sessions/{id}/optical-flow
pub async fn get_flow_artifact(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    artifact_url(&state, &ctx, &session_id, |s| s.flow_key.clone()).await
}

fn token_response(state: &AppState, user: &crate::auth::tenants::User) -> Result<TokenResponse, ApiError> {
    let access_token = state
        .jwt
        .generate_access_token(&user.user_id, &user.tenant_id, &user.email, &user.role)
        .map_err(ApiError::Internal)?;
    let refresh_token = state
        .jwt
        .generate_refresh_token(&user.user_id, &user.tenant_id, &user.email, &user.role)
        .map_err(ApiError::Internal)?;

    Ok(TokenResponse {
        access_token,
        refresh_token,
        token_type: "bearer",
        user: UserInfo {
            user_id: user.user_id.clone(),
            tenant_id: user.tenant_id.clone(),
            email: user.email.clone(),
            role: user.role.clone(),
        },
    })
}

/// POST /api/v1/auth/signup
pub async fn signup(
    State(state): State<AppState>,
    Json(request): Json<SignupRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    if request.email.is_empty() || !request.email.contains('@') {
        return Err(ApiError::InvalidInput("Invalid email".to_string()));
    }
    if request.password.len() < 8 {
        return Err(ApiError::InvalidInput(
            "Password must be at least 8 characters".to_string(),
        ));
    }

    let user = state
        .tenants
        .signup(&request.email, &request.password)
        .map_err(|e| ApiError::InvalidInput(e.to_string()))?;

    Ok(Json(token_response(&state, &user)?))
}

/// POST /api/v1/auth/login
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let user = state
        .tenants
        .login(&request.email, &request.password)
        .map_err(ApiError::Internal)?
        .ok_or_else(|| ApiError::AuthInvalid("Invalid credentials".to_string()))?;

    Ok(Json(token_response(&state, &user)?))
}

/// POST /api/v1/auth/refresh
pub async fn refresh_token(
    State(state): State<AppState>,
    Json(request): Json<RefreshRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let claims = state.jwt.validate_refresh_token(&request.refresh_token)?;

    let user = state
        .tenants
        .get_user_by_id(&claims.sub)
        .map_err(ApiError::Internal)?
        .ok_or_else(|| ApiError::AuthInvalid("User not found".to_string()))?;

    let access_token = state
        .jwt
        .generate_access_token(&user.user_id, &user.tenant_id, &user.email, &user.role)
        .map_err(ApiError::Internal)?;

    Ok(Json(json!({
        "access_token": access_token,
        "token_type": "bearer",
    })))
}

/// POST /api/v1/api-keys (JWT authenticated).
pub async fn generate_api_key(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Json(request): Json<CreateApiKeyRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let key = state
        .api_keys
        .generate(&ctx.tenant_id, &request.environment)
        .map_err(|e| ApiError::InvalidInput(e.to_string()))?;

    Ok(Json(json!({
        "key_id": key.key_id,
        "api_key": key.api_key,
        "environment": key.environment,
    })))
}

/// GET /api/v1/api-keys (JWT authenticated).
pub async fn list_api_keys(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let keys = state
        .api_keys
        .list_for_tenant(&ctx.tenant_id)
        .map_err(ApiError::Internal)?;

    let keys: Vec<_> = keys
        .into_iter()
        .map(|k| {
            json!({
                "key_id": k.key_id,
                "api_key": k.api_key,
                "environment": k.environment,
                "created_at": k.created_at,
                "revoked_at": k.revoked_at,
            })
        })
        .collect();

    Ok(Json(json!(keys)))
}

/// DELETE /api/v1/api-keys/{key_id} (JWT authenticated).
pub async fn revoke_api_key(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(key_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let revoked = state
        .api_keys
        .revoke(&key_id, &ctx.tenant_id)
        .map_err(ApiError::Internal)?;

    if !revoked {
        return Err(ApiError::NotFound("API key"));
    }

    Ok(Json(json!({ "message": "API key revoked" })))
}

/// GET /api/v1/sessions (JWT authenticated, tenant-scoped listing).
pub async fn list_sessions(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    axum::extract::Query(params): axum::extract::Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let limit = params.limit.unwrap_or(100).min(500);
    let offset = params.offset.unwrap_or(0);

    let sessions = state
        .sessions
        .list_by_tenant(&ctx.tenant_id, limit, offset)
        .map_err(ApiError::Internal)?;

    Ok(Json(json!({
        "count": sessions.len(),
        "sessions": sessions,
    })))
}

#[derive(Debug, serde::Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// GET /health
pub async fn health_check() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

/// GET /
pub async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "service": "VeraProof AI",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}
