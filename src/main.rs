//! VeraProof AI Backend - Physics-First Fraud Detection Platform
//! Mission: Verify liveness by correlating device motion with camera motion

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    middleware as axum_mw,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use dotenv::dotenv;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::{net::TcpListener, time::interval};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use veraproof_backend::{
    api,
    auth::{api_key_auth, jwt_auth, ApiKeyManager, JwtHandler, TenantStore},
    config::Settings,
    fusion::{DeepfakeClassifier, MockClassifier, RemoteClassifier, SensorFusionAnalyzer, TrustScoreCombiner},
    limits::{QuotaManager, RateLimiter},
    session::{websocket_verify, SessionStore},
    storage::{ArtifactStore, FsArtifactStore},
    webhooks::WebhookDispatcher,
    AppState,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    let settings = Settings::from_env().context("Invalid configuration")?;
    info!(
        environment = settings.environment.as_str(),
        "🚀 VeraProof backend starting"
    );

    // Persistence layer. A missing database file is created; an unreachable
    // path is non-fatal in development (the stores degrade), fatal when the
    // fallbacks are disabled.
    let tenants = Arc::new(
        TenantStore::new(&settings.database_path).context("Failed to open tenant store")?,
    );
    let api_keys = Arc::new(
        ApiKeyManager::new(&settings.database_path).context("Failed to open API key store")?,
    );
    let sessions = Arc::new(
        SessionStore::new(&settings.database_path, settings.session_memory_fallback)
            .context("Failed to open session store")?,
    );
    let webhooks = Arc::new(
        WebhookDispatcher::new(&settings.database_path, Duration::from_secs(1))
            .context("Failed to initialize webhook dispatcher")?,
    );
    info!(path = %settings.database_path, "📊 Database initialized");

    let jwt = Arc::new(JwtHandler::new(
        settings.jwt_secret.clone(),
        settings.jwt_expiration_hours,
        settings.refresh_token_expiration_days,
    ));

    let rate_limiter = RateLimiter::new(
        settings.max_concurrent_sessions,
        settings.api_rate_limit_per_minute,
    );
    let quota = Arc::new(QuotaManager::new(
        &settings.database_path,
        settings.fail_open_on_missing_tenant,
    ));

    let fs_artifacts = Arc::new(FsArtifactStore::new(
        settings.artifact_root.clone(),
        settings.artifact_signing_secret.clone(),
        public_base(&settings),
    ));
    let artifacts: Arc<dyn ArtifactStore> = fs_artifacts.clone();
    info!(root = %settings.artifact_root, "🗄️  Artifact storage initialized");

    let classifier: Option<Arc<dyn DeepfakeClassifier>> = match &settings.classifier_endpoint {
        Some(endpoint) => {
            let timeout = Duration::from_secs(settings.classifier_timeout_seconds);
            match RemoteClassifier::new(endpoint.clone(), timeout) {
                Ok(c) => {
                    info!(endpoint, "🧠 Remote deepfake classifier configured");
                    Some(Arc::new(c))
                }
                Err(e) => {
                    warn!(error = %e, "Failed to build remote classifier - using mock");
                    Some(Arc::new(MockClassifier::new()))
                }
            }
        }
        None => {
            info!("🧠 Mock deepfake classifier active (no CLASSIFIER_ENDPOINT)");
            Some(Arc::new(MockClassifier::new()))
        }
    };

    let state = AppState {
        analyzer: Arc::new(SensorFusionAnalyzer::new(settings.fraud_threshold)),
        combiner: Arc::new(TrustScoreCombiner),
        settings: Arc::new(settings),
        tenants,
        api_keys,
        jwt,
        sessions,
        rate_limiter,
        quota,
        artifacts,
        classifier,
        webhooks,
    };

    spawn_background_jobs(&state);

    let app = build_router(state.clone(), fs_artifacts);

    let addr = state.settings.bind_addr.clone();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(%addr, "🎯 API server listening");

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "veraproof_backend=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Base URL artifacts are served from, derived from the bind address.
fn public_base(settings: &Settings) -> String {
    std::env::var("PUBLIC_BASE_URL")
        .unwrap_or_else(|_| format!("http://{}", settings.bind_addr.replace("0.0.0.0", "localhost")))
}

fn build_router(state: AppState, fs_artifacts: Arc<FsArtifactStore>) -> Router {
    // Machine surface (API key auth).
    let api_key_routes = Router::new()
        .route("/api/v1/sessions/create", post(api::create_session))
        .route("/api/v1/sessions/:id", get(api::get_session))
        .route("/api/v1/sessions/:id/results", get(api::get_session_results))
        .route("/api/v1/sessions/:id/video", get(api::get_video_artifact))
        .route("/api/v1/sessions/:id/imu-data", get(api::get_imu_artifact))
        .route(
            "/api/v1/sessions/:id/optical-flow",
            get(api::get_flow_artifact),
        )
        .route_layer(axum_mw::from_fn_with_state(state.clone(), api_key_auth))
        .with_state(state.clone());

    // Dashboard surface (JWT auth).
    let jwt_routes = Router::new()
        .route("/api/v1/sessions", get(api::list_sessions))
        .route(
            "/api/v1/api-keys",
            post(api::generate_api_key).get(api::list_api_keys),
        )
        .route("/api/v1/api-keys/:key_id", delete(api::revoke_api_key))
        .route_layer(axum_mw::from_fn_with_state(state.clone(), jwt_auth))
        .with_state(state.clone());

    let auth_routes = Router::new()
        .route("/api/v1/auth/signup", post(api::signup))
        .route("/api/v1/auth/login", post(api::login))
        .route("/api/v1/auth/refresh", post(api::refresh_token))
        .with_state(state.clone());

    let ws_routes = Router::new()
        .route("/api/v1/ws/verify/:session_id", get(websocket_verify))
        .with_state(state.clone());

    let public_routes = Router::new()
        .route("/", get(api::root))
        .route("/health", get(api::health_check))
        .with_state(state.clone());

    let artifact_routes = Router::new()
        .route("/artifacts/*key", get(serve_artifact))
        .with_state(fs_artifacts);

    Router::new()
        .merge(public_routes)
        .merge(auth_routes)
        .merge(api_key_routes)
        .merge(jwt_routes)
        .merge(ws_routes)
        .merge(artifact_routes)
        .layer(cors_layer(&state.settings))
}

fn cors_layer(settings: &Settings) -> CorsLayer {
    if settings.cors_origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = settings
        .cors_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}

#[derive(Debug, Deserialize)]
struct SignedUrlParams {
    expires: i64,
    signature: String,
}

/// Serve a stored artifact against a valid, unexpired signature.
async fn serve_artifact(
    State(store): State<Arc<FsArtifactStore>>,
    Path(key): Path<String>,
    Query(params): Query<SignedUrlParams>,
) -> Response {
    if !store.verify_signature(&key, params.expires, &params.signature) {
        return (StatusCode::FORBIDDEN, "Invalid or expired signature").into_response();
    }

    match tokio::fs::read(store.artifact_path(&key)).await {
        Ok(bytes) => {
            let content_type = if key.ends_with(".json") {
                "application/json"
            } else if key.ends_with(".webm") {
                "video/webm"
            } else {
                "application/octet-stream"
            };
            ([(header::CONTENT_TYPE, content_type)], bytes).into_response()
        }
        Err(_) => (StatusCode::NOT_FOUND, "Artifact not found").into_response(),
    }
}

/// Background maintenance: session reaping, rate-window sweeping, and
/// monthly quota resets.
fn spawn_background_jobs(state: &AppState) {
    let sessions = state.sessions.clone();
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            if let Err(e) = sessions.reap_expired() {
                warn!(error = %e, "Session reaper sweep failed");
            }
        }
    });

    let rate_limiter = state.rate_limiter.clone();
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            rate_limiter.sweep();
        }
    });

    let quota = state.quota.clone();
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(86_400));
        loop {
            ticker.tick().await;
            if let Err(e) = quota.reset_monthly_quotas() {
                warn!(error = %e, "Monthly quota reset failed");
            }
        }
    });

    info!("🧹 Background jobs started (reaper, rate sweeper, quota reset)");
}
