//! Application State
//! Mission: One injected dependency graph, no process-wide singletons

use crate::auth::{ApiKeyManager, JwtHandler, TenantStore};
use crate::config::Settings;
use crate::fusion::{DeepfakeClassifier, SensorFusionAnalyzer, TrustScoreCombiner};
use crate::limits::{QuotaManager, RateLimiter};
use crate::session::SessionStore;
use crate::storage::ArtifactStore;
use crate::webhooks::WebhookDispatcher;
use std::sync::Arc;

/// Shared application state. Every manager is constructor-injected so tests
/// can substitute fakes; nothing here is a global.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub tenants: Arc<TenantStore>,
    pub api_keys: Arc<ApiKeyManager>,
    pub jwt: Arc<JwtHandler>,
    pub sessions: Arc<SessionStore>,
    pub rate_limiter: RateLimiter,
    pub quota: Arc<QuotaManager>,
    pub artifacts: Arc<dyn ArtifactStore>,
    /// Tier 2 classifier; None disables AI forensics entirely.
    pub classifier: Option<Arc<dyn DeepfakeClassifier>>,
    pub analyzer: Arc<SensorFusionAnalyzer>,
    pub combiner: Arc<TrustScoreCombiner>,
    pub webhooks: Arc<WebhookDispatcher>,
}
