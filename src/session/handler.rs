//! Verification Session Core
//! Mission: Drive the per-connection state machine from stream to verdict
//!
//! One handler task owns the socket and the sensor window; all buffer
//! mutation happens inside this loop (single-owner actor). Suspension points
//! are socket I/O, store writes, artifact uploads, and the classifier call;
//! none of them is reached while a lock is held.

use crate::error::ApiError;
use crate::fusion::OpticalFlowEngine;
use crate::models::{
    ImuSample, ResultPayload, ServerMessage, Session, SessionState, VerificationStatus,
    WebhookPayload,
};
use crate::state::AppState;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use chrono::Utc;
use std::borrow::Cow;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Minimum aligned samples per series before Tier 1 can run.
const MIN_ALIGNED_SAMPLES: usize = 10;

const CLOSE_NORMAL: u16 = 1000;
const CLOSE_POLICY: u16 = 1008;
const CLOSE_INTERNAL: u16 = 1011;

/// One buffered video chunk with its server-side arrival timestamp.
#[derive(Debug, Clone)]
pub struct VideoChunk {
    pub data: Vec<u8>,
    pub timestamp: f64,
}

/// Ephemeral per-session buffers, owned exclusively by the live connection.
pub struct SensorWindow {
    pub video_chunks: Vec<VideoChunk>,
    pub imu_samples: Vec<ImuSample>,
    pub gyro_gamma: Vec<f64>,
    pub optical_flow_x: Vec<f64>,
    pub phase: SessionState,
    pub start_time: chrono::DateTime<Utc>,
}

impl SensorWindow {
    pub fn new() -> Self {
        Self {
            video_chunks: Vec::new(),
            imu_samples: Vec::new(),
            gyro_gamma: Vec::new(),
            optical_flow_x: Vec::new(),
            phase: SessionState::Idle,
            start_time: Utc::now(),
        }
    }

    pub fn push_video(&mut self, data: Vec<u8>) {
        debug!(chunk_size = data.len(), "Video chunk buffered");
        self.video_chunks.push(VideoChunk {
            data,
            timestamp: Utc::now().timestamp_millis() as f64 / 1000.0,
        });
    }

    /// Buffer an IMU batch, extracting usable gamma values. Null, NaN, and
    /// exactly-zero gamma readings are dropped before they can poison the
    /// correlation.
    pub fn push_imu_batch(&mut self, samples: Vec<ImuSample>) {
        for sample in &samples {
            if let Some(gamma) = sample.rotation_rate.gamma {
                if gamma.is_finite() && gamma != 0.0 {
                    self.gyro_gamma.push(gamma);
                }
            }
        }
        self.imu_samples.extend(samples);

        debug!(
            total_imu = self.imu_samples.len(),
            total_gyro = self.gyro_gamma.len(),
            "IMU sensor batch processed"
        );
    }

    /// Concatenate video chunks in arrival order.
    pub fn assembled_video(&self) -> Vec<u8> {
        let total: usize = self.video_chunks.iter().map(|c| c.data.len()).sum();
        let mut video = Vec::with_capacity(total);
        for chunk in &self.video_chunks {
            video.extend_from_slice(&chunk.data);
        }
        video
    }
}

impl Default for SensorWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Development-only stand-in for optical flow when the pipeline produced no
/// samples: gamma scaled down with a small deterministic perturbation.
pub fn synthetic_flow(gyro_gamma: &[f64]) -> Vec<f64> {
    gyro_gamma
        .iter()
        .enumerate()
        .map(|(i, g)| g * 0.9 + ((i % 3) as f64 - 1.0) * 0.1)
        .collect()
}

/// `GET /api/v1/ws/verify/{session_id}` upgrade handler.
pub async fn websocket_verify(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, state))
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: Cow::Owned(reason.to_string()),
        })))
        .await;
}

async fn send_message(socket: &mut WebSocket, message: &ServerMessage) -> bool {
    let text = match serde_json::to_string(message) {
        Ok(t) => t,
        Err(e) => {
            error!(error = %e, "Failed to serialize server message");
            return false;
        }
    };
    socket.send(Message::Text(text)).await.is_ok()
}

async fn handle_socket(mut socket: WebSocket, session_id: String, state: AppState) {
    let session = match state.sessions.get(&session_id) {
        Ok(Some(session)) => session,
        Ok(None) => {
            warn!(session_id, "WebSocket connect for unknown session");
            close_with(&mut socket, CLOSE_POLICY, "Session not found").await;
            return;
        }
        Err(e) => {
            error!(session_id, error = %e, "Session lookup failed on connect");
            close_with(&mut socket, CLOSE_INTERNAL, "Internal error").await;
            return;
        }
    };

    if session.state.is_terminal() || session.is_expired(Utc::now()) {
        close_with(&mut socket, CLOSE_POLICY, "Session not found").await;
        return;
    }

    // Concurrency gate. The permit is held for the life of the connection
    // and released on drop, abnormal disconnects included.
    let Some(_permit) = state.rate_limiter.acquire_session_permit(&session.tenant_id) else {
        send_message(
            &mut socket,
            &ServerMessage::Error {
                message: "Concurrent session limit exceeded".to_string(),
            },
        )
        .await;
        close_with(&mut socket, CLOSE_POLICY, "Concurrent session limit exceeded").await;
        return;
    };

    info!(session_id, tenant_id = %session.tenant_id, "WebSocket connected");

    // Verification is starting: baseline phase, extended deadline.
    let _ = state.sessions.set_state(&session_id, SessionState::Baseline);
    let _ = state
        .sessions
        .extend_expiry(&session_id, state.settings.session_extension_minutes);

    let branding = state
        .tenants
        .get_branding(&session.tenant_id)
        .unwrap_or_default();
    if !send_message(&mut socket, &ServerMessage::Branding(branding)).await {
        return;
    }
    if !send_phase(&mut socket, &state, &session_id, SessionState::Baseline).await {
        return;
    }

    let mut window = SensorWindow::new();
    window.phase = SessionState::Baseline;
    let mut flow_engine = OpticalFlowEngine::new();

    // The socket idles out together with the (extended) session expiry.
    let deadline = Duration::from_secs(state.settings.session_extension_minutes.max(1) as u64 * 60);

    loop {
        let received = match tokio::time::timeout(deadline, socket.recv()).await {
            Ok(msg) => msg,
            Err(_) => {
                warn!(session_id, "Session timed out waiting for client data");
                send_message(
                    &mut socket,
                    &ServerMessage::Error {
                        message: "Session expired".to_string(),
                    },
                )
                .await;
                close_with(&mut socket, CLOSE_NORMAL, "Session expired").await;
                break;
            }
        };

        let message = match received {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                warn!(session_id, error = %e, "WebSocket receive error");
                break;
            }
            None => {
                info!(session_id, "WebSocket disconnected");
                break;
            }
        };

        match message {
            Message::Binary(data) => {
                if let Some(magnitude) = flow_engine.process_chunk(&data) {
                    window.optical_flow_x.push(magnitude);
                }
                window.push_video(data);
            }
            Message::Text(text) => {
                match handle_text(&mut socket, &state, &session, &mut window, &text).await {
                    TextOutcome::Continue => {}
                    TextOutcome::Finished => break,
                }
            }
            Message::Close(_) => {
                info!(session_id, "WebSocket closed by client");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    flow_engine.reset();
}

enum TextOutcome {
    Continue,
    Finished,
}

async fn handle_text(
    socket: &mut WebSocket,
    state: &AppState,
    session: &Session,
    window: &mut SensorWindow,
    text: &str,
) -> TextOutcome {
    let parsed: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(session_id = %session.session_id, error = %e, "Undecodable client message");
            return TextOutcome::Continue;
        }
    };

    let msg_type = parsed.get("type").and_then(|t| t.as_str()).unwrap_or("");
    let payload = parsed.get("payload").cloned().unwrap_or(serde_json::Value::Null);

    match msg_type {
        "imu_batch" => {
            match serde_json::from_value::<Vec<ImuSample>>(payload) {
                Ok(samples) if !samples.is_empty() => window.push_imu_batch(samples),
                Ok(_) => warn!(session_id = %session.session_id, "Empty IMU payload"),
                Err(e) => {
                    warn!(session_id = %session.session_id, error = %e, "Invalid IMU batch")
                }
            }
            TextOutcome::Continue
        }
        "phase_complete" => {
            let phase = payload.get("phase").and_then(|p| p.as_str()).unwrap_or("");
            info!(session_id = %session.session_id, phase, "Verification phase completed");

            match phase {
                "baseline" => {
                    window.phase = SessionState::Pan;
                    send_phase(socket, state, &session.session_id, SessionState::Pan).await;
                    TextOutcome::Continue
                }
                "pan" => {
                    window.phase = SessionState::Return;
                    send_phase(socket, state, &session.session_id, SessionState::Return).await;
                    TextOutcome::Continue
                }
                "return" => {
                    match run_analysis(state, session, window).await {
                        Ok(result) => {
                            send_message(socket, &ServerMessage::Result(result)).await;
                            close_with(socket, CLOSE_NORMAL, "Verification complete").await;
                        }
                        Err(e) => {
                            warn!(
                                session_id = %session.session_id,
                                kind = e.kind(),
                                "Verification failed"
                            );
                            send_message(
                                socket,
                                &ServerMessage::Error {
                                    message: e.detail(),
                                },
                            )
                            .await;
                            close_with(socket, CLOSE_INTERNAL, "Verification failed").await;
                        }
                    }
                    TextOutcome::Finished
                }
                other => {
                    warn!(session_id = %session.session_id, phase = other, "Unknown phase");
                    TextOutcome::Continue
                }
            }
        }
        other => {
            warn!(session_id = %session.session_id, msg_type = other, "Unknown client message type");
            TextOutcome::Continue
        }
    }
}

async fn send_phase(
    socket: &mut WebSocket,
    state: &AppState,
    session_id: &str,
    phase: SessionState,
) -> bool {
    let sent = send_message(
        socket,
        &ServerMessage::PhaseChange {
            phase: phase.as_str().to_string(),
        },
    )
    .await;

    if sent {
        let _ = state.sessions.set_state(session_id, phase);
    }
    sent
}

/// The ANALYZING stage: align streams, score, persist, notify.
///
/// Classifier and artifact failures are recovered locally (degraded score,
/// degraded keys); only insufficient sensor data aborts the verification.
pub async fn run_analysis(
    state: &AppState,
    session: &Session,
    window: &mut SensorWindow,
) -> Result<ResultPayload, ApiError> {
    let session_id = &session.session_id;
    let _ = state.sessions.set_state(session_id, SessionState::Analyzing);
    window.phase = SessionState::Analyzing;

    let gyro = window.gyro_gamma.clone();
    let mut flow = window.optical_flow_x.clone();

    if flow.is_empty() && state.settings.allow_synthetic_flow {
        warn!(session_id, "Optical flow pipeline inactive - using synthetic flow (dev mode)");
        flow = synthetic_flow(&gyro);
    }

    info!(
        session_id,
        gyro_samples = gyro.len(),
        flow_samples = flow.len(),
        "Sensor fusion analysis starting"
    );

    if gyro.len() < MIN_ALIGNED_SAMPLES || flow.len() < MIN_ALIGNED_SAMPLES {
        return Err(ApiError::InsufficientData);
    }

    let tier_1 = state.analyzer.analyze(&gyro, &flow);

    // Tier 2 only on suspicion, bounded, and never fatal.
    let mut degraded = false;
    let tier_2_score = if tier_1.trigger_tier_2 {
        match &state.classifier {
            Some(classifier) => {
                let video_ref =
                    format!("{}/sessions/{session_id}/video.webm", session.tenant_id);
                let timeout = Duration::from_secs(state.settings.classifier_timeout_seconds);

                match tokio::time::timeout(timeout, classifier.classify(&video_ref)).await {
                    Ok(Ok(detection)) => Some(state.combiner.tier_2_score(&detection)),
                    Ok(Err(e)) => {
                        warn!(session_id, error = %e, "Classifier unavailable - degraded mode");
                        degraded = true;
                        None
                    }
                    Err(_) => {
                        warn!(session_id, "Classifier timed out - degraded mode");
                        degraded = true;
                        None
                    }
                }
            }
            None => None,
        }
    } else {
        None
    };

    let (final_trust_score, reasoning) = if degraded {
        state.combiner.degraded_score(tier_1.tier_1_score)
    } else {
        state
            .combiner
            .final_score(tier_1.tier_1_score, tier_2_score)
    };

    let status = if final_trust_score >= 70 {
        VerificationStatus::Success
    } else {
        VerificationStatus::Failed
    };

    state
        .sessions
        .set_results(
            session_id,
            tier_1.tier_1_score,
            tier_2_score,
            final_trust_score,
            tier_1.correlation,
            &reasoning,
        )
        .map_err(ApiError::Internal)?;

    upload_artifacts(state, session, window).await;

    fire_webhooks(
        state,
        session,
        tier_1.tier_1_score,
        tier_2_score,
        final_trust_score,
        status,
    );

    info!(
        session_id,
        final_trust_score,
        correlation = tier_1.correlation,
        status = status.as_str(),
        "Verification concluded"
    );

    Ok(ResultPayload {
        status,
        final_trust_score,
        correlation_value: tier_1.correlation,
        reasoning,
    })
}

/// Persist artifacts and store their keys. Storage failures degrade to
/// synthetic keys inside the sink; they never abort the session.
async fn upload_artifacts(state: &AppState, session: &Session, window: &mut SensorWindow) {
    let tenant_id = &session.tenant_id;
    let session_id = &session.session_id;

    let video_key = (!window.video_chunks.is_empty()).then(|| {
        state
            .artifacts
            .put_video(tenant_id, session_id, &window.assembled_video())
    });

    let imu_key = (!window.imu_samples.is_empty())
        .then(|| state.artifacts.put_imu(tenant_id, session_id, &window.imu_samples));

    let flow_key = (!window.optical_flow_x.is_empty())
        .then(|| state.artifacts.put_flow(tenant_id, session_id, &window.optical_flow_x));

    if video_key.is_some() || imu_key.is_some() || flow_key.is_some() {
        let result = state.sessions.set_artifact_keys(
            session_id,
            video_key.as_deref(),
            imu_key.as_deref(),
            flow_key.as_deref(),
        );
        if let Err(e) = result {
            error!(session_id, error = %e, "Failed to store artifact keys");
        }

        for key in [&video_key, &imu_key, &flow_key].into_iter().flatten() {
            state
                .artifacts
                .schedule_deletion(key, state.settings.artifact_retention_days);
        }
    }

    // Free the sensor window buffers now that artifacts are out.
    window.video_chunks.clear();
    window.imu_samples.clear();
}

/// Enqueue webhook delivery without blocking session close.
fn fire_webhooks(
    state: &AppState,
    session: &Session,
    tier_1_score: i64,
    tier_2_score: Option<i64>,
    final_trust_score: i64,
    status: VerificationStatus,
) {
    let api_secret = match state.tenants.api_secret(&session.tenant_id) {
        Ok(Some(secret)) => secret,
        Ok(None) => {
            debug!(tenant_id = %session.tenant_id, "No tenant secret - skipping webhooks");
            return;
        }
        Err(e) => {
            warn!(tenant_id = %session.tenant_id, error = %e, "Failed to load tenant secret");
            return;
        }
    };

    let payload = WebhookPayload {
        session_id: session.session_id.clone(),
        tier_1_score,
        tier_2_score,
        final_trust_score,
        verification_status: status.as_str().to_string(),
        timestamp: Utc::now(),
        metadata: session.metadata.clone(),
    };

    let dispatcher = state.webhooks.clone();
    let tenant_id = session.tenant_id.clone();
    tokio::spawn(async move {
        dispatcher
            .dispatch_completion(&tenant_id, &payload, &api_secret)
            .await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::{DeepfakeDetection, MockClassifier};
    use crate::state::test_support::test_state;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn imu_sample(gamma: Option<f64>) -> ImuSample {
        ImuSample {
            timestamp: 0.0,
            acceleration: Default::default(),
            rotation_rate: crate::models::RotationRate {
                alpha: None,
                beta: None,
                gamma,
            },
        }
    }

    fn make_session(state: &crate::state::AppState) -> Session {
        state.tenants.create_tenant("tenant-1", "t@example.com").unwrap();
        state
            .sessions
            .create("tenant-1", "https://example.com/done", HashMap::new(), 15)
            .unwrap()
    }

    #[test]
    fn test_gyro_filter_drops_null_nan_zero() {
        let mut window = SensorWindow::new();
        window.push_imu_batch(vec![
            imu_sample(Some(1.5)),
            imu_sample(None),
            imu_sample(Some(0.0)),
            imu_sample(Some(f64::NAN)),
            imu_sample(Some(-2.5)),
        ]);

        assert_eq!(window.gyro_gamma, vec![1.5, -2.5]);
        assert_eq!(window.imu_samples.len(), 5);
    }

    #[test]
    fn test_video_assembly_preserves_order() {
        let mut window = SensorWindow::new();
        window.push_video(vec![1, 2, 3]);
        window.push_video(vec![4, 5]);
        window.push_video(vec![6]);

        assert_eq!(window.assembled_video(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_synthetic_flow_formula() {
        let gyro = [1.0, 2.0, 3.0];
        let flow = synthetic_flow(&gyro);

        assert!((flow[0] - (0.9 - 0.1)).abs() < 1e-9);
        assert!((flow[1] - 1.8).abs() < 1e-9);
        assert!((flow[2] - (2.7 + 0.1)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_happy_path_tier_1_only() {
        let (state, _dir) = test_state();
        let session = make_session(&state);

        let mut window = SensorWindow::new();
        window.gyro_gamma = (1..=10).map(|v| v as f64).collect();
        window.optical_flow_x = (1..=10).map(|v| (v * 2) as f64).collect();
        window.push_video(vec![0u8; 128]);
        window.push_imu_batch(vec![imu_sample(Some(1.0))]);

        let result = run_analysis(&state, &session, &mut window).await.unwrap();

        assert_eq!(result.final_trust_score, 100);
        assert!((result.correlation_value - 1.0).abs() < 1e-9);
        assert_eq!(result.status, VerificationStatus::Success);
        assert!(result.reasoning.contains("No AI forensics required"));

        let stored = state.sessions.get(&session.session_id).unwrap().unwrap();
        assert_eq!(stored.state, SessionState::Complete);
        assert!(stored.has_results());
        assert_eq!(stored.tier_1_score, Some(100));
        assert!(stored.tier_2_score.is_none());
        assert!(stored.video_key.is_some());
        assert!(stored.imu_key.is_some());
        assert!(stored.flow_key.is_some());
    }

    #[tokio::test]
    async fn test_suspicious_motion_triggers_tier_2() {
        let (mut state, _dir) = test_state();
        state.classifier = Some(Arc::new(MockClassifier::returning(DeepfakeDetection {
            is_deepfake: false,
            confidence: 0.9,
            diffusion_artifacts_detected: false,
            gan_ghosting_detected: false,
            processing_time_ms: 5,
        })));
        let session = make_session(&state);

        let mut window = SensorWindow::new();
        // Perfect anti-correlation: tier 1 score 0, tier 2 triggered.
        window.gyro_gamma = (1..=10).map(|v| v as f64).collect();
        window.optical_flow_x = (1..=10).map(|v| (22 - 2 * v) as f64).collect();

        let result = run_analysis(&state, &session, &mut window).await.unwrap();

        // floor(0 * 0.6 + 90 * 0.4) = 36
        assert_eq!(result.final_trust_score, 36);
        assert_eq!(result.status, VerificationStatus::Failed);

        let stored = state.sessions.get(&session.session_id).unwrap().unwrap();
        assert_eq!(stored.tier_1_score, Some(0));
        assert_eq!(stored.tier_2_score, Some(90));
        assert_eq!(stored.final_trust_score, Some(36));
        assert!((stored.correlation_value.unwrap() + 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_classifier_failure_degrades_gracefully() {
        struct FailingClassifier;

        #[async_trait::async_trait]
        impl crate::fusion::DeepfakeClassifier for FailingClassifier {
            async fn classify(&self, _: &str) -> anyhow::Result<DeepfakeDetection> {
                anyhow::bail!("inference endpoint down")
            }
        }

        let (mut state, _dir) = test_state();
        state.classifier = Some(Arc::new(FailingClassifier));
        let session = make_session(&state);

        let mut window = SensorWindow::new();
        window.gyro_gamma = (1..=10).map(|v| v as f64).collect();
        window.optical_flow_x = (1..=10).map(|v| (22 - 2 * v) as f64).collect();

        let result = run_analysis(&state, &session, &mut window).await.unwrap();

        assert!(result.reasoning.contains("degraded mode"));
        let stored = state.sessions.get(&session.session_id).unwrap().unwrap();
        assert_eq!(stored.state, SessionState::Complete);
        assert!(stored.tier_2_score.is_none());
    }

    #[tokio::test]
    async fn test_insufficient_data_aborts_without_complete() {
        let (mut state, _dir) = test_state();
        {
            let settings = Arc::make_mut(&mut state.settings);
            settings.allow_synthetic_flow = false;
        }
        let session = make_session(&state);

        let mut window = SensorWindow::new();
        window.gyro_gamma = vec![1.0, 2.0, 3.0, 4.0, 5.0];

        let err = run_analysis(&state, &session, &mut window).await.unwrap_err();
        assert_eq!(err.kind(), "INSUFFICIENT_DATA");

        let stored = state.sessions.get(&session.session_id).unwrap().unwrap();
        assert_ne!(stored.state, SessionState::Complete);
        assert!(!stored.has_results());
    }

    #[tokio::test]
    async fn test_synthetic_flow_fallback_dev_only() {
        let (state, _dir) = test_state();
        assert!(state.settings.allow_synthetic_flow);
        let session = make_session(&state);

        let mut window = SensorWindow::new();
        window.gyro_gamma = (1..=12).map(|v| v as f64).collect();
        // No optical flow at all: dev mode synthesizes it from gamma.

        let result = run_analysis(&state, &session, &mut window).await.unwrap();
        assert!(result.final_trust_score >= 85);
        assert_eq!(result.status, VerificationStatus::Success);
    }

    #[tokio::test]
    async fn test_production_requires_real_flow() {
        let (mut state, _dir) = test_state();
        {
            let settings = Arc::make_mut(&mut state.settings);
            settings.allow_synthetic_flow = false;
        }
        let session = make_session(&state);

        let mut window = SensorWindow::new();
        window.gyro_gamma = (1..=12).map(|v| v as f64).collect();

        let err = run_analysis(&state, &session, &mut window).await.unwrap_err();
        assert_eq!(err.kind(), "INSUFFICIENT_DATA");
    }
}
