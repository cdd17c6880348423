//! Tier 2: AI Forensics
//! Mission: Deepfake classification behind a swappable interface, plus the
//! final trust-score combination.
//!
//! Tier 2 is only invoked when Tier 1 flags the submission (r < 0.85).

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// Classification result returned by the deepfake model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepfakeDetection {
    pub is_deepfake: bool,
    pub confidence: f64,
    pub diffusion_artifacts_detected: bool,
    pub gan_ghosting_detected: bool,
    pub processing_time_ms: u64,
}

/// A potentially slow, fallible classification RPC. Callers bound it with a
/// timeout and must tolerate failure (degraded-mode scoring).
#[async_trait]
pub trait DeepfakeClassifier: Send + Sync {
    async fn classify(&self, video_ref: &str) -> Result<DeepfakeDetection>;
}

/// Mock classifier returning randomized plausible values after a simulated
/// inference delay. Used in development and tests.
pub struct MockClassifier {
    rng: Mutex<ChaCha8Rng>,
    latency: Option<(Duration, Duration)>,
    fixed: Option<DeepfakeDetection>,
}

impl MockClassifier {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(ChaCha8Rng::from_entropy()),
            latency: Some((Duration::from_millis(1000), Duration::from_millis(3000))),
            fixed: None,
        }
    }

    /// Deterministic variant for tests.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
            latency: None,
            fixed: None,
        }
    }

    /// Always returns the given detection, immediately.
    pub fn returning(detection: DeepfakeDetection) -> Self {
        Self {
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(0)),
            latency: None,
            fixed: Some(detection),
        }
    }
}

impl Default for MockClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeepfakeClassifier for MockClassifier {
    async fn classify(&self, video_ref: &str) -> Result<DeepfakeDetection> {
        let (delay, result) = {
            let mut rng = self.rng.lock();

            let delay = self
                .latency
                .map(|(lo, hi)| rng.gen_range(lo..=hi))
                .unwrap_or(Duration::ZERO);

            let result = if let Some(fixed) = &self.fixed {
                fixed.clone()
            } else {
                let is_deepfake = rng.gen_bool(0.5);
                let confidence = if is_deepfake {
                    rng.gen_range(0.6..0.95)
                } else {
                    rng.gen_range(0.05..0.4)
                };
                DeepfakeDetection {
                    is_deepfake,
                    confidence,
                    diffusion_artifacts_detected: rng.gen_bool(0.5),
                    gan_ghosting_detected: rng.gen_bool(0.5),
                    processing_time_ms: delay.as_millis() as u64,
                }
            };
            (delay, result)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        info!(video_ref, ?result, "Mock deepfake detection");
        Ok(result)
    }
}

/// Classifier backed by a remote inference endpoint.
pub struct RemoteClassifier {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Serialize)]
struct InferenceRequest<'a> {
    video_ref: &'a str,
}

impl RemoteClassifier {
    pub fn new(endpoint: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build classifier HTTP client")?;

        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl DeepfakeClassifier for RemoteClassifier {
    async fn classify(&self, video_ref: &str) -> Result<DeepfakeDetection> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&InferenceRequest { video_ref })
            .send()
            .await
            .context("Classifier endpoint unreachable")?
            .error_for_status()
            .context("Classifier endpoint returned error status")?;

        let detection = response
            .json::<DeepfakeDetection>()
            .await
            .context("Invalid classifier response body")?;

        info!(video_ref, ?detection, "Remote deepfake detection");
        Ok(detection)
    }
}

/// Combines Tier 1 and optional Tier 2 into the final trust score with
/// human-readable reasoning.
#[derive(Debug, Clone, Default)]
pub struct TrustScoreCombiner;

impl TrustScoreCombiner {
    /// Map a detection to the Tier 2 trust score: confident deepfake means
    /// low trust, confident authentic means high trust.
    pub fn tier_2_score(&self, detection: &DeepfakeDetection) -> i64 {
        let score = if detection.is_deepfake {
            (1.0 - detection.confidence) * 100.0
        } else {
            detection.confidence * 100.0
        };

        (score.round() as i64).clamp(0, 100)
    }

    /// Weighted final score: Tier 1 alone, or 60% Tier 1 + 40% Tier 2.
    pub fn final_score(&self, tier_1_score: i64, tier_2_score: Option<i64>) -> (i64, String) {
        match tier_2_score {
            None => {
                let reasoning = format!(
                    "Verification passed Tier 1 sensor fusion analysis. \
                     Correlation between device motion and video content is strong \
                     (score: {tier_1_score}/100). No AI forensics required."
                );
                (tier_1_score, reasoning)
            }
            Some(tier_2) => {
                let final_score =
                    (tier_1_score as f64 * 0.6 + tier_2 as f64 * 0.4).floor() as i64;

                let verdict = if final_score >= 85 {
                    "Verification passed with high confidence."
                } else if final_score >= 70 {
                    "Verification passed with moderate confidence."
                } else if final_score >= 50 {
                    "Verification flagged: low confidence."
                } else {
                    "Verification failed: fraud suspected."
                };

                let reasoning = format!(
                    "Combined analysis: Tier 1 sensor fusion score {tier_1_score}/100, \
                     Tier 2 AI forensics score {tier_2}/100. \
                     Final trust score: {final_score}/100 (weighted 60/40). {verdict}"
                );
                (final_score, reasoning)
            }
        }
    }

    /// Degraded-mode combination when the classifier was triggered but
    /// unavailable: Tier 1 stands alone and the reasoning records the gap.
    pub fn degraded_score(&self, tier_1_score: i64) -> (i64, String) {
        let reasoning = format!(
            "Tier 1 sensor fusion score {tier_1_score}/100. \
             AI forensics was requested but unavailable; trust score reflects \
             sensor fusion only (degraded mode)."
        );
        (tier_1_score, reasoning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(is_deepfake: bool, confidence: f64) -> DeepfakeDetection {
        DeepfakeDetection {
            is_deepfake,
            confidence,
            diffusion_artifacts_detected: false,
            gan_ghosting_detected: false,
            processing_time_ms: 0,
        }
    }

    #[test]
    fn test_tier_2_score_authentic() {
        let combiner = TrustScoreCombiner;
        assert_eq!(combiner.tier_2_score(&detection(false, 0.9)), 90);
        assert_eq!(combiner.tier_2_score(&detection(false, 0.05)), 5);
    }

    #[test]
    fn test_tier_2_score_deepfake_inverts_confidence() {
        let combiner = TrustScoreCombiner;
        assert_eq!(combiner.tier_2_score(&detection(true, 0.9)), 10);
        assert_eq!(combiner.tier_2_score(&detection(true, 0.6)), 40);
    }

    #[test]
    fn test_final_score_tier_1_only() {
        let combiner = TrustScoreCombiner;
        let (score, reasoning) = combiner.final_score(92, None);

        assert_eq!(score, 92);
        assert!(reasoning.contains("No AI forensics required"));
    }

    #[test]
    fn test_final_score_weighted() {
        let combiner = TrustScoreCombiner;
        let (score, reasoning) = combiner.final_score(70, Some(90));

        // floor(70 * 0.6 + 90 * 0.4) = floor(78.0)
        assert_eq!(score, 78);
        assert!(reasoning.contains("weighted 60/40"));
        assert!(reasoning.contains("moderate confidence"));
    }

    #[test]
    fn test_final_score_verdict_bands() {
        let combiner = TrustScoreCombiner;
        assert!(combiner.final_score(90, Some(90)).1.contains("high confidence"));
        assert!(combiner.final_score(40, Some(40)).1.contains("fraud suspected"));
        assert!(combiner.final_score(55, Some(55)).1.contains("low confidence"));
    }

    #[tokio::test]
    async fn test_mock_classifier_is_deterministic_with_seed() {
        let a = MockClassifier::with_seed(42);
        let b = MockClassifier::with_seed(42);

        let ra = a.classify("video").await.unwrap();
        let rb = b.classify("video").await.unwrap();

        assert_eq!(ra.is_deepfake, rb.is_deepfake);
        assert!((ra.confidence - rb.confidence).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_mock_classifier_confidence_bounds() {
        let mock = MockClassifier::with_seed(7);
        for _ in 0..32 {
            let result = mock.classify("video").await.unwrap();
            if result.is_deepfake {
                assert!((0.6..0.95).contains(&result.confidence));
            } else {
                assert!((0.05..0.4).contains(&result.confidence));
            }
        }
    }

    #[tokio::test]
    async fn test_returning_classifier_fixed_output() {
        let mock = MockClassifier::returning(detection(false, 0.9));
        let result = mock.classify("video").await.unwrap();

        assert!(!result.is_deepfake);
        assert!((result.confidence - 0.9).abs() < f64::EPSILON);
    }
}
