//! Tier 1 Triage: Sensor Fusion Analysis
//! Mission: Score physical consistency between gyro motion and camera motion
//!
//! Physics-first approach: a genuine head-pan produces gyroscope gamma
//! readings that track the horizontal optical flow of the camera feed.
//! Pearson correlation between the two series is the triage signal.

use tracing::{info, warn};

/// Result of a complete Tier 1 analysis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tier1Analysis {
    pub correlation: f64,
    pub tier_1_score: i64,
    pub trigger_tier_2: bool,
}

/// Pearson-correlation scorer between gyro gamma and horizontal optical flow.
#[derive(Debug, Clone)]
pub struct SensorFusionAnalyzer {
    /// Correlation below this flags the submission for AI forensics.
    fraud_threshold: f64,
}

impl Default for SensorFusionAnalyzer {
    fn default() -> Self {
        Self::new(0.85)
    }
}

impl SensorFusionAnalyzer {
    pub fn new(fraud_threshold: f64) -> Self {
        Self { fraud_threshold }
    }

    /// Pearson correlation coefficient between the two series, aligned by
    /// truncating to the shorter length. Degenerate input (short series or
    /// zero variance) yields 0.0.
    pub fn pearson_correlation(&self, gyro_gamma: &[f64], optical_flow_x: &[f64]) -> f64 {
        if gyro_gamma.is_empty() || optical_flow_x.is_empty() {
            warn!("Empty data arrays for correlation calculation");
            return 0.0;
        }

        let n = gyro_gamma.len().min(optical_flow_x.len());
        if n < 2 {
            warn!(samples = n, "Insufficient data points for correlation");
            return 0.0;
        }

        let g = &gyro_gamma[..n];
        let f = &optical_flow_x[..n];

        let nf = n as f64;
        let mean_g = g.iter().sum::<f64>() / nf;
        let mean_f = f.iter().sum::<f64>() / nf;

        let mut cov = 0.0;
        let mut var_g = 0.0;
        let mut var_f = 0.0;
        for i in 0..n {
            let dg = g[i] - mean_g;
            let df = f[i] - mean_f;
            cov += dg * df;
            var_g += dg * dg;
            var_f += df * df;
        }

        if var_g <= f64::EPSILON || var_f <= f64::EPSILON {
            warn!("Zero-variance series in correlation calculation");
            return 0.0;
        }

        let r = cov / (var_g.sqrt() * var_f.sqrt());
        r.clamp(-1.0, 1.0)
    }

    /// Map a correlation coefficient to the Tier 1 score.
    ///
    /// r >= threshold maps [0.85, 1.0] onto [85, 100]; below threshold,
    /// [-1.0, 0.85) maps onto [0, 84].
    pub fn tier_1_score(&self, r: f64) -> i64 {
        let r = r.clamp(-1.0, 1.0);

        let score = if r >= self.fraud_threshold {
            85.0 + ((r - 0.85) / 0.15) * 15.0
        } else {
            ((r + 1.0) / 1.85) * 84.0
        };

        (score.round() as i64).clamp(0, 100)
    }

    /// Tier 2 AI forensics runs only when the submission looks suspicious.
    pub fn should_trigger_tier_2(&self, r: f64) -> bool {
        let trigger = r < self.fraud_threshold;
        if trigger {
            warn!(r, threshold = self.fraud_threshold, "Tier 2 triggered");
        }
        trigger
    }

    /// Complete Tier 1 analysis over aligned sensor series.
    pub fn analyze(&self, gyro_gamma: &[f64], optical_flow_x: &[f64]) -> Tier1Analysis {
        let r = self.pearson_correlation(gyro_gamma, optical_flow_x);
        let tier_1_score = self.tier_1_score(r);
        let trigger_tier_2 = self.should_trigger_tier_2(r);

        info!(
            r,
            score = tier_1_score,
            trigger_tier_2,
            "Tier 1 analysis complete"
        );

        Tier1Analysis {
            correlation: r,
            tier_1_score,
            trigger_tier_2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn analyzer() -> SensorFusionAnalyzer {
        SensorFusionAnalyzer::default()
    }

    #[test]
    fn test_perfect_positive_correlation() {
        let gyro: Vec<f64> = (1..=10).map(|v| v as f64).collect();
        let flow: Vec<f64> = (1..=10).map(|v| (v * 2) as f64).collect();

        let result = analyzer().analyze(&gyro, &flow);
        assert!((result.correlation - 1.0).abs() < 1e-9);
        assert_eq!(result.tier_1_score, 100);
        assert!(!result.trigger_tier_2);
    }

    #[test]
    fn test_perfect_negative_correlation() {
        let gyro = [1.0, 2.0, 3.0, 4.0, 5.0];
        let flow = [10.0, 8.0, 6.0, 4.0, 2.0];

        let result = analyzer().analyze(&gyro, &flow);
        assert!((result.correlation + 1.0).abs() < 1e-9);
        assert_eq!(result.tier_1_score, 0);
        assert!(result.trigger_tier_2);
    }

    #[test]
    fn test_empty_input_yields_zero() {
        let r = analyzer().pearson_correlation(&[], &[1.0, 2.0]);
        assert_eq!(r, 0.0);
    }

    #[test]
    fn test_single_sample_yields_zero() {
        let r = analyzer().pearson_correlation(&[1.0], &[2.0]);
        assert_eq!(r, 0.0);
    }

    #[test]
    fn test_zero_variance_yields_zero() {
        let r = analyzer().pearson_correlation(&[3.0, 3.0, 3.0, 3.0], &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(r, 0.0);
    }

    #[test]
    fn test_length_alignment_truncates() {
        let gyro = [1.0, 2.0, 3.0, 4.0, 5.0, 100.0, -40.0];
        let flow = [2.0, 4.0, 6.0, 8.0, 10.0];

        let r = analyzer().pearson_correlation(&gyro, &flow);
        assert!((r - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_score_at_threshold_boundary() {
        let a = analyzer();
        assert_eq!(a.tier_1_score(0.85), 85);
        assert_eq!(a.tier_1_score(1.0), 100);
        assert_eq!(a.tier_1_score(-1.0), 0);
    }

    #[test]
    fn test_borderline_correlation_just_misses_pass_band() {
        let a = analyzer();
        // ((0.84 + 1.0) / 1.85) * 84 rounds to 84.
        assert_eq!(a.tier_1_score(0.84), 84);
        assert!(a.should_trigger_tier_2(0.84));
    }

    #[test]
    fn test_trigger_below_threshold() {
        let a = analyzer();
        assert!(a.should_trigger_tier_2(0.80));
        assert!(a.should_trigger_tier_2(0.8499999));
        assert!(!a.should_trigger_tier_2(0.85));
        assert!(!a.should_trigger_tier_2(0.90));
    }

    proptest! {
        #[test]
        fn prop_correlation_stays_in_range(
            data in proptest::collection::vec((-100.0f64..100.0, -100.0f64..100.0), 2..200)
        ) {
            let gyro: Vec<f64> = data.iter().map(|(g, _)| *g).collect();
            let flow: Vec<f64> = data.iter().map(|(_, f)| *f).collect();

            let r = analyzer().pearson_correlation(&gyro, &flow);
            prop_assert!((-1.0..=1.0).contains(&r));
        }

        #[test]
        fn prop_score_stays_in_range(r in -1.0f64..=1.0) {
            let score = analyzer().tier_1_score(r);
            prop_assert!((0..=100).contains(&score));
        }

        #[test]
        fn prop_high_correlation_high_score(r in 0.85f64..=1.0) {
            prop_assert!(analyzer().tier_1_score(r) >= 85);
        }

        #[test]
        fn prop_below_threshold_stays_below_pass_band(r in -1.0f64..0.85) {
            prop_assert!(analyzer().tier_1_score(r) <= 84);
        }

        #[test]
        fn prop_low_correlation_low_score(r in -1.0f64..0.1) {
            prop_assert!(analyzer().tier_1_score(r) < 50);
        }

        #[test]
        fn prop_trigger_iff_below_threshold(r in -1.0f64..=1.0) {
            prop_assert_eq!(analyzer().should_trigger_tier_2(r), r < 0.85);
        }

        #[test]
        fn prop_correlation_is_symmetric(
            data in proptest::collection::vec((-50.0f64..50.0, -50.0f64..50.0), 2..100)
        ) {
            let a: Vec<f64> = data.iter().map(|(x, _)| *x).collect();
            let b: Vec<f64> = data.iter().map(|(_, y)| *y).collect();

            let fwd = analyzer().pearson_correlation(&a, &b);
            let rev = analyzer().pearson_correlation(&b, &a);
            prop_assert!((fwd - rev).abs() < 1e-9);
        }
    }
}
