//! Two-tier scoring pipeline: sensor fusion triage, optical flow, and
//! AI forensics.

pub mod forensics;
pub mod optical_flow;
pub mod sensor_fusion;

pub use forensics::{
    DeepfakeClassifier, DeepfakeDetection, MockClassifier, RemoteClassifier, TrustScoreCombiner,
};
pub use optical_flow::OpticalFlowEngine;
pub use sensor_fusion::{SensorFusionAnalyzer, Tier1Analysis};
