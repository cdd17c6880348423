//! VeraProof AI Backend
//! Physics-first liveness verification: sensor-fusion triage with
//! conditional deepfake forensics.

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod fusion;
pub mod limits;
pub mod models;
pub mod session;
pub mod state;
pub mod storage;
pub mod webhooks;

pub use state::AppState;
