// trustgate/src/lib.rs
//
// Trustgate: account-sharing detection and atomic generation quotas for a
// subscription service.
//
//   engine   detect-and-enforce entry point, tiered policy, side effects
//   workers  device comparator, confidence scorer, narrow 5-minute detectors
//   quota    daily credits + cooldown gate with compare-and-swap commits
//   state    store / audit collaborator traits and in-process implementations
//   throttle per-key request throttle with lazy expiry

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod notify;
pub mod quota;
pub mod sink;
pub mod state;
pub mod throttle;
pub mod workers;

pub use config::Config;
pub use engine::SharingGuard;
pub use error::{GenerationError, StoreError};
pub use quota::GenerationGate;
