//! Judge Core Library
//!
//! Authenticated SLO judgment for deployment gating: signing keys with
//! rotation and grace, replay protection, the SLO evaluator, k-of-n quorum,
//! sliding-window metrics and the request orchestrator that ties them
//! together. Transport lives in `judged`; this crate is transport-free.

pub mod auth;
pub mod authz;
pub mod canonical;
pub mod clock;
pub mod config;
pub mod domain;
pub mod evaluator;
pub mod keys;
pub mod metrics;
pub mod obs;
pub mod quorum;
pub mod readiness;
pub mod replay;
pub mod service;
pub mod telemetry;

/// Crate version reported by the binaries.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use auth::{AuthError, SignedHeaders};
pub use authz::{AllowAll, Authorizer, StaticAllowList};
pub use canonical::{
    canonical_bytes, canonical_json, canonical_sha256, integrity_json, integrity_sha256, sha256_hex,
};
pub use clock::{iso_seconds, within_skew, Clock, ManualClock, SystemClock};
pub use config::{ConfigError, JudgeConfig};
pub use domain::{Decision, Evidence, SloSpec, ValidationError, Verdict};
pub use evaluator::evaluate;
pub use keys::{KeySources, KeyState, KeyStore, KeyStoreConfig, RefreshOutcome, SigningKey};
pub use metrics::{Counters, SlidingWindow, WindowSummary};
pub use quorum::{
    decide, HttpJudge, HttpJudgeConfig, JudgeProvider, LocalJudge, ProviderError, QuorumError,
    QuorumOptions, QuorumResult, Vote,
};
pub use readiness::{check_readiness, ReadinessReport};
pub use replay::{ReplayError, ReplayGuard, ReplayGuardConfig};
pub use service::{JudgeError, JudgeResponse, JudgeService};
pub use telemetry::init_tracing;
