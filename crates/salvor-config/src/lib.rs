#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]

//! Recovery policy configuration: typed model, guard-rail normalisation and loading.
//!
//! Layout: `model.rs` (serde models with defaults), `policy.rs` (normalisation into
//! the effective policy), `loader.rs` (JSON document + environment overrides),
//! `error.rs`.

pub mod error;
pub mod loader;
pub mod model;
pub mod policy;

pub use error::{ConfigError, ConfigResult};
pub use loader::{CONFIG_PATH_ENV, load_config, load_config_with};
pub use model::{LoggingSettings, RecoveryPolicy, SalvorConfig};
pub use policy::{
    MAX_BACKOFF_CAP_MS, MAX_ESCALATION_GRACE_MS, MIN_LOOP_INTERVAL_MS, RecoveryPolicyEffective,
    normalize_recovery_policy,
};
