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

//! Salvor runtime bootstrap wiring.
//!
//! Layout: `bootstrap.rs` (config, telemetry and engine wiring), `error.rs`.

/// Runtime bootstrap and shutdown.
pub mod bootstrap;
/// Application-level errors.
pub mod error;

pub use bootstrap::{RecoveryRuntime, RuntimeDependencies};
pub use error::{AppError, AppResult};
