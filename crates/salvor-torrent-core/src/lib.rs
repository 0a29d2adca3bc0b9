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
#![allow(clippy::module_name_repetitions)]

//! Engine-agnostic torrent types and the boundary traits consumed by the recovery core.
//!
//! Layout: `model/` (entity snapshots, error envelopes, fingerprints, engine DTOs),
//! `service/` (engine client, inspector and refresh traits), `error.rs`.

pub mod error;
pub mod model;
pub mod service;

pub use error::{TorrentError, TorrentResult};
pub use model::{
    BlockReason, Capabilities, EngineOutcome, ErrorClass, ErrorEnvelope, ExecutionModel,
    Fingerprint, ProbeResult, ProbeStatus, RecoveryState, TorrentSnapshot, TorrentState,
    VerifyOptions,
};
pub use service::{EngineClient, RecoveryRefresh, TorrentInspector};
