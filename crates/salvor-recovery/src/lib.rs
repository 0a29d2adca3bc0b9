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

//! Recovery orchestration for torrents failing on storage errors.
//!
//! Layout: `classifier.rs` and `outcome.rs` (pure decision logic), `scheduler.rs`,
//! `probe_cache.rs` and `session.rs` (state owned by the engine), `engine.rs` (facade),
//! `flow.rs` (probe/repair/verify), `gate.rs` (request dispositions),
//! `background.rs` (periodic and on-demand passes), `error.rs`.

pub mod background;
pub mod classifier;
pub mod engine;
pub mod error;
pub mod flow;
pub mod gate;
pub mod outcome;
pub mod probe_cache;
pub mod scheduler;
pub mod session;

pub use background::BackgroundReport;
pub use classifier::{Classification, ClassificationKind, Confidence, EscalationSignal, classify};
pub use engine::{RecoveryEngine, RecoveryEngineDeps};
pub use error::{RecoveryError, RecoveryResult};
pub use flow::{FlowOptions, FlowResult};
pub use gate::{
    FEEDBACK_AUTO_DISMISS_MS, GateOutcome, HandledOutcome, NotRequiredReason, RecoveryAction,
    RecoveryRequest, RequestOptions, RequestOrigin,
};
pub use outcome::{DecisionPolicy, RecoveryOutcome, ResolvedLog, upgrade_outcome_for_session};
pub use probe_cache::ProbeCache;
pub use scheduler::{AttemptGate, BackoffPolicy, RetrySchedule, RetryScheduler};
pub use session::{
    ActiveSessionView, EnqueueDisposition, FinalizeReport, QueueEntry, RecoveryMarks,
    SessionQueue, SessionResolution, SessionState, SessionView, create_recovery_queue_entry,
};
