//! Batch classification of exported network flows against behavioral signatures.
//!
//! Files are processed by a bounded worker pool: each worker preselects the
//! source addresses worth aggregating, folds their flows into per-target
//! running statistics, and hands the partial result to a single reducer that
//! merges it into the run-wide [`GlobalResult`].

pub mod cli;
pub mod config;
pub mod core;
pub mod diagnostics;
pub mod error;
pub mod logging;
pub mod report;
pub mod signals;
pub mod source;

pub use crate::core::pipeline::{CancelHandle, Engine, FileFailure, RunOutcome};
pub use crate::core::result::{GlobalResult, SourceAggregate, TargetAggregate, TimeWindow};
pub use crate::core::{FlowRecord, Protocol, TargetKey};
pub use crate::diagnostics::{DiagnosticSink, TracingSink};
pub use crate::error::{ConfigError, RecordError, SourceError};
pub use crate::signals::{Signature, SignatureRegistry};
pub use crate::source::RecordSource;
