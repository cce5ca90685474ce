//! Record sources: one capture interval's exported flows.
//!
//! A source is reopened for every pass over it; each `open` yields the same
//! finite sequence from the start.

pub mod csv;
pub mod nfdump;

use crate::core::FlowRecord;
use crate::error::{ReadError, RecordError, SourceError};

pub use csv::CsvFlowFile;
pub use nfdump::NfdumpFile;

pub type RecordIter<'a> = Box<dyn Iterator<Item = Result<FlowRecord, ReadError>> + 'a>;

pub trait RecordSource: Send + Sync {
    /// Identifier used in failure reports and logs.
    fn id(&self) -> String;

    fn open(&self) -> Result<RecordIter<'_>, SourceError>;
}

/// Records held in memory, optionally with malformed entries or an open failure.
#[derive(Debug, Clone)]
pub struct MemorySource {
    id: String,
    items: Vec<Result<FlowRecord, RecordError>>,
    failure: Option<String>,
}

impl MemorySource {
    pub fn new(id: impl Into<String>, records: Vec<FlowRecord>) -> Self {
        Self {
            id: id.into(),
            items: records.into_iter().map(Ok).collect(),
            failure: None,
        }
    }

    /// A source whose every open fails with `reason`.
    pub fn failing(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            items: Vec::new(),
            failure: Some(reason.into()),
        }
    }

    pub fn push_malformed(&mut self, err: RecordError) {
        self.items.push(Err(err));
    }
}

impl RecordSource for MemorySource {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn open(&self) -> Result<RecordIter<'_>, SourceError> {
        if let Some(reason) = &self.failure {
            return Err(SourceError::Injected(reason.clone()));
        }
        Ok(Box::new(
            self.items
                .iter()
                .map(|item| item.clone().map_err(ReadError::from)),
        ))
    }
}
