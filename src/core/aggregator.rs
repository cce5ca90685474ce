use super::preselect::CandidateSet;
use super::result::{PartialResult, SourceAggregate, TimeWindow};
use crate::error::{ReadError, RecordError, SourceError};
use crate::signals::SignatureRegistry;
use crate::source::RecordSource;

/// Counters from one aggregation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregateStats {
    pub records: u64,
    pub retained: u64,
    pub skipped: u64,
}

/// Second pass: fold every record from a candidate source into its target,
/// then classify each target against the registry. Activity is measured
/// against the window spanned by every valid record in the file.
pub fn aggregate(
    source: &dyn RecordSource,
    registry: &SignatureRegistry,
    candidates: &CandidateSet,
    on_skip: &mut dyn FnMut(&RecordError),
) -> Result<(PartialResult, AggregateStats), SourceError> {
    let mut partial = PartialResult::new();
    let mut stats = AggregateStats::default();
    let mut window: Option<TimeWindow> = None;

    for item in source.open()? {
        stats.records += 1;
        let record = match item {
            Ok(record) => record,
            Err(ReadError::Record(e)) => {
                stats.skipped += 1;
                on_skip(&e);
                continue;
            }
            Err(ReadError::Fatal(e)) => return Err(e),
        };
        match window.as_mut() {
            Some(w) => w.extend(&record),
            None => window = Some(TimeWindow::of(&record)),
        }
        if !candidates.contains(&record.src_ip) {
            continue;
        }
        partial
            .entry(record.src_ip)
            .or_insert_with(|| SourceAggregate::new(&record))
            .fold(&record, registry);
        stats.retained += 1;
    }

    for src in partial.values_mut() {
        if let Some(w) = window {
            src.within(w);
        }
        src.finalize(registry);
    }
    Ok((partial, stats))
}
