use std::collections::HashSet;
use std::net::IpAddr;

use crate::error::{ReadError, SourceError};
use crate::signals::SignatureRegistry;
use crate::source::RecordSource;

/// Source addresses worth full aggregation in one file.
pub type CandidateSet = HashSet<IpAddr>;

/// First pass: collect every source with at least one record passing the
/// coarse criteria of some signature. Malformed records are skipped here and
/// reported by the aggregation pass.
pub fn select(source: &dyn RecordSource, registry: &SignatureRegistry) -> Result<CandidateSet, SourceError> {
    let mut candidates = CandidateSet::new();
    for item in source.open()? {
        let record = match item {
            Ok(record) => record,
            Err(ReadError::Record(_)) => continue,
            Err(ReadError::Fatal(e)) => return Err(e),
        };
        if candidates.contains(&record.src_ip) {
            continue;
        }
        if registry.admits(&record) {
            candidates.insert(record.src_ip);
        }
    }
    Ok(candidates)
}
