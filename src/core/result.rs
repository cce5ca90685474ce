use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use chrono::{DateTime, Utc};

use super::stats::RunningStats;
use super::{seconds_between, FlowRecord, Protocol, TargetKey};
use crate::signals::rules::{Bound, Metric, Observation};
use crate::signals::{Signature, SignatureRegistry};

/// Earliest flow start to latest flow end over some set of records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn of(record: &FlowRecord) -> Self {
        Self {
            start: record.start_time,
            end: record.end_time,
        }
    }

    pub fn extend(&mut self, record: &FlowRecord) {
        self.start = self.start.min(record.start_time);
        self.end = self.end.max(record.end_time);
    }

    pub fn union(self, other: TimeWindow) -> Self {
        Self {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    pub fn secs(&self) -> f64 {
        seconds_between(self.start, self.end)
    }
}

/// Statistics for one `(dst_ip, dst_port)` contacted by a source.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetAggregate {
    pub key: TargetKey,
    pub packets: RunningStats,
    pub bytes: RunningStats,
    pub duration: RunningStats,
    pub flows: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Sum of flow durations, seconds.
    pub total_duration: f64,
    /// Share of the file window this target was active, 0..=1.
    pub activity: f64,
    pub protocols: BTreeSet<Protocol>,
    pub url_hits: BTreeMap<String, u64>,
    /// Signatures whose coarse criteria all held on at least one folded flow.
    pub admitted_by: BTreeSet<String>,
    pub signature: Option<String>,
}

impl TargetAggregate {
    pub fn new(record: &FlowRecord) -> Self {
        Self {
            key: record.target(),
            packets: RunningStats::new(),
            bytes: RunningStats::new(),
            duration: RunningStats::new(),
            flows: 0,
            first_seen: record.start_time,
            last_seen: record.end_time,
            total_duration: 0.0,
            activity: 0.0,
            protocols: BTreeSet::new(),
            url_hits: BTreeMap::new(),
            admitted_by: BTreeSet::new(),
            signature: None,
        }
    }

    /// Fold one record in. O(1) in the record count.
    pub fn fold(&mut self, record: &FlowRecord, registry: &SignatureRegistry) {
        let secs = record.duration_secs();
        self.packets.push(record.packets as f64);
        self.bytes.push(record.bytes as f64);
        self.duration.push(secs);
        self.flows += 1;
        self.first_seen = self.first_seen.min(record.start_time);
        self.last_seen = self.last_seen.max(record.end_time);
        self.total_duration += secs;
        self.protocols.insert(record.protocol);
        if let Some(url) = &record.url {
            *self.url_hits.entry(url.clone()).or_insert(0) += 1;
        }
        for signature in registry.iter() {
            if !self.admitted_by.contains(&signature.name) && signature.admits(record) {
                self.admitted_by.insert(signature.name.clone());
            }
        }
    }

    /// Combine with the same target seen in another partition.
    pub fn absorb(&mut self, other: TargetAggregate) {
        debug_assert_eq!(self.key, other.key);
        self.packets.merge(&other.packets);
        self.bytes.merge(&other.bytes);
        self.duration.merge(&other.duration);
        self.flows += other.flows;
        self.first_seen = self.first_seen.min(other.first_seen);
        self.last_seen = self.last_seen.max(other.last_seen);
        self.total_duration += other.total_duration;
        self.protocols.extend(other.protocols);
        for (url, hits) in other.url_hits {
            *self.url_hits.entry(url).or_insert(0) += hits;
        }
        self.admitted_by.extend(other.admitted_by);
    }

    /// Time between the first flow start and the last flow end, seconds.
    pub fn span(&self) -> f64 {
        seconds_between(self.first_seen, self.last_seen)
    }

    fn finalize(&mut self, window: f64, registry: &SignatureRegistry) {
        self.activity = if window > 0.0 {
            (self.total_duration / window).clamp(0.0, 1.0)
        } else {
            1.0
        };
        self.signature = registry.classify(&*self);
    }
}

impl Observation for TargetAggregate {
    fn port(&self) -> u16 {
        self.key.port
    }

    fn has_protocol(&self, protocol: Protocol) -> bool {
        self.protocols.contains(&protocol)
    }

    fn any_url(&self, pred: &dyn Fn(&str) -> bool) -> bool {
        self.url_hits.keys().any(|u| pred(u.as_str()))
    }

    fn admitted(&self, signature: &Signature) -> bool {
        self.admitted_by.contains(&signature.name)
    }

    fn bounded_value(&self, metric: Metric, _bound: Bound) -> Option<f64> {
        match metric {
            // Per-flow bounds were decided flow by flow, see `admitted`.
            Metric::Packets | Metric::Bytes | Metric::Duration => None,
            Metric::Flows => Some(self.flows as f64),
            Metric::PacketsMean => Some(self.packets.mean()),
            Metric::PacketsStdev => Some(self.packets.stdev()),
            Metric::BytesMean => Some(self.bytes.mean()),
            Metric::BytesStdev => Some(self.bytes.stdev()),
            Metric::DurationMean => Some(self.duration.mean()),
            Metric::DurationStdev => Some(self.duration.stdev()),
            Metric::TotalDuration => Some(self.total_duration),
            Metric::Activity => Some(self.activity),
            Metric::Urls => Some(self.url_hits.len() as f64),
        }
    }
}

/// Everything one source address did within the processed input.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceAggregate {
    pub src_ip: IpAddr,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// `end_time - start_time`, seconds.
    pub total_duration: f64,
    /// Window of the files this source was seen in; activity is measured against it.
    pub window: TimeWindow,
    pub targets: BTreeMap<TargetKey, TargetAggregate>,
}

impl SourceAggregate {
    pub fn new(record: &FlowRecord) -> Self {
        Self {
            src_ip: record.src_ip,
            start_time: record.start_time,
            end_time: record.end_time,
            total_duration: 0.0,
            window: TimeWindow::of(record),
            targets: BTreeMap::new(),
        }
    }

    pub fn fold(&mut self, record: &FlowRecord, registry: &SignatureRegistry) {
        debug_assert_eq!(self.src_ip, record.src_ip);
        self.start_time = self.start_time.min(record.start_time);
        self.end_time = self.end_time.max(record.end_time);
        self.window.extend(record);
        self.targets
            .entry(record.target())
            .or_insert_with(|| TargetAggregate::new(record))
            .fold(record, registry);
    }

    /// Widen the activity window to the whole file the records came from.
    pub fn within(&mut self, file: TimeWindow) {
        self.window = self.window.union(file);
    }

    /// Recompute window-derived fields and classify every target.
    pub fn finalize(&mut self, registry: &SignatureRegistry) {
        self.total_duration = seconds_between(self.start_time, self.end_time);
        let window = self.window.secs();
        for target in self.targets.values_mut() {
            target.finalize(window, registry);
        }
    }

    /// Merge another partition of the same source, then re-classify.
    pub fn absorb(&mut self, other: SourceAggregate, registry: &SignatureRegistry) {
        debug_assert_eq!(self.src_ip, other.src_ip, "merging different sources");
        self.start_time = self.start_time.min(other.start_time);
        self.end_time = self.end_time.max(other.end_time);
        self.window = self.window.union(other.window);
        for (key, target) in other.targets {
            match self.targets.get_mut(&key) {
                Some(existing) => existing.absorb(target),
                None => {
                    self.targets.insert(key, target);
                }
            }
        }
        // The window may have grown, which moves every target's activity.
        self.finalize(registry);
    }

    pub fn flows(&self) -> u64 {
        self.targets.values().map(|t| t.flows).sum()
    }
}

/// Per-file output of the aggregator.
pub type PartialResult = BTreeMap<IpAddr, SourceAggregate>;

/// The run-wide result, built only by folding partial results in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalResult {
    sources: BTreeMap<IpAddr, SourceAggregate>,
}

impl GlobalResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one file's partial result in. Ownership of the partial moves here.
    pub fn merge(&mut self, partial: PartialResult, registry: &SignatureRegistry) {
        for (ip, source) in partial {
            match self.sources.get_mut(&ip) {
                Some(existing) => existing.absorb(source, registry),
                None => {
                    self.sources.insert(ip, source);
                }
            }
        }
    }

    pub fn get(&self, ip: &IpAddr) -> Option<&SourceAggregate> {
        self.sources.get(ip)
    }

    pub fn sources(&self) -> impl Iterator<Item = &SourceAggregate> {
        self.sources.values()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Number of targets carrying each signature; unclassified targets are not counted.
    pub fn signature_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for target in self.sources().flat_map(|s| s.targets.values()) {
            if let Some(name) = &target.signature {
                *counts.entry(name.clone()).or_insert(0) += 1;
            }
        }
        counts
    }
}
