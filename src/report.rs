//! Report rendering for a finished run.
//!
//! Two formats: a human-readable text report (`.ids`) and JSON Lines with one
//! object per target (`.idats`).

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::config::OutputConfig;
use crate::core::pipeline::RunOutcome;
use crate::core::result::{SourceAggregate, TargetAggregate};
use crate::signals::SignatureRegistry;

const TIME_FMT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// `<sorted signature names joined by '_'>-<date>`, shared by both report files.
pub fn report_stem(registry: &SignatureRegistry, date: NaiveDate) -> String {
    format!("{}-{}", registry.names().join("_"), date.format("%Y-%m-%d"))
}

/// Write the enabled reports. Returns the files written; without an output
/// directory the human report goes to stdout and nothing is returned.
pub fn write_reports(
    outcome: &RunOutcome,
    registry: &SignatureRegistry,
    output: &OutputConfig,
    date: NaiveDate,
) -> io::Result<Vec<PathBuf>> {
    let Some(dir) = &output.dir else {
        if output.human {
            let stdout = io::stdout();
            write_human(&mut stdout.lock(), outcome, registry)?;
        }
        if output.parsable {
            tracing::warn!("No output directory configured, skipping parsable report");
        }
        return Ok(Vec::new());
    };

    std::fs::create_dir_all(dir)?;
    let stem = report_stem(registry, date);
    let mut written = Vec::new();
    if output.human {
        let path = dir.join(format!("{stem}.ids"));
        write_file(&path, |w| write_human(w, outcome, registry))?;
        written.push(path);
    }
    if output.parsable {
        let path = dir.join(format!("{stem}.idats"));
        write_file(&path, |w| write_parsable(w, outcome))?;
        written.push(path);
    }
    for path in &written {
        tracing::info!("📝 Report written to {}", path.display());
    }
    Ok(written)
}

fn write_file(path: &Path, render: impl FnOnce(&mut BufWriter<File>) -> io::Result<()>) -> io::Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    render(&mut w)?;
    w.flush()
}

/// Text report: legend, then every source and its targets, then failures.
pub fn write_human<W: Write>(w: &mut W, outcome: &RunOutcome, registry: &SignatureRegistry) -> io::Result<()> {
    let result = &outcome.result;
    writeln!(w, "Signatures: {}", registry.names().join(", "))?;
    writeln!(w, "Sources: {}", result.len())?;
    writeln!(w)?;

    let counts = result.signature_counts();
    let total: usize = result.sources().map(|s| s.targets.len()).sum();
    let classified: usize = counts.values().sum();
    writeln!(w, "Legend (targets per signature)")?;
    for name in registry.names() {
        writeln!(w, "  {:<32} {:>8}", name, counts.get(name).copied().unwrap_or(0))?;
    }
    writeln!(w, "  {:<32} {:>8}", "-", total - classified)?;

    for source in result.sources() {
        writeln!(w)?;
        write_source(w, source)?;
    }

    if !outcome.failures.is_empty() {
        writeln!(w)?;
        writeln!(w, "Failed files ({})", outcome.failures.len())?;
        for f in &outcome.failures {
            writeln!(w, "  {}: {}", f.file, f.reason)?;
        }
    }
    if !outcome.skipped.is_empty() {
        writeln!(w)?;
        writeln!(w, "Not processed, run cancelled ({})", outcome.skipped.len())?;
        for file in &outcome.skipped {
            writeln!(w, "  {file}")?;
        }
    }
    Ok(())
}

fn write_source<W: Write>(w: &mut W, source: &SourceAggregate) -> io::Result<()> {
    writeln!(
        w,
        "Source {}  {} .. {}  ({:.3}s, {} targets, {} flows)",
        source.src_ip,
        source.start_time.format(TIME_FMT),
        source.end_time.format(TIME_FMT),
        source.total_duration,
        source.targets.len(),
        source.flows()
    )?;
    for target in source.targets.values() {
        write_target(w, target)?;
    }
    Ok(())
}

fn write_target<W: Write>(w: &mut W, t: &TargetAggregate) -> io::Result<()> {
    let protocols: Vec<String> = t.protocols.iter().map(|p| p.name()).collect();
    writeln!(
        w,
        "  {:<28} {:<24} flows {:>6}  activity {:.3}  [{}]",
        t.key.to_string(),
        t.signature.as_deref().unwrap_or("-"),
        t.flows,
        t.activity,
        protocols.join(",")
    )?;
    writeln!(
        w,
        "      seen {} .. {}  total {:.3}s",
        t.first_seen.format(TIME_FMT),
        t.last_seen.format(TIME_FMT),
        t.total_duration
    )?;
    writeln!(
        w,
        "      packets {:.2} ± {:.2}  bytes {:.2} ± {:.2}  duration {:.3}s ± {:.3}s",
        t.packets.mean(),
        t.packets.stdev(),
        t.bytes.mean(),
        t.bytes.stdev(),
        t.duration.mean(),
        t.duration.stdev()
    )?;
    for (url, hits) in urls_by_hits(&t.url_hits) {
        writeln!(w, "      {hits:>8}  {url}")?;
    }
    Ok(())
}

/// Most hit first, ties by url.
fn urls_by_hits(hits: &BTreeMap<String, u64>) -> Vec<(&str, u64)> {
    let mut urls: Vec<(&str, u64)> = hits.iter().map(|(u, n)| (u.as_str(), *n)).collect();
    urls.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    urls
}

#[derive(Debug, Serialize)]
struct TargetLine<'a> {
    src_ip: IpAddr,
    src_start: DateTime<Utc>,
    src_end: DateTime<Utc>,
    src_duration: f64,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    dst_ip: IpAddr,
    dst_port: u16,
    signature: Option<&'a str>,
    flows: u64,
    packets_mean: f64,
    packets_stdev: f64,
    bytes_mean: f64,
    bytes_stdev: f64,
    duration_mean: f64,
    duration_stdev: f64,
    total_duration: f64,
    activity: f64,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    protocols: Vec<String>,
    urls: &'a BTreeMap<String, u64>,
}

impl<'a> TargetLine<'a> {
    fn new(source: &SourceAggregate, t: &'a TargetAggregate) -> Self {
        Self {
            src_ip: source.src_ip,
            src_start: source.start_time,
            src_end: source.end_time,
            src_duration: source.total_duration,
            window_start: source.window.start,
            window_end: source.window.end,
            dst_ip: t.key.ip,
            dst_port: t.key.port,
            signature: t.signature.as_deref(),
            flows: t.flows,
            packets_mean: t.packets.mean(),
            packets_stdev: t.packets.stdev(),
            bytes_mean: t.bytes.mean(),
            bytes_stdev: t.bytes.stdev(),
            duration_mean: t.duration.mean(),
            duration_stdev: t.duration.stdev(),
            total_duration: t.total_duration,
            activity: t.activity,
            first_seen: t.first_seen,
            last_seen: t.last_seen,
            protocols: t.protocols.iter().map(|p| p.name()).collect(),
            urls: &t.url_hits,
        }
    }
}

/// JSON Lines: one object per target, source fields inlined.
pub fn write_parsable<W: Write>(w: &mut W, outcome: &RunOutcome) -> io::Result<()> {
    for source in outcome.result.sources() {
        for target in source.targets.values() {
            let json = serde_json::to_string(&TargetLine::new(source, target))?;
            writeln!(w, "{json}")?;
        }
    }
    Ok(())
}
