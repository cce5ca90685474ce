use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc, watch};
use tracing::{debug, info};

use super::result::{GlobalResult, PartialResult};
use super::{aggregator, preselect};
use crate::diagnostics::{DiagnosticSink, FileSummary};
use crate::error::SourceError;
use crate::signals::SignatureRegistry;
use crate::source::RecordSource;

/// A file that contributed nothing to the run, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFailure {
    pub file: String,
    pub reason: String,
}

/// Everything a run produced.
#[derive(Debug, Default)]
pub struct RunOutcome {
    pub result: GlobalResult,
    pub failures: Vec<FileFailure>,
    /// Files never dispatched because the run was cancelled.
    pub skipped: Vec<String>,
    /// Files that completed, successfully or not.
    pub processed: usize,
}

/// Stops a run from dispatching further files. Cloneable and usable from any thread.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    fn new() -> Self {
        Self {
            tx: Arc::new(watch::Sender::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// What a worker hands to the reducer: exactly one per dispatched file.
enum FileOutcome {
    Done { file: String, partial: PartialResult },
    Failed(FileFailure),
}

/// Bounded worker pool feeding a single merge reducer.
pub struct Engine {
    registry: Arc<SignatureRegistry>,
    concurrency: usize,
    sink: Arc<dyn DiagnosticSink>,
    cancel: CancelHandle,
}

impl Engine {
    pub fn new(registry: SignatureRegistry, concurrency: usize, sink: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            registry: Arc::new(registry),
            concurrency: concurrency.max(1),
            sink,
            cancel: CancelHandle::new(),
        }
    }

    pub fn registry(&self) -> &SignatureRegistry {
        &self.registry
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Process every file once, at most `concurrency` at a time.
    ///
    /// Returns after every dispatched file has completed or failed. Partial
    /// results are folded one at a time by a reducer that alone owns the
    /// global result.
    pub async fn run(&self, files: Vec<Arc<dyn RecordSource>>) -> RunOutcome {
        info!(files = files.len(), workers = self.concurrency, "run started");
        let (tx, rx) = mpsc::unbounded_channel();

        let (skipped, mut outcome) = tokio::join!(self.dispatch(files, tx), reduce(rx, &self.registry));
        outcome.skipped = skipped;

        info!(
            processed = outcome.processed,
            failed = outcome.failures.len(),
            skipped = outcome.skipped.len(),
            sources = outcome.result.len(),
            "run finished"
        );
        outcome
    }

    /// Hands files to blocking workers as permits free up. Returns the ids of
    /// files left undispatched by cancellation.
    async fn dispatch(&self, files: Vec<Arc<dyn RecordSource>>, tx: mpsc::UnboundedSender<FileOutcome>) -> Vec<String> {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut cancel = self.cancel.subscribe();
        let mut pending = files.into_iter();

        while let Some(source) = pending.next() {
            let permit = if *cancel.borrow() {
                None
            } else {
                tokio::select! {
                    biased;
                    Ok(_) = cancel.wait_for(|c| *c) => None,
                    permit = permits.clone().acquire_owned() => permit.ok(),
                }
            };
            let Some(permit) = permit else {
                let skipped: Vec<String> = std::iter::once(source).chain(pending).map(|s| s.id()).collect();
                info!(skipped = skipped.len(), "run cancelled, not dispatching remaining files");
                return skipped;
            };

            let registry = Arc::clone(&self.registry);
            let sink = Arc::clone(&self.sink);
            let tx = tx.clone();
            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let outcome = run_worker(source.as_ref(), &registry, sink.as_ref());
                // The reducer outlives every worker, so a send only fails if the run was dropped.
                let _ = tx.send(outcome);
            });
        }
        Vec::new()
    }
}

/// Folds worker outcomes into the global result, one at a time, until every
/// sender is gone.
async fn reduce(mut rx: mpsc::UnboundedReceiver<FileOutcome>, registry: &SignatureRegistry) -> RunOutcome {
    let mut outcome = RunOutcome::default();
    while let Some(item) = rx.recv().await {
        outcome.processed += 1;
        match item {
            FileOutcome::Done { file, partial } => {
                debug!(file = %file, sources = partial.len(), "merging partial result");
                outcome.result.merge(partial, registry);
            }
            FileOutcome::Failed(failure) => outcome.failures.push(failure),
        }
    }
    outcome
}

fn run_worker(source: &dyn RecordSource, registry: &SignatureRegistry, sink: &dyn DiagnosticSink) -> FileOutcome {
    let file = source.id();
    let reason = match catch_unwind(AssertUnwindSafe(|| process_file(source, registry, sink))) {
        Ok(Ok(partial)) => return FileOutcome::Done { file, partial },
        Ok(Err(e)) => e.to_string(),
        Err(panic) => format!("worker panicked: {}", panic_message(&*panic)),
    };
    sink.file_failed(&file, &reason);
    FileOutcome::Failed(FileFailure { file, reason })
}

/// Preselect then aggregate one file.
fn process_file(
    source: &dyn RecordSource,
    registry: &SignatureRegistry,
    sink: &dyn DiagnosticSink,
) -> Result<PartialResult, SourceError> {
    let file = source.id();
    sink.file_started(&file);

    let candidates = preselect::select(source, registry)?;
    let (partial, stats) = aggregator::aggregate(source, registry, &candidates, &mut |e| sink.record_skipped(&file, e))?;

    sink.file_finished(
        &file,
        &FileSummary {
            records: stats.records,
            candidates: candidates.len(),
            retained: stats.retained,
            skipped: stats.skipped,
            sources: partial.len(),
        },
    );
    Ok(partial)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}

/// Blocking entry point: run `files` on a fresh tokio runtime.
pub fn run(
    files: Vec<Arc<dyn RecordSource>>,
    registry: SignatureRegistry,
    concurrency: usize,
    sink: Arc<dyn DiagnosticSink>,
) -> std::io::Result<RunOutcome> {
    let rt = tokio::runtime::Runtime::new()?;
    let engine = Engine::new(registry, concurrency, sink);
    Ok(rt.block_on(engine.run(files)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::IpAddr;

    use crate::core::TargetKey;
    use crate::core::testutil::flow;
    use crate::diagnostics::{Diagnostic, MemorySink};
    use crate::error::RecordError;
    use crate::signals::SignatureDefinitions;
    use crate::signals::rules::CriterionValue;
    use crate::source::{CsvFlowFile, MemorySource, RecordIter};

    fn registry() -> SignatureRegistry {
        let mut defs = SignatureDefinitions::new();
        defs.insert(
            "web_crawler".into(),
            [
                ("port".to_string(), CriterionValue::Integer(80)),
                ("min_flows".to_string(), CriterionValue::Integer(10)),
            ]
            .into_iter()
            .collect(),
        );
        defs.insert(
            "dns_flood".into(),
            [
                ("port".to_string(), CriterionValue::Integer(53)),
                ("max_bytes".to_string(), CriterionValue::Integer(80)),
                ("min_flows".to_string(), CriterionValue::Integer(3)),
            ]
            .into_iter()
            .collect(),
        );
        SignatureRegistry::from_definitions(&defs).unwrap()
    }

    fn engine(concurrency: usize) -> (Engine, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        (Engine::new(registry(), concurrency, sink.clone()), sink)
    }

    fn make_files() -> Vec<Arc<dyn RecordSource>> {
        let mut files: Vec<Arc<dyn RecordSource>> = Vec::new();
        for f in 0..6i64 {
            let mut recs = Vec::new();
            for i in 0..(4 + f as u64) {
                let off = f * 300 + i as i64 * 7;
                recs.push(flow("10.0.0.1", "93.1.1.1", 80, 3 + i, 90 + 13 * i, off, (i % 4) as i64));
                recs.push(flow("10.0.0.2", "8.8.8.8", 53, 1, 40 + i, off + 1, 0));
                recs.push(flow("10.0.0.3", "93.1.1.1", 443, 9, 1500, off + 2, 3));
            }
            files.push(Arc::new(MemorySource::new(format!("file{f}"), recs)));
        }
        files
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn assert_same(a: &GlobalResult, b: &GlobalResult) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.sources().zip(b.sources()) {
            assert_eq!(x.src_ip, y.src_ip);
            assert_eq!(x.start_time, y.start_time);
            assert_eq!(x.end_time, y.end_time);
            assert_eq!(x.targets.len(), y.targets.len());
            for (tx, ty) in x.targets.values().zip(y.targets.values()) {
                assert_eq!(tx.key, ty.key);
                assert_eq!(tx.flows, ty.flows);
                assert_eq!(tx.signature, ty.signature);
                assert_eq!(tx.url_hits, ty.url_hits);
                assert!((tx.bytes.mean() - ty.bytes.mean()).abs() < 1e-9);
                assert!((tx.bytes.stdev() - ty.bytes.stdev()).abs() < 1e-9);
                assert!((tx.packets.stdev() - ty.packets.stdev()).abs() < 1e-9);
                assert!((tx.duration.mean() - ty.duration.mean()).abs() < 1e-9);
                assert!((tx.activity - ty.activity).abs() < 1e-9);
            }
        }
    }

    #[tokio::test]
    async fn same_result_for_any_worker_count_and_order() {
        let (serial, _) = engine(1);
        let baseline = serial.run(make_files()).await;
        assert!(baseline.failures.is_empty());
        assert_eq!(baseline.processed, 6);

        for workers in [2, 4, 8] {
            let (pool, _) = engine(workers);
            let mut files = make_files();
            files.reverse();
            let out = pool.run(files).await;
            assert_same(&baseline.result, &out.result);
        }
    }

    #[tokio::test]
    async fn classification_reflects_merged_statistics() {
        let (e, _) = engine(3);
        let out = e.run(make_files()).await;
        let web = &out.result.get(&ip("10.0.0.1")).unwrap().targets[&TargetKey { ip: ip("93.1.1.1"), port: 80 }];
        // 4+5+...+9 flows overall; no single file reaches 10.
        assert_eq!(web.flows, 39);
        assert_eq!(web.signature.as_deref(), Some("web_crawler"));
        let dns = &out.result.get(&ip("10.0.0.2")).unwrap().targets[&TargetKey { ip: ip("8.8.8.8"), port: 53 }];
        assert_eq!(dns.signature.as_deref(), Some("dns_flood"));
    }

    #[tokio::test]
    async fn preselection_keeps_only_candidate_sources() {
        let (e, _) = engine(2);
        let out = e.run(make_files()).await;
        assert!(out.result.get(&ip("10.0.0.1")).is_some());
        assert!(out.result.get(&ip("10.0.0.2")).is_some());
        // Port 443 passes no signature's coarse criteria.
        assert!(out.result.get(&ip("10.0.0.3")).is_none());
        // Destinations are never sources.
        assert!(out.result.get(&ip("93.1.1.1")).is_none());
    }

    #[tokio::test]
    async fn two_file_threshold_scenario() {
        let a: Vec<_> = (0..10).map(|i| flow("10.0.0.1", "93.1.1.1", 80, 5, 100, i, 1)).collect();
        let b: Vec<_> = (0..5).map(|i| flow("10.0.0.1", "93.1.1.1", 80, 5, 100, 100 + i, 1)).collect();
        let files = || -> Vec<Arc<dyn RecordSource>> {
            vec![
                Arc::new(MemorySource::new("a", a.clone())),
                Arc::new(MemorySource::new("b", b.clone())),
            ]
        };
        let key = TargetKey { ip: ip("93.1.1.1"), port: 80 };

        let strict = |min_flows: i64| {
            let mut defs = SignatureDefinitions::new();
            defs.insert(
                "web".into(),
                [
                    ("port".to_string(), CriterionValue::Integer(80)),
                    ("min_flows".to_string(), CriterionValue::Integer(min_flows)),
                ]
                .into_iter()
                .collect(),
            );
            SignatureRegistry::from_definitions(&defs).unwrap()
        };

        let out = Engine::new(strict(20), 2, Arc::new(MemorySink::new())).run(files()).await;
        let t = &out.result.get(&ip("10.0.0.1")).unwrap().targets[&key];
        assert_eq!(t.flows, 15);
        assert!((t.bytes.mean() - 100.0).abs() < 1e-12);
        assert_eq!(t.bytes.stdev(), 0.0);
        assert_eq!(t.signature, None);

        let out = Engine::new(strict(10), 2, Arc::new(MemorySink::new())).run(files()).await;
        let t = &out.result.get(&ip("10.0.0.1")).unwrap().targets[&key];
        assert_eq!(t.signature.as_deref(), Some("web"));
    }

    #[tokio::test]
    async fn one_corrupt_file_is_one_failure() {
        let mut good = Vec::new();
        for n in 0..3 {
            let mut f = tempfile::NamedTempFile::new().unwrap();
            writeln!(f, "ts,te,sa,da,dp,pr,ipkt,ibyt").unwrap();
            for i in 0..4 {
                writeln!(f, "2014-07-01 15:5{n}:0{i},2014-07-01 15:5{n}:0{i},10.0.0.1,93.1.1.1,80,TCP,5,100").unwrap();
            }
            f.flush().unwrap();
            good.push(f);
        }
        let mut bad = tempfile::NamedTempFile::new().unwrap();
        writeln!(bad, "ts,te,sa,da,dp,pr,ipkt,ibyt\nnot,a,flow\nstill,not\n").unwrap();
        bad.flush().unwrap();

        let mut files: Vec<Arc<dyn RecordSource>> =
            good.iter().map(|f| Arc::new(CsvFlowFile::new(f.path())) as Arc<dyn RecordSource>).collect();
        files.insert(1, Arc::new(CsvFlowFile::new(bad.path())));

        let (e, sink) = engine(2);
        let out = e.run(files).await;
        assert_eq!(out.processed, 4);
        assert_eq!(out.failures.len(), 1);
        assert_eq!(out.failures[0].file, bad.path().display().to_string());
        let t = &out.result.get(&ip("10.0.0.1")).unwrap().targets[&TargetKey { ip: ip("93.1.1.1"), port: 80 }];
        assert_eq!(t.flows, 12);
        assert_eq!(t.signature.as_deref(), Some("web_crawler"));

        let failed = sink.events().into_iter().filter(|d| matches!(d, Diagnostic::Failed(..))).count();
        assert_eq!(failed, 1);
    }

    #[tokio::test]
    async fn unreadable_file_does_not_abort_run() {
        let mut files = make_files();
        files.push(Arc::new(CsvFlowFile::new("/nonexistent/nfcapd.201407011555")));
        files.push(Arc::new(MemorySource::failing("broken", "device vanished")));
        let (e, _) = engine(4);
        let out = e.run(files).await;
        assert_eq!(out.processed, 8);
        assert_eq!(out.failures.len(), 2);
        assert_eq!(out.result.len(), 2);
    }

    #[tokio::test]
    async fn skipped_records_reach_the_sink() {
        let mut src = MemorySource::new("m", vec![flow("10.0.0.1", "93.1.1.1", 80, 5, 100, 0, 1)]);
        src.push_malformed(RecordError::BadField {
            line: 3,
            field: "ibyt",
            value: "lots".into(),
        });
        let (e, sink) = engine(1);
        let out = e.run(vec![Arc::new(src)]).await;
        assert!(out.failures.is_empty());
        let events = sink.events();
        assert!(events.iter().any(|d| matches!(d, Diagnostic::Skipped(f, _) if f == "m")));
        assert!(events.iter().any(|d| matches!(d, Diagnostic::Finished(f, s) if f == "m" && s.skipped == 1 && s.retained == 1)));
    }

    struct Panicking;

    impl RecordSource for Panicking {
        fn id(&self) -> String {
            "panicking".into()
        }

        fn open(&self) -> Result<RecordIter<'_>, SourceError> {
            panic!("decoder state exploded");
        }
    }

    #[tokio::test]
    async fn worker_panic_becomes_failure() {
        let mut files = make_files();
        files.insert(2, Arc::new(Panicking));
        let (e, _) = engine(3);
        let out = e.run(files).await;
        assert_eq!(out.failures.len(), 1);
        assert_eq!(out.failures[0].file, "panicking");
        assert!(out.failures[0].reason.contains("decoder state exploded"));
        assert_eq!(out.result.len(), 2);
    }

    #[tokio::test]
    async fn cancelled_before_start_dispatches_nothing() {
        let (e, _) = engine(2);
        e.cancel_handle().cancel();
        let out = e.run(make_files()).await;
        assert_eq!(out.processed, 0);
        assert_eq!(out.skipped.len(), 6);
        assert!(out.result.is_empty());
    }

    /// Cancels the run as soon as a worker opens it.
    struct CancelOnOpen {
        inner: MemorySource,
        handle: CancelHandle,
    }

    impl RecordSource for CancelOnOpen {
        fn id(&self) -> String {
            self.inner.id()
        }

        fn open(&self) -> Result<RecordIter<'_>, SourceError> {
            self.handle.cancel();
            self.inner.open()
        }
    }

    #[tokio::test]
    async fn cancel_mid_run_keeps_in_flight_work() {
        let (e, _) = engine(1);
        let first = CancelOnOpen {
            inner: MemorySource::new("first", vec![flow("10.0.0.1", "93.1.1.1", 80, 5, 100, 0, 1)]),
            handle: e.cancel_handle(),
        };
        let mut files: Vec<Arc<dyn RecordSource>> = vec![Arc::new(first)];
        files.extend(make_files());

        let out = e.run(files).await;
        assert!(e.cancel_handle().is_cancelled());
        assert_eq!(out.processed, 1);
        assert_eq!(out.skipped.len(), 6);
        assert_eq!(out.skipped[0], "file0");
        let t = &out.result.get(&ip("10.0.0.1")).unwrap().targets[&TargetKey { ip: ip("93.1.1.1"), port: 80 }];
        assert_eq!(t.flows, 1);
    }

    #[test]
    fn blocking_wrapper_runs_to_completion() {
        let out = run(make_files(), registry(), 0, Arc::new(MemorySink::new())).unwrap();
        assert_eq!(out.processed, 6);
        assert!(out.skipped.is_empty());
        assert_eq!(out.result.len(), 2);
    }

    #[test]
    fn zero_concurrency_clamps_to_one() {
        let (e, _) = engine(0);
        assert_eq!(e.concurrency(), 1);
    }
}
