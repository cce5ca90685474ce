use std::io::BufReader;
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Stdio};

use super::csv::CsvRecords;
use super::{RecordIter, RecordSource};
use crate::core::FlowRecord;
use crate::error::{ReadError, SourceError};

/// A binary nfcapd capture, read by running the external `nfdump` extractor.
#[derive(Debug, Clone)]
pub struct NfdumpFile {
    path: PathBuf,
    bin: PathBuf,
}

impl NfdumpFile {
    pub fn new(path: impl Into<PathBuf>, bin: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            bin: bin.into(),
        }
    }
}

impl RecordSource for NfdumpFile {
    fn id(&self) -> String {
        self.path.display().to_string()
    }

    fn open(&self) -> Result<RecordIter<'_>, SourceError> {
        let mut child = Command::new(&self.bin)
            .arg("-r")
            .arg(&self.path)
            .args(["-o", "csv"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| SourceError::Open {
                path: self.id(),
                source,
            })?;

        let Some(stdout) = child.stdout.take() else {
            reap(&mut child);
            return Err(SourceError::Extractor("no stdout pipe".into()));
        };
        let inner = match CsvRecords::new(BufReader::new(stdout)) {
            Ok(inner) => inner,
            Err(e) => {
                // A failed extractor prints nothing, so report its exit status if it has one.
                let status = child.wait().ok();
                return Err(match status {
                    Some(s) if !s.success() => SourceError::Extractor(s.to_string()),
                    _ => e,
                });
            }
        };
        tracing::debug!(file = %self.id(), bin = %self.bin.display(), "nfdump started");
        Ok(Box::new(NfdumpRecords {
            inner,
            child,
            finished: false,
        }))
    }
}

struct NfdumpRecords {
    inner: CsvRecords<BufReader<ChildStdout>>,
    child: Child,
    finished: bool,
}

impl Iterator for NfdumpRecords {
    type Item = Result<FlowRecord, ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if let Some(item) = self.inner.next() {
            return Some(item);
        }
        self.finished = true;
        match self.child.wait() {
            Ok(status) if status.success() => None,
            Ok(status) => Some(Err(SourceError::Extractor(status.to_string()).into())),
            Err(e) => Some(Err(SourceError::Read(e).into())),
        }
    }
}

impl Drop for NfdumpRecords {
    fn drop(&mut self) {
        if !self.finished {
            reap(&mut self.child);
        }
    }
}

fn reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}
