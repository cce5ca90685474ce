use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};

use super::{RecordIter, RecordSource};
use crate::core::{FlowRecord, Protocol};
use crate::error::{ReadError, RecordError, SourceError};

/// Flow export in the comma separated layout of `nfdump -o csv`.
#[derive(Debug, Clone)]
pub struct CsvFlowFile {
    path: PathBuf,
}

impl CsvFlowFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordSource for CsvFlowFile {
    fn id(&self) -> String {
        self.path.display().to_string()
    }

    fn open(&self) -> Result<RecordIter<'_>, SourceError> {
        let file = File::open(&self.path).map_err(|source| SourceError::Open {
            path: self.id(),
            source,
        })?;
        Ok(Box::new(CsvRecords::new(BufReader::new(file))?))
    }
}

/// Column positions resolved from the header line.
#[derive(Debug, Clone)]
struct Columns {
    width: usize,
    ts: usize,
    te: usize,
    sa: usize,
    da: usize,
    dp: usize,
    pr: usize,
    ipkt: usize,
    ibyt: usize,
    url: Option<usize>,
}

impl Columns {
    fn from_header(header: &str) -> Result<Self, SourceError> {
        let names: Vec<&str> = header.split(',').map(str::trim).collect();
        let find = |name: &'static str| {
            names
                .iter()
                .position(|n| *n == name)
                .ok_or(SourceError::MissingColumn(name))
        };
        Ok(Self {
            width: names.len(),
            ts: find("ts")?,
            te: find("te")?,
            sa: find("sa")?,
            da: find("da")?,
            dp: find("dp")?,
            pr: find("pr")?,
            ipkt: find("ipkt")?,
            ibyt: find("ibyt")?,
            url: find("url").ok(),
        })
    }

    fn parse(&self, line: &str, line_no: usize) -> Result<FlowRecord, RecordError> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != self.width {
            return Err(RecordError::FieldCount {
                line: line_no,
                expected: self.width,
                got: fields.len(),
            });
        }
        let bad = |field: &'static str, value: &str| RecordError::BadField {
            line: line_no,
            field,
            value: value.to_string(),
        };

        let start_time = parse_time(fields[self.ts]).ok_or_else(|| bad("ts", fields[self.ts]))?;
        let end_time = parse_time(fields[self.te]).ok_or_else(|| bad("te", fields[self.te]))?;
        if end_time < start_time {
            return Err(RecordError::NegativeDuration { line: line_no });
        }
        let src_ip: IpAddr = fields[self.sa].parse().map_err(|_| bad("sa", fields[self.sa]))?;
        let dst_ip: IpAddr = fields[self.da].parse().map_err(|_| bad("da", fields[self.da]))?;
        let dst_port = parse_port(fields[self.dp]).ok_or_else(|| bad("dp", fields[self.dp]))?;
        let protocol: Protocol = fields[self.pr].parse().map_err(|_| bad("pr", fields[self.pr]))?;
        let packets: u64 = fields[self.ipkt].parse().map_err(|_| bad("ipkt", fields[self.ipkt]))?;
        let bytes: u64 = fields[self.ibyt].parse().map_err(|_| bad("ibyt", fields[self.ibyt]))?;
        let url = self
            .url
            .map(|i| fields[i])
            .filter(|u| !u.is_empty())
            .map(str::to_string);

        Ok(FlowRecord {
            start_time,
            end_time,
            src_ip,
            dst_ip,
            dst_port,
            protocol,
            packets,
            bytes,
            url,
        })
    }
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(t.and_utc());
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// nfdump prints ICMP type/code as a float-like port ("3.3"); those count as port 0.
fn parse_port(s: &str) -> Option<u16> {
    if let Ok(p) = s.parse::<u16>() {
        return Some(p);
    }
    s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|_| 0)
}

/// Streaming parser over a header line followed by data lines.
///
/// Lines are read as bytes and decoded one at a time, so a line that is not
/// valid UTF-8 is skipped as a malformed record.
pub struct CsvRecords<R> {
    reader: R,
    buf: Vec<u8>,
    columns: Columns,
    line_no: usize,
    data_lines: usize,
    parsed: usize,
    done: bool,
}

impl<R: BufRead> CsvRecords<R> {
    pub fn new(mut reader: R) -> Result<Self, SourceError> {
        let mut buf = Vec::new();
        let mut line_no = 0;
        let columns = loop {
            if !read_line(&mut reader, &mut buf)? {
                return Err(SourceError::MissingHeader);
            }
            line_no += 1;
            let header = std::str::from_utf8(&buf)
                .map_err(|e| SourceError::Read(io::Error::new(io::ErrorKind::InvalidData, e)))?;
            if !header.trim().is_empty() {
                break Columns::from_header(header)?;
            }
        };
        Ok(Self {
            reader,
            buf,
            columns,
            line_no,
            data_lines: 0,
            parsed: 0,
            done: false,
        })
    }

    fn finish(&mut self) -> Option<Result<FlowRecord, ReadError>> {
        self.done = true;
        if self.data_lines > 0 && self.parsed == 0 {
            return Some(Err(SourceError::Corrupt(self.data_lines).into()));
        }
        None
    }
}

/// Read one line into `buf` without its terminator. `false` at end of input.
fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<bool> {
    buf.clear();
    if reader.read_until(b'\n', buf)? == 0 {
        return Ok(false);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(true)
}

impl<R: BufRead> Iterator for CsvRecords<R> {
    type Item = Result<FlowRecord, ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match read_line(&mut self.reader, &mut self.buf) {
            Ok(true) => {}
            Ok(false) => return self.finish(),
            Err(e) => {
                self.done = true;
                return Some(Err(SourceError::Read(e).into()));
            }
        }
        self.line_no += 1;
        let Ok(line) = std::str::from_utf8(&self.buf) else {
            self.data_lines += 1;
            return Some(Err(RecordError::Encoding { line: self.line_no }.into()));
        };
        let line = line.trim();
        // nfdump appends a blank line and a summary block after the flows.
        if line.is_empty() || line.starts_with("Summary") {
            return self.finish();
        }
        self.data_lines += 1;
        match self.columns.parse(line, self.line_no) {
            Ok(record) => {
                self.parsed += 1;
                Some(Ok(record))
            }
            Err(e) => Some(Err(e.into())),
        }
    }
}
