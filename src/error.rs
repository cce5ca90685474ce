use thiserror::Error;

/// Errors that stop a run before any file is processed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no signatures configured")]
    EmptyRegistry,

    #[error("signature '{signature}': unknown criterion '{key}'")]
    UnknownCriterion { signature: String, key: String },

    #[error("signature '{signature}': invalid value for '{key}': {reason}")]
    InvalidCriterion {
        signature: String,
        key: String,
        reason: String,
    },

    #[error("signature '{signature}': bad pattern for '{key}': {source}")]
    BadPattern {
        signature: String,
        key: String,
        #[source]
        source: regex::Error,
    },

    #[error("selected signature '{0}' is not defined")]
    UnknownSignature(String),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A failure attributable to one input file. The file contributes nothing to the result.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("cannot open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("read error: {0}")]
    Read(#[from] std::io::Error),

    #[error("missing header line")]
    MissingHeader,

    #[error("header lacks required column '{0}'")]
    MissingColumn(&'static str),

    #[error("corrupt record stream: none of {0} data lines could be parsed")]
    Corrupt(usize),

    #[error("extractor exited with {0}")]
    Extractor(String),

    #[error("{0}")]
    Injected(String),
}

/// A single malformed record. The record is skipped; the file continues.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordError {
    #[error("line {line}: expected {expected} fields, got {got}")]
    FieldCount {
        line: usize,
        expected: usize,
        got: usize,
    },

    #[error("line {line}: bad {field} '{value}'")]
    BadField {
        line: usize,
        field: &'static str,
        value: String,
    },

    #[error("line {line}: flow ends before it starts")]
    NegativeDuration { line: usize },

    #[error("line {line}: not valid UTF-8")]
    Encoding { line: usize },
}

impl RecordError {
    pub fn line(&self) -> usize {
        match self {
            RecordError::FieldCount { line, .. }
            | RecordError::BadField { line, .. }
            | RecordError::NegativeDuration { line }
            | RecordError::Encoding { line } => *line,
        }
    }
}

/// What a record stream can yield instead of a record.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Fatal(#[from] SourceError),
}
