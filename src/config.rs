use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::signals::{SignatureDefinitions, SignatureRegistry};

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub source: SourceConfig,
    pub output: OutputConfig,
    pub logging: LoggingConfig,
    /// `[signatures.<name>]` tables of criteria.
    pub signatures: SignatureDefinitions,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker count; 0 means one per CPU.
    pub threads: usize,
    /// Signatures to enable. Empty enables every configured signature.
    pub signatures: Vec<String>,
}

/// How input files are turned into flow records.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Text export in `nfdump -o csv` layout.
    #[default]
    Csv,
    /// Binary nfcapd capture, decoded by running nfdump.
    Nfdump,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub nfdump_bin: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory for report files. Without one the human report goes to stdout.
    pub dir: Option<PathBuf>,
    pub human: bool,
    pub parsable: bool,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct LoggingConfig {
    /// Also append log output to this file.
    pub file: Option<PathBuf>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Csv,
            nfdump_bin: "nfdump".into(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: None,
            human: true,
            parsable: true,
        }
    }
}

impl Config {
    /// Load config from a TOML file. Falls back to defaults if the file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        tracing::info!(
            signatures = config.signatures.len(),
            "Config loaded from {}",
            path.display()
        );
        Ok(config)
    }

    pub fn worker_count(&self) -> usize {
        match self.engine.threads {
            0 => num_cpus::get(),
            n => n,
        }
    }

    /// Build the registry of enabled signatures.
    pub fn registry(&self) -> Result<SignatureRegistry, ConfigError> {
        SignatureRegistry::from_definitions(&self.signatures)?.select(&self.engine.signatures)
    }
}
