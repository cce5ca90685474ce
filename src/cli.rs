use std::path::PathBuf;

use clap::Parser;

use crate::config::{Config, SourceKind};

/// Classify exported network flows against behavioral signatures.
#[derive(Debug, Parser)]
#[command(name = "flowsig", version, about)]
pub struct Cli {
    /// Flow files to process (csv exports or nfcapd captures)
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Configuration file
    #[arg(short, long, default_value = "flowsig.toml")]
    pub config: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    pub debug: bool,

    /// Worker threads (0 = one per CPU)
    #[arg(short, long)]
    pub threads: Option<usize>,

    /// Enable only this signature; repeatable
    #[arg(short, long = "signature", value_name = "NAME")]
    pub signatures: Vec<String>,

    /// Directory for report files
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// How input files are read
    #[arg(long, value_enum)]
    pub source: Option<SourceKind>,

    /// Also append log output to this file
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    /// Command line flags take precedence over the config file.
    pub fn apply(&self, config: &mut Config) {
        if let Some(threads) = self.threads {
            config.engine.threads = threads;
        }
        if !self.signatures.is_empty() {
            config.engine.signatures = self.signatures.clone();
        }
        if let Some(dir) = &self.output {
            config.output.dir = Some(dir.clone());
        }
        if let Some(kind) = self.source {
            config.source.kind = kind;
        }
        if let Some(path) = &self.log_file {
            config.logging.file = Some(path.clone());
        }
    }
}
