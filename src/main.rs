use std::error::Error;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use tracing_subscriber::util::SubscriberInitExt;

use flowsig::cli::Cli;
use flowsig::config::{Config, SourceKind};
use flowsig::{logging, report};
use flowsig::source::{CsvFlowFile, NfdumpFile};
use flowsig::{Engine, RecordSource, TracingSink};

fn main() -> ExitCode {
    let cli = Cli::parse();

    // The log file may come from the config, so load it under a console-only logger.
    let loaded = match logging::subscriber(cli.debug, None) {
        Ok(console) => tracing::subscriber::with_default(console, || Config::load(&cli.config)),
        Err(_) => Config::load(&cli.config),
    };
    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => {
            eprintln!("flowsig: {e}");
            return ExitCode::FAILURE;
        }
    };
    cli.apply(&mut config);

    // Initialize logging
    match logging::subscriber(cli.debug, config.logging.file.as_deref()) {
        Ok(subscriber) => subscriber.init(),
        Err(e) => {
            eprintln!("flowsig: cannot open log file: {e}");
            return ExitCode::FAILURE;
        }
    }

    tracing::info!("⚡ flowsig starting...");

    match run(cli, config) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli, config: Config) -> Result<ExitCode, Box<dyn Error>> {
    // Signature selection happens here, before the engine exists.
    let registry = config.registry()?;
    tracing::info!(signatures = ?registry.names(), "Signatures enabled");

    let files: Vec<Arc<dyn RecordSource>> = cli
        .files
        .iter()
        .map(|path| -> Arc<dyn RecordSource> {
            match config.source.kind {
                SourceKind::Csv => Arc::new(CsvFlowFile::new(path)),
                SourceKind::Nfdump => Arc::new(NfdumpFile::new(path, &config.source.nfdump_bin)),
            }
        })
        .collect();

    let engine = Engine::new(registry, config.worker_count(), Arc::new(TracingSink));
    let cancel = engine.cancel_handle();

    let rt = tokio::runtime::Runtime::new()?;
    let outcome = rt.block_on(async {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, finishing files in flight");
                cancel.cancel();
            }
        });
        engine.run(files).await
    });

    report::write_reports(&outcome, engine.registry(), &config.output, Utc::now().date_naive())?;

    if outcome.failures.is_empty() && outcome.skipped.is_empty() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(2))
    }
}
