use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use tracing::Subscriber;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Console logging filtered by `RUST_LOG` plus a `flowsig` level directive.
/// With `file`, every event is also appended there without ANSI colours.
pub fn subscriber(debug: bool, file: Option<&Path>) -> io::Result<impl Subscriber + Send + Sync + 'static> {
    let directive = if debug { "flowsig=debug" } else { "flowsig=info" };
    let mut filter = EnvFilter::from_default_env();
    if let Ok(d) = directive.parse() {
        filter = filter.add_directive(d);
    }

    let file_layer = match file {
        Some(path) => {
            let log = OpenOptions::new().create(true).append(true).open(path)?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(log)))
        }
        None => None,
    };

    Ok(tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_appended_to_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowsig.log");
        std::fs::write(&path, "earlier run\n").unwrap();

        let sub = subscriber(false, Some(&path)).unwrap();
        tracing::subscriber::with_default(sub, || {
            tracing::info!(file = "a.csv", "File processed");
            tracing::debug!("only with --debug");
        });

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("earlier run\n"));
        assert!(text.contains("File processed"));
        assert!(text.contains("a.csv"));
        assert!(!text.contains("only with --debug"));
        assert!(!text.contains('\u{1b}'));
    }

    #[test]
    fn debug_flag_reaches_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("debug.log");
        let sub = subscriber(true, Some(&path)).unwrap();
        tracing::subscriber::with_default(sub, || tracing::debug!("worker started"));
        assert!(std::fs::read_to_string(&path).unwrap().contains("worker started"));
    }

    #[test]
    fn unopenable_log_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("flowsig.log");
        assert!(subscriber(false, Some(&path)).is_err());
    }
}
