use std::fs::File;
use std::path::Path;

use tracing::Subscriber;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Level of the stderr layer.
pub fn level_for(verbosity: u8, quiet: bool) -> LevelFilter {
    if quiet {
        return LevelFilter::OFF;
    }
    match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Level of the log file: never below INFO, and `-q` does not apply.
pub fn file_level_for(verbosity: u8) -> LevelFilter {
    level_for(verbosity, false).max(LevelFilter::INFO)
}

/// Compact stderr output, plus a full-detail file layer when `log_file` is given.
pub fn setup_logging(verbosity: u8, quiet: bool, log_file: Option<&Path>) -> std::io::Result<()> {
    let file = log_file.map(File::create).transpose()?;
    subscriber(verbosity, quiet, file).init();
    Ok(())
}

fn subscriber(verbosity: u8, quiet: bool, file: Option<File>) -> impl Subscriber + Send + Sync + 'static {
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .with_filter(level_for(verbosity, quiet));

    let file_layer = file.map(|file| {
        fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_thread_ids(true)
            .with_target(true)
            .with_filter(file_level_for(verbosity))
    });

    tracing_subscriber::registry().with(stderr_layer).with(file_layer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_wins_over_verbosity() {
        assert_eq!(level_for(3, true), LevelFilter::OFF);
        assert_eq!(level_for(0, false), LevelFilter::WARN);
        assert_eq!(level_for(2, false), LevelFilter::DEBUG);
        assert_eq!(level_for(9, false), LevelFilter::TRACE);
    }

    #[test]
    fn file_level_has_an_info_floor() {
        assert_eq!(file_level_for(0), LevelFilter::INFO);
        assert_eq!(file_level_for(2), LevelFilter::DEBUG);
    }

    #[test]
    fn quiet_still_writes_the_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qf.log");
        let file = File::create(&path).unwrap();

        tracing::subscriber::with_default(subscriber(0, true, Some(file)), || {
            tracing::info!("local job started");
            tracing::debug!("inputs staged");
        });

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("local job started"), "{text}");
        assert!(!text.contains("inputs staged"));
    }
}
