use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,reqwest=warn,hyper=warn";
const LOG_FILE_NAME: &str = "chatsync.log";

pub struct LoggingHandle {
    pub run_id: String,
    pub guard: WorkerGuard,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub log_dir: PathBuf,
}

pub fn init_logging(config: &LogConfig) -> anyhow::Result<LoggingHandle> {
    std::fs::create_dir_all(&config.log_dir)?;
    let log_path = config.log_dir.join(LOG_FILE_NAME);

    let (filter_source, filter) = resolve_filter(|key| std::env::var(key).ok());

    let file_appender = tracing_appender::rolling::never(&config.log_dir, LOG_FILE_NAME);
    let (writer, guard) = tracing_appender::non_blocking(file_appender);
    let format = std::env::var("CHATSYNC_LOG_FORMAT").unwrap_or_else(|_| "json".into());

    let registry = tracing_subscriber::registry().with(filter);
    if format.eq_ignore_ascii_case("pretty") {
        registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .pretty()
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .json()
                    .flatten_event(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true)
                    .with_current_span(true),
            )
            .try_init()?;
    }

    let run_id = std::env::var("CHATSYNC_RUN_ID").unwrap_or_else(|_| {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        format!("pid-{}-{}", std::process::id(), now)
    });

    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        run_id = %run_id,
        log_path = %log_path.display(),
        format = %format,
        filter = %filter_source,
    );

    Ok(LoggingHandle { run_id, guard })
}

/// `CHATSYNC_LOG_FILTER` > `RUST_LOG` > default. A value that does not
/// parse falls back to the default, and the returned source says so.
fn resolve_filter(lookup: impl Fn(&str) -> Option<String>) -> (String, EnvFilter) {
    lookup("CHATSYNC_LOG_FILTER")
        .or_else(|| lookup("RUST_LOG"))
        .and_then(|value| EnvFilter::try_new(&value).ok().map(|filter| (value, filter)))
        .unwrap_or_else(|| (DEFAULT_FILTER.to_string(), EnvFilter::new(DEFAULT_FILTER)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_filter_wins_over_rust_log() {
        let (source, _) = resolve_filter(|key| match key {
            "CHATSYNC_LOG_FILTER" => Some("debug".into()),
            "RUST_LOG" => Some("warn".into()),
            _ => None,
        });
        assert_eq!(source, "debug");
    }

    #[test]
    fn unparsable_filter_reports_the_default() {
        let (source, filter) =
            resolve_filter(|key| (key == "RUST_LOG").then(|| "info,chatsync=loud".to_string()));
        assert_eq!(source, DEFAULT_FILTER);
        assert_eq!(filter.to_string(), EnvFilter::new(DEFAULT_FILTER).to_string());
    }
}
