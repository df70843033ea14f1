use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;

static DROPPED_WRITES: Lazy<Mutex<HashMap<&'static str, u64>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Counts a frame write attempted against a transport that is not
/// open. The spec requires these to be observable without surfacing
/// an error to the caller.
pub fn record_dropped_write(frame_kind: &'static str) {
    let mut stats = DROPPED_WRITES.lock().unwrap();
    let count = stats.entry(frame_kind).or_default();
    *count += 1;
    tracing::warn!(
        target: "runbox::transport",
        frame = frame_kind,
        dropped = *count,
        "transport not open; frame dropped"
    );
}

pub fn dropped_writes(frame_kind: &str) -> u64 {
    DROPPED_WRITES
        .lock()
        .unwrap()
        .get(frame_kind)
        .copied()
        .unwrap_or(0)
}

pub mod logging {
    use clap::ValueEnum;
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        pub fn as_str(self) -> &'static str {
            match self {
                LogLevel::Error => "error",
                LogLevel::Warn => "warn",
                LogLevel::Info => "info",
                LogLevel::Debug => "debug",
                LogLevel::Trace => "trace",
            }
        }

        pub fn to_filter(self) -> LevelFilter {
            match self {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    impl std::fmt::Display for LogLevel {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.as_str())
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to configure logger: {0}")]
        Configure(String),
    }

    static INIT: OnceLock<()> = OnceLock::new();
    static GUARD: OnceLock<Option<WorkerGuard>> = OnceLock::new();

    // HTTP and WebSocket dependencies log aggressively at debug; keep
    // them at warn unless RUNBOX_TRACE_DEPS or RUNBOX_LOG_FILTER asks
    // for more.
    const NOISY_DEPS: &[&str] = &[
        "tungstenite",
        "tokio_tungstenite",
        "hyper",
        "reqwest",
        "h2",
        "rustls",
    ];

    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if INIT.get().is_some() {
            return Ok(());
        }
        inner_init(config)?;
        INIT.set(()).ok();
        Ok(())
    }

    fn inner_init(config: &LogConfig) -> Result<(), InitError> {
        let env_filter = build_env_filter(config.level.to_filter());

        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_level(true)
            .with_target(config.level >= LogLevel::Debug)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Configure(err.to_string()))?;

        let _ = GUARD.set(Some(guard));
        Ok(())
    }

    fn build_env_filter(level: LevelFilter) -> EnvFilter {
        if let Ok(custom) = std::env::var("RUNBOX_LOG_FILTER") {
            if !custom.trim().is_empty() {
                if let Ok(filter) = EnvFilter::try_new(custom.trim()) {
                    return filter;
                }
            }
        }
        let trace_deps = std::env::var("RUNBOX_TRACE_DEPS")
            .map(|value| value != "0" && !value.is_empty())
            .unwrap_or(false);
        let mut filter = EnvFilter::default().add_directive(level.into());
        if !trace_deps {
            for dep in NOISY_DEPS {
                if let Ok(directive) = format!("{dep}=warn").parse() {
                    filter = filter.add_directive(directive);
                }
            }
        }
        filter
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn log_level_maps_to_filter() {
            assert_eq!(LogLevel::Error.to_filter(), LevelFilter::ERROR);
            assert_eq!(LogLevel::Trace.to_filter(), LevelFilter::TRACE);
            assert_eq!(LogLevel::default(), LogLevel::Warn);
        }

        #[test]
        fn log_level_names_match_cli_values() {
            assert_eq!(LogLevel::Debug.as_str(), "debug");
            assert_eq!(LogLevel::Warn.as_str(), "warn");
        }
    }
}
