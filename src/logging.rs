//! Logging configuration for pool drivers and workers.
//!
//! Workers inherit the driver's stderr and environment, so one set of
//! variables controls both sides of a pool.
//!
//! # Environment Variables
//!
//! - `SUBPOOL_LOG` - log filter, overrides `RUST_LOG`
//! - `SUBPOOL_LOG_LEVEL` - level name when no filter is set
//! - `SUBPOOL_LOG_FORMAT` - `pretty`, `compact`, or `json`
//! - `SUBPOOL_LOG_FILE` - log file path, written in addition to stderr
//! - `RUST_LOG` - standard filter variable, used as a fallback
//!
//! # Example
//!
//! ```no_run
//! use subpool::logging::{init, LogConfig};
//!
//! init(LogConfig::from_env());
//! ```

use std::path::PathBuf;
use std::str::FromStr;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// What [`init`] installs: level or filter, line format, optional file.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level emitted when `filter` is unset (default INFO).
    pub level: Level,
    /// Line format on stderr and in the file.
    pub format: LogFormat,
    /// Log file to write alongside stderr; `None` disables file output.
    pub file_path: Option<PathBuf>,
    /// Rotation schedule for the file.
    pub rotation: LogRotation,
    /// Full filter directive string; wins over `level` when set.
    pub filter: Option<String>,
    /// Include the module path in each line (default true).
    pub show_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Compact,
            file_path: None,
            rotation: LogRotation::Daily,
            filter: None,
            show_target: true,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults plus environment overrides. Worker processes use this so
    /// `SUBPOOL_LOG=debug` set on the driver reaches the whole pool.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_rotation(mut self, rotation: LogRotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Fold environment variables into this configuration.
    ///
    /// A filter already set programmatically wins over `SUBPOOL_LOG`,
    /// `RUST_LOG`, and `SUBPOOL_LOG_LEVEL`.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            if let Ok(filter) = std::env::var("SUBPOOL_LOG") {
                self.filter = Some(filter);
            } else if let Ok(filter) = std::env::var("RUST_LOG") {
                self.filter = Some(filter);
            }
        }

        if self.filter.is_none() {
            if let Ok(level_str) = std::env::var("SUBPOOL_LOG_LEVEL") {
                self.level = parse_level(&level_str).unwrap_or(self.level);
            }
        }

        if let Ok(format) = std::env::var("SUBPOOL_LOG_FORMAT") {
            if let Ok(parsed) = format.parse() {
                self.format = parsed;
            }
        }

        if let Ok(path) = std::env::var("SUBPOOL_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        let level_only = || EnvFilter::new(self.level.to_string().to_lowercase());
        match &self.filter {
            Some(filter) => EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!(
                    "Warning: invalid log filter '{filter}', using level {}",
                    self.level
                );
                level_only()
            }),
            None => level_only(),
        }
    }
}

/// Shape of each emitted log line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, field-per-line output for local debugging.
    Pretty,
    /// One line per event (default; driver and worker lines interleave on
    /// the same stderr).
    #[default]
    Compact,
    /// JSON objects, one per line, for log collectors.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "unknown log format '{s}' (expected pretty, compact, or json)"
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Pretty => "pretty",
            Self::Compact => "compact",
            Self::Json => "json",
        })
    }
}

/// When the log file rolls over to a fresh one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogRotation {
    /// A new file every hour.
    Hourly,
    /// A new file every day (default).
    #[default]
    Daily,
    /// A single file, grown forever.
    Never,
}

impl FromStr for LogRotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "never" => Ok(Self::Never),
            _ => Err(format!(
                "unknown log rotation '{s}' (expected hourly, daily, or never)"
            )),
        }
    }
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Parse a level name, with the "warning" alias `Level` itself does not
/// accept.
fn parse_level(s: &str) -> Option<Level> {
    if s.eq_ignore_ascii_case("warning") {
        return Some(Level::WARN);
    }
    s.parse().ok()
}

/// One fmt layer in the configured format, over any writer.
fn format_layer<S, W>(
    format: LogFormat,
    show_target: bool,
    ansi: bool,
    writer: W,
) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a> + 'static,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let base = fmt::layer()
        .with_target(show_target)
        .with_ansi(ansi)
        .with_writer(writer);
    match format {
        LogFormat::Pretty => base.boxed(),
        LogFormat::Compact => base.compact().boxed(),
        LogFormat::Json => base.json().boxed(),
    }
}

/// Install the global tracing subscriber.
///
/// Call once at program startup; later calls are ignored. With `file_path`
/// set, events go to both stderr and a rolling file.
pub fn init(config: LogConfig) {
    let filter = config.build_filter();

    let file_layer = config.file_path.as_ref().map(|path| {
        let parent = path.parent().unwrap_or(std::path::Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("subpool.log");
        let appender = RollingFileAppender::new(config.rotation.into(), parent, file_name);
        format_layer(config.format, config.show_target, false, appender)
    });

    // An error means a subscriber is already installed; keep it.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(format_layer(
            config.format,
            config.show_target,
            true,
            std::io::stderr,
        ))
        .with(file_layer)
        .try_init();
}
