//! Logging for the supervisor.
//!
//! Every component logs through `tracing`. [`init_logging`] installs a
//! subscriber that renders each event as one line,
//! `[<ISO-8601 timestamp>] [<LEVEL>] <message>`, into two sinks:
//! - the console (stdout), for whoever is watching the loop
//! - an append-only log file that is rotated once it grows past a size limit
//!
//! Writing the log never fails the caller. File errors are reported on
//! stderr and otherwise ignored.
//!
//! An optional [`ActivityClock`] layer records when the last entry passed
//! the level filter.

use std::ffi::OsString;
use std::fmt::{self as stdfmt, Write as _};
use std::fs::{self, OpenOptions};
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use owo_colors::OwoColorize;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{self, FmtContext, FormatEvent, FormatFields, MakeWriter};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Log level configuration for the logging middleware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    /// Trace level - most verbose
    Trace,
    /// Debug level
    Debug,
    /// Info level (default)
    #[default]
    Info,
    /// Warning level
    Warn,
    /// Error level - least verbose
    Error,
    /// Disable logging entirely
    Off,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Off => "off",
        }
    }
}

impl From<u8> for LogLevel {
    /// Convert verbosity count to log level.
    /// 0 = Info, 1 = Debug, 2+ = Trace
    fn from(verbosity: u8) -> Self {
        match verbosity {
            0 => LogLevel::Info,
            1 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

/// Configuration for the logging middleware.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// The log level to use when `RUST_LOG` is not set
    pub level: LogLevel,
    /// Whether to echo entries on stdout
    pub console: bool,
    /// Log file to append to, if any
    pub log_file: Option<PathBuf>,
    /// Size in bytes above which the log file is rotated
    pub max_log_size: u64,
    /// Clock touched by every emitted entry
    pub activity: Option<ActivityClock>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            console: true,
            log_file: None,
            max_log_size: 10 * 1024 * 1024,
            activity: None,
        }
    }
}

impl LoggingConfig {
    /// Create a new logging configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the log level.
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// Set whether entries are echoed on the console.
    pub fn with_console(mut self, enabled: bool) -> Self {
        self.console = enabled;
        self
    }

    /// Set the rotating log file and its size limit.
    pub fn with_log_file(mut self, path: impl Into<PathBuf>, max_log_size: u64) -> Self {
        self.log_file = Some(path.into());
        self.max_log_size = max_log_size;
        self
    }

    /// Record the time of every emitted entry in `clock`.
    pub fn with_activity(mut self, clock: ActivityClock) -> Self {
        self.activity = Some(clock);
        self
    }

    /// Whether a rotation notice should appear on the console.
    ///
    /// The notice is an info entry, so it needs the console on and a level
    /// of info or more verbose.
    pub fn announces_rotation(&self) -> bool {
        self.console
            && matches!(
                self.level,
                LogLevel::Trace | LogLevel::Debug | LogLevel::Info
            )
    }

    /// Create a configuration from verbosity level (0 = info, 1 = debug, 2+ = trace).
    pub fn from_verbosity(verbosity: u8) -> Self {
        Self::default().with_level(LogLevel::from(verbosity))
    }
}

/// A single rendered log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub message: String,
}

impl LogEntry {
    /// Creates an entry stamped with the current time.
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        }
    }

    fn timestamp_string(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

impl stdfmt::Display for LogEntry {
    fn fmt(&self, f: &mut stdfmt::Formatter<'_>) -> stdfmt::Result {
        write!(
            f,
            "[{}] [{}] {}",
            self.timestamp_string(),
            self.level,
            self.message
        )
    }
}

/// Time of the most recent log entry, shared between clones.
///
/// Installed as a subscriber layer it is touched by every event that passes
/// the level filter.
#[derive(Debug, Clone)]
pub struct ActivityClock {
    millis: Arc<AtomicI64>,
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityClock {
    /// Creates a clock reading the current time.
    pub fn new() -> Self {
        Self {
            millis: Arc::new(AtomicI64::new(Utc::now().timestamp_millis())),
        }
    }

    /// Records activity now.
    pub fn touch(&self) {
        self.millis
            .fetch_max(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Time of the last recorded activity, millisecond precision.
    pub fn last(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::Relaxed))
            .unwrap_or_else(Utc::now)
    }
}

impl<S: Subscriber> Layer<S> for ActivityClock {
    fn on_event(&self, _event: &Event<'_>, _ctx: Context<'_, S>) {
        self.touch();
    }
}

/// Collects the event message and any structured fields.
#[derive(Default)]
struct EntryVisitor {
    message: String,
    fields: String,
}

impl EntryVisitor {
    fn finish(self) -> String {
        let mut message = self.message;
        message.push_str(&self.fields);
        message
    }
}

impl Visit for EntryVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn stdfmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

/// Event formatter producing `[timestamp] [LEVEL] message` lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineFormat;

impl<S, N> FormatEvent<S, N> for LineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> stdfmt::Result {
        let mut visitor = EntryVisitor::default();
        event.record(&mut visitor);
        let entry = LogEntry::new(*event.metadata().level(), visitor.finish());

        if !writer.has_ansi_escapes() {
            return writeln!(writer, "{}", entry);
        }

        let level = entry.level.as_str();
        let level = match entry.level {
            Level::ERROR => level.red().to_string(),
            Level::WARN => level.yellow().to_string(),
            Level::INFO => level.green().to_string(),
            _ => level.dimmed().to_string(),
        };
        writeln!(
            writer,
            "[{}] [{}] {}",
            entry.timestamp_string().dimmed(),
            level,
            entry.message
        )
    }
}

#[derive(Debug)]
struct RotatingLogInner {
    path: PathBuf,
    max_size: u64,
    lock: Mutex<()>,
}

/// Append-only log file with size-based rotation.
///
/// After each append the file size is checked; once it exceeds `max_size`
/// the file is renamed to `<path>.<unix-millis>.bak` and the next append
/// starts a fresh file.
#[derive(Debug, Clone)]
pub struct RotatingLog {
    inner: Arc<RotatingLogInner>,
    announce: bool,
}

impl RotatingLog {
    /// Creates the sink, creating the parent directory if needed.
    pub fn new(path: impl Into<PathBuf>, max_size: u64) -> Self {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = fs::create_dir_all(parent) {
                eprintln!("Failed to create log directory {}: {}", parent.display(), e);
            }
        }

        Self {
            inner: Arc::new(RotatingLogInner {
                path,
                max_size,
                lock: Mutex::new(()),
            }),
            announce: false,
        }
    }

    /// Print a notice on stdout after each rotation.
    pub fn with_rotation_notice(mut self, enabled: bool) -> Self {
        self.announce = enabled;
        self
    }

    /// Whether rotations are announced on stdout.
    pub fn announces_rotation(&self) -> bool {
        self.announce
    }

    /// Path of the live log file.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Backup path used when rotating at `at`.
    pub fn backup_path(&self, at: DateTime<Utc>) -> PathBuf {
        let mut name = OsString::from(self.inner.path.as_os_str());
        name.push(format!(".{}.bak", at.timestamp_millis()));
        PathBuf::from(name)
    }

    /// Appends `bytes` and rotates the file if it grew past the limit.
    ///
    /// Returns the backup path when a rotation happened. Errors are reported
    /// on stderr and never returned.
    pub fn append(&self, bytes: &[u8]) -> Option<PathBuf> {
        let _guard = self.inner.lock.lock().unwrap_or_else(|e| e.into_inner());

        if let Err(e) = self.write_bytes(bytes) {
            eprintln!("Failed to write to log file: {}", e);
            return None;
        }

        match self.rotate_if_needed() {
            Ok(Some(backup)) => {
                if self.announce {
                    let notice = LogEntry::new(
                        Level::INFO,
                        format!("Log rotated to {}", backup.display()),
                    );
                    println!("{}", notice);
                }
                Some(backup)
            }
            Ok(None) => None,
            Err(e) => {
                eprintln!("Failed to rotate log file: {}", e);
                None
            }
        }
    }

    fn write_bytes(&self, bytes: &[u8]) -> io::Result<()> {
        let open = || {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.inner.path)
        };

        let mut file = match open() {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if let Some(parent) = self.inner.path.parent() {
                    fs::create_dir_all(parent)?;
                }
                open()?
            }
            Err(e) => return Err(e),
        };
        file.write_all(bytes)
    }

    fn rotate_if_needed(&self) -> io::Result<Option<PathBuf>> {
        let size = fs::metadata(&self.inner.path)?.len();
        if size <= self.inner.max_size {
            return Ok(None);
        }

        let backup = self.backup_path(Utc::now());
        fs::rename(&self.inner.path, &backup)?;
        Ok(Some(backup))
    }
}

/// Writer handed to the `fmt` layer for a single event.
pub struct RotatingLogWriter<'a> {
    log: &'a RotatingLog,
}

impl Write for RotatingLogWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.log.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for RotatingLog {
    type Writer = RotatingLogWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        RotatingLogWriter { log: self }
    }
}

/// Initialize the logging middleware with the given configuration.
///
/// This function should be called once at the start of the application.
/// `RUST_LOG`, when set, takes precedence over `config.level`.
///
/// # Examples
///
/// ```no_run
/// use ralph_supervisor::logging::{init_logging, LoggingConfig, LogLevel};
///
/// init_logging(
///     LoggingConfig::new()
///         .with_level(LogLevel::Debug)
///         .with_log_file(".ralph/cli.log", 10 * 1024 * 1024),
/// );
/// ```
pub fn init_logging(config: LoggingConfig) {
    let env_filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(config.level.directive())
    };

    let console = config.console.then(|| {
        fmt::layer()
            .event_format(LineFormat)
            .with_ansi(io::stdout().is_terminal())
            .with_writer(io::stdout)
    });

    let file = config.log_file.as_ref().map(|path| {
        fmt::layer()
            .event_format(LineFormat)
            .with_ansi(false)
            .with_writer(
                RotatingLog::new(path, config.max_log_size)
                    .with_rotation_notice(config.announces_rotation()),
            )
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(config.activity)
        .with(console)
        .with(file)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::prelude::*;

    fn backups_in(dir: &Path) -> Vec<PathBuf> {
        let mut backups: Vec<PathBuf> = fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "bak"))
            .collect();
        backups.sort();
        backups
    }

    #[test]
    fn test_log_level_from_verbosity() {
        assert!(matches!(LogLevel::from(0), LogLevel::Info));
        assert!(matches!(LogLevel::from(1), LogLevel::Debug));
        assert!(matches!(LogLevel::from(2), LogLevel::Trace));
        assert!(matches!(LogLevel::from(10), LogLevel::Trace));
    }

    #[test]
    fn test_logging_config_builder() {
        let config = LoggingConfig::new()
            .with_level(LogLevel::Debug)
            .with_console(false)
            .with_log_file("logs/run.log", 128);

        assert_eq!(config.level, LogLevel::Debug);
        assert!(!config.console);
        assert_eq!(config.log_file.as_deref(), Some(Path::new("logs/run.log")));
        assert_eq!(config.max_log_size, 128);
    }

    #[test]
    fn test_rotation_notice_needs_console_and_info_level() {
        let config = LoggingConfig::new().with_log_file("cli.log", 16);
        assert!(config.announces_rotation());
        assert!(config.clone().with_level(LogLevel::Debug).announces_rotation());
        assert!(!config.clone().with_console(false).announces_rotation());
        assert!(!config.clone().with_level(LogLevel::Warn).announces_rotation());
        assert!(!config.with_level(LogLevel::Off).announces_rotation());
    }

    #[test]
    fn test_quiet_sink_still_rotates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cli.log");
        let log = RotatingLog::new(&path, 4).with_rotation_notice(false);

        assert!(!log.announces_rotation());
        assert!(log.append(b"0123456789\n").is_some());
        assert_eq!(backups_in(dir.path()).len(), 1);
    }

    #[test]
    fn test_activity_clock_follows_filtered_events() {
        let clock = ActivityClock::new();
        let before = clock.last();
        std::thread::sleep(std::time::Duration::from_millis(20));

        let subscriber = tracing_subscriber::registry()
            .with(EnvFilter::new("info"))
            .with(clock.clone());

        tracing::subscriber::with_default(subscriber, || {
            tracing::debug!("filtered out");
        });
        assert_eq!(clock.last(), before);

        let subscriber = tracing_subscriber::registry()
            .with(EnvFilter::new("info"))
            .with(clock.clone());
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("Starting iteration 1");
        });
        assert!(clock.last() > before);
    }

    #[test]
    fn test_log_entry_format() {
        let entry = LogEntry {
            timestamp: DateTime::parse_from_rfc3339("2024-03-05T07:08:09.123Z")
                .unwrap()
                .with_timezone(&Utc),
            level: Level::ERROR,
            message: "Auto-commit failed".to_string(),
        };
        assert_eq!(
            entry.to_string(),
            "[2024-03-05T07:08:09.123Z] [ERROR] Auto-commit failed"
        );
    }

    #[test]
    fn test_append_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".ralph").join("cli.log");
        let log = RotatingLog::new(&path, 1024);

        assert!(log.append(b"first\n").is_none());
        assert!(log.append(b"second\n").is_none());
        assert_eq!(fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }

    #[test]
    fn test_rotation_preserves_content_and_starts_fresh_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cli.log");
        let log = RotatingLog::new(&path, 16);

        assert!(log.append(b"0123456789\n").is_none());
        let backup = log
            .append(b"abcdefghij\n")
            .expect("file should rotate once it exceeds the limit");

        assert!(!path.exists());
        assert_eq!(fs::read(&backup).unwrap(), b"0123456789\nabcdefghij\n");
        assert!(backup
            .to_string_lossy()
            .starts_with(&*path.to_string_lossy()));
        assert_eq!(backups_in(dir.path()), vec![backup]);

        assert!(log.append(b"next\n").is_none());
        assert_eq!(fs::read_to_string(&path).unwrap(), "next\n");
    }

    #[test]
    fn test_file_at_limit_is_not_rotated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cli.log");
        let log = RotatingLog::new(&path, 4);

        assert!(log.append(b"abcd").is_none());
        assert!(path.exists());
        assert!(backups_in(dir.path()).is_empty());
    }

    #[test]
    fn test_backup_path_format() {
        let log = RotatingLog::new(Path::new("cli.log"), 1);
        let at = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        assert_eq!(
            log.backup_path(at),
            PathBuf::from("cli.log.1700000000123.bak")
        );
    }

    #[test]
    fn test_write_failure_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "file").unwrap();

        let log = RotatingLog::new(blocker.join("cli.log"), 1024);
        assert!(log.append(b"lost\n").is_none());
    }

    #[test]
    fn test_subscriber_writes_formatted_lines_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cli.log");
        let log = RotatingLog::new(&path, 1024 * 1024);

        let subscriber = tracing_subscriber::registry().with(
            fmt::layer()
                .event_format(LineFormat)
                .with_ansi(false)
                .with_writer(log.clone()),
        );

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("Starting iteration {}", 3);
            tracing::error!(step = 2, "Auto-commit failed");
        });

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("] [INFO] Starting iteration 3"));
        assert!(lines[1].ends_with("] [ERROR] Auto-commit failed step=2"));
    }
}
