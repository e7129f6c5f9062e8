use crate::config::LoggingConfig;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

const DEFAULT_LEVEL: &str = "info";

type SharedFile = Arc<Mutex<File>>;

/// Command line and environment values layered over `[logging]`.
#[derive(Clone, Debug, Default)]
pub struct LogOverrides {
    pub debug: bool,
    pub level: Option<String>,
    pub dir: Option<String>,
}

/// Effective log level and optional log file path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl LogSettings {
    /// `--debug` wins, then the override, then the config file, then `info`.
    /// The directory follows the same order and joins `file_name`.
    pub fn resolve(config: &LoggingConfig, overrides: &LogOverrides) -> Self {
        let level = if overrides.debug {
            "debug".to_string()
        } else {
            non_blank(&overrides.level)
                .or_else(|| non_blank(&config.level))
                .unwrap_or_else(|| DEFAULT_LEVEL.to_string())
        };
        let file = non_blank(&overrides.dir)
            .or_else(|| non_blank(&config.dir))
            .map(|dir| PathBuf::from(dir).join(&config.file_name));
        Self { level, file }
    }
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Installs the global subscriber. `RUST_LOG` still takes precedence over
/// the resolved level. A log file that cannot be opened leaves stdout only.
pub fn init(settings: &LogSettings) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level));
    let file = settings.file.as_deref().and_then(|path| match open_append(path) {
        Ok(file) => Some(file),
        Err(err) => {
            eprintln!("log_file_error: {}: {err}", path.display());
            None
        }
    });
    let make_writer = BoxMakeWriter::new(move || TeeWriter {
        stdout: io::stdout(),
        file: file.clone(),
    });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn open_append(path: &Path) -> io::Result<SharedFile> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Arc::new(Mutex::new(file)))
}

/// Copies each formatted line to stdout and, when present, the log file.
/// Write errors are ignored.
struct TeeWriter {
    stdout: io::Stdout,
    file: Option<SharedFile>,
}

impl TeeWriter {
    fn each(&mut self, op: impl Fn(&mut dyn Write) -> io::Result<()>) {
        let _ = op(&mut self.stdout);
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = op(&mut *file);
        }
    }
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.each(|out| out.write_all(buf));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.each(|out| out.flush());
        Ok(())
    }
}
