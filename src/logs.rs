//! Log files for the worker streams and the supervisor itself.
use std::{
    collections::VecDeque,
    fmt,
    fs::{self, File, OpenOptions},
    io::{self, BufRead, BufReader, Read, Write},
    path::PathBuf,
    str::FromStr,
    thread::{self, JoinHandle},
};

use tracing::{debug, warn};

use crate::{error::LogsError, runtime};

/// Type of logs to display.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogKind {
    /// Worker standard output.
    #[default]
    Stdout,
    /// Worker standard error.
    Stderr,
    /// The supervisor's own log.
    Supervisor,
}

impl LogKind {
    /// String representation for file paths and display.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogKind::Stdout => "stdout",
            LogKind::Stderr => "stderr",
            LogKind::Supervisor => "supervisor",
        }
    }
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for LogKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "stdout" => Ok(LogKind::Stdout),
            "stderr" => Ok(LogKind::Stderr),
            "supervisor" => Ok(LogKind::Supervisor),
            _ => Err(format!(
                "invalid log kind '{}', must be one of: stdout, stderr, supervisor",
                s
            )),
        }
    }
}

/// Path of the log file for a service and stream.
pub fn resolve_log_path(service: &str, kind: LogKind) -> PathBuf {
    runtime::log_dir().join(format!("{service}_{}.log", kind.as_str()))
}

/// Opens a log file for appending, creating the log directory if needed.
pub fn open_log_file(service: &str, kind: LogKind) -> io::Result<File> {
    let path = resolve_log_path(service, kind);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Copies a child stream into its log file on a background thread until EOF.
///
/// Bytes are written through unchanged. The pipe is drained to the end even when the log
/// file cannot be written, so the child never sees a closed stdout/stderr.
pub fn spawn_log_writer<R>(service: &str, stream: R, kind: LogKind) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    let service = service.to_string();
    thread::spawn(move || {
        let mut sink: Box<dyn Write + Send> = match open_log_file(&service, kind) {
            Ok(file) => Box::new(file),
            Err(err) => {
                warn!("Cannot open {kind} log for '{service}', discarding output: {err}");
                Box::new(io::sink())
            }
        };

        let mut reader = BufReader::new(stream);
        let mut chunk = Vec::new();
        let mut writable = true;
        loop {
            chunk.clear();
            match reader.read_until(b'\n', &mut chunk) {
                Ok(0) => break,
                Ok(_) => {
                    if writable && let Err(err) = sink.write_all(&chunk) {
                        warn!("Failed writing {kind} log for '{service}', discarding output: {err}");
                        writable = false;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!("{kind} stream for '{service}' closed: {err}");
                    break;
                }
            }
        }
    })
}

/// Feeds every line of `stream` to `each`, replacing invalid UTF-8 instead of stopping.
pub fn read_lines_lossy<R, F>(stream: R, mut each: F) -> io::Result<()>
where
    R: Read,
    F: FnMut(String),
{
    let mut reader = BufReader::new(stream);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw) {
            Ok(0) => return Ok(()),
            Ok(_) => {
                while matches!(raw.last(), Some(b'\n' | b'\r')) {
                    raw.pop();
                }
                each(String::from_utf8_lossy(&raw).into_owned());
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
}

/// Returns the last `lines` lines of a service log.
pub fn tail_log(service: &str, kind: LogKind, lines: usize) -> Result<Vec<String>, LogsError> {
    let path = resolve_log_path(service, kind);
    if !path.exists() {
        return Err(LogsError::LogUnavailable {
            service: service.to_string(),
            kind: kind.to_string(),
        });
    }

    let mut tail = VecDeque::with_capacity(lines);
    read_lines_lossy(File::open(path)?, |line| {
        if lines == 0 {
            return;
        }
        if tail.len() == lines {
            tail.pop_front();
        }
        tail.push_back(line);
    })?;
    Ok(tail.into())
}
