use std::fmt;
use std::time::Duration;

/// Upper bound on diagnostic text (dissector stderr, capture stderr) carried by errors.
pub const MAX_DIAGNOSTIC_CHARS: usize = 4000;

/// Cuts `text` down to [`MAX_DIAGNOSTIC_CHARS`] without splitting a character.
pub fn bounded_diagnostic(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(MAX_DIAGNOSTIC_CHARS) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    TomlError(String),
    DirectoryDoesNotExist(String),
    NotInRange(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::TomlError(e) => write!(f, "TOML parsing error: {}", e),
            ConfigError::DirectoryDoesNotExist(e) => write!(f, "Directory error: {}", e),
            ConfigError::NotInRange(e) => write!(f, "Value out of range: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

/// Failures surfaced by the analysis, reconstruction, capture and registry layers.
///
/// `Timeout` and `QueueFull` are the transient cases: callers may retry them with
/// backoff, everything else should fail fast.
#[derive(Debug)]
pub enum ForensicError {
    /// A required external tool could not be located or is unusable.
    Configuration(String),
    /// An external process exited unsuccessfully. `diagnostic` is bounded.
    Process {
        status: Option<i32>,
        diagnostic: String,
    },
    /// A wall-clock budget was exceeded and the worker was torn down.
    Timeout { after: Duration },
    /// Unknown session, capture or stream id. Never says whether the id exists for someone else.
    NotFound(String),
    /// The dispatcher wait queue is saturated.
    QueueFull { max_queued: usize },
    /// Unparseable binary header, invalid regex, malformed request.
    MalformedInput(String),
    IoError(std::io::Error),
}

impl ForensicError {
    pub fn process(status: Option<i32>, diagnostic: &str) -> Self {
        ForensicError::Process {
            status,
            diagnostic: bounded_diagnostic(diagnostic),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ForensicError::Timeout { .. } | ForensicError::QueueFull { .. }
        )
    }
}

impl fmt::Display for ForensicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForensicError::Configuration(e) => write!(f, "Configuration error: {}", e),
            ForensicError::Process { status, diagnostic } => match status {
                Some(code) => write!(f, "Process failed (exit {}): {}", code, diagnostic),
                None => write!(f, "Process failed: {}", diagnostic),
            },
            ForensicError::Timeout { after } => {
                write!(f, "Timed out after {:.1}s", after.as_secs_f64())
            }
            ForensicError::NotFound(e) => write!(f, "Not found: {}", e),
            ForensicError::QueueFull { max_queued } => {
                write!(f, "Analysis queue is full ({} waiting)", max_queued)
            }
            ForensicError::MalformedInput(e) => write!(f, "Malformed input: {}", e),
            ForensicError::IoError(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for ForensicError {}

impl From<std::io::Error> for ForensicError {
    fn from(err: std::io::Error) -> Self {
        ForensicError::IoError(err)
    }
}

impl From<regex::Error> for ForensicError {
    fn from(err: regex::Error) -> Self {
        ForensicError::MalformedInput(format!("invalid search pattern: {}", err))
    }
}
