use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("emulator not found at: {}", .0.display())]
    EmulatorNotFound(PathBuf),
    #[error("game file not found at: {}", .0.display())]
    GameNotFound(PathBuf),
    #[error("cannot create download directory {}: {source}", .path.display())]
    DownloadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid download url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error(transparent)]
    InvalidFile(#[from] InvalidFile),
    #[error("not a directory: {}", .0.display())]
    ScanRoot(PathBuf),
    #[error("filesystem loop while scanning at: {}", .0.display())]
    ScanLoop(PathBuf),

    #[error("network error: {0}")]
    Network(String),
    #[error("download failed with status: {status} - {reason}")]
    HttpStatus { status: u16, reason: String },
    #[error("too many redirects ({0}) or invalid redirect url")]
    TooManyRedirects(u32),
    #[error("invalid redirect target {location:?}: {reason}")]
    InvalidRedirect { location: String, reason: String },
    #[error("download timeout after {}s - please check your internet connection", .0.as_secs())]
    Timeout(Duration),
    #[error("download cancelled")]
    Cancelled,
    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("downloaded file is empty or corrupted: {}", .0.display())]
    EmptyDownload(PathBuf),

    #[error("failed to launch game: {0}")]
    Process(String),
}

/// Coarse classification used by callers to decide how to present a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Precondition,
    Transport,
    Integrity,
    Process,
    Internal,
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::EmulatorNotFound(_)
            | CoreError::GameNotFound(_)
            | CoreError::DownloadDir { .. }
            | CoreError::InvalidUrl { .. }
            | CoreError::InvalidFile(_)
            | CoreError::ScanRoot(_)
            | CoreError::ScanLoop(_) => ErrorKind::Precondition,
            CoreError::Network(_)
            | CoreError::HttpStatus { .. }
            | CoreError::TooManyRedirects(_)
            | CoreError::InvalidRedirect { .. }
            | CoreError::Timeout(_)
            | CoreError::Cancelled
            | CoreError::Write { .. } => ErrorKind::Transport,
            CoreError::EmptyDownload(_) => ErrorKind::Integrity,
            CoreError::Process(_) => ErrorKind::Process,
            CoreError::Io(_) | CoreError::Serde(_) => ErrorKind::Internal,
        }
    }
}

/// Reasons a user-picked file is rejected before it is ever handed to the emulator.
#[derive(Debug, Error)]
pub enum InvalidFile {
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("path is not a file: {}", .0.display())]
    NotAFile(PathBuf),
    #[error("file is not executable: {}", .0.display())]
    NotExecutable(PathBuf),
    #[error("file is not readable: {}", .0.display())]
    Unreadable(PathBuf),
    #[error("unsupported file format {ext:?}. Supported: {supported}")]
    UnsupportedFormat { ext: String, supported: String },
}

/// Renders an error together with every `source()` below it, one cause per line.
pub fn format_error_chain(error: &dyn Error) -> String {
    let mut chain = vec![error.to_string()];
    let mut source = error.source();

    while let Some(err) = source {
        chain.push(format!("  caused by: {}", err));
        source = err.source();
    }

    chain.join("\n")
}
