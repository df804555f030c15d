pub mod args;
pub mod config;
pub mod download;
pub mod error;
pub mod library;
pub mod logging;
pub mod process;
pub mod settings;

pub use args::{synthesize, EmulatorFamily};
pub use config::{DownloadOptions, LaunchConfig, MAX_REDIRECTS};
pub use download::{DownloadTask, Downloader};
pub use error::{format_error_chain, CoreError, CoreResult, ErrorKind, InvalidFile};
pub use library::{scan_directory, scan_games, validate_emulator, validate_game_file, FileInfo};
pub use process::{LaunchResult, ProbeReport, ProcessLauncher};
pub use settings::{JsonFileStore, ManagerSettings, MemoryStore, SettingsStore};
