use crate::error::{CoreError, CoreResult, InvalidFile};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;
use walkdir::WalkDir;

/// Extensions accepted as game images or packages, lowercase without the dot.
pub const GAME_EXTENSIONS: &[&str] = &[
    "iso", "xex", "xbe", "img", "rom", "zip", "7z", "cue", "nrg", "mdf", "ccd",
];

#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub format: Option<String>,
}

/// Every regular file below `root`, sorted by path.
pub fn scan_directory(root: &Path) -> CoreResult<Vec<PathBuf>> {
    if !root.is_dir() {
        return Err(CoreError::ScanRoot(root.to_path_buf()));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = entry.map_err(|e| {
            let at = e.path().unwrap_or(root).to_path_buf();
            match e.into_io_error() {
                Some(io) => CoreError::Io(io),
                None => CoreError::ScanLoop(at),
            }
        })?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    files.sort();
    debug!(root = %root.display(), count = files.len(), "scanned directory");
    Ok(files)
}

/// Like [`scan_directory`], keeping only files with a game extension.
pub fn scan_games(root: &Path) -> CoreResult<Vec<PathBuf>> {
    Ok(scan_directory(root)?
        .into_iter()
        .filter(|p| is_game_file(p))
        .collect())
}

pub fn is_game_file(path: &Path) -> bool {
    extension(path).is_some_and(|ext| GAME_EXTENSIONS.contains(&ext.as_str()))
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
}

fn regular_file(path: &Path) -> Result<fs::Metadata, InvalidFile> {
    let meta = fs::metadata(path).map_err(|_| InvalidFile::NotFound(path.to_path_buf()))?;
    if !meta.is_file() {
        return Err(InvalidFile::NotAFile(path.to_path_buf()));
    }
    Ok(meta)
}

fn info(path: &Path, meta: &fs::Metadata) -> FileInfo {
    FileInfo {
        path: path.to_path_buf(),
        size: meta.len(),
        modified: meta.modified().ok(),
        format: extension(path),
    }
}

#[cfg(unix)]
fn is_executable(_path: &Path, meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(path: &Path, _meta: &fs::Metadata) -> bool {
    extension(path).as_deref() == Some("exe")
}

pub fn validate_emulator(path: &Path) -> Result<FileInfo, InvalidFile> {
    let meta = regular_file(path)?;
    if !is_executable(path, &meta) {
        return Err(InvalidFile::NotExecutable(path.to_path_buf()));
    }
    if fs::File::open(path).is_err() {
        return Err(InvalidFile::Unreadable(path.to_path_buf()));
    }
    Ok(info(path, &meta))
}

pub fn validate_game_file(path: &Path) -> Result<FileInfo, InvalidFile> {
    let meta = regular_file(path)?;
    if !is_game_file(path) {
        return Err(InvalidFile::UnsupportedFormat {
            ext: extension(path).map(|e| format!(".{e}")).unwrap_or_default(),
            supported: GAME_EXTENSIONS
                .iter()
                .map(|e| format!(".{e}"))
                .collect::<Vec<_>>()
                .join(", "),
        });
    }
    if fs::File::open(path).is_err() {
        return Err(InvalidFile::Unreadable(path.to_path_buf()));
    }
    Ok(info(path, &meta))
}
