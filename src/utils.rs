//! Executable lookup for child processes

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use parking_lot::Mutex;
use walkdir::WalkDir;

use crate::{Error, Result};

/// How deep a search root is walked
const MAX_SEARCH_DEPTH: usize = 6;

/// Resolved executables, keyed by the name asked for
static LOCATE_CACHE: LazyLock<Mutex<HashMap<String, PathBuf>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Validate and canonicalize an executable path
///
/// Resolves symlinks and relative components and requires a regular file.
pub fn validate_executable(path: &Path) -> Result<PathBuf> {
    let canonical_path = path
        .canonicalize()
        .map_err(|_| Error::NotFound(format!("Invalid or non-existent path: {:?}", path)))?;

    if !canonical_path.is_file() {
        return Err(Error::NotFound(format!(
            "Not a regular file: {:?}",
            canonical_path
        )));
    }

    Ok(canonical_path)
}

/// Common places a helper executable is installed next to its host
pub fn default_search_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd);
    }
    if let Some(dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        roots.push(dir);
    }
    if let Some(home) = dirs::home_dir() {
        roots.push(home.join(".local/bin"));
        roots.push(home.join(".cargo/bin"));
    }

    roots
}

/// Find an executable by file name.
///
/// Walks each root in order (at most `MAX_SEARCH_DEPTH` levels) and returns the first regular file whose name
/// matches (`name.exe` also matches on Windows), then falls back to `PATH`.
/// Hits are cached for the lifetime of the process.
pub fn locate_executable(name: &str, roots: &[PathBuf]) -> Result<PathBuf> {
    if let Some(path) = LOCATE_CACHE.lock().get(name) {
        return Ok(path.clone());
    }

    let candidates = candidate_names(name);
    let found = roots
        .iter()
        .filter(|root| root.is_dir())
        .find_map(|root| find_under(root, &candidates))
        .or_else(|| which::which(name).ok());

    let path = match found {
        Some(path) => validate_executable(&path)?,
        None => {
            return Err(Error::NotFound(format!(
                "{} was not found under {} search roots or on PATH",
                name,
                roots.len()
            )))
        }
    };

    tracing::debug!("Located {} at {:?}", name, path);
    LOCATE_CACHE.lock().insert(name.to_string(), path.clone());
    Ok(path)
}

fn candidate_names(name: &str) -> Vec<String> {
    let mut names = vec![name.to_string()];
    if cfg!(windows) && !name.to_ascii_lowercase().ends_with(".exe") {
        names.push(format!("{}.exe", name));
    }
    names
}

fn find_under(root: &Path, candidates: &[String]) -> Option<PathBuf> {
    WalkDir::new(root)
        .max_depth(MAX_SEARCH_DEPTH)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .find(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|file_name| candidates.iter().any(|c| c == file_name))
        })
        .map(|entry| entry.into_path())
}
