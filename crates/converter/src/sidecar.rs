use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use std::fs;

/// Suffix appended to a target while it is still being downloaded
pub const PARTIAL_SUFFIX: &str = "part";

/// Get the path a download is written to before being renamed into place
pub fn partial_path(target_path: &Path) -> PathBuf {
    let mut name = target_path.as_os_str().to_os_string();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Get the path to the why.txt file for a given source file
pub fn why_txt_path(source_path: &Path) -> PathBuf {
    let mut path = source_path.to_path_buf();
    path.set_extension("why.txt");
    path
}

/// Write a why.txt file explaining why a source failed to convert
pub fn write_why_txt(source_path: &Path, reason: &str) -> Result<()> {
    let why_path = why_txt_path(source_path);
    fs::write(&why_path, reason)
        .with_context(|| format!("Failed to write why.txt: {}", why_path.display()))?;
    Ok(())
}

/// Remove a stale why.txt after a successful conversion
pub fn clear_why_txt(source_path: &Path) -> Result<()> {
    let why_path = why_txt_path(source_path);
    match fs::remove_file(&why_path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove why.txt: {}", why_path.display())),
    }
}
