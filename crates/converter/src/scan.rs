use std::collections::HashMap;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::Serialize;
use walkdir::WalkDir;
use crate::config::ConvertConfig;
use crate::item::WorkItem;
use crate::workspace::RemoteWorkspace;
use log::{debug, info, warn};

/// A source file that still lacks a converted output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingSource {
    /// Stem shared by source and target
    pub source_name: String,
    pub source_path: PathBuf,
    /// Where the converted output will be written
    pub target_path: PathBuf,
    pub source_bytes: u64,
}

/// A source whose output is already present locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConvertedSource {
    pub source_name: String,
    pub target_path: PathBuf,
    pub target_bytes: u64,
}

/// Local diff of source files against already-produced outputs
#[derive(Debug, Clone, Default, Serialize)]
pub struct Inventory {
    pub pending: Vec<PendingSource>,
    pub converted: Vec<ConvertedSource>,
    /// Targets that exist but are below `min_target_bytes`
    pub undersized: Vec<String>,
}

impl Inventory {
    pub fn total_sources(&self) -> usize {
        self.pending.len() + self.converted.len()
    }

    pub fn pending_bytes(&self) -> u64 {
        self.pending.iter().map(|p| p.source_bytes).sum()
    }

    /// Instantiate one work item per pending source, with remote paths inside `workspace`
    pub fn into_work_items(self, workspace: &RemoteWorkspace) -> Vec<WorkItem> {
        self.pending
            .into_iter()
            .map(|p| {
                let remote_source = workspace.file_path(&file_name_lossy(&p.source_path));
                let remote_target = workspace.file_path(&file_name_lossy(&p.target_path));
                WorkItem::new(p.source_name, p.source_path, p.target_path, remote_source, remote_target)
            })
            .collect()
    }
}

fn file_name_lossy(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Lowercased extension match, like `a.WAV` for `wav`
fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.eq_ignore_ascii_case(ext))
        .unwrap_or(false)
}

/// Scan the local directory and compute which sources still need converting
///
/// Only the top level of `local_dir` is considered. Output is sorted by
/// source name so reruns see the same order regardless of filesystem.
pub fn scan_inventory(cfg: &ConvertConfig) -> Result<Inventory> {
    let dir = &cfg.local_dir;
    if !dir.is_dir() {
        anyhow::bail!("Local directory does not exist: {}", dir.display());
    }

    info!("Scanning directory: {}", dir.display());

    // stem -> (source path, size)
    let mut sources: HashMap<String, (PathBuf, u64)> = HashMap::new();
    // stem -> target size
    let mut targets: HashMap<String, u64> = HashMap::new();

    let walker = WalkDir::new(dir).min_depth(1).max_depth(1).follow_links(true);
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Error reading directory entry: {}", e);
                continue;
            }
        };

        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let stem = match path.file_stem().and_then(|s| s.to_str()) {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => {
                debug!("Ignoring file without a usable stem: {}", path.display());
                continue;
            }
        };

        if has_extension(path, &cfg.source_ext) {
            let size = entry
                .metadata()
                .with_context(|| format!("Failed to stat file: {}", path.display()))?
                .len();
            if let Some((previous, _)) = sources.insert(stem.clone(), (path.to_path_buf(), size)) {
                warn!(
                    "Two sources share the name {:?} ({} and {}); keeping the latter",
                    stem,
                    previous.display(),
                    path.display()
                );
            }
        } else if has_extension(path, &cfg.target_ext) {
            let size = entry
                .metadata()
                .with_context(|| format!("Failed to stat file: {}", path.display()))?
                .len();
            targets.insert(stem, size);
        }
    }

    let mut inventory = Inventory::default();
    for (stem, (source_path, source_bytes)) in sources {
        let target_path = dir.join(format!("{}.{}", stem, cfg.target_ext));
        match targets.get(&stem) {
            Some(&size) if size >= cfg.min_target_bytes => {
                inventory.converted.push(ConvertedSource {
                    source_name: stem,
                    target_path,
                    target_bytes: size,
                });
            }
            Some(&size) => {
                warn!(
                    "Existing output for {} is {} bytes (< {}), converting again",
                    stem, size, cfg.min_target_bytes
                );
                inventory.undersized.push(stem.clone());
                inventory.pending.push(PendingSource {
                    source_name: stem,
                    source_path,
                    target_path,
                    source_bytes,
                });
            }
            None => {
                inventory.pending.push(PendingSource {
                    source_name: stem,
                    source_path,
                    target_path,
                    source_bytes,
                });
            }
        }
    }

    inventory.pending.sort_by(|a, b| a.source_name.cmp(&b.source_name));
    inventory.converted.sort_by(|a, b| a.source_name.cmp(&b.source_name));
    inventory.undersized.sort();

    info!(
        "Scan complete: {} .{} files, {} already converted, {} to convert",
        inventory.total_sources(),
        cfg.source_ext,
        inventory.converted.len(),
        inventory.pending.len()
    );
    Ok(inventory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Transport;
    use proptest::prelude::*;
    use std::collections::BTreeSet;
    use std::fs;

    fn config_for(dir: &Path) -> ConvertConfig {
        ConvertConfig {
            local_dir: dir.to_path_buf(),
            transport: Transport::Local,
            ..Default::default()
        }
    }

    fn names(inv: &Inventory) -> Vec<String> {
        inv.pending.iter().map(|p| p.source_name.clone()).collect()
    }

    #[test]
    fn test_existing_targets_are_excluded() {
        let dir = tempfile::tempdir().unwrap();
        for f in ["a.wav", "b.wav", "c.wav", "a.mp3", "notes.txt"] {
            fs::write(dir.path().join(f), b"data").unwrap();
        }

        let inv = scan_inventory(&config_for(dir.path())).unwrap();
        assert_eq!(names(&inv), vec!["b", "c"]);
        assert_eq!(inv.converted.len(), 1);
        assert_eq!(inv.converted[0].source_name, "a");
        assert_eq!(inv.pending[0].target_path, dir.path().join("b.mp3"));
        assert_eq!(inv.pending_bytes(), 8);
    }

    #[test]
    fn test_orphan_targets_and_subdirectories_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("lonely.mp3"), b"x").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested").join("deep.wav"), b"x").unwrap();

        let inv = scan_inventory(&config_for(dir.path())).unwrap();
        assert!(inv.pending.is_empty());
        assert!(inv.converted.is_empty());
    }

    #[test]
    fn test_extension_match_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Horse.WAV"), b"x").unwrap();
        let inv = scan_inventory(&config_for(dir.path())).unwrap();
        assert_eq!(names(&inv), vec!["Horse"]);
        assert_eq!(inv.pending[0].target_path, dir.path().join("Horse.mp3"));
    }

    #[test]
    fn test_zero_byte_target_counts_as_done_by_default() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cow.wav"), b"moo").unwrap();
        fs::write(dir.path().join("cow.mp3"), b"").unwrap();

        let inv = scan_inventory(&config_for(dir.path())).unwrap();
        assert!(inv.pending.is_empty());

        let mut cfg = config_for(dir.path());
        cfg.min_target_bytes = 1;
        let inv = scan_inventory(&cfg).unwrap();
        assert_eq!(names(&inv), vec!["cow"]);
        assert_eq!(inv.undersized, vec!["cow"]);
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let cfg = config_for(Path::new("/definitely/not/here"));
        assert!(scan_inventory(&cfg).is_err());
    }

    #[test]
    fn test_work_items_use_workspace_paths() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("owl.wav"), b"x").unwrap();
        let inv = scan_inventory(&config_for(dir.path())).unwrap();
        let ws = RemoteWorkspace::new("/tmp/rconv-test");
        let items = inv.into_work_items(&ws);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].remote_source_path, "/tmp/rconv-test/owl.wav");
        assert_eq!(items[0].remote_target_path, "/tmp/rconv-test/owl.mp3");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        /// The batch is exactly the sources whose derived target is absent, and
        /// once every target exists the batch is empty
        #[test]
        fn test_inventory_is_set_difference(
            sources in prop::collection::btree_set("[a-z]{1,8}", 0..12),
            targets in prop::collection::btree_set("[a-z]{1,8}", 0..12),
        ) {
            let dir = tempfile::tempdir().unwrap();
            for s in &sources {
                fs::write(dir.path().join(format!("{}.wav", s)), b"src").unwrap();
            }
            for t in &targets {
                fs::write(dir.path().join(format!("{}.mp3", t)), b"out").unwrap();
            }

            let cfg = config_for(dir.path());
            let inv = scan_inventory(&cfg).unwrap();
            let expected: Vec<String> = sources.difference(&targets).cloned().collect();
            prop_assert_eq!(names(&inv), expected.clone());

            let unique: BTreeSet<_> = names(&inv).into_iter().collect();
            prop_assert_eq!(unique.len(), inv.pending.len());

            for s in &expected {
                fs::write(dir.path().join(format!("{}.mp3", s)), b"out").unwrap();
            }
            let rerun = scan_inventory(&cfg).unwrap();
            prop_assert!(rerun.pending.is_empty());
        }
    }
}
