//! Project scanner: walks directories, hashes files, emits changes.
//!
//! Keeps an in-memory map of last-seen content hashes so repeated scans only
//! surface files whose bytes actually changed. On the first scan after a
//! service start the map is seeded from the store's latest file hashes, so
//! untouched files are not re-indexed across restarts.

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use crate::models::FileChange;

/// Directories never worth scanning.
const EXCLUDED_DIRS: &[&str] = &[".git", "target", "node_modules", ".idea", ".vscode"];

pub struct Scanner {
    extensions: Vec<String>,
    seen: HashMap<PathBuf, String>,
}

impl Scanner {
    pub fn new(extensions: &[String]) -> Self {
        Self {
            extensions: extensions.to_vec(),
            seen: HashMap::new(),
        }
    }

    /// Seed the last-seen map (warm start from the store).
    pub fn seed(&mut self, hashes: HashMap<String, String>) {
        for (path, hash) in hashes {
            self.seen.insert(PathBuf::from(path), hash);
        }
    }

    pub fn tracked_files(&self) -> usize {
        self.seen.len()
    }

    /// Walk `dirs` and report files whose hash differs from the last scan,
    /// plus deletions. Only files under the scanned directories are eligible
    /// for deletion; a targeted single-directory scan leaves the rest of the
    /// map intact.
    pub fn scan(&mut self, dirs: &[PathBuf]) -> Result<Vec<FileChange>> {
        let mut changes = Vec::new();
        let mut present: Vec<PathBuf> = Vec::new();

        for dir in dirs {
            if !dir.exists() {
                continue;
            }
            let walker = WalkDir::new(dir).into_iter().filter_entry(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .map(|name| !EXCLUDED_DIRS.contains(&name))
                    .unwrap_or(true)
            });
            for entry in walker {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = entry.path();
                if !self.watches(path) {
                    continue;
                }
                let bytes = match std::fs::read(path) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        debug!(path = %path.display(), error = %e, "skipping unreadable file");
                        continue;
                    }
                };
                let hash = hash_bytes(&bytes);
                present.push(path.to_path_buf());

                match self.seen.get(path) {
                    Some(previous) if previous == &hash => {}
                    _ => {
                        self.seen.insert(path.to_path_buf(), hash.clone());
                        changes.push(FileChange {
                            path: path.to_path_buf(),
                            hash,
                            exists: true,
                        });
                    }
                }
            }
        }

        // Deletion scope: only files under the directories scanned here.
        let deleted: Vec<PathBuf> = self
            .seen
            .keys()
            .filter(|known| {
                dirs.iter().any(|dir| known.starts_with(dir)) && !present.contains(known)
            })
            .cloned()
            .collect();
        for path in deleted {
            self.seen.remove(&path);
            changes.push(FileChange {
                path,
                hash: String::new(),
                exists: false,
            });
        }

        Ok(changes)
    }

    /// Scan exactly one file (used by the debounced change notifications).
    pub fn scan_file(&mut self, path: &Path) -> Result<Option<FileChange>> {
        if !self.watches(path) {
            return Ok(None);
        }
        if !path.exists() {
            if self.seen.remove(path).is_some() {
                return Ok(Some(FileChange {
                    path: path.to_path_buf(),
                    hash: String::new(),
                    exists: false,
                }));
            }
            return Ok(None);
        }
        let bytes = std::fs::read(path)?;
        let hash = hash_bytes(&bytes);
        if self.seen.get(path).map(String::as_str) == Some(hash.as_str()) {
            return Ok(None);
        }
        self.seen.insert(path.to_path_buf(), hash.clone());
        Ok(Some(FileChange {
            path: path.to_path_buf(),
            hash,
            exists: true,
        }))
    }

    fn watches(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.extensions.iter().any(|e| e == ext))
            .unwrap_or(false)
    }
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn extensions() -> Vec<String> {
        vec!["xml".to_string(), "yaml".to_string()]
    }

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn first_scan_reports_all_watched_files() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.xml", "<a/>");
        write(tmp.path(), "b.yaml", "key: value");
        write(tmp.path(), "ignored.txt", "nope");

        let mut scanner = Scanner::new(&extensions());
        let changes = scanner.scan(&[tmp.path().to_path_buf()]).unwrap();
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c.exists));
    }

    #[test]
    fn unchanged_rescan_is_silent() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.xml", "<a/>");

        let mut scanner = Scanner::new(&extensions());
        scanner.scan(&[tmp.path().to_path_buf()]).unwrap();
        let second = scanner.scan(&[tmp.path().to_path_buf()]).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn content_change_is_detected() {
        let tmp = TempDir::new().unwrap();
        let path = write(tmp.path(), "a.xml", "<a/>");

        let mut scanner = Scanner::new(&extensions());
        scanner.scan(&[tmp.path().to_path_buf()]).unwrap();
        std::fs::write(&path, "<a changed=\"yes\"/>").unwrap();
        let changes = scanner.scan(&[tmp.path().to_path_buf()]).unwrap();
        assert_eq!(changes.len(), 1);
        assert!(changes[0].exists);
    }

    #[test]
    fn deletion_is_reported() {
        let tmp = TempDir::new().unwrap();
        let path = write(tmp.path(), "a.xml", "<a/>");

        let mut scanner = Scanner::new(&extensions());
        scanner.scan(&[tmp.path().to_path_buf()]).unwrap();
        std::fs::remove_file(&path).unwrap();
        let changes = scanner.scan(&[tmp.path().to_path_buf()]).unwrap();
        assert_eq!(changes.len(), 1);
        assert!(!changes[0].exists);
        assert_eq!(changes[0].path, path);
    }

    #[test]
    fn scoped_scan_does_not_flag_outside_files_as_deleted() {
        let tmp = TempDir::new().unwrap();
        let dir_a = tmp.path().join("a");
        let dir_b = tmp.path().join("b");
        std::fs::create_dir_all(&dir_a).unwrap();
        std::fs::create_dir_all(&dir_b).unwrap();
        write(&dir_a, "one.xml", "<one/>");
        write(&dir_b, "two.xml", "<two/>");

        let mut scanner = Scanner::new(&extensions());
        scanner.scan(&[dir_a.clone(), dir_b.clone()]).unwrap();

        // Scanning only dir_a must not declare dir_b's files deleted.
        let changes = scanner.scan(&[dir_a.clone()]).unwrap();
        assert!(changes.is_empty());
        assert_eq!(scanner.tracked_files(), 2);
    }

    #[test]
    fn warm_start_skips_known_hashes() {
        let tmp = TempDir::new().unwrap();
        let path = write(tmp.path(), "a.xml", "<a/>");
        let hash = hash_bytes(&std::fs::read(&path).unwrap());

        let mut scanner = Scanner::new(&extensions());
        let mut seed = HashMap::new();
        seed.insert(path.display().to_string(), hash);
        scanner.seed(seed);

        let changes = scanner.scan(&[tmp.path().to_path_buf()]).unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn scan_file_detects_single_change() {
        let tmp = TempDir::new().unwrap();
        let path = write(tmp.path(), "a.xml", "<a/>");

        let mut scanner = Scanner::new(&extensions());
        let first = scanner.scan_file(&path).unwrap();
        assert!(first.is_some());
        let second = scanner.scan_file(&path).unwrap();
        assert!(second.is_none());

        std::fs::remove_file(&path).unwrap();
        let third = scanner.scan_file(&path).unwrap();
        assert!(matches!(third, Some(FileChange { exists: false, .. })));
    }

    #[test]
    fn excluded_directories_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let git = tmp.path().join(".git");
        std::fs::create_dir_all(&git).unwrap();
        write(&git, "config.xml", "<x/>");
        write(tmp.path(), "a.xml", "<a/>");

        let mut scanner = Scanner::new(&extensions());
        let changes = scanner.scan(&[tmp.path().to_path_buf()]).unwrap();
        assert_eq!(changes.len(), 1);
    }
}
