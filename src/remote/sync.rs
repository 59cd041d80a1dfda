// src/remote/sync.rs

//! Helpers for project sync: exclude matching, size estimates and rsync
//! progress parsing.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;

use crate::errors::{Result, SpotrunError};

pub const DEFAULT_EXCLUDES: &[&str] = &[".venv", "__pycache__", ".git", "*.pyc"];

pub fn default_excludes() -> Vec<String> {
    DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect()
}

/// `rsync --info=progress2` lines look like
/// `  1,234,567  45%   12.34MB/s    0:01:23 (xfr#10, to-chk=90/200)`.
static PROGRESS2_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\s,]*([\d,]+)\s+(\d+)%\s+(\S+)\s+(\S+)").expect("static regex is valid")
});

/// One parsed progress line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub bytes: u64,
    pub percent: u8,
}

pub fn parse_progress2(line: &str) -> Option<Progress> {
    let caps = PROGRESS2_RE.captures(line.trim_end())?;
    let bytes = caps[1].replace(',', "").parse().ok()?;
    let percent = caps[2].parse().ok()?;
    Some(Progress { bytes, percent })
}

/// Match exclude patterns against single path components, the way rsync
/// treats bare patterns.
pub fn build_excludes(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pat in patterns {
        let glob = Glob::new(pat)
            .map_err(|e| SpotrunError::ConfigError(format!("invalid exclude pattern '{pat}': {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| SpotrunError::ConfigError(format!("building exclude set: {e}")))
}

/// Total size in bytes of files under `root`, skipping excluded names.
///
/// Unreadable entries are ignored.
pub fn dir_size(root: &Path, excludes: &GlobSet) -> u64 {
    let mut total = 0;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            if excludes.is_match(entry.file_name()) {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if meta.is_dir() {
                stack.push(entry.path());
            } else if meta.is_file() {
                total += meta.len();
            }
        }
    }
    total
}

pub fn fmt_size(bytes: u64) -> String {
    let mut n = bytes as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if n < 1024.0 {
            return format!("{n:.1} {unit}");
        }
        n /= 1024.0;
    }
    format!("{n:.1} TB")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_progress2_lines() {
        let p = parse_progress2("      1,234,567  45%   12.34MB/s    0:01:23 (xfr#10, to-chk=90/200)");
        assert_eq!(
            p,
            Some(Progress {
                bytes: 1_234_567,
                percent: 45
            })
        );
        assert_eq!(parse_progress2("sending incremental file list"), None);
    }

    #[test]
    fn formats_sizes() {
        assert_eq!(fmt_size(512), "512.0 B");
        assert_eq!(fmt_size(1536), "1.5 KB");
        assert_eq!(fmt_size(5 * 1024 * 1024 * 1024 * 1024), "5.0 TB");
    }

    #[test]
    fn size_skips_excluded_dirs_and_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.py"), vec![0u8; 100]).unwrap();
        fs::write(dir.path().join("main.pyc"), vec![0u8; 1000]).unwrap();
        fs::create_dir_all(dir.path().join(".venv/lib")).unwrap();
        fs::write(dir.path().join(".venv/lib/big"), vec![0u8; 5000]).unwrap();
        fs::create_dir_all(dir.path().join("pkg")).unwrap();
        fs::write(dir.path().join("pkg/mod.py"), vec![0u8; 20]).unwrap();

        let set = build_excludes(&default_excludes()).unwrap();
        assert_eq!(dir_size(dir.path(), &set), 120);
    }
}
