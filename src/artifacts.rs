//! Artifact store: one directory per URL test under `test-history/`, holding
//! exactly `screenshot.png` and `network.har`. The database row keeps only
//! path references; this module owns the files.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

use crate::error::PumpkinError;
use crate::utils::db_timestamp;

pub const SCREENSHOT_FILE: &str = "screenshot.png";
pub const HAR_FILE: &str = "network.har";

/// Paths allocated for one URL test.
#[derive(Debug, Clone)]
pub struct TestDirs {
    pub dir: PathBuf,
    pub screenshot_path: PathBuf,
    pub har_path: PathBuf,
}

/// Filesystem store rooted at the configured `test-history` directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Allocates the directory for one test and returns its canonical paths.
    ///
    /// The directory name embeds the job's start timestamp, so callers never
    /// reuse the same millisecond for the same URL; an existing directory is
    /// reported as `ArtifactConflict` rather than silently shared.
    pub fn allocate_test_dir(
        &self,
        url: &str,
        now: DateTime<Utc>,
    ) -> Result<TestDirs, PumpkinError> {
        let name = dir_name(url, now);
        let dir = self.root.join(&name);

        std::fs::create_dir_all(&self.root)?;
        match std::fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(PumpkinError::ArtifactConflict(name));
            }
            Err(e) => return Err(PumpkinError::ArtifactIo(e)),
        }

        Ok(TestDirs {
            screenshot_path: dir.join(SCREENSHOT_FILE),
            har_path: dir.join(HAR_FILE),
            dir,
        })
    }

    /// Direct child directories of the root, skipping dot-entries.
    pub fn list_test_dirs(&self) -> Result<Vec<String>, PumpkinError> {
        let mut names = Vec::new();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(PumpkinError::ArtifactIo(e)),
        };

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            if entry.file_type()?.is_dir() {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// Removes one test directory recursively.
    pub fn remove_test_dir(&self, name: &str) -> Result<(), PumpkinError> {
        std::fs::remove_dir_all(self.root.join(name))?;
        Ok(())
    }

    /// Best-effort creation of empty artifact files so every database row has
    /// both files on disk even when the driver produced nothing.
    pub fn ensure_placeholders(dirs: &TestDirs) {
        if !dirs.screenshot_path.exists() {
            let _ = std::fs::write(&dirs.screenshot_path, []);
        }
        if !dirs.har_path.exists() {
            let _ = std::fs::write(&dirs.har_path, br#"{"log":{"version":"1.2","entries":[]}}"#);
        }
    }
}

/// Canonical directory name: ISO-8601 timestamp with `:` and `.` replaced by
/// `-`, two underscores, then the sanitized URL.
pub fn dir_name(url: &str, now: DateTime<Utc>) -> String {
    let stamp = db_timestamp(now).replace([':', '.'], "-");
    format!("{stamp}__{}", sanitize_url(url))
}

/// Strips the scheme and trailing slash, then maps every URL-delimiter
/// character to `_`.
pub fn sanitize_url(url: &str) -> String {
    let stripped = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    let stripped = stripped.strip_suffix('/').unwrap_or(stripped);

    stripped
        .chars()
        .map(|c| match c {
            ':' | '/' | '?' | '#' | '[' | ']' | '@' | '!' | '$' | '&' | '\'' | '(' | ')' | '*'
            | '+' | ',' | ';' | '=' => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 10, 20, 30).unwrap()
    }

    #[test]
    fn sanitize_strips_scheme_and_delimiters() {
        assert_eq!(sanitize_url("https://example.com/"), "example.com");
        assert_eq!(
            sanitize_url("https://example.com/a/b?q=1&x=2"),
            "example.com_a_b_q_1_x_2"
        );
        assert_eq!(sanitize_url("http://host:8080/p"), "host_8080_p");
    }

    #[test]
    fn dir_name_is_filesystem_safe() {
        let name = dir_name("https://example.com/x", fixed_now());
        assert_eq!(name, "2025-06-01T10-20-30-000Z__example.com_x");
        assert!(!name.contains(':'));
        assert!(!name.contains('/'));
    }

    #[test]
    fn allocate_creates_dir_and_paths() {
        let tmp = TempDir::new().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let dirs = store
            .allocate_test_dir("https://example.com", fixed_now())
            .unwrap();

        assert!(dirs.dir.is_dir());
        assert!(dirs.screenshot_path.ends_with(SCREENSHOT_FILE));
        assert!(dirs.har_path.ends_with(HAR_FILE));
    }

    #[test]
    fn allocate_rejects_collision() {
        let tmp = TempDir::new().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let now = fixed_now();
        store.allocate_test_dir("https://example.com", now).unwrap();
        let err = store
            .allocate_test_dir("https://example.com", now)
            .unwrap_err();
        assert!(matches!(err, PumpkinError::ArtifactConflict(_)));
    }

    #[test]
    fn list_skips_dot_entries_and_files() {
        let tmp = TempDir::new().unwrap();
        let store = ArtifactStore::new(tmp.path());
        store.allocate_test_dir("https://a.example", fixed_now()).unwrap();
        std::fs::create_dir(tmp.path().join(".hidden")).unwrap();
        std::fs::write(tmp.path().join("stray.txt"), "x").unwrap();

        let dirs = store.list_test_dirs().unwrap();
        assert_eq!(dirs.len(), 1);
        assert!(dirs[0].contains("a.example"));
    }

    #[test]
    fn list_on_missing_root_is_empty() {
        let store = ArtifactStore::new("/nonexistent/pumpkin-test-root");
        assert!(store.list_test_dirs().unwrap().is_empty());
    }

    #[test]
    fn placeholders_create_both_files() {
        let tmp = TempDir::new().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let dirs = store
            .allocate_test_dir("https://example.com", fixed_now())
            .unwrap();
        ArtifactStore::ensure_placeholders(&dirs);
        assert!(dirs.screenshot_path.exists());
        assert!(dirs.har_path.exists());
    }
}
