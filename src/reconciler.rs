//! Artifact reconciliation: the on-disk `test-history/` tree must stay
//! bijective with the database rows that reference it. Directories no row
//! points at are orphans and get removed.

use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

use crate::artifacts::ArtifactStore;
use crate::error::PumpkinError;
use crate::store::Store;

/// Result of one reconciliation pass.
#[derive(Debug, Clone)]
pub struct CleanReport {
    /// Directories removed this pass (empty on a dry run).
    pub deleted: Vec<String>,
    /// Directories referenced by at least one url_test row.
    pub kept: usize,
    /// Unreferenced directories found on disk.
    pub orphans: Vec<String>,
}

pub struct Reconciler {
    store: Store,
    artifacts: ArtifactStore,
}

impl Reconciler {
    pub fn new(store: Store, artifacts: ArtifactStore) -> Self {
        Self { store, artifacts }
    }

    /// Compares disk against database and removes (or, on a dry run, only
    /// reports) unreferenced directories.
    ///
    /// The database must be reachable first: with no row set to compare
    /// against, every directory would look like an orphan.
    pub async fn clean(&self, dry_run: bool) -> Result<CleanReport, PumpkinError> {
        if !self.store.ping().await {
            return Err(PumpkinError::DatabaseUnavailable(
                "refusing to reconcile without the reference row set".to_string(),
            ));
        }

        let referenced: HashSet<String> = self
            .store
            .referenced_screenshot_paths()
            .await?
            .iter()
            .filter_map(|p| dir_segment(p))
            .collect();

        let on_disk = self.artifacts.list_test_dirs()?;
        let mut orphans: Vec<String> = on_disk
            .iter()
            .filter(|name| !referenced.contains(*name))
            .cloned()
            .collect();
        orphans.sort();
        let kept = on_disk.len() - orphans.len();

        if dry_run {
            info!(
                orphans = orphans.len(),
                kept, "dry run: no directories removed"
            );
            return Ok(CleanReport {
                deleted: Vec::new(),
                kept,
                orphans,
            });
        }

        let mut deleted = Vec::with_capacity(orphans.len());
        for name in &orphans {
            match self.artifacts.remove_test_dir(name) {
                Ok(()) => {
                    info!("removed orphan directory {name}");
                    deleted.push(name.clone());
                }
                Err(e) => warn!("could not remove {name}: {e}"),
            }
        }

        Ok(CleanReport {
            deleted,
            kept,
            orphans,
        })
    }
}

/// The `test-history` child directory a stored artifact path points into.
fn dir_segment(path: &str) -> Option<String> {
    Path::new(path)
        .parent()
        .and_then(|dir| dir.file_name())
        .map(|name| name.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::temp_store;
    use tempfile::TempDir;

    async fn seed_reference(store: &Store, screenshot_path: &str) {
        sqlx::query(
            "INSERT INTO runs (uuid, run_timestamp, total_urls, parallel_workers)
             VALUES (?, '2025-06-01T00:00:00.000Z', 1, 1)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .execute(store.pool())
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO url_tests
             (uuid, test_run_id, test_timestamp, url, domain, browser, user_agent,
              status, test_duration_ms, scroll_duration_ms, screenshot_path, har_path)
             VALUES (?, (SELECT MAX(id) FROM runs), '2025-06-01T00:00:01.000Z',
                     'https://example.com', 'example.com', 'chromium', 'ua',
                     'PASSED', 10, 0, ?, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(screenshot_path)
        .bind(screenshot_path.replace("screenshot.png", "network.har"))
        .execute(store.pool())
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn orphans_detected_then_removed_then_stable() {
        let (store, _db_tmp) = temp_store().await;
        let artifact_tmp = TempDir::new().unwrap();
        let artifacts = ArtifactStore::new(artifact_tmp.path());

        for name in ["dir-a", "dir-b", "dir-c"] {
            std::fs::create_dir(artifact_tmp.path().join(name)).unwrap();
        }
        for referenced in ["dir-a", "dir-c"] {
            let path = artifact_tmp
                .path()
                .join(referenced)
                .join("screenshot.png")
                .to_string_lossy()
                .into_owned();
            seed_reference(&store, &path).await;
        }

        let reconciler = Reconciler::new(store.clone(), artifacts);

        // Dry run: reports the orphan, removes nothing.
        let report = reconciler.clean(true).await.unwrap();
        assert_eq!(report.orphans, vec!["dir-b"]);
        assert_eq!(report.kept, 2);
        assert!(report.deleted.is_empty());
        assert!(artifact_tmp.path().join("dir-b").exists());

        // Real pass removes it.
        let report = reconciler.clean(false).await.unwrap();
        assert_eq!(report.deleted, vec!["dir-b"]);
        assert!(!artifact_tmp.path().join("dir-b").exists());
        assert!(artifact_tmp.path().join("dir-a").exists());
        assert!(artifact_tmp.path().join("dir-c").exists());

        // Second pass finds a clean tree.
        let report = reconciler.clean(false).await.unwrap();
        assert!(report.orphans.is_empty());
        assert!(report.deleted.is_empty());
        assert_eq!(report.kept, 2);
    }

    #[tokio::test]
    async fn unreachable_database_aborts_without_deleting() {
        let (store, _db_tmp) = temp_store().await;
        let artifact_tmp = TempDir::new().unwrap();
        std::fs::create_dir(artifact_tmp.path().join("dir-x")).unwrap();

        store.close().await;
        let reconciler = Reconciler::new(store, ArtifactStore::new(artifact_tmp.path()));

        let err = reconciler.clean(false).await.unwrap_err();
        assert!(matches!(err, PumpkinError::DatabaseUnavailable(_)));
        assert!(artifact_tmp.path().join("dir-x").exists());
    }

    #[test]
    fn dir_segment_extracts_parent_name() {
        assert_eq!(
            dir_segment("/app/test-history/2025-x__example.com/screenshot.png"),
            Some("2025-x__example.com".to_string())
        );
        assert_eq!(dir_segment("screenshot.png"), None);
    }
}
