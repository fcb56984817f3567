// ABOUTME: One-directional file synchronization from the file store into a sandbox
// ABOUTME: Full pushes and digest-based diff pushes; sandbox-only files are never deleted

use crate::error::{Result, SandboxError};
use crate::executor::RemoteExecutor;
use crate::files::{content_hash, is_safe_relative_path, FileRecord, FileStore};
use crate::settings::WORKDIR;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub has_changes: bool,
    pub changed_count: usize,
}

impl SyncReport {
    fn from_count(changed_count: usize) -> Self {
        Self {
            has_changes: changed_count > 0,
            changed_count,
        }
    }
}

/// Absolute sandbox path for a store-relative path
pub fn sandbox_path(path: &str) -> Option<String> {
    if !is_safe_relative_path(path) {
        return None;
    }
    let relative = path.trim_start_matches("./");
    Some(format!("{}/{}", WORKDIR, relative))
}

pub struct FileSynchronizer {
    executor: RemoteExecutor,
    files: Arc<dyn FileStore>,
}

impl FileSynchronizer {
    pub fn new(executor: RemoteExecutor, files: Arc<dyn FileStore>) -> Self {
        Self { executor, files }
    }

    /// Push every file unconditionally
    pub async fn sync_all(&self, project_id: &str) -> Result<SyncReport> {
        let records = self.files.list_files(project_id).await?;
        info!("Pushing {} file(s) to project {}", records.len(), project_id);

        let mut written = 0;
        let mut failed = Vec::new();
        for record in &records {
            match self.write(project_id, record).await {
                Ok(()) => written += 1,
                Err(e) => {
                    warn!("Failed to push {} to project {}: {}", record.path, project_id, e);
                    failed.push(record.path.clone());
                }
            }
        }

        finish(project_id, written, failed)
    }

    /// Push only files whose content differs from the sandbox copy
    pub async fn sync_smart(&self, project_id: &str) -> Result<SyncReport> {
        let records = self.files.list_files(project_id).await?;
        debug!("Diffing {} file(s) for project {}", records.len(), project_id);

        let mut changed = 0;
        let mut failed = Vec::new();
        for record in &records {
            match self.sync_one(project_id, record).await {
                Ok(true) => changed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to sync {} to project {}: {}", record.path, project_id, e);
                    failed.push(record.path.clone());
                }
            }
        }

        finish(project_id, changed, failed)
    }

    /// Returns whether the file was written
    async fn sync_one(&self, project_id: &str, record: &FileRecord) -> Result<bool> {
        let remote = sandbox_path(&record.path)
            .ok_or_else(|| SandboxError::Unknown(format!("unsafe path {}", record.path)))?;

        let local = content_hash(&record.content);
        if self.executor.file_digest(project_id, &remote).await?.as_deref() == Some(local.as_str())
        {
            return Ok(false);
        }

        debug!("{} changed in project {}", record.path, project_id);
        self.executor
            .write_file(project_id, &remote, &record.content)
            .await?;
        Ok(true)
    }

    async fn write(&self, project_id: &str, record: &FileRecord) -> Result<()> {
        let remote = sandbox_path(&record.path)
            .ok_or_else(|| SandboxError::Unknown(format!("unsafe path {}", record.path)))?;
        self.executor
            .write_file(project_id, &remote, &record.content)
            .await
    }
}

fn finish(project_id: &str, changed: usize, failed: Vec<String>) -> Result<SyncReport> {
    if !failed.is_empty() {
        return Err(SandboxError::SyncFailure { failed });
    }
    let report = SyncReport::from_count(changed);
    info!(
        "Synced project {}: {} file(s) updated",
        project_id, report.changed_count
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_path_mapping() {
        assert_eq!(sandbox_path("src/a.js").as_deref(), Some("/workspace/src/a.js"));
        assert_eq!(sandbox_path("./index.html").as_deref(), Some("/workspace/index.html"));
        assert_eq!(sandbox_path("/etc/hosts"), None);
        assert_eq!(sandbox_path("../up"), None);
    }

    #[test]
    fn test_report_flags_changes() {
        assert_eq!(
            SyncReport::from_count(0),
            SyncReport {
                has_changes: false,
                changed_count: 0
            }
        );
        assert!(SyncReport::from_count(3).has_changes);
    }
}
