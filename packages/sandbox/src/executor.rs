// ABOUTME: Remote command execution inside a project's sandbox
// ABOUTME: Wraps backend exec with exit-status checking, file writes via archive upload and remote digests

use crate::backend::{ClusterBackend, ExecOutput};
use crate::endpoint::sandbox_name;
use crate::error::{Result, SandboxError};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Runs commands in the primary container of a running sandbox.
///
/// No timeout is applied here; callers that need one wrap the future.
#[derive(Clone)]
pub struct RemoteExecutor {
    backend: Arc<dyn ClusterBackend>,
}

impl RemoteExecutor {
    pub fn new(backend: Arc<dyn ClusterBackend>) -> Self {
        Self { backend }
    }

    /// Run `command` and return its output without judging the exit status
    pub async fn exec_raw(&self, project_id: &str, command: &[String]) -> Result<ExecOutput> {
        let sandbox = sandbox_name(project_id);
        debug!("exec in {}: {}", sandbox, command.join(" "));
        Ok(self.backend.exec(&sandbox, command).await?)
    }

    /// Run `command` and return combined stdout and stderr.
    ///
    /// A non-zero exit yields `ExecFailure` carrying the remote diagnostics.
    pub async fn exec(&self, project_id: &str, command: &[String]) -> Result<String> {
        let output = self.exec_raw(project_id, command).await?;
        if output.success() {
            Ok(output.combined())
        } else {
            Err(SandboxError::ExecFailure {
                command: command.join(" "),
                exit_code: output.exit_code,
                message: output.combined().trim().to_string(),
            })
        }
    }

    /// Write `content` to the absolute `path` inside the sandbox, creating parents first
    pub async fn write_file(&self, project_id: &str, path: &str, content: &[u8]) -> Result<()> {
        let target = Path::new(path);
        let parent = target
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "/".to_string());
        let file_name = target
            .file_name()
            .ok_or_else(|| SandboxError::Unknown(format!("not a file path: {}", path)))?
            .to_string_lossy()
            .into_owned();

        self.exec(project_id, &["mkdir".to_string(), "-p".to_string(), parent.clone()])
            .await?;

        let archive = single_file_archive(&file_name, content)
            .map_err(|e| SandboxError::Unknown(format!("failed to pack {}: {}", path, e)))?;
        self.backend
            .upload_archive(&sandbox_name(project_id), &parent, archive)
            .await?;
        Ok(())
    }

    /// SHA-256 of the remote file, or `None` when it cannot be read
    pub async fn file_digest(&self, project_id: &str, path: &str) -> Result<Option<String>> {
        let output = self
            .exec_raw(project_id, &["sha256sum".to_string(), path.to_string()])
            .await?;
        if !output.success() {
            return Ok(None);
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .split_whitespace()
            .next()
            .map(str::to_lowercase))
    }
}

fn single_file_archive(file_name: &str, content: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
    header.set_cksum();
    builder.append_data(&mut header, file_name, content)?;
    builder.into_inner()
}
