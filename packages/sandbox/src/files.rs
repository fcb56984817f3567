// ABOUTME: Authoritative project file store interface and its in-memory and directory implementations
// ABOUTME: The synchronizer reads FileRecords from here and hashes them against the sandbox

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum FileStoreError {
    #[error("Invalid file path: {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, FileStoreError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    /// Path relative to the project root, `/`-separated
    pub path: String,
    pub content: Vec<u8>,
    pub content_hash: String,
}

impl FileRecord {
    pub fn new(path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        let content = content.into();
        Self {
            path: path.into(),
            content_hash: content_hash(&content),
            content,
        }
    }
}

/// Lowercase hex SHA-256 of `content`
pub fn content_hash(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// True for non-empty relative paths without `..`, root or prefix components
pub fn is_safe_relative_path(path: &str) -> bool {
    !path.is_empty()
        && !path.starts_with('/')
        && Path::new(path)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[async_trait]
pub trait FileStore: Send + Sync {
    async fn list_files(&self, project_id: &str) -> Result<Vec<FileRecord>>;

    async fn get_file(&self, project_id: &str, path: &str) -> Result<Option<FileRecord>>;

    async fn save_file(&self, project_id: &str, path: &str, content: &[u8]) -> Result<FileRecord>;

    /// Returns whether a file was removed
    async fn delete_file(&self, project_id: &str, path: &str) -> Result<bool>;
}

#[derive(Default)]
pub struct MemoryFileStore {
    projects: RwLock<HashMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn list_files(&self, project_id: &str) -> Result<Vec<FileRecord>> {
        let projects = self.projects.read().await;
        Ok(projects
            .get(project_id)
            .map(|files| {
                files
                    .iter()
                    .map(|(path, content)| FileRecord::new(path.clone(), content.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_file(&self, project_id: &str, path: &str) -> Result<Option<FileRecord>> {
        let projects = self.projects.read().await;
        Ok(projects
            .get(project_id)
            .and_then(|files| files.get(path))
            .map(|content| FileRecord::new(path, content.clone())))
    }

    async fn save_file(&self, project_id: &str, path: &str, content: &[u8]) -> Result<FileRecord> {
        if !is_safe_relative_path(path) {
            return Err(FileStoreError::InvalidPath(path.to_string()));
        }
        let mut projects = self.projects.write().await;
        projects
            .entry(project_id.to_string())
            .or_default()
            .insert(path.to_string(), content.to_vec());
        Ok(FileRecord::new(path, content))
    }

    async fn delete_file(&self, project_id: &str, path: &str) -> Result<bool> {
        let mut projects = self.projects.write().await;
        Ok(projects
            .get_mut(project_id)
            .map(|files| files.remove(path).is_some())
            .unwrap_or(false))
    }
}

/// Files live on disk under `<root>/<project_id>/`
pub struct DirectoryFileStore {
    root: PathBuf,
}

const SKIPPED_DIRS: &[&str] = &["node_modules", ".git", ".skiff"];

impl DirectoryFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn project_dir(&self, project_id: &str) -> PathBuf {
        self.root.join(project_id)
    }

    fn resolve(&self, project_id: &str, path: &str) -> Result<PathBuf> {
        if !is_safe_relative_path(path) {
            return Err(FileStoreError::InvalidPath(path.to_string()));
        }
        Ok(self.project_dir(project_id).join(path))
    }
}

#[async_trait]
impl FileStore for DirectoryFileStore {
    async fn list_files(&self, project_id: &str) -> Result<Vec<FileRecord>> {
        let dir = self.project_dir(project_id);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        tokio::task::spawn_blocking(move || {
            let mut records = Vec::new();
            let walker = WalkDir::new(&dir)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|entry| {
                    let name = entry.file_name().to_string_lossy();
                    entry.depth() == 0
                        || !(entry.file_type().is_dir() && SKIPPED_DIRS.iter().any(|d| *d == name))
                });

            for entry in walker {
                let entry = entry.map_err(|e| FileStoreError::Storage(e.to_string()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = entry
                    .path()
                    .strip_prefix(&dir)
                    .map_err(|e| FileStoreError::Storage(e.to_string()))?;
                let path = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                let content = std::fs::read(entry.path())?;
                records.push(FileRecord::new(path, content));
            }
            debug!("Listed {} file(s) under {}", records.len(), dir.display());
            Ok(records)
        })
        .await
        .map_err(|e| FileStoreError::Storage(e.to_string()))?
    }

    async fn get_file(&self, project_id: &str, path: &str) -> Result<Option<FileRecord>> {
        let full = self.resolve(project_id, path)?;
        match tokio::fs::read(&full).await {
            Ok(content) => Ok(Some(FileRecord::new(path, content))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_file(&self, project_id: &str, path: &str, content: &[u8]) -> Result<FileRecord> {
        let full = self.resolve(project_id, path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, content).await?;
        Ok(FileRecord::new(path, content))
    }

    async fn delete_file(&self, project_id: &str, path: &str) -> Result<bool> {
        let full = self.resolve(project_id, path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
