//! 文件持久层：每个 trace 一个 `<trace_id>.json`
//!
//! 写入先落临时文件再 rename，读者不会看到半截 JSON。

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::core::StoreError;
use crate::state::backend::validate_key;
use crate::state::{RunState, StateBackend};

#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, trace_id: &str) -> Result<PathBuf, StoreError> {
        validate_key(trace_id)?;
        Ok(self.dir.join(format!("{}.json", trace_id)))
    }

    async fn read_state(path: &Path) -> Result<Option<RunState>, StoreError> {
        match tokio::fs::read_to_string(path).await {
            Ok(body) => Ok(Some(serde_json::from_str(&body)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl StateBackend for FileBackend {
    async fn save(&self, state: &RunState) -> Result<(), StoreError> {
        let path = self.path_for(&state.trace_id)?;

        // 磁盘上的版本不旧于本次写入时跳过；读不出来的旧文件直接覆盖
        if let Ok(Some(existing)) = Self::read_state(&path).await {
            if existing.version >= state.version {
                tracing::debug!(trace_id = %state.trace_id, "Skipped stale state write");
                return Ok(());
            }
        }

        let body = serde_json::to_vec_pretty(state)?;
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", state.trace_id, uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &body).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn load(&self, trace_id: &str) -> Result<Option<RunState>, StoreError> {
        let path = self.path_for(trace_id)?;
        Self::read_state(&path).await
    }

    async fn list(&self) -> Result<Vec<RunState>, StoreError> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_state = path.extension().map(|e| e == "json").unwrap_or(false)
                && !entry.file_name().to_string_lossy().starts_with('.');
            if !is_state {
                continue;
            }
            match Self::read_state(&path).await {
                Ok(Some(state)) => out.push(state),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable state file");
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_load_list() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path()).unwrap();

        let a = RunState::new("s1", "a", None);
        let b = RunState::new("s2", "b", None);
        backend.save(&a).await.unwrap();
        backend.save(&b).await.unwrap();

        assert_eq!(backend.load(&a.trace_id).await.unwrap().unwrap(), a);
        assert_eq!(backend.list().await.unwrap().len(), 2);
        assert!(backend.load("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_older_version_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path()).unwrap();

        let mut state = RunState::new("s1", "a", None);
        state.version = 5;
        state.input_preview = "new".into();
        backend.save(&state).await.unwrap();

        let mut stale = state.clone();
        stale.version = 3;
        stale.input_preview = "old".into();
        backend.save(&stale).await.unwrap();

        let loaded = backend.load(&state.trace_id).await.unwrap().unwrap();
        assert_eq!(loaded.input_preview, "new");
    }

    #[tokio::test]
    async fn test_rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path()).unwrap();
        let err = backend.load("../secret").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
    }
}
