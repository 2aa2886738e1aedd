//! RunStateStore：内存缓存 + 可选持久层
//!
//! 读以缓存为准，缓存未命中时回落到持久层并回填。
//! 所有修改在写锁内对最新状态就地合并（事件只追加），随后把快照写入持久层；
//! 持久层按 version 拒绝旧写入，较慢的落盘不会抹掉较新的内存更新。

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;

use crate::config::{AppConfig, StoreBackendKind};
use crate::core::StoreError;
use crate::plan::{Step, StepStatus};
use crate::state::{
    EventStatus, FileBackend, RunOutcome, RunState, RunSummary, SqliteBackend, StateBackend,
    Validation,
};

#[derive(Clone)]
pub struct RunStateStore {
    cache: Arc<RwLock<HashMap<String, RunState>>>,
    backend: Option<Arc<dyn StateBackend>>,
}

impl RunStateStore {
    pub fn new(backend: Option<Arc<dyn StateBackend>>) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            backend,
        }
    }

    /// 仅内存，不落盘
    pub fn in_memory() -> Self {
        Self::new(None)
    }

    /// 按 [store] 段选择持久层；path 缺省时放在 app.data_dir 下
    pub fn from_config(cfg: &AppConfig) -> Result<Self, StoreError> {
        let backend: Option<Arc<dyn StateBackend>> = match cfg.store.backend {
            StoreBackendKind::Sqlite => {
                let path = cfg
                    .store
                    .path
                    .clone()
                    .unwrap_or_else(|| cfg.app.data_dir.join("runs.db"));
                Some(Arc::new(SqliteBackend::open(path)?))
            }
            StoreBackendKind::File => {
                let dir = cfg
                    .store
                    .path
                    .clone()
                    .unwrap_or_else(|| cfg.app.data_dir.clone());
                Some(Arc::new(FileBackend::new(dir)?))
            }
            StoreBackendKind::Memory => None,
        };
        tracing::info!(backend = ?cfg.store.backend, "Run state store ready");
        Ok(Self::new(backend))
    }

    pub async fn create(
        &self,
        session_id: &str,
        user_input: &str,
        action_guess: Option<String>,
    ) -> Result<RunState, StoreError> {
        let mut state = RunState::new(session_id, user_input, action_guess);
        state.version = 1;
        {
            let mut cache = self.cache.write().await;
            cache.insert(state.trace_id.clone(), state.clone());
        }
        self.persist(&state).await;
        Ok(state)
    }

    pub async fn append_event(
        &self,
        trace_id: &str,
        name: &str,
        status: EventStatus,
        details: Value,
    ) -> Result<(), StoreError> {
        self.mutate(trace_id, |s| s.push_event(name, status, details))
            .await
    }

    pub async fn set_step_status(
        &self,
        trace_id: &str,
        step_key: &str,
        status: StepStatus,
    ) -> Result<(), StoreError> {
        self.mutate(trace_id, |s| s.set_step_status(step_key, status))
            .await
    }

    /// 写入校验结论。已是 interrupted 的结论不会被覆盖。
    pub async fn set_validation(
        &self,
        trace_id: &str,
        validation: Validation,
    ) -> Result<(), StoreError> {
        self.mutate(trace_id, |s| {
            let locked = s
                .validation
                .as_ref()
                .map(|v| v.status == crate::state::VerdictStatus::Interrupted)
                .unwrap_or(false);
            if !locked {
                s.validation = Some(validation);
            }
        })
        .await
    }

    pub async fn set_checklist(&self, trace_id: &str, steps: &[Step]) -> Result<(), StoreError> {
        self.mutate(trace_id, |s| s.checklist = steps.to_vec()).await
    }

    pub async fn set_outcome(&self, trace_id: &str, outcome: RunOutcome) -> Result<(), StoreError> {
        self.mutate(trace_id, |s| s.outcome = Some(outcome)).await
    }

    pub async fn load(&self, trace_id: &str) -> Result<RunState, StoreError> {
        if let Some(state) = self.cache.read().await.get(trace_id) {
            return Ok(state.clone());
        }
        match self.load_cold(trace_id).await? {
            Some(state) => {
                let mut cache = self.cache.write().await;
                // 并发回填时保留版本更新的一份
                let entry = cache
                    .entry(trace_id.to_string())
                    .or_insert_with(|| state.clone());
                if state.version > entry.version {
                    *entry = state;
                }
                Ok(entry.clone())
            }
            None => Err(StoreError::NotFound(trace_id.to_string())),
        }
    }

    /// 摘要列表，按创建时间新到旧；session_id 为空时返回全部
    pub async fn list(&self, session_id: Option<&str>) -> Result<Vec<RunSummary>, StoreError> {
        let mut merged: HashMap<String, RunState> = HashMap::new();
        if let Some(backend) = &self.backend {
            for state in backend.list().await? {
                merged.insert(state.trace_id.clone(), state);
            }
        }
        for (id, state) in self.cache.read().await.iter() {
            let newer = merged
                .get(id)
                .map(|s| state.version >= s.version)
                .unwrap_or(true);
            if newer {
                merged.insert(id.clone(), state.clone());
            }
        }

        let mut summaries: Vec<RunSummary> = merged
            .into_values()
            .filter(|s| session_id.map(|sid| s.session_id == sid).unwrap_or(true))
            .map(|s| s.summary())
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    async fn load_cold(&self, trace_id: &str) -> Result<Option<RunState>, StoreError> {
        match &self.backend {
            Some(backend) => backend.load(trace_id).await,
            None => Ok(None),
        }
    }

    /// 在最新状态上应用修改并递增 version，然后落盘
    async fn mutate<F>(&self, trace_id: &str, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut RunState),
    {
        let cached = self.cache.read().await.contains_key(trace_id);
        let cold = if cached {
            None
        } else {
            self.load_cold(trace_id).await?
        };

        let snapshot = {
            let mut cache = self.cache.write().await;
            if let Some(state) = cold {
                let entry = cache
                    .entry(trace_id.to_string())
                    .or_insert_with(|| state.clone());
                if state.version > entry.version {
                    *entry = state;
                }
            }
            let state = cache
                .get_mut(trace_id)
                .ok_or_else(|| StoreError::NotFound(trace_id.to_string()))?;
            f(state);
            state.version += 1;
            state.clone()
        };

        self.persist(&snapshot).await;
        Ok(())
    }

    async fn persist(&self, state: &RunState) {
        if let Some(backend) = &self.backend {
            if let Err(e) = backend.save(state).await {
                tracing::warn!(trace_id = %state.trace_id, error = %e, "Failed to persist run state");
            }
        }
    }
}
