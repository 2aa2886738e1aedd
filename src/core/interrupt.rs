//! 任务中断登记表
//!
//! 每个 trace 持有独立的 token：单任务中断只取消自己，interrupt_all（Ctrl+C）逐个取消当前登记的任务，
//! 之后新登记的任务不受影响。
//! 中断是协作式的，编排循环只在阶段边界检查 token，不会打断进行中的外部调用。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::memory::truncate_chars;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Interrupted,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub trace_id: String,
    pub started_at: DateTime<Utc>,
    pub status: TaskStatus,
    /// 最近一次上报的步骤描述
    pub current_step: Option<String>,
    pub user_input: String,
}

/// 活跃任务概览
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub running: usize,
    pub interrupted: usize,
    pub tasks: Vec<TaskView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub trace_id: String,
    pub status: TaskStatus,
    pub current_step: Option<String>,
    pub elapsed_secs: i64,
}

struct Entry {
    info: TaskInfo,
    token: CancellationToken,
}

#[derive(Clone)]
pub struct InterruptRegistry {
    tasks: Arc<RwLock<HashMap<String, Entry>>>,
}

impl InterruptRegistry {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 登记任务并返回其取消 token；重复登记会替换旧记录
    pub async fn register(&self, trace_id: &str, user_input: &str) -> CancellationToken {
        let token = CancellationToken::new();
        let entry = Entry {
            info: TaskInfo {
                trace_id: trace_id.to_string(),
                started_at: Utc::now(),
                status: TaskStatus::Running,
                current_step: None,
                user_input: truncate_chars(user_input, 100),
            },
            token: token.clone(),
        };
        self.tasks.write().await.insert(trace_id.to_string(), entry);
        tracing::debug!(trace_id, "Task registered");
        token
    }

    /// 请求中断；任务未登记时返回 false
    pub async fn interrupt(&self, trace_id: &str) -> bool {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(trace_id) {
            Some(entry) => {
                entry.token.cancel();
                entry.info.status = TaskStatus::Interrupted;
                tracing::info!(trace_id, "Task interrupt requested");
                true
            }
            None => false,
        }
    }

    pub async fn is_interrupted(&self, trace_id: &str) -> bool {
        self.tasks
            .read()
            .await
            .get(trace_id)
            .map(|e| e.token.is_cancelled())
            .unwrap_or(false)
    }

    pub async fn status(&self, trace_id: &str) -> Option<TaskInfo> {
        self.tasks.read().await.get(trace_id).map(|e| {
            let mut info = e.info.clone();
            // 调用方持有的 token 可能被直接取消，这里补齐状态
            if e.token.is_cancelled() && info.status == TaskStatus::Running {
                info.status = TaskStatus::Interrupted;
            }
            info
        })
    }

    pub async fn update_step(&self, trace_id: &str, step: &str) {
        if let Some(entry) = self.tasks.write().await.get_mut(trace_id) {
            entry.info.current_step = Some(step.to_string());
        }
    }

    /// 移除任务记录；仍在 running 的记为 completed 后返回
    pub async fn cleanup(&self, trace_id: &str) -> Option<TaskInfo> {
        let entry = self.tasks.write().await.remove(trace_id)?;
        let mut info = entry.info;
        if entry.token.is_cancelled() {
            info.status = TaskStatus::Interrupted;
        } else if info.status == TaskStatus::Running {
            info.status = TaskStatus::Completed;
        }
        Some(info)
    }

    /// 中断当前登记的全部活跃任务，返回受影响的任务数
    pub async fn interrupt_all(&self) -> usize {
        let mut tasks = self.tasks.write().await;
        let mut count = 0;
        for entry in tasks.values_mut() {
            if entry.info.status == TaskStatus::Running {
                entry.info.status = TaskStatus::Interrupted;
                count += 1;
            }
            entry.token.cancel();
        }
        tracing::warn!(count, "All tasks interrupted");
        count
    }

    pub async fn snapshot(&self) -> RegistrySnapshot {
        let now = Utc::now();
        let tasks = self.tasks.read().await;
        let mut views: Vec<TaskView> = tasks
            .values()
            .map(|e| TaskView {
                trace_id: e.info.trace_id.clone(),
                status: if e.token.is_cancelled() {
                    TaskStatus::Interrupted
                } else {
                    e.info.status
                },
                current_step: e.info.current_step.clone(),
                elapsed_secs: (now - e.info.started_at).num_seconds(),
            })
            .collect();
        views.sort_by(|a, b| b.elapsed_secs.cmp(&a.elapsed_secs));
        RegistrySnapshot {
            running: views.iter().filter(|v| v.status == TaskStatus::Running).count(),
            interrupted: views
                .iter()
                .filter(|v| v.status == TaskStatus::Interrupted)
                .count(),
            tasks: views,
        }
    }
}

impl Default for InterruptRegistry {
    fn default() -> Self {
        Self::new()
    }
}
