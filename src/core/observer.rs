//! 状态轮询：按固定间隔读取 RunState，直到任务写入 outcome 或超出等待预算

use std::time::Duration;

use crate::config::ObserverSection;
use crate::core::StoreError;
use crate::state::{RunState, RunStateStore};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// 轮询结果；超时不是错误，带回最后一次读到的状态
#[derive(Debug, Clone)]
pub enum Observation {
    Finished(RunState),
    TimedOut(RunState),
}

impl Observation {
    pub fn state(&self) -> &RunState {
        match self {
            Observation::Finished(s) | Observation::TimedOut(s) => s,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Observation::Finished(_))
    }
}

/// 轮询参数
#[derive(Debug, Clone, Copy)]
pub struct ObserveOptions {
    pub poll_interval: Duration,
    pub max_wait: Duration,
}

impl From<&ObserverSection> for ObserveOptions {
    fn from(section: &ObserverSection) -> Self {
        Self {
            poll_interval: Duration::from_millis(section.poll_interval_ms),
            max_wait: Duration::from_secs(section.max_wait_secs),
        }
    }
}

/// trace 不存在时立即返回 NotFound
pub async fn observe_until_finished(
    store: &RunStateStore,
    trace_id: &str,
    options: ObserveOptions,
) -> Result<Observation, StoreError> {
    let interval = options
        .poll_interval
        .clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL);
    let deadline = tokio::time::Instant::now() + options.max_wait;

    loop {
        let state = store.load(trace_id).await?;
        if state.is_finished() {
            return Ok(Observation::Finished(state));
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            tracing::warn!(trace_id, waited = ?options.max_wait, "Observer gave up waiting");
            return Ok(Observation::TimedOut(state));
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RunOutcome;

    fn opts(poll_ms: u64, wait_ms: u64) -> ObserveOptions {
        ObserveOptions {
            poll_interval: Duration::from_millis(poll_ms),
            max_wait: Duration::from_millis(wait_ms),
        }
    }

    #[tokio::test]
    async fn test_times_out_on_unfinished_task() {
        let store = RunStateStore::in_memory();
        let state = store.create("s", "x", None).await.unwrap();
        let obs = observe_until_finished(&store, &state.trace_id, opts(10, 50))
            .await
            .unwrap();
        assert!(!obs.is_finished());
    }

    #[tokio::test]
    async fn test_sees_outcome_written_later() {
        let store = RunStateStore::in_memory();
        let state = store.create("s", "x", None).await.unwrap();
        let writer = store.clone();
        let id = state.trace_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            writer
                .set_outcome(
                    &id,
                    RunOutcome {
                        done: true,
                        final_text: "ok".into(),
                        plan_rationale: String::new(),
                        finished_at: chrono::Utc::now(),
                    },
                )
                .await
                .unwrap();
        });

        let obs = observe_until_finished(&store, &state.trace_id, opts(10, 2_000))
            .await
            .unwrap();
        assert!(obs.is_finished());
        assert_eq!(obs.state().outcome.as_ref().map(|o| o.done), Some(true));
    }

    #[tokio::test]
    async fn test_unknown_trace_is_not_found() {
        let store = RunStateStore::in_memory();
        let err = observe_until_finished(&store, "missing", opts(10, 50))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
