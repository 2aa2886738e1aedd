//! 编排器：Planner → Executor/Validator 逐步执行 → Reviewer 复评（可有限次重规划）
//!
//! 每个阶段切换都会写入事件与 ToDo 标记（plan / step-N / step-N-validate），
//! 观察者无需等待任务结束即可还原进度。中断只在阶段边界检查。

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::actions::{ActionDispatcher, LlmActionDispatcher};
use crate::config::AppConfig;
use crate::core::interrupt::{InterruptRegistry, RegistrySnapshot, TaskInfo};
use crate::core::{OrchestratorError, StoreError};
use crate::llm::{create_llm_from_config, LlmClient, RetryConfig, RetryingLlmClient};
use crate::memory::Message;
use crate::plan::{ActionPolicy, Step, StepStatus};
use crate::roles::{Executor, OutputRules, Planner, Reviewer, TaskContext, Validator};
use crate::state::{
    EventStatus, RunOutcome, RunState, RunStateStore, RunSummary, Validation, VerdictStatus,
};

/// 一次任务的返回结果
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub trace_id: String,
    pub session_id: String,
    pub done: bool,
    pub final_text: String,
    pub plan_rationale: String,
    pub checklist: Vec<Step>,
    pub interrupted: bool,
}

/// 一轮清单执行的结果
struct ChecklistRun {
    steps: Vec<Step>,
    final_text: String,
    interrupted: bool,
}

pub struct Orchestrator {
    planner: Planner,
    executor: Executor,
    validator: Validator,
    reviewer: Reviewer,
    policy: Arc<ActionPolicy>,
    store: RunStateStore,
    registry: InterruptRegistry,
    step_max_attempts: u32,
    overall_replan_max: u32,
}

impl Orchestrator {
    /// 角色共用一个文本生成后端；执行走 dispatcher
    pub fn new(
        llm: Arc<dyn LlmClient>,
        dispatcher: Arc<dyn ActionDispatcher>,
        store: RunStateStore,
        cfg: &AppConfig,
    ) -> Self {
        let policy = Arc::new(ActionPolicy::from_config(&cfg.policy));
        let section = &cfg.orchestrator;
        Self {
            planner: Planner::from_config(Arc::clone(&llm), Arc::clone(&policy), section),
            executor: Executor::new(dispatcher, Arc::clone(&policy)),
            validator: Validator::new(
                Arc::clone(&llm),
                Arc::clone(&policy),
                OutputRules::from(&cfg.validator),
                section.pass_threshold,
            ),
            reviewer: Reviewer::new(llm, Arc::clone(&policy)),
            policy,
            store,
            registry: InterruptRegistry::new(),
            step_max_attempts: section.step_max_attempts.max(1),
            overall_replan_max: section.overall_replan_max,
        }
    }

    /// 按配置组装：LLM 外包一层重试，dispatcher 复用同一个带重试的后端
    pub fn from_config(cfg: &AppConfig) -> Result<Self, OrchestratorError> {
        let llm: Arc<dyn LlmClient> = Arc::new(RetryingLlmClient::new(
            create_llm_from_config(cfg),
            RetryConfig::from(&cfg.retry),
        ));
        let dispatcher = Arc::new(LlmActionDispatcher::new(Arc::clone(&llm)));
        let store = RunStateStore::from_config(cfg)?;
        Ok(Self::new(llm, dispatcher, store, cfg))
    }

    pub fn store(&self) -> &RunStateStore {
        &self.store
    }

    pub fn registry(&self) -> &InterruptRegistry {
        &self.registry
    }

    /// 同步跑完整个流程
    pub async fn run(
        &self,
        user_input: &str,
        session_id: Option<&str>,
        history: Vec<Message>,
    ) -> Result<RunResult, OrchestratorError> {
        let (mut ctx, token) = self.prepare(user_input, session_id, history).await?;
        self.drive(&mut ctx, &token).await
    }

    /// 先创建 RunState 并登记，立即返回 trace_id，流程在后台任务中运行
    pub async fn submit(
        self: &Arc<Self>,
        user_input: &str,
        session_id: Option<&str>,
        history: Vec<Message>,
    ) -> Result<(String, JoinHandle<Result<RunResult, OrchestratorError>>), OrchestratorError> {
        let (mut ctx, token) = self.prepare(user_input, session_id, history).await?;
        let trace_id = ctx.trace_id.clone();
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.drive(&mut ctx, &token).await });
        Ok((trace_id, handle))
    }

    pub async fn get_state(&self, trace_id: &str) -> Result<RunState, StoreError> {
        self.store.load(trace_id).await
    }

    pub async fn list_states(&self, session_id: Option<&str>) -> Result<Vec<RunSummary>, StoreError> {
        self.store.list(session_id).await
    }

    pub async fn interrupt(&self, trace_id: &str) -> bool {
        self.registry.interrupt(trace_id).await
    }

    pub async fn is_interrupted(&self, trace_id: &str) -> bool {
        self.registry.is_interrupted(trace_id).await
    }

    pub async fn status(&self, trace_id: &str) -> Option<TaskInfo> {
        self.registry.status(trace_id).await
    }

    pub async fn interrupt_all(&self) -> usize {
        self.registry.interrupt_all().await
    }

    pub async fn snapshot(&self) -> RegistrySnapshot {
        self.registry.snapshot().await
    }

    async fn prepare(
        &self,
        user_input: &str,
        session_id: Option<&str>,
        history: Vec<Message>,
    ) -> Result<(TaskContext, CancellationToken), OrchestratorError> {
        // 未指定会话时每次任务自成一个会话
        let session_id = session_id
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let session_id = session_id.as_str();
        let action = self.policy.guess_action(user_input);
        let state = self
            .store
            .create(session_id, user_input, Some(action.clone()))
            .await?;
        let token = self.registry.register(&state.trace_id, user_input).await;
        tracing::info!(trace_id = %state.trace_id, session_id, action = %action, "Task created");

        let ctx = TaskContext::new(state.trace_id, session_id, action, user_input, history);
        Ok((ctx, token))
    }

    /// 跑流程并在结束时注销中断登记（无论成败）
    async fn drive(
        &self,
        ctx: &mut TaskContext,
        token: &CancellationToken,
    ) -> Result<RunResult, OrchestratorError> {
        let result = self.run_flow(ctx, token).await;
        if let Err(e) = &result {
            tracing::error!(trace_id = %ctx.trace_id, error = %e, "Task aborted");
        }
        self.registry.cleanup(&ctx.trace_id).await;
        result.map_err(OrchestratorError::from)
    }

    async fn run_flow(
        &self,
        ctx: &mut TaskContext,
        token: &CancellationToken,
    ) -> Result<RunResult, StoreError> {
        let trace_id = ctx.trace_id.clone();
        self.store
            .append_event(&trace_id, "log", EventStatus::Info, json!({ "msg": "Initial Prompt received" }))
            .await?;

        // 1) 规划
        self.registry.update_step(&trace_id, "plan").await;
        self.store.set_step_status(&trace_id, "plan", StepStatus::InProgress).await?;
        self.store
            .append_event(&trace_id, "planner", EventStatus::Started, json!({ "action": ctx.action }))
            .await?;

        let plan = self.planner.plan(ctx).await;
        if !plan.feasible {
            tracing::warn!(trace_id = %trace_id, rationale = %plan.rationale, "Planning failed");
            self.store.set_step_status(&trace_id, "plan", StepStatus::Failed).await?;
            self.store
                .append_event(&trace_id, "planner", EventStatus::Failed, json!({ "reason": plan.rationale }))
                .await?;
            return self
                .finish(ctx, false, String::new(), plan.rationale, Vec::new(), false)
                .await;
        }

        let steps: Vec<Step> = plan
            .steps
            .into_iter()
            .map(|s| s.with_max_attempts(self.step_max_attempts))
            .collect();
        self.store.set_step_status(&trace_id, "plan", StepStatus::Completed).await?;
        self.store
            .append_event(
                &trace_id,
                "planner",
                EventStatus::Ok,
                json!({
                    "steps": steps.iter().map(|s| s.title.as_str()).collect::<Vec<_>>(),
                    "rationale": plan.rationale,
                }),
            )
            .await?;
        self.store.set_checklist(&trace_id, &steps).await?;
        tracing::info!(trace_id = %trace_id, steps = steps.len(), "Plan ready");

        if token.is_cancelled() {
            return self.interrupted(ctx, steps, String::new(), plan.rationale).await;
        }

        // 2) 逐步执行
        let mut run = self.execute_all(ctx, steps, token).await?;

        // 3) 复评，必要时重规划
        let mut replan_times = 0;
        loop {
            if run.interrupted {
                return self
                    .interrupted(ctx, run.steps, run.final_text, plan.rationale)
                    .await;
            }

            self.registry.update_step(&trace_id, "review").await;
            let review = self.reviewer.review(ctx, &run.steps).await;
            let status = if review.overall_ok { EventStatus::Ok } else { EventStatus::Warn };
            self.store
                .append_event(&trace_id, "planner_review", status, json!({ "rationale": review.rationale }))
                .await?;

            if review.overall_ok
                || replan_times >= self.overall_replan_max
                || review.revised_steps.is_empty()
            {
                let done = review.overall_ok && run.steps.iter().all(Step::is_satisfied);
                let rationale = if review.overall_ok {
                    plan.rationale
                } else {
                    format!("overall_review: {}", review.rationale)
                };
                return self
                    .finish(ctx, done, run.final_text, rationale, run.steps, false)
                    .await;
            }

            replan_times += 1;
            tracing::info!(trace_id = %trace_id, replan_times, "Replanning after overall review");
            self.store
                .append_event(
                    &trace_id,
                    "planner",
                    EventStatus::Replan,
                    json!({
                        "times": replan_times,
                        "new_steps": review.revised_steps.iter().map(|s| s.title.as_str()).collect::<Vec<_>>(),
                    }),
                )
                .await?;

            ctx.last_failed_feedback.clear();
            let steps: Vec<Step> = review
                .revised_steps
                .into_iter()
                .map(|s| s.with_max_attempts(self.step_max_attempts))
                .collect();
            self.store.set_checklist(&trace_id, &steps).await?;
            run = self.execute_all(ctx, steps, token).await?;
        }
    }

    /// 严格按顺序执行清单；单步失败不中止后续步骤
    async fn execute_all(
        &self,
        ctx: &mut TaskContext,
        mut steps: Vec<Step>,
        token: &CancellationToken,
    ) -> Result<ChecklistRun, StoreError> {
        let trace_id = ctx.trace_id.clone();
        let mut final_text = String::new();

        for idx in 0..steps.len() {
            if token.is_cancelled() {
                tracing::info!(trace_id = %trace_id, next_step = idx + 1, "Interrupted at step boundary");
                return Ok(ChecklistRun {
                    steps,
                    final_text,
                    interrupted: true,
                });
            }

            let key = format!("step-{}", idx + 1);
            let validate_key = format!("{}-validate", key);
            self.registry
                .update_step(&trace_id, &format!("{}: {}", key, steps[idx].title))
                .await;
            // 修正点只在同一步的重试之间传递
            ctx.last_failed_feedback.clear();

            loop {
                if !steps[idx].begin_attempt() {
                    steps[idx].finish(StepStatus::Failed);
                    self.store.set_step_status(&trace_id, &key, StepStatus::Failed).await?;
                    break;
                }
                let attempt = steps[idx].attempts;
                self.store.set_step_status(&trace_id, &key, StepStatus::InProgress).await?;
                self.store
                    .append_event(
                        &trace_id,
                        "executor",
                        EventStatus::Started,
                        json!({ "step": steps[idx].title, "attempt": attempt }),
                    )
                    .await?;

                match self.executor.execute(ctx, &steps[idx]).await {
                    Ok(out) => {
                        self.store
                            .append_event(
                                &trace_id,
                                "executor",
                                EventStatus::Ok,
                                json!({
                                    "outputs_keys": out.keys().collect::<Vec<_>>(),
                                    "tool": out.get("used_tool"),
                                }),
                            )
                            .await?;
                        steps[idx].outputs.extend(out);
                    }
                    Err(e) => {
                        tracing::warn!(trace_id = %trace_id, step = %steps[idx].title, attempt, error = %e, "Step execution failed");
                        self.store
                            .append_event(&trace_id, "executor", EventStatus::Error, json!({ "error": e.to_string() }))
                            .await?;
                        if steps[idx].has_attempts_left() {
                            steps[idx].requeue();
                            self.store.set_step_status(&trace_id, &key, StepStatus::Pending).await?;
                            continue;
                        }
                        steps[idx].finish(StepStatus::Failed);
                        self.store.set_step_status(&trace_id, &key, StepStatus::Failed).await?;
                        break;
                    }
                }

                if steps[idx].need_validation {
                    self.store
                        .set_step_status(&trace_id, &validate_key, StepStatus::InProgress)
                        .await?;
                    let verdict = self.validator.validate(ctx, &steps[idx], &steps).await;
                    let status = if verdict.passed { EventStatus::Ok } else { EventStatus::Warn };
                    self.store
                        .append_event(
                            &trace_id,
                            "validator",
                            status,
                            json!({ "step": steps[idx].title, "feedback": verdict.feedback }),
                        )
                        .await?;
                    let issues = if verdict.feedback.is_empty() {
                        Vec::new()
                    } else {
                        vec![verdict.feedback.clone()]
                    };
                    let verdict_status = if verdict.passed {
                        VerdictStatus::Passed
                    } else {
                        VerdictStatus::Rejected
                    };
                    self.store
                        .set_validation(&trace_id, Validation::new(verdict.passed, verdict_status, issues))
                        .await?;

                    if !verdict.passed {
                        if steps[idx].has_attempts_left() {
                            steps[idx].requeue();
                            self.store
                                .set_step_status(&trace_id, &validate_key, StepStatus::Pending)
                                .await?;
                            ctx.last_failed_feedback = verdict.feedback;
                            continue;
                        }
                        steps[idx].finish(StepStatus::Failed);
                        self.store
                            .set_step_status(&trace_id, &validate_key, StepStatus::Failed)
                            .await?;
                        self.store.set_step_status(&trace_id, &key, StepStatus::Failed).await?;
                        break;
                    }
                    self.store
                        .set_step_status(&trace_id, &validate_key, StepStatus::Completed)
                        .await?;
                }

                steps[idx].finish(StepStatus::Completed);
                self.store.set_step_status(&trace_id, &key, StepStatus::Completed).await?;
                if let Some(text) = steps[idx].primary_text() {
                    final_text = text.to_string();
                }
                break;
            }

            tracing::debug!(
                trace_id = %trace_id,
                step = %steps[idx].title,
                status = %steps[idx].status,
                attempts = steps[idx].attempts,
                "Step finished"
            );
            // 该步骤周期结束后才提交清单快照
            self.store.set_checklist(&trace_id, &steps).await?;

            if token.is_cancelled() {
                tracing::info!(trace_id = %trace_id, step = idx + 1, "Interrupted after step cycle");
                return Ok(ChecklistRun {
                    steps,
                    final_text,
                    interrupted: true,
                });
            }
        }

        Ok(ChecklistRun {
            steps,
            final_text,
            interrupted: false,
        })
    }

    async fn interrupted(
        &self,
        ctx: &TaskContext,
        steps: Vec<Step>,
        final_text: String,
        plan_rationale: String,
    ) -> Result<RunResult, StoreError> {
        tracing::warn!(trace_id = %ctx.trace_id, "Task interrupted");
        self.store
            .append_event(&ctx.trace_id, "interrupt", EventStatus::Interrupted, json!({ "msg": "任务已被中断" }))
            .await?;
        self.store
            .set_validation(&ctx.trace_id, Validation::interrupted())
            .await?;
        self.finish(ctx, false, final_text, plan_rationale, steps, true)
            .await
    }

    async fn finish(
        &self,
        ctx: &TaskContext,
        done: bool,
        final_text: String,
        plan_rationale: String,
        checklist: Vec<Step>,
        interrupted: bool,
    ) -> Result<RunResult, StoreError> {
        let trace_id = &ctx.trace_id;
        self.store.set_checklist(trace_id, &checklist).await?;
        if !interrupted {
            let status = if done { VerdictStatus::Completed } else { VerdictStatus::Failed };
            let issues = if done { Vec::new() } else { vec![plan_rationale.clone()] };
            self.store
                .set_validation(trace_id, Validation::new(done, status, issues))
                .await?;
        }
        self.store
            .set_outcome(
                trace_id,
                RunOutcome {
                    done,
                    final_text: final_text.clone(),
                    plan_rationale: plan_rationale.clone(),
                    finished_at: chrono::Utc::now(),
                },
            )
            .await?;
        let status = if done { EventStatus::Ok } else { EventStatus::Failed };
        self.store
            .append_event(trace_id, "run", status, json!({ "done": done, "interrupted": interrupted }))
            .await?;
        tracing::info!(trace_id = %trace_id, done, interrupted, "Task finished");

        Ok(RunResult {
            trace_id: trace_id.clone(),
            session_id: ctx.session_id.clone(),
            done,
            final_text,
            plan_rationale,
            checklist,
            interrupted,
        })
    }
}
