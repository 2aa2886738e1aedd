//! Quill 命令行入口
//!
//! - `quill run <input...> [--session <id>]`：执行一次任务，结束后打印结果
//! - `quill status <trace_id>`：打印完整 RunState
//! - `quill list [session_id]`：打印运行摘要（新到旧）
//!
//! 运行中按 Ctrl+C 会中断所有任务，当前步骤结束后以 interrupted 收尾。

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use quill::config::{load_config, AppConfig};
use quill::Orchestrator;

#[derive(Debug, Parser)]
#[command(name = "quill", about = "文书任务编排引擎")]
struct Cli {
    /// 配置文件（默认 config/default.toml）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 执行一次任务
    Run {
        #[arg(long)]
        session: Option<String>,
        #[arg(value_name = "INPUT", required = true)]
        input: Vec<String>,
    },
    /// 查看某次运行的完整状态
    Status { trace_id: String },
    /// 列出运行摘要
    List { session_id: Option<String> },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    quill::observability::init();
    let cli = Cli::parse();

    let cfg = load_config(cli.config.clone()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    let orchestrator =
        std::sync::Arc::new(Orchestrator::from_config(&cfg).context("Failed to build orchestrator")?);

    match cli.command {
        Command::Run { session, input } => {
            let input = input.join(" ");
            let (trace_id, handle) = orchestrator
                .submit(&input, session.as_deref(), Vec::new())
                .await
                .context("Failed to submit task")?;
            tracing::info!(trace_id = %trace_id, "Task submitted");

            let interrupter = std::sync::Arc::clone(&orchestrator);
            let ctrl_c = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    let n = interrupter.interrupt_all().await;
                    tracing::warn!(tasks = n, "Ctrl+C received, interrupting");
                }
            });

            let result = handle.await.context("Task panicked")??;
            ctrl_c.abort();
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Status { trace_id } => {
            let state = orchestrator
                .get_state(&trace_id)
                .await
                .with_context(|| format!("No run state for {}", trace_id))?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Command::List { session_id } => {
            let summaries = orchestrator.list_states(session_id.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&summaries)?);
        }
    }

    Ok(())
}
