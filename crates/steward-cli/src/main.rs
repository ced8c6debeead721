//! steward CLI - デモ handler でコーディネータを動かす、または設定を表示する
//!
//! 引数の `///` は `--help` にそのまま出るので英語のままにしています。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::time::{Duration, Instant, sleep};
use tracing::{info, warn};

use steward_core::app::{CoordinatorBuilder, Submission, TaskContext, TaskHandler};
use steward_core::domain::{PayloadKind, PayloadRef, TaskFailure, TaskOutput};
use steward_core::observability::{TaskCounts, init_logging};
use steward_core::ports::TaskFilter;
use steward_core::StewardConfig;

#[derive(Debug, Parser)]
#[command(name = "steward", version, about = "Task dispatch with resource reservations")]
struct Cli {
    /// TOML configuration file; defaults apply when omitted.
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Submit a handful of repository tasks and watch them run.
    Demo {
        /// Override `workers.count`.
        #[arg(long)]
        workers: Option<usize>,

        /// Simulated duration of each task, in milliseconds.
        #[arg(long, default_value_t = 300)]
        step_ms: u64,

        /// Give up waiting after this many seconds.
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
    /// Print the effective configuration as TOML.
    Config,
}

fn load_config(path: Option<&PathBuf>) -> Result<StewardConfig> {
    match path {
        Some(path) => StewardConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => Ok(StewardConfig::default()),
    }
}

/// DemoHandler は本物の sync / publish / bind の代役
struct DemoHandler {
    step: Duration,
}

#[async_trait]
impl TaskHandler for DemoHandler {
    async fn handle(
        &self,
        payload: PayloadRef,
        ctx: TaskContext,
    ) -> std::result::Result<TaskOutput, TaskFailure> {
        let progress = |e: steward_core::StewardError| TaskFailure::new("progress", e.to_string());
        ctx.report_progress(serde_json::json!({"state": "in_progress"}))
            .await
            .map_err(progress)?;

        tokio::select! {
            _ = ctx.cancellation().cancelled() => {
                return Err(TaskFailure::new("canceled", "stopped on revoke"));
            }
            _ = sleep(self.step) => {}
        }

        ctx.report_progress(serde_json::json!({"state": "complete"}))
            .await
            .map_err(progress)?;
        let result = serde_json::to_value(&payload)
            .map_err(|e| TaskFailure::new("serialization", e.to_string()))?;
        info!(task_id = %ctx.task_id(), worker_name = ctx.worker_name(), kind = %payload.kind(), "demo task done");
        Ok(TaskOutput::with_result(result))
    }
}

/// GroupPublishHandler はメンバーごとに publish を spawn してグループを publish する
struct GroupPublishHandler;

#[async_trait]
impl TaskHandler for GroupPublishHandler {
    async fn handle(
        &self,
        payload: PayloadRef,
        ctx: TaskContext,
    ) -> std::result::Result<TaskOutput, TaskFailure> {
        let PayloadRef::RepositoryGroupPublish {
            distributor_id,
            members,
            ..
        } = payload
        else {
            return Err(TaskFailure::new("unexpected_payload", "expected group publish"));
        };

        let mut output = TaskOutput::default();
        for repo_id in members {
            let child = PayloadRef::RepositoryPublish {
                repo_id: repo_id.clone(),
                distributor_id: distributor_id.clone(),
            };
            let tags = child.required_tags();
            let task_id = ctx
                .spawn(child, tags)
                .await
                .map_err(|e| TaskFailure::new("spawn_failed", e.to_string()))?;
            output.spawned_tasks.push(task_id);
        }
        Ok(output)
    }
}

#[derive(Serialize)]
struct DemoSummary {
    counts: TaskCounts,
    postponed: serde_json::Value,
    reservations_left: usize,
}

async fn run_demo(
    mut config: StewardConfig,
    workers: Option<usize>,
    step: Duration,
    timeout: Duration,
) -> Result<()> {
    if let Some(count) = workers {
        config.workers.count = count;
    }
    // デモのタスクはミリ秒で終わるので、ポーリングも短くする
    config.workers.poll_interval_ms = config.workers.poll_interval_ms.min(100);

    let demo: Arc<dyn TaskHandler> = Arc::new(DemoHandler { step });
    let mut builder = CoordinatorBuilder::new().config(config);
    for kind in PayloadKind::ALL {
        builder = match kind {
            PayloadKind::ReapHistory => builder,
            PayloadKind::RepositoryGroupPublish => builder.register(kind, Arc::new(GroupPublishHandler))?,
            _ => builder.register(kind, Arc::clone(&demo))?,
        };
    }
    let coordinator = builder
        .expect_kinds(&PayloadKind::ALL)
        .build()
        .context("building coordinator")?;
    let running = coordinator.start().await?;

    let dispatcher = coordinator.dispatcher();
    let (group_id, submitted) = dispatcher
        .submit_group(vec![
            Submission::with_required_tags(PayloadRef::RepositorySync {
                repo_id: "foo".into(),
                override_config: None,
            }),
            Submission::with_required_tags(PayloadRef::RepositorySync {
                repo_id: "foo".into(),
                override_config: None,
            }),
            Submission::with_required_tags(PayloadRef::RepositorySync {
                repo_id: "bar".into(),
                override_config: None,
            }),
            Submission::with_required_tags(PayloadRef::ConsumerBind {
                consumer_id: "c1".into(),
                repo_id: "foo".into(),
                distributor_id: "yum".into(),
            }),
            Submission::with_required_tags(PayloadRef::RepositoryGroupPublish {
                group_id: "all".into(),
                distributor_id: "export".into(),
                members: vec!["foo".into(), "bar".into()],
            }),
        ])
        .await?;
    info!(group_id = %group_id, tasks = submitted.len(), "demo tasks submitted");

    let status = coordinator.status();
    let deadline = Instant::now() + timeout;
    let counts = loop {
        let counts = status.counts().await?;
        if counts.incomplete() == 0 {
            break counts;
        }
        if Instant::now() >= deadline {
            warn!(incomplete = counts.incomplete(), "timed out waiting for demo tasks");
            break counts;
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted");
                break counts;
            }
            _ = sleep(Duration::from_millis(100)) => {}
        }
    };

    let by_group = status
        .list_tasks(&TaskFilter::new().with_group(group_id))
        .await?;
    for record in &by_group {
        info!(
            task_id = %record.task_id,
            state = %record.state,
            worker_name = record.worker_name.as_deref().unwrap_or("-"),
            tags = ?record.tags,
            "task"
        );
    }

    let summary = DemoSummary {
        counts,
        postponed: status.postponed(&submitted).to_json(),
        reservations_left: coordinator.reservations().snapshot().await?.reservations.len(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    running.shutdown().await;
    coordinator.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Demo {
            workers,
            step_ms,
            timeout_secs,
        } => {
            init_logging(&config.logging)?;
            run_demo(
                config,
                workers,
                Duration::from_millis(step_ms),
                Duration::from_secs(timeout_secs),
            )
            .await
        }
        Command::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}
