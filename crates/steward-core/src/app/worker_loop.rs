//! WorkerPool - タスク実行ループ
//!
//! 各 worker は heartbeat ループと実行ループの 2 つの tokio タスクです。
//!
//! # 実装
//! - 実行ループは自分の予約レーン、次に general レーンの順に pop する
//! - 一度に 1 タスクだけ実行し、結果を記録する
//! - kind ごとの `tasks.timeout_ms` を超えたタスクは cancel し、`TIMED_OUT` として記録
//! - シャットダウン信号（または送信側の drop）で両ループが止まる。実行中のタスクは最後まで走る
//!
//! # 学習ポイント
//! - `tokio::select!` による完了・取り消し・期限切れの待ち合わせ
//! - `tokio::pin!` した future の再ポーリング
//! - `CancellationToken` による協調的キャンセル

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::app::dispatcher::Dispatcher;
use crate::app::runtime::{HandlerRegistry, TaskContext};
use crate::config::{StewardConfig, TasksConfig};
use crate::domain::{TaskFailure, TaskId, TaskOutput, TaskRecord};
use crate::error::{Result, StewardError};
use crate::ports::{Clock, Delivery, DeliveryQueue, TaskStore, WorkerStore, task_update};
use crate::reservation::ReservationHandle;

/// WorkerDeps は全 worker が共有するサービス
#[derive(Clone)]
pub struct WorkerDeps {
    pub tasks: Arc<dyn TaskStore>,
    pub workers: Arc<dyn WorkerStore>,
    pub queue: Arc<dyn DeliveryQueue>,
    pub reservations: ReservationHandle,
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Arc<HandlerRegistry>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Copy)]
struct Timing {
    heartbeat_interval: Duration,
    poll_interval: Duration,
    cancel_grace: Duration,
}

/// WorkerPool は worker 群のハンドル
/// - `request_shutdown()`: 実行中のタスクを終えたら全 worker を止める
/// - `shutdown_and_join()`: 止まるまで待つ
pub struct WorkerPool {
    names: Vec<String>,
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// `config.workers.count` 個の worker を起動
    ///
    /// 全 worker が最初の heartbeat を送ってから返るので、
    /// 直後に投入したタスクもそれらの worker に予約できる。
    pub async fn spawn(config: &StewardConfig, deps: WorkerDeps) -> Result<Self> {
        let timing = Timing {
            heartbeat_interval: config.workers.heartbeat_interval(),
            poll_interval: config.workers.poll_interval(),
            cancel_grace: config.tasks.cancel_grace(),
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let names: Vec<String> = (0..config.workers.count)
            .map(|n| config.workers.worker_name(n))
            .collect();

        for name in &names {
            deps.workers.heartbeat(name, deps.clock.now()).await?;
        }

        let limits = Arc::new(config.tasks.clone());
        let mut joins = Vec::with_capacity(names.len() * 2);
        for name in &names {
            joins.push(tokio::spawn(heartbeat_loop(
                name.clone(),
                Arc::clone(&deps.workers),
                Arc::clone(&deps.clock),
                timing.heartbeat_interval,
                shutdown_rx.clone(),
            )));

            let worker = Worker {
                name: name.clone(),
                revocations: deps.dispatcher.subscribe_revocations(),
                deps: deps.clone(),
                timing,
                limits: Arc::clone(&limits),
            };
            joins.push(tokio::spawn(worker.run(shutdown_rx.clone())));
        }

        info!(workers = names.len(), "worker pool started");
        Ok(Self {
            names,
            shutdown_tx,
            joins,
        })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn request_shutdown(&self) {
        // 受信側はもういないかもしれない
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(err) = join.await {
                error!(error = %err, "worker task ended abnormally");
            }
        }
        info!("worker pool stopped");
    }
}

async fn heartbeat_loop(
    name: String,
    workers: Arc<dyn WorkerStore>,
    clock: Arc<dyn Clock>,
    every: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    // 最初の tick は即座に来る。その heartbeat は spawn 時に送信済み
    ticker.tick().await;

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if let Err(err) = workers.heartbeat(&name, clock.now()).await {
                    error!(worker_name = %name, error = %err, "heartbeat failed");
                }
            }
        }
    }
}

enum Execution {
    Done(std::result::Result<TaskOutput, TaskFailure>),
    Revoked,
    TimedOut,
}

struct Worker {
    name: String,
    deps: WorkerDeps,
    revocations: broadcast::Receiver<TaskId>,
    timing: Timing,
    limits: Arc<TasksConfig>,
}

impl Worker {
    async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        debug!(worker_name = %self.name, "worker started");
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let popped = tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                popped = self.deps.queue.pop(&self.name, self.timing.poll_interval) => popped,
            };

            match popped {
                Ok(Some(delivery)) => self.process(delivery).await,
                Ok(None) => {}
                Err(err) => {
                    error!(worker_name = %self.name, error = %err, "pop failed");
                    tokio::time::sleep(self.timing.poll_interval).await;
                }
            }
        }
        debug!(worker_name = %self.name, "worker stopped");
    }

    async fn process(&mut self, delivery: Delivery) {
        let task_id = delivery.task_id;
        let now = self.deps.clock.now();
        let name = self.name.clone();
        let started = self
            .deps
            .tasks
            .update(task_id, task_update(move |r| r.start(&name, now)))
            .await;

        match started {
            Ok(record) => self.execute(record).await,
            Err(StewardError::InvalidTransition { from, .. }) => {
                debug!(task_id = %task_id, state = %from, "skipping task that is no longer waiting");
            }
            Err(err) => {
                warn!(task_id = %task_id, error = %err, "could not start task");
            }
        }

        if delivery.lane.is_some()
            && let Err(err) = self.deps.reservations.release(task_id).await
        {
            error!(task_id = %task_id, error = %err, "releasing reservation failed");
        }
    }

    async fn execute(&mut self, record: TaskRecord) {
        let task_id = record.task_id;
        let kind = record.payload.kind();
        info!(task_id = %task_id, kind = %kind, worker_name = %self.name, "task started");

        let outcome = match self.deps.registry.get(kind) {
            Ok(handler) => {
                let token = CancellationToken::new();
                let ctx = TaskContext::new(
                    task_id,
                    self.name.clone(),
                    record.group_id,
                    token.clone(),
                    Arc::clone(&self.deps.tasks),
                    Arc::clone(&self.deps.dispatcher),
                );
                let payload = record.payload.clone();
                let execution = tokio::spawn(async move { handler.handle(payload, ctx).await });
                let limit = self.limits.timeout_for(kind);
                self.supervise(task_id, execution, token, limit).await
            }
            Err(err) => Execution::Done(Err(TaskFailure::new("handler_not_found", err.to_string()))),
        };

        self.record(task_id, outcome).await;
    }

    /// handler の完了を待つ。revoke か `limit` 切れが来たら
    /// cancel して猶予後に打ち切る。
    async fn supervise(
        &mut self,
        task_id: TaskId,
        mut execution: JoinHandle<std::result::Result<TaskOutput, TaskFailure>>,
        token: CancellationToken,
        limit: Option<Duration>,
    ) -> Execution {
        let expiry = async move {
            match limit {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(expiry);

        let mut listening = true;
        let outcome = loop {
            tokio::select! {
                joined = &mut execution => break Execution::Done(flatten(joined)),
                _ = &mut expiry => break Execution::TimedOut,
                signal = self.revocations.recv(), if listening => match signal {
                    Ok(id) if id == task_id => break Execution::Revoked,
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(worker_name = %self.name, skipped, "revocations lagged");
                    }
                    Err(RecvError::Closed) => listening = false,
                },
            }
        };

        if matches!(outcome, Execution::Revoked | Execution::TimedOut) {
            if let Execution::TimedOut = outcome {
                warn!(task_id = %task_id, worker_name = %self.name, ?limit, "task timed out");
            }
            token.cancel();
            match tokio::time::timeout(self.timing.cancel_grace, &mut execution).await {
                Ok(_) => debug!(task_id = %task_id, "interrupted task stopped"),
                Err(_) => {
                    execution.abort();
                    warn!(task_id = %task_id, "interrupted task ignored cancellation; dropped");
                }
            }
        }
        outcome
    }

    async fn record(&self, task_id: TaskId, outcome: Execution) {
        let now = self.deps.clock.now();
        let apply = match outcome {
            Execution::Done(Ok(output)) => task_update(move |r| r.finish(output, now)),
            Execution::Done(Err(failure)) => task_update(move |r| r.fail(failure, now)),
            Execution::Revoked => task_update(move |r| r.cancel(now)),
            Execution::TimedOut => task_update(move |r| r.time_out(now)),
        };

        match self.deps.tasks.update(task_id, apply).await {
            Ok(record) => {
                info!(task_id = %task_id, state = %record.state, worker_name = %self.name, "task completed");
            }
            Err(StewardError::InvalidTransition { from, .. }) => {
                warn!(task_id = %task_id, state = %from, "task changed state while running; outcome discarded");
            }
            Err(err) => {
                error!(task_id = %task_id, error = %err, "recording task outcome failed");
            }
        }
    }
}

fn flatten(
    joined: std::result::Result<std::result::Result<TaskOutput, TaskFailure>, JoinError>,
) -> std::result::Result<TaskOutput, TaskFailure> {
    match joined {
        Ok(result) => result,
        Err(err) if err.is_panic() => {
            let panic = err.into_panic();
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            Err(TaskFailure::new("handler_panicked", message.clone()).with_traceback(message))
        }
        Err(err) => Err(TaskFailure::new("handler_aborted", err.to_string())),
    }
}
