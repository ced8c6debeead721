//! CoordinatorBuilder - コーディネータの構築とワイヤリング
//!
//! ストア、配送レーン、reservation actor、dispatcher、スケジュール登録、
//! バックグラウンドループを組み立てます。
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（期待する payload kind すべてに handler があるか）
//! - `Arc` による共有所有権とループごとの `watch` シャットダウン

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::dispatcher::Dispatcher;
use crate::app::liveness_loop::LivenessMonitor;
use crate::app::reaper_loop::{HistoryReaper, ReapHistoryHandler};
use crate::app::runtime::{HandlerRegistry, TaskHandler};
use crate::app::scheduler::{ScheduleRegistry, ScheduleRequest};
use crate::app::status::StatusService;
use crate::app::worker_loop::{WorkerDeps, WorkerPool};
use crate::config::StewardConfig;
use crate::domain::{PayloadKind, PayloadRef, Schedule};
use crate::error::StewardError;
use crate::impls::{
    HistoryCollection, InMemoryDeliveryQueue, InMemoryTaskStore, InMemoryWorkerStore,
    TaskStatusHistory,
};
use crate::ports::{
    Clock, DeliveryQueue, IdGenerator, ReapableCollection, SystemClock, TaskStore, UlidGenerator,
    WorkerStore,
};
use crate::reservation::{ReservationHandle, ReservationManager};

/// TaskStore と一緒に作る履歴コレクション
pub const HISTORY_COLLECTIONS: [&str; 4] = [
    "consumer_history",
    "repo_sync_results",
    "repo_publish_results",
    "repo_group_publish_results",
];

/// CoordinatorBuilder は Coordinator を構築
///
/// # 使用例
/// ```ignore
/// let coordinator = CoordinatorBuilder::new()
///     .config(config)
///     .register(PayloadKind::RepositorySync, Arc::new(SyncHandler))?
///     .expect_kinds(&[PayloadKind::RepositorySync])
///     .build()?;
/// let running = coordinator.start().await?;
/// ```
///
/// # Fail-fast 設計
/// - `expect_kinds()` で期待される payload kind を登録
/// - `build()` 時に「期待集合 ⊆ 登録済み集合」をチェック
/// - 不足があれば `BuildError::MissingHandlers` を返す
pub struct CoordinatorBuilder {
    config: StewardConfig,
    registry: HandlerRegistry,
    expected_kinds: Option<Vec<PayloadKind>>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing handlers for payload kinds: {0:?}. These kinds were expected but not registered.")]
    MissingHandlers(Vec<PayloadKind>),

    #[error(transparent)]
    Steward(#[from] StewardError),
}

impl CoordinatorBuilder {
    pub fn new() -> Self {
        Self {
            config: StewardConfig::default(),
            registry: HandlerRegistry::new(),
            expected_kinds: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn config(mut self, config: StewardConfig) -> Self {
        self.config = config;
        self
    }

    /// 時計を差し替え（テストでは `FixedClock` で固定）
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn register(
        mut self,
        kind: PayloadKind,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<Self, StewardError> {
        self.registry.register(kind, handler)?;
        Ok(self)
    }

    pub fn expect_kinds(mut self, kinds: &[PayloadKind]) -> Self {
        self.expected_kinds = Some(kinds.to_vec());
        self
    }

    /// 検証してすべてを結線
    ///
    /// reservation actor を spawn するので tokio runtime 内で呼ぶこと。
    /// `ReapHistory` は未登録なら組み込み handler を使う。
    pub fn build(mut self) -> Result<Coordinator, BuildError> {
        self.config.validate()?;

        if let Some(expected) = &self.expected_kinds {
            let missing: Vec<PayloadKind> = expected
                .iter()
                .copied()
                .filter(|kind| *kind != PayloadKind::ReapHistory && !self.registry.contains(*kind))
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingHandlers(missing));
            }
        }

        let clock = self.clock;
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        let tasks: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let workers: Arc<dyn WorkerStore> = Arc::new(InMemoryWorkerStore::new());
        let queue: Arc<dyn DeliveryQueue> = Arc::new(InMemoryDeliveryQueue::new());

        let (reservations, reservation_join) = ReservationManager::spawn(
            Arc::clone(&queue),
            Arc::clone(&workers),
            Arc::clone(&ids),
            Arc::clone(&clock),
            self.config.liveness.timeout(),
        );

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&tasks),
            Arc::clone(&queue),
            reservations.clone(),
            Arc::clone(&ids),
            Arc::clone(&clock),
        ));

        let history: Vec<Arc<HistoryCollection>> = HISTORY_COLLECTIONS
            .iter()
            .map(|name| Arc::new(HistoryCollection::new(*name)))
            .collect();
        let mut collections: Vec<Arc<dyn ReapableCollection>> =
            vec![Arc::new(TaskStatusHistory::new(Arc::clone(&tasks)))];
        collections.extend(
            history
                .iter()
                .map(|c| Arc::clone(c) as Arc<dyn ReapableCollection>),
        );
        let reaper = Arc::new(HistoryReaper::new(
            collections,
            self.config.reaper.clone(),
            Arc::clone(&clock),
        ));

        if !self.registry.contains(PayloadKind::ReapHistory) {
            self.registry.register(
                PayloadKind::ReapHistory,
                Arc::new(ReapHistoryHandler::new(Arc::clone(&reaper))),
            )?;
        }

        let schedules = Arc::new(ScheduleRegistry::new(
            Arc::clone(&dispatcher),
            Arc::clone(&tasks),
            Arc::clone(&ids),
            Arc::clone(&clock),
        ));

        let status = Arc::new(StatusService::new(
            Arc::clone(&tasks),
            Arc::clone(&workers),
            Arc::clone(&dispatcher),
            Arc::clone(&clock),
            self.config.liveness.timeout(),
            self.config.api.prefix.clone(),
        ));

        info!(handlers = ?self.registry.kinds(), "coordinator built");
        Ok(Coordinator {
            config: self.config,
            clock,
            ids,
            tasks,
            workers,
            queue,
            reservations,
            reservation_join,
            dispatcher,
            registry: Arc::new(self.registry),
            reaper,
            history,
            schedules,
            status,
        })
    }
}

impl Default for CoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Coordinator は結線済みのコーディネータ。
/// `start()` までは reservation actor 以外何も動かない。
pub struct Coordinator {
    config: StewardConfig,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    tasks: Arc<dyn TaskStore>,
    workers: Arc<dyn WorkerStore>,
    queue: Arc<dyn DeliveryQueue>,
    reservations: ReservationHandle,
    reservation_join: JoinHandle<()>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<HandlerRegistry>,
    reaper: Arc<HistoryReaper>,
    history: Vec<Arc<HistoryCollection>>,
    schedules: Arc<ScheduleRegistry>,
    status: Arc<StatusService>,
}

impl Coordinator {
    pub fn config(&self) -> &StewardConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn status(&self) -> Arc<StatusService> {
        Arc::clone(&self.status)
    }

    pub fn reaper(&self) -> Arc<HistoryReaper> {
        Arc::clone(&self.reaper)
    }

    pub fn schedules(&self) -> Arc<ScheduleRegistry> {
        Arc::clone(&self.schedules)
    }

    pub fn reservations(&self) -> ReservationHandle {
        self.reservations.clone()
    }

    pub fn tasks(&self) -> Arc<dyn TaskStore> {
        Arc::clone(&self.tasks)
    }

    pub fn workers(&self) -> Arc<dyn WorkerStore> {
        Arc::clone(&self.workers)
    }

    pub fn ids(&self) -> Arc<dyn IdGenerator> {
        Arc::clone(&self.ids)
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// 名前付きの履歴コレクション（`HISTORY_COLLECTIONS` 参照）
    pub fn history(&self, name: &str) -> Option<Arc<HistoryCollection>> {
        self.history
            .iter()
            .find(|c| c.name() == name)
            .map(Arc::clone)
    }

    pub fn liveness_monitor(&self) -> LivenessMonitor {
        LivenessMonitor::new(
            Arc::clone(&self.tasks),
            Arc::clone(&self.workers),
            self.reservations.clone(),
            Arc::clone(&self.clock),
            self.config.liveness.timeout(),
            self.config.liveness.check_interval(),
        )
    }

    /// 履歴の定期削除を未登録なら登録する。
    /// 初回は今から 1 間隔後。
    async fn schedule_reap(&self) -> Result<(), StewardError> {
        let scheduled = self
            .schedules
            .list()
            .await
            .iter()
            .any(|call| call.payload == PayloadRef::ReapHistory);
        if scheduled {
            return Ok(());
        }

        let interval = chrono::Duration::from_std(self.config.reaper.interval())
            .map_err(|e| StewardError::Config(format!("reaper.interval_secs: {e}")))?;
        let first_run = self
            .clock
            .now()
            .checked_add_signed(interval)
            .ok_or_else(|| StewardError::Config("reaper.interval_secs is out of range".into()))?;
        let schedule = Schedule::every(interval)
            .map_err(|e| StewardError::Config(e.to_string()))?
            .starting_at(first_run);
        self.schedules
            .add(ScheduleRequest::new(PayloadRef::ReapHistory, schedule))
            .await?;
        Ok(())
    }

    /// worker プール、liveness monitor、scheduler を起動
    pub async fn start(&self) -> Result<RunningCoordinator, StewardError> {
        self.schedule_reap().await?;

        let pool = WorkerPool::spawn(
            &self.config,
            WorkerDeps {
                tasks: Arc::clone(&self.tasks),
                workers: Arc::clone(&self.workers),
                queue: Arc::clone(&self.queue),
                reservations: self.reservations.clone(),
                dispatcher: Arc::clone(&self.dispatcher),
                registry: Arc::clone(&self.registry),
                clock: Arc::clone(&self.clock),
            },
        )
        .await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let loops = vec![
            tokio::spawn(self.liveness_monitor().run(shutdown_rx.clone())),
            tokio::spawn(
                Arc::clone(&self.schedules).run(self.config.scheduler.check_interval(), shutdown_rx),
            ),
        ];

        info!(workers = pool.names().len(), "coordinator started");
        Ok(RunningCoordinator {
            pool,
            shutdown_tx,
            loops,
        })
    }

    /// reservation actor を止める。動いている部分をすべて止めてから呼ぶこと
    pub async fn close(self) {
        self.reservation_join.abort();
        if let Err(err) = self.reservation_join.await
            && !err.is_cancelled()
        {
            error!(error = %err, "reservation manager ended abnormally");
        }
    }
}

/// RunningCoordinator は `Coordinator::start` が起動した部分のハンドル
pub struct RunningCoordinator {
    pool: WorkerPool,
    shutdown_tx: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
}

impl RunningCoordinator {
    pub fn worker_names(&self) -> &[String] {
        self.pool.names()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        self.pool.shutdown_and_join().await;
        for join in self.loops {
            if let Err(err) = join.await {
                error!(error = %err, "background loop ended abnormally");
            }
        }
        info!("coordinator stopped");
    }
}
