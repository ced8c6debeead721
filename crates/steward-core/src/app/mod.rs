//! App - アプリケーション層
//!
//! ports と reservation actor を組み合わせてコーディネータを構成します。
//!
//! # 主要コンポーネント
//! - **CoordinatorBuilder**: 構築とワイヤリング（fail-fast な handler 検証）
//! - **Dispatcher**: 投入・キャンセル・スキップ
//! - **WorkerPool**: タスク実行ループ（pop→start→handle→record→release）
//! - **LivenessMonitor**: heartbeat が途絶えた worker の後始末
//! - **HistoryReaper**: 履歴の定期削除
//! - **ScheduleRegistry**: 定期実行（scheduled call、reap もその一つ）
//! - **StatusService**: 参照と制御の API

pub mod builder;
pub mod dispatcher;
pub mod liveness_loop;
pub mod reaper_loop;
pub mod runtime;
pub mod scheduler;
pub mod status;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, Coordinator, CoordinatorBuilder, RunningCoordinator};
pub use self::dispatcher::{CancelOutcome, Dispatcher, Submission};
pub use self::liveness_loop::{LivenessMonitor, LivenessReport};
pub use self::reaper_loop::{HistoryReaper, ReapHistoryHandler, ReapReport};
pub use self::runtime::{HandlerRegistry, TaskContext, TaskHandler};
pub use self::scheduler::{ScheduleRegistry, ScheduleRequest};
pub use self::status::{ControlResponse, PostponedResponse, StatusService, TaskLink};
pub use self::worker_loop::{WorkerDeps, WorkerPool};
