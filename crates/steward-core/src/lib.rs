//! steward-core
//!
//! Asynchronous task dispatch with per-resource reservations.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, state, tags, payload, task, worker, schedule）
//! - **ports**: 抽象化レイヤー（TaskStore, WorkerStore, DeliveryQueue, Clock, IdGenerator, ReapableCollection）
//! - **impls**: in-memory 実装（タスク、worker、レーン、履歴）
//! - **reservation**: リソース予約テーブルとその actor
//! - **app**: dispatcher, worker pool, liveness monitor, reaper, scheduler, status, builder
//! - **config** / **observability** / **error**: 設定、ログ、エラー型

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod reservation;

pub use app::{Coordinator, CoordinatorBuilder};
pub use config::StewardConfig;
pub use error::{Result, StewardError};
