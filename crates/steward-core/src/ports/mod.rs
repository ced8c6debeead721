//! Ports - 抽象化レイヤー
//!
//! 各 trait はバックエンド（タスク・worker レコードのドキュメントストア、レーンのブローカー）を隠します。
//! in-memory 実装は `impls` にあります。

pub mod clock;
pub mod delivery_queue;
pub mod history;
pub mod id_generator;
pub mod task_store;
pub mod worker_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::delivery_queue::{Delivery, DeliveryQueue};
pub use self::history::ReapableCollection;
pub use self::id_generator::{IdGenerator, UlidGenerator, record_id_at};
pub use self::task_store::{TaskFilter, TaskStore, TaskUpdate, task_update};
pub use self::worker_store::WorkerStore;
