//! Impls - ports の in-memory 実装
//!
//! テストとデモバイナリで使います。本番ではタスク・worker・履歴をドキュメントストアに、
//! レーンをブローカーに差し替える想定です。

pub mod history;
pub mod inmem_delivery;
pub mod inmem_task_store;
pub mod inmem_worker_store;

pub use self::history::{HistoryCollection, TaskStatusHistory};
pub use self::inmem_delivery::InMemoryDeliveryQueue;
pub use self::inmem_task_store::InMemoryTaskStore;
pub use self::inmem_worker_store::InMemoryWorkerStore;
