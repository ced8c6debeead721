//! Domain identifiers (strongly-typed IDs).
//!
//! # ULID ベースの ID + ジェネリック実装
//!
//! すべての ID は `Id<T>` で包んだ ULID です。`T` はサイズ 0 のマーカー型です。
//!
//! ## ULID の特性
//! - 先頭のタイムスタンプがレコードの作成時刻を兼ねる
//! - 作成順にソートされるので、reaper は「X より古いもの」を範囲削除一回で消せる
//! - `TaskId` と `LaneId` を取り違えるとコンパイルエラー

use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
pub trait IdMarker: Send + Sync + 'static {
    /// パースエラーやログに出す種別名
    fn kind() -> &'static str;
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }

    /// ID に埋め込まれた作成時刻（ミリ秒精度）
    pub fn created_at(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.ulid.timestamp_ms() as i64)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// `at` に生成されうる最小の ID
    ///
    /// `at` より前に作られた ID はすべてこれより小さい。
    pub fn lower_bound_at(at: DateTime<Utc>) -> Self {
        let ms = at.timestamp_millis().max(0) as u64;
        Self::from_ulid(Ulid::from_parts(ms, 0))
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.ulid.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} id: {value}")]
pub struct ParseIdError {
    pub kind: &'static str,
    pub value: String,
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s)
            .map(Self::from_ulid)
            .map_err(|_| ParseIdError {
                kind: T::kind(),
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn kind() -> &'static str {
        "task"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Group {}

impl IdMarker for Group {
    fn kind() -> &'static str {
        "group"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Lane {}

impl IdMarker for Lane {
    fn kind() -> &'static str {
        "lane"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Record {}

impl IdMarker for Record {
    fn kind() -> &'static str {
        "record"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Call {}

impl IdMarker for Call {
    fn kind() -> &'static str {
        "schedule"
    }
}

/// タスクの ID（投入・状態・キャンセルの単位）
pub type TaskId = Id<Task>;

/// 1 回のグループ投入で作られた兄弟タスクが共有する ID
pub type GroupId = Id<Group>;

/// 予約レーンの ID
pub type LaneId = Id<Lane>;

/// 履歴コレクションのエントリの ID
pub type RecordId = Id<Record>;

/// scheduled call の ID
pub type ScheduleId = Id<Call>;
