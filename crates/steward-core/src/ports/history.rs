//! ReapableCollection port - reaper が削除できる履歴コレクション

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

#[async_trait]
pub trait ReapableCollection: Send + Sync {
    /// 設定から保持期間を引くときの名前
    fn name(&self) -> &str;

    /// `cutoff` より前に作られたレコードを削除し、件数を返す
    ///
    /// 実装は ID に埋め込まれた作成時刻で比較するので、順序付きの範囲削除になる。
    /// 2 回走らせても害はない。
    async fn reap_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}
