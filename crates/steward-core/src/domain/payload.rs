//! PayloadRef - タスクが実行する操作とその引数
//!
//! payload はただのデータです。worker は `PayloadRef::kind()` で handler registry を引きます。
//! 実行可能なものはタスクレコードに一切保存しません。

use std::fmt;

use serde::{Deserialize, Serialize};

use super::tags::{ResourceKind, ResourceTag};

/// PayloadKind は handler を登録できる操作種別の閉じた集合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    RepositorySync,
    RepositoryPublish,
    RepositoryGroupPublish,
    ConsumerBind,
    ConsumerUnbind,
    ContentUploadImport,
    ContentSourceRefresh,
    ReapHistory,
}

impl PayloadKind {
    pub const ALL: [PayloadKind; 8] = [
        PayloadKind::RepositorySync,
        PayloadKind::RepositoryPublish,
        PayloadKind::RepositoryGroupPublish,
        PayloadKind::ConsumerBind,
        PayloadKind::ConsumerUnbind,
        PayloadKind::ContentUploadImport,
        PayloadKind::ContentSourceRefresh,
        PayloadKind::ReapHistory,
    ];

    /// snake_case 名。シリアライズ形式と設定キーに使う
    pub fn name(self) -> &'static str {
        match self {
            PayloadKind::RepositorySync => "repository_sync",
            PayloadKind::RepositoryPublish => "repository_publish",
            PayloadKind::RepositoryGroupPublish => "repository_group_publish",
            PayloadKind::ConsumerBind => "consumer_bind",
            PayloadKind::ConsumerUnbind => "consumer_unbind",
            PayloadKind::ContentUploadImport => "content_upload_import",
            PayloadKind::ContentSourceRefresh => "content_source_refresh",
            PayloadKind::ReapHistory => "reap_history",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// `steward:action:<name>` タグに使うアクション名
    pub fn action(self) -> &'static str {
        match self {
            PayloadKind::RepositorySync => "sync",
            PayloadKind::RepositoryPublish => "publish",
            PayloadKind::RepositoryGroupPublish => "group_publish",
            PayloadKind::ConsumerBind => "bind",
            PayloadKind::ConsumerUnbind => "unbind",
            PayloadKind::ContentUploadImport => "import_upload",
            PayloadKind::ContentSourceRefresh => "refresh_content_sources",
            PayloadKind::ReapHistory => "reap",
        }
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.action())
    }
}

/// PayloadRef はタスクが行う処理への型付き参照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum PayloadRef {
    RepositorySync {
        repo_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        override_config: Option<serde_json::Value>,
    },
    RepositoryPublish {
        repo_id: String,
        distributor_id: String,
    },
    RepositoryGroupPublish {
        group_id: String,
        distributor_id: String,
        /// メンバーのリポジトリ。メンバーごとに publish タスクを 1 つ spawn する
        #[serde(default)]
        members: Vec<String>,
    },
    ConsumerBind {
        consumer_id: String,
        repo_id: String,
        distributor_id: String,
    },
    ConsumerUnbind {
        consumer_id: String,
        repo_id: String,
        distributor_id: String,
    },
    ContentUploadImport {
        repo_id: String,
        upload_id: String,
        unit_type_id: String,
    },
    ContentSourceRefresh {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source_id: Option<String>,
    },
    ReapHistory,
}

impl PayloadRef {
    pub fn kind(&self) -> PayloadKind {
        match self {
            PayloadRef::RepositorySync { .. } => PayloadKind::RepositorySync,
            PayloadRef::RepositoryPublish { .. } => PayloadKind::RepositoryPublish,
            PayloadRef::RepositoryGroupPublish { .. } => PayloadKind::RepositoryGroupPublish,
            PayloadRef::ConsumerBind { .. } => PayloadKind::ConsumerBind,
            PayloadRef::ConsumerUnbind { .. } => PayloadKind::ConsumerUnbind,
            PayloadRef::ContentUploadImport { .. } => PayloadKind::ContentUploadImport,
            PayloadRef::ContentSourceRefresh { .. } => PayloadKind::ContentSourceRefresh,
            PayloadRef::ReapHistory => PayloadKind::ReapHistory,
        }
    }

    /// この payload の投入に必須のタグ
    ///
    /// 欠けていればタスクレコードを作る前に拒否する。
    pub fn required_tags(&self) -> Vec<ResourceTag> {
        match self {
            PayloadRef::RepositorySync { repo_id, .. }
            | PayloadRef::RepositoryPublish { repo_id, .. }
            | PayloadRef::ContentUploadImport { repo_id, .. } => {
                vec![ResourceTag::repository(repo_id)]
            }
            PayloadRef::RepositoryGroupPublish { group_id, .. } => {
                vec![ResourceTag::new(ResourceKind::RepositoryGroup, group_id)]
            }
            PayloadRef::ConsumerBind { consumer_id, .. }
            | PayloadRef::ConsumerUnbind { consumer_id, .. } => {
                vec![ResourceTag::consumer(consumer_id)]
            }
            PayloadRef::ContentSourceRefresh { source_id } => source_id
                .iter()
                .map(|id| ResourceTag::new(ResourceKind::ContentSource, id))
                .collect(),
            PayloadRef::ReapHistory => Vec::new(),
        }
    }
}
