//! Tags - リソースタグ、アクションタグ、予約キー
//!
//! リソースは `steward:<kind>:<id>`、アクションは `steward:action:<name>` と表記します。
//! `action` はリソース種別ではないので、アクションのラベルがリソース ID と衝突することはありません。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StewardError;

pub const TAG_NAMESPACE: &str = "steward";
const ACTION_KIND: &str = "action";

/// ResourceType はリソース種別の固定語彙
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Repository,
    RepositoryGroup,
    RepositoryImporter,
    RepositoryDistributor,
    RepositoryGroupDistributor,
    Consumer,
    ConsumerGroup,
    ContentUnit,
    ContentSource,
    Upload,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 10] = [
        ResourceKind::Repository,
        ResourceKind::RepositoryGroup,
        ResourceKind::RepositoryImporter,
        ResourceKind::RepositoryDistributor,
        ResourceKind::RepositoryGroupDistributor,
        ResourceKind::Consumer,
        ResourceKind::ConsumerGroup,
        ResourceKind::ContentUnit,
        ResourceKind::ContentSource,
        ResourceKind::Upload,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Repository => "repository",
            ResourceKind::RepositoryGroup => "repository_group",
            ResourceKind::RepositoryImporter => "repository_importer",
            ResourceKind::RepositoryDistributor => "repository_distributor",
            ResourceKind::RepositoryGroupDistributor => "repository_group_distributor",
            ResourceKind::Consumer => "consumer",
            ResourceKind::ConsumerGroup => "consumer_group",
            ResourceKind::ContentUnit => "content_unit",
            ResourceKind::ContentSource => "content_source",
            ResourceKind::Upload => "upload",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = StewardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| StewardError::Validation(format!("unknown resource type: {s}")))
    }
}

/// ResourceTag はタスクが読む・変更する `(resource_type, resource_id)` の組
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceTag {
    pub resource_type: ResourceKind,
    pub resource_id: String,
}

impl ResourceTag {
    pub fn new(resource_type: ResourceKind, resource_id: impl Into<String>) -> Self {
        Self {
            resource_type,
            resource_id: resource_id.into(),
        }
    }

    pub fn repository(id: impl Into<String>) -> Self {
        Self::new(ResourceKind::Repository, id)
    }

    pub fn consumer(id: impl Into<String>) -> Self {
        Self::new(ResourceKind::Consumer, id)
    }

    pub fn validate(&self) -> Result<(), StewardError> {
        if self.resource_id.trim().is_empty() {
            return Err(StewardError::Validation(format!(
                "empty resource id for {}",
                self.resource_type
            )));
        }
        if self.resource_id.contains(':') {
            return Err(StewardError::Validation(format!(
                "resource id may not contain ':': {}",
                self.resource_id
            )));
        }
        Ok(())
    }

    /// reservation manager が直列化に使うキー
    pub fn reservation_key(&self) -> ReservationKey {
        ReservationKey(format!("{}:{}", self.resource_type, self.resource_id))
    }

    /// 検索用タグ。例: `steward:repository:foo`
    pub fn to_tag(&self) -> String {
        format!("{TAG_NAMESPACE}:{}:{}", self.resource_type, self.resource_id)
    }
}

impl fmt::Display for ResourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource_type, self.resource_id)
    }
}

/// アクションの検索用タグ。例: `steward:action:sync`
pub fn action_tag(name: &str) -> String {
    format!("{TAG_NAMESPACE}:{ACTION_KIND}:{name}")
}

/// 検索用タグを ResourceTag に戻す。アクションタグは `None`
pub fn parse_resource_tag(tag: &str) -> Result<Option<ResourceTag>, StewardError> {
    let mut parts = tag.splitn(3, ':');
    let (Some(ns), Some(kind), Some(id)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(StewardError::Validation(format!("malformed tag: {tag}")));
    };
    if ns != TAG_NAMESPACE {
        return Err(StewardError::Validation(format!(
            "unknown tag namespace: {ns}"
        )));
    }
    if kind == ACTION_KIND {
        return Ok(None);
    }
    let tag = ResourceTag::new(kind.parse()?, id);
    tag.validate()?;
    Ok(Some(tag))
}

/// ReservationKey は `<resource_type>:<resource_id>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationKey(String);

impl ReservationKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReservationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 重複を除く。初出順を保つ
pub fn normalize_tags(tags: Vec<ResourceTag>) -> Vec<ResourceTag> {
    let mut out: Vec<ResourceTag> = Vec::with_capacity(tags.len());
    for tag in tags {
        if !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_id_different_type_gives_different_keys() {
        let repo = ResourceTag::repository("foo");
        let consumer = ResourceTag::consumer("foo");
        assert_ne!(repo.reservation_key(), consumer.reservation_key());
        assert_eq!(repo.reservation_key().as_str(), "repository:foo");
    }

    #[test]
    fn renders_and_parses_query_tags() {
        let tag = ResourceTag::new(ResourceKind::RepositoryDistributor, "yum_dist");
        assert_eq!(tag.to_tag(), "steward:repository_distributor:yum_dist");
        assert_eq!(parse_resource_tag(&tag.to_tag()).unwrap(), Some(tag));
    }

    #[test]
    fn action_tags_are_not_resources() {
        let tag = action_tag("sync");
        assert_eq!(tag, "steward:action:sync");
        assert_eq!(parse_resource_tag(&tag).unwrap(), None);
    }

    #[test]
    fn rejects_malformed_tags() {
        assert!(parse_resource_tag("repository:foo").is_err());
        assert!(parse_resource_tag("other:repository:foo").is_err());
        assert!(parse_resource_tag("steward:planet:foo").is_err());
    }

    #[test]
    fn validate_rejects_empty_and_separator_ids() {
        assert!(ResourceTag::repository("").validate().is_err());
        assert!(ResourceTag::repository("a:b").validate().is_err());
        assert!(ResourceTag::repository("zoo-1").validate().is_ok());
    }

    #[test]
    fn normalize_keeps_first_seen_order() {
        let tags = vec![
            ResourceTag::repository("b"),
            ResourceTag::repository("a"),
            ResourceTag::repository("b"),
        ];
        assert_eq!(
            normalize_tags(tags),
            vec![ResourceTag::repository("b"), ResourceTag::repository("a")]
        );
    }
}
