//! StewardConfig - コーディネータの設定
//!
//! TOML から読み込みます。全セクション・全フィールドにデフォルトがあるので、空ファイルも有効な設定です。
//! `validate` が範囲外の値（0 の間隔、上限超えのタイムアウトや保持期間、未知の kind 名）を起動前に拒否します。
//!
//! ```toml
//! [workers]
//! count = 4
//!
//! [liveness]
//! timeout_secs = 300
//!
//! [reaper.retention_days]
//! task_status = 7
//! consumer_history = 60
//!
//! [tasks.timeout_ms]
//! repository_sync = 3600000
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::PayloadKind;
use crate::error::{Result, StewardError};

/// `reaper.retention_days` の上限（100 年）
pub const MAX_RETENTION_DAYS: f64 = 36_500.0;

/// `liveness.timeout_secs` の上限（30 日）
pub const MAX_LIVENESS_TIMEOUT_SECS: u64 = 30 * 86_400;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StewardConfig {
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl StewardConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| StewardError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| StewardError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| StewardError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers.count == 0 {
            return Err(StewardError::Config("workers.count must be at least 1".into()));
        }
        if self.workers.name_prefix.trim().is_empty() {
            return Err(StewardError::Config("workers.name_prefix must not be empty".into()));
        }
        if self.workers.heartbeat_interval_secs == 0 {
            return Err(StewardError::Config(
                "workers.heartbeat_interval_secs must be at least 1".into(),
            ));
        }
        if self.liveness.timeout_secs <= self.workers.heartbeat_interval_secs {
            return Err(StewardError::Config(format!(
                "liveness.timeout_secs ({}) must exceed workers.heartbeat_interval_secs ({})",
                self.liveness.timeout_secs, self.workers.heartbeat_interval_secs
            )));
        }
        if self.reaper.interval_secs == 0 {
            return Err(StewardError::Config("reaper.interval_secs must be at least 1".into()));
        }
        if self.scheduler.check_interval_ms == 0 {
            return Err(StewardError::Config(
                "scheduler.check_interval_ms must be at least 1".into(),
            ));
        }
        if self.liveness.timeout_secs > MAX_LIVENESS_TIMEOUT_SECS {
            return Err(StewardError::Config(format!(
                "liveness.timeout_secs must be at most {MAX_LIVENESS_TIMEOUT_SECS}"
            )));
        }
        for (name, days) in &self.reaper.retention_days {
            if !days.is_finite() || *days < 0.0 || *days > MAX_RETENTION_DAYS {
                return Err(StewardError::Config(format!(
                    "reaper.retention_days.{name} must be between 0 and {MAX_RETENTION_DAYS} days"
                )));
            }
        }
        for (name, ms) in &self.tasks.timeout_ms {
            if PayloadKind::from_name(name).is_none() {
                return Err(StewardError::Config(format!(
                    "tasks.timeout_ms.{name} is not a task kind"
                )));
            }
            if *ms == 0 {
                return Err(StewardError::Config(format!(
                    "tasks.timeout_ms.{name} must be at least 1"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_worker_count")]
    pub count: usize,
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// 1 回の pop がブロックする時間。切れたらシャットダウンを再確認
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl WorkersConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn worker_name(&self, n: usize) -> String {
        format!("{}-{n}", self.name_prefix)
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            name_prefix: default_name_prefix(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// これより長く沈黙した worker は消失扱い
    #[serde(default = "default_liveness_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_liveness_interval_secs")]
    pub check_interval_secs: u64,
}

impl LivenessConfig {
    /// `validate` を通っていない設定でも `MAX_LIVENESS_TIMEOUT_SECS` で頭打ち
    pub fn timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.timeout_secs.min(MAX_LIVENESS_TIMEOUT_SECS) as i64)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_liveness_timeout_secs(),
            check_interval_secs: default_liveness_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaperConfig {
    #[serde(default = "default_reaper_interval_secs")]
    pub interval_secs: u64,
    /// コレクションごとの保持期間（日、小数可）
    #[serde(default = "default_retention_days")]
    pub retention_days: BTreeMap<String, f64>,
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// 保持期間がない、または表現できないほど大きいときは `None`。
    /// 範囲外は飽和するので、呼び出し側は `checked_sub_signed` で引くこと。
    pub fn retention(&self, collection: &str) -> Option<chrono::Duration> {
        self.retention_days
            .get(collection)
            .and_then(|days| chrono::Duration::try_milliseconds((days * 86_400_000.0) as i64))
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reaper_interval_secs(),
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TasksConfig {
    /// revoke されたタスクが自分で止まるまでの猶予
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
    /// kind ごとの最長実行時間。超えると TIMED_OUT
    /// キーは kind 名（`repository_sync` など）。載っていない kind は無制限
    #[serde(default)]
    pub timeout_ms: BTreeMap<String, u64>,
}

impl TasksConfig {
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn timeout_for(&self, kind: PayloadKind) -> Option<Duration> {
        self.timeout_ms.get(kind.name()).map(|ms| Duration::from_millis(*ms))
    }
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            cancel_grace_ms: default_cancel_grace_ms(),
            timeout_ms: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// scheduled call の確認間隔
    #[serde(default = "default_scheduler_check_interval_ms")]
    pub check_interval_ms: u64,
}

impl SchedulerConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: default_scheduler_check_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_prefix")]
    pub prefix: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            prefix: default_api_prefix(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `STEWARD_LOG` 未設定時のフィルタ
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_worker_count() -> usize {
    4
}

fn default_name_prefix() -> String {
    "reserved_resource_worker".to_string()
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_liveness_timeout_secs() -> u64 {
    300
}

fn default_liveness_interval_secs() -> u64 {
    60
}

fn default_reaper_interval_secs() -> u64 {
    86_400
}

fn default_retention_days() -> BTreeMap<String, f64> {
    [
        ("task_status", 7.0),
        ("consumer_history", 60.0),
        ("repo_sync_results", 60.0),
        ("repo_publish_results", 60.0),
        ("repo_group_publish_results", 60.0),
    ]
    .into_iter()
    .map(|(name, days)| (name.to_string(), days))
    .collect()
}

fn default_cancel_grace_ms() -> u64 {
    5_000
}

fn default_scheduler_check_interval_ms() -> u64 {
    1_000
}

fn default_api_prefix() -> String {
    "/api/v2".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;

    #[test]
    fn empty_document_yields_defaults() {
        let config = StewardConfig::from_toml_str("").unwrap();
        assert_eq!(config, StewardConfig::default());
        assert_eq!(config.workers.worker_name(0), "reserved_resource_worker-0");
        assert_eq!(config.reaper.retention_days["task_status"], 7.0);
        assert_eq!(config.reaper.retention_days.len(), 5);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = StewardConfig::from_toml_str(
            r#"
            [workers]
            count = 2

            [reaper.retention_days]
            repo_sync_results = 0.5

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.workers.count, 2);
        assert_eq!(config.workers.heartbeat_interval_secs, 30);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(
            config.reaper.retention("repo_sync_results"),
            Some(chrono::Duration::hours(12))
        );
        // 明示したテーブルはデフォルトを丸ごと置き換える
        assert_eq!(config.reaper.retention("task_status"), None);
    }

    #[rstest]
    #[case::no_workers("[workers]\ncount = 0")]
    #[case::negative_retention("[reaper.retention_days]\ntask_status = -1.0")]
    #[case::timeout_below_heartbeat("[liveness]\ntimeout_secs = 10")]
    #[case::timeout_beyond_bound("[liveness]\ntimeout_secs = 9223372036854775807")]
    #[case::retention_beyond_bound("[reaper.retention_days]\nconsumer_history = 1e9")]
    #[case::unknown_timeout_kind("[tasks.timeout_ms]\nsync = 1000")]
    #[case::zero_timeout("[tasks.timeout_ms]\nrepository_sync = 0")]
    #[case::zero_reap_interval("[reaper]\ninterval_secs = 0")]
    #[case::zero_scheduler_tick("[scheduler]\ncheck_interval_ms = 0")]
    #[case::not_toml("workers = [")]
    fn invalid_documents_are_rejected(#[case] raw: &str) {
        let err = StewardConfig::from_toml_str(raw).unwrap_err();
        assert!(matches!(err, StewardError::Config(_)));
    }

    #[test]
    fn unvalidated_extremes_do_not_overflow() {
        let mut config = StewardConfig::default();
        config.liveness.timeout_secs = u64::MAX;
        assert_eq!(
            config.liveness.timeout(),
            chrono::Duration::seconds(MAX_LIVENESS_TIMEOUT_SECS as i64)
        );

        config.reaper.retention_days.insert("consumer_history".into(), f64::NAN);
        assert_eq!(config.reaper.retention("consumer_history"), Some(chrono::Duration::zero()));
    }

    #[test]
    fn task_timeouts_are_looked_up_by_kind() {
        let config = StewardConfig::from_toml_str(
            "[tasks.timeout_ms]\nrepository_sync = 1500\n",
        )
        .unwrap();
        assert_eq!(
            config.tasks.timeout_for(PayloadKind::RepositorySync),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(config.tasks.timeout_for(PayloadKind::RepositoryPublish), None);
    }

    #[test]
    fn load_reads_file_and_round_trips() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[liveness]\ntimeout_secs = 90\n[api]\nprefix = \"/api\"").unwrap();

        let config = StewardConfig::load(file.path()).unwrap();
        assert_eq!(config.liveness.timeout(), chrono::Duration::seconds(90));
        assert_eq!(config.api.prefix, "/api");

        let rendered = config.to_toml_string().unwrap();
        assert_eq!(StewardConfig::from_toml_str(&rendered).unwrap(), config);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = StewardConfig::load("/nonexistent/steward.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/steward.toml"));
    }
}
