//! Observability - ログ初期化とタスク集計

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};
use crate::domain::{TaskRecord, TaskState};
use crate::error::{Result, StewardError};

/// `logging.level` を上書きする環境変数
pub const LOG_ENV: &str = "STEWARD_LOG";

/// グローバルな `tracing` subscriber を設定
///
/// `STEWARD_LOG`（例: `steward_core=debug`）が設定値より優先。
/// すでに設定済みなら失敗する。
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| StewardError::Config(format!("invalid log filter: {e}")))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = match config.format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| StewardError::Config(format!("logging already initialized: {e}")))
}

/// TaskCounts は状態ごとのタスク数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub waiting: usize,
    pub running: usize,
    pub finished: usize,
    pub error: usize,
    pub canceled: usize,
    pub skipped: usize,
    pub timed_out: usize,
}

impl TaskCounts {
    pub fn tally<'a>(records: impl IntoIterator<Item = &'a TaskRecord>) -> Self {
        let mut counts = Self::default();
        for record in records {
            let slot = match record.state {
                TaskState::Waiting => &mut counts.waiting,
                TaskState::Running => &mut counts.running,
                TaskState::Finished => &mut counts.finished,
                TaskState::Error => &mut counts.error,
                TaskState::Canceled => &mut counts.canceled,
                TaskState::Skipped => &mut counts.skipped,
                TaskState::TimedOut => &mut counts.timed_out,
            };
            *slot += 1;
        }
        counts
    }

    pub fn incomplete(&self) -> usize {
        self.waiting + self.running
    }
}
