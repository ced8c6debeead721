//! TaskState - タスクの状態遷移

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// TaskState はタスクの状態
///
/// # 遷移
/// - Waiting -> Running -> Finished | Error | Canceled | TimedOut
/// - Waiting -> Skipped（実行されない。superseded など）
/// - Waiting -> Canceled（取得前のキャンセル、または worker 消失）
///
/// 終端状態からは二度と動かない。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Waiting,
    Running,
    Finished,
    Error,
    Canceled,
    Skipped,
    TimedOut,
}

impl TaskState {
    pub const ALL: [TaskState; 7] = [
        TaskState::Waiting,
        TaskState::Running,
        TaskState::Finished,
        TaskState::Error,
        TaskState::Canceled,
        TaskState::Skipped,
        TaskState::TimedOut,
    ];

    pub fn is_terminal(self) -> bool {
        !self.is_incomplete()
    }

    /// Waiting か Running。まだ予約を保持している
    pub fn is_incomplete(self) -> bool {
        matches!(self, TaskState::Waiting | TaskState::Running)
    }

    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Waiting, Running)
                | (Waiting, Skipped)
                | (Waiting, Canceled)
                | (Running, Finished)
                | (Running, Error)
                | (Running, Canceled)
                | (Running, TimedOut)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Waiting => "waiting",
            TaskState::Running => "running",
            TaskState::Finished => "finished",
            TaskState::Error => "error",
            TaskState::Canceled => "canceled",
            TaskState::Skipped => "skipped",
            TaskState::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown task state: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::start(TaskState::Waiting, TaskState::Running)]
    #[case::skip(TaskState::Waiting, TaskState::Skipped)]
    #[case::cancel_waiting(TaskState::Waiting, TaskState::Canceled)]
    #[case::finish(TaskState::Running, TaskState::Finished)]
    #[case::fail(TaskState::Running, TaskState::Error)]
    #[case::cancel_running(TaskState::Running, TaskState::Canceled)]
    #[case::time_out(TaskState::Running, TaskState::TimedOut)]
    fn legal_transitions(#[case] from: TaskState, #[case] to: TaskState) {
        assert!(from.can_transition_to(to));
    }

    #[rstest]
    #[case::finish_without_running(TaskState::Waiting, TaskState::Finished)]
    #[case::restart(TaskState::Running, TaskState::Waiting)]
    #[case::skip_running(TaskState::Running, TaskState::Skipped)]
    fn illegal_transitions(#[case] from: TaskState, #[case] to: TaskState) {
        assert!(!from.can_transition_to(to));
    }

    #[test]
    fn terminal_states_never_move() {
        for from in TaskState::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in TaskState::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn parses_wire_names() {
        assert_eq!("timed_out".parse::<TaskState>(), Ok(TaskState::TimedOut));
        assert_eq!(
            serde_json::to_string(&TaskState::Canceled).unwrap(),
            "\"canceled\""
        );
        assert!("done".parse::<TaskState>().is_err());
    }
}
