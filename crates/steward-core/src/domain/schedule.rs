//! Schedule / ScheduledCall - 定期投入
//!
//! `Schedule` は ISO 8601 の repeating interval、`[R[n]/][start/]duration` です。
//!
//! - `PT30M`: 30 分ごと、今から
//! - `R5/P1D`: 1 日 1 回、5 回まで
//! - `R/2024-06-01T02:00:00Z/P1W`: 指定時刻から毎週
//!
//! 期間に使えるのは週・日・時・分・秒です。年と月は長さが一定しないため拒否します。
//!
//! # ScheduledCall
//! - 時刻が来るたびに payload を投入し、`remaining_runs` を減らす
//! - 取りこぼした枠は後から埋めずに飛ばす
//! - `failure_threshold` 回続けて ERROR で終わると自動で無効化

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ScheduleId, TaskId};
use super::payload::PayloadRef;
use super::state::TaskState;
use super::tags::ResourceTag;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid schedule {value:?}: {reason}")]
pub struct ScheduleError {
    pub value: String,
    pub reason: &'static str,
}

impl ScheduleError {
    fn new(value: &str, reason: &'static str) -> Self {
        Self {
            value: value.to_string(),
            reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Schedule {
    interval: Duration,
    start: Option<DateTime<Utc>>,
    runs: Option<u32>,
}

impl Schedule {
    /// 作成時から `interval` ごとに無期限に発火するスケジュール。
    /// 秒未満は切り捨てる。
    pub fn every(interval: Duration) -> Result<Self, ScheduleError> {
        let interval = Duration::seconds(interval.num_seconds());
        if interval <= Duration::zero() {
            return Err(ScheduleError::new(
                &format_duration(interval),
                "interval must be positive",
            ));
        }
        Ok(Self {
            interval,
            start: None,
            runs: None,
        })
    }

    pub fn starting_at(mut self, start: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self
    }

    pub fn times(mut self, runs: u32) -> Self {
        self.runs = Some(runs);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.start
    }

    /// 総実行回数。`None` は無限
    pub fn runs(&self) -> Option<u32> {
        self.runs
    }
}

impl FromStr for Schedule {
    type Err = ScheduleError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let mut parts: Vec<&str> = raw.split('/').collect();
        if parts.len() > 3 {
            return Err(ScheduleError::new(raw, "too many '/' separated parts"));
        }

        let mut runs = None;
        if let Some(first) = parts.first().copied()
            && let Some(count) = first.strip_prefix('R')
        {
            if !count.is_empty() {
                let count: u32 = count
                    .parse()
                    .map_err(|_| ScheduleError::new(raw, "repeat count is not a number"))?;
                if count == 0 {
                    return Err(ScheduleError::new(raw, "repeat count must be at least 1"));
                }
                runs = Some(count);
            }
            parts.remove(0);
        }

        let (start, duration) = match parts.as_slice() {
            [duration] => (None, *duration),
            [start, duration] => {
                let start = DateTime::parse_from_rfc3339(start)
                    .map_err(|_| ScheduleError::new(raw, "start is not an RFC 3339 timestamp"))?
                    .with_timezone(&Utc);
                (Some(start), *duration)
            }
            _ => return Err(ScheduleError::new(raw, "missing duration")),
        };

        let interval = parse_duration(duration).map_err(|reason| ScheduleError::new(raw, reason))?;
        Ok(Self {
            interval,
            start,
            runs,
        })
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.runs {
            Some(runs) => write!(f, "R{runs}/")?,
            None if self.start.is_some() => f.write_str("R/")?,
            None => {}
        }
        if let Some(start) = self.start {
            write!(f, "{}/", start.to_rfc3339_opts(SecondsFormat::AutoSi, true))?;
        }
        f.write_str(&format_duration(self.interval))
    }
}

impl TryFrom<String> for Schedule {
    type Error = ScheduleError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<Schedule> for String {
    fn from(schedule: Schedule) -> Self {
        schedule.to_string()
    }
}

fn parse_duration(raw: &str) -> Result<Duration, &'static str> {
    let body = raw.strip_prefix('P').ok_or("duration must start with 'P'")?;
    let (date, time) = match body.split_once('T') {
        Some((_, "")) => return Err("empty time part after 'T'"),
        Some((date, time)) => (date, Some(time)),
        None => (body, None),
    };

    let mut seconds = sum_fields(date, &[('W', 604_800), ('D', 86_400)])?;
    if let Some(time) = time {
        seconds = seconds
            .checked_add(sum_fields(time, &[('H', 3_600), ('M', 60), ('S', 1)])?)
            .ok_or("duration is too long")?;
    }
    if seconds == 0 {
        return Err("interval must be positive");
    }
    Duration::try_seconds(seconds).ok_or("duration is too long")
}

/// `<n><unit>` を合計する。単位は与えた順に、各 1 回まで
fn sum_fields(part: &str, units: &[(char, i64)]) -> Result<i64, &'static str> {
    let mut total: i64 = 0;
    let mut digits = String::new();
    let mut next_unit = 0;
    for c in part.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        if c == 'Y' || (c == 'M' && units[0].0 == 'W') {
            return Err("years and months are not supported");
        }
        let offset = units[next_unit..]
            .iter()
            .position(|(unit, _)| *unit == c)
            .ok_or("unknown or out-of-order duration unit")?;
        let (_, scale) = units[next_unit + offset];
        next_unit += offset + 1;

        let value: i64 = digits.parse().map_err(|_| "duration unit without a number")?;
        digits.clear();
        total = value
            .checked_mul(scale)
            .and_then(|v| total.checked_add(v))
            .ok_or("duration is too long")?;
    }
    if !digits.is_empty() {
        return Err("trailing number without a unit");
    }
    Ok(total)
}

fn format_duration(interval: Duration) -> String {
    let total = interval.num_seconds();
    let (days, rest) = (total / 86_400, total % 86_400);
    let (hours, minutes, seconds) = (rest / 3_600, rest % 3_600 / 60, rest % 60);

    let mut out = String::from("P");
    if days != 0 {
        out.push_str(&format!("{days}D"));
    }
    if rest != 0 || days == 0 {
        out.push('T');
        if hours != 0 {
            out.push_str(&format!("{hours}H"));
        }
        if minutes != 0 {
            out.push_str(&format!("{minutes}M"));
        }
        if seconds != 0 || rest == 0 {
            out.push_str(&format!("{seconds}S"));
        }
    }
    out
}

/// ScheduledCall はスケジュールに従って投入される payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledCall {
    pub schedule_id: ScheduleId,
    pub schedule: Schedule,
    pub payload: PayloadRef,
    pub resource_tags: Vec<ResourceTag>,
    pub enabled: bool,
    /// 残り回数。`None` は無限
    pub remaining_runs: Option<u32>,
    /// この回数 ERROR が続くと無効化。`None` なら無効化しない
    pub failure_threshold: Option<u32>,
    pub consecutive_failures: u32,
    pub total_run_count: u32,
    pub first_run: DateTime<Utc>,
    /// 実行が残っていなければ `None`
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    /// 結果をまだ数えていない投入済みタスク。古い順
    pub pending: Vec<TaskId>,
}

impl ScheduledCall {
    pub fn new(
        schedule_id: ScheduleId,
        schedule: Schedule,
        payload: PayloadRef,
        resource_tags: Vec<ResourceTag>,
        failure_threshold: Option<u32>,
        now: DateTime<Utc>,
    ) -> Self {
        let first_run = schedule.start().unwrap_or(now);
        Self {
            schedule_id,
            remaining_runs: schedule.runs(),
            schedule,
            payload,
            resource_tags,
            enabled: true,
            failure_threshold,
            consecutive_failures: 0,
            total_run_count: 0,
            first_run,
            next_run: Some(first_run),
            last_run: None,
            pending: Vec::new(),
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run.is_some_and(|at| at <= now)
    }

    /// `now` の実行を 1 回数え、`next_run` を `now` より後の最初の枠へ進める。
    /// コーディネータが忙しかった・止まっていた間の枠は再実行せず飛ばす。
    pub fn record_dispatch(&mut self, task_id: Option<TaskId>, now: DateTime<Utc>) {
        self.total_run_count = self.total_run_count.saturating_add(1);
        self.last_run = Some(now);
        if let Some(task_id) = task_id {
            self.pending.push(task_id);
        }

        if let Some(remaining) = self.remaining_runs.as_mut() {
            *remaining = remaining.saturating_sub(1);
        }
        self.next_run = match self.remaining_runs {
            Some(0) => None,
            _ => self.next_slot_after(now),
        };
        if self.next_run.is_none() {
            self.enabled = false;
        }
    }

    /// 終わった実行を数える。この結果で無効化したら true
    pub fn record_outcome(&mut self, state: TaskState) -> bool {
        match state {
            TaskState::Error => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                let reached = self
                    .failure_threshold
                    .is_some_and(|threshold| self.consecutive_failures >= threshold);
                if reached && self.enabled {
                    self.enabled = false;
                    return true;
                }
                false
            }
            TaskState::Finished => {
                self.consecutive_failures = 0;
                false
            }
            _ => false,
        }
    }

    /// 再有効化で失敗カウントをリセット
    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled && !self.enabled {
            self.consecutive_failures = 0;
        }
        self.enabled = enabled;
    }

    fn next_slot_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let base = self.next_run?;
        let step = self.schedule.interval().num_milliseconds().max(1);
        let behind = now.signed_duration_since(base).num_milliseconds().max(0);
        let slots = behind / step + 1;
        let offset = Duration::try_milliseconds(slots.checked_mul(step)?)?;
        base.checked_add_signed(offset)
    }
}
