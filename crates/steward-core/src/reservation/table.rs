//! ReservationTable - reservation manager の束縛表
//!
//! I/O も時計も持たない純粋な帳簿です。`super` の actor が生存 worker 名と新しいレーン ID を渡し、
//! 表が求めるレーン操作を実行します。

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::Serialize;

use crate::domain::{LaneId, ReservationKey, TaskId};
use crate::error::{Result, StewardError};

/// Reservation は予約中のリソース 1 つ。専用レーンで worker に束縛される
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reservation {
    pub lane: LaneId,
    pub worker_name: String,
    /// このキーを保持しているルーティング済みタスク数
    pub num_reservations: usize,
}

/// ParkedRetry は `ReservationTable::retry_parked` の結果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParkedRetry {
    pub placed: Vec<Placement>,
    /// 実行可能だが、載せられる生存 worker がない
    pub stranded: Vec<TaskId>,
}

#[derive(Debug, Clone)]
struct RoutedTask {
    lane: LaneId,
    keys: Vec<ReservationKey>,
}

#[derive(Debug, Clone)]
struct ParkedTask {
    task_id: TaskId,
    keys: Vec<ReservationKey>,
}

/// Placement はタスクの行き先
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub task_id: TaskId,
    pub lane: LaneId,
    pub worker_name: String,
    /// この配置で開いたレーン。すべて `worker_name` の所有
    pub opened: Vec<LaneId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    Place(Placement),
    Park,
}

/// Reassignment は 1 worker の予約を破棄した結果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reassignment {
    pub closed: Vec<LaneId>,
    pub discarded: Vec<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReservationEntry {
    pub key: ReservationKey,
    #[serde(flatten)]
    pub reservation: Reservation,
}

/// ReservationSnapshot は観測用の表のコピー
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReservationSnapshot {
    pub reservations: Vec<ReservationEntry>,
    pub parked: Vec<TaskId>,
}

impl ReservationSnapshot {
    pub fn get(&self, key: &ReservationKey) -> Option<&Reservation> {
        self.reservations
            .iter()
            .find(|e| &e.key == key)
            .map(|e| &e.reservation)
    }

    /// `worker_name` が所有する予約数
    pub fn owned_by(&self, worker_name: &str) -> usize {
        self.reservations
            .iter()
            .filter(|e| e.reservation.worker_name == worker_name)
            .count()
    }
}

#[derive(Debug, Default)]
pub struct ReservationTable {
    reservations: BTreeMap<ReservationKey, Reservation>,
    routed: HashMap<TaskId, RoutedTask>,
    parked: VecDeque<ParkedTask>,
}

impl ReservationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// `task_id` をルーティングするか保留する
    ///
    /// `keys` は空でなく、タグ順であること。タスクは最後の（最も具体的な）
    /// キーのレーンへ行く。
    pub fn acquire(
        &mut self,
        task_id: TaskId,
        keys: Vec<ReservationKey>,
        live_workers: &[String],
        new_lane: impl FnMut() -> LaneId,
    ) -> Result<Plan> {
        if keys.is_empty() {
            return Err(StewardError::Other(format!(
                "task {task_id} acquired no reservation keys"
            )));
        }

        // 同じリソースを待つ保留タスクを追い越さない
        let blocked = self
            .parked
            .iter()
            .any(|p| p.keys.iter().any(|k| keys.contains(k)));
        if blocked {
            self.parked.push_back(ParkedTask { task_id, keys });
            return Ok(Plan::Park);
        }

        match self.try_place(task_id, &keys, live_workers, new_lane)? {
            Some(placement) => Ok(Plan::Place(placement)),
            None => {
                self.parked.push_back(ParkedTask { task_id, keys });
                Ok(Plan::Park)
            }
        }
    }

    /// 競合の解けた保留タスクを古い順に配置
    ///
    /// 競合は解けたが生存 worker がいないタスクは保留のまま残し、
    /// `stranded` で報告する。
    pub fn retry_parked(
        &mut self,
        live_workers: &[String],
        mut new_lane: impl FnMut() -> LaneId,
    ) -> ParkedRetry {
        let mut retry = ParkedRetry::default();
        let mut still_parked = VecDeque::new();
        let mut held: HashSet<ReservationKey> = HashSet::new();

        while let Some(parked) = self.parked.pop_front() {
            let behind_earlier = parked.keys.iter().any(|k| held.contains(k));
            let placement = if behind_earlier {
                None
            } else {
                match self.try_place(parked.task_id, &parked.keys, live_workers, &mut new_lane) {
                    Ok(placement) => placement,
                    Err(_) => {
                        retry.stranded.push(parked.task_id);
                        None
                    }
                }
            };

            match placement {
                Some(placement) => retry.placed.push(placement),
                None => {
                    held.extend(parked.keys.iter().cloned());
                    still_parked.push_back(parked);
                }
            }
        }

        self.parked = still_parked;
        retry
    }

    fn try_place(
        &mut self,
        task_id: TaskId,
        keys: &[ReservationKey],
        live_workers: &[String],
        mut new_lane: impl FnMut() -> LaneId,
    ) -> Result<Option<Placement>> {
        let owners: HashSet<&str> = keys
            .iter()
            .filter_map(|k| self.reservations.get(k))
            .map(|r| r.worker_name.as_str())
            .collect();

        if owners.len() > 1 {
            return Ok(None);
        }
        let worker_name = match owners.into_iter().next() {
            Some(owner) => owner.to_string(),
            None => self.least_loaded(live_workers)?,
        };

        let mut opened = Vec::new();
        for key in keys {
            let reservation = self.reservations.entry(key.clone()).or_insert_with(|| {
                let lane = new_lane();
                opened.push(lane);
                Reservation {
                    lane,
                    worker_name: worker_name.clone(),
                    num_reservations: 0,
                }
            });
            reservation.num_reservations += 1;
        }

        let lane = keys
            .last()
            .and_then(|k| self.reservations.get(k))
            .map(|r| r.lane)
            .ok_or_else(|| StewardError::Other(format!("task {task_id} has no lane")))?;

        self.routed.insert(
            task_id,
            RoutedTask {
                lane,
                keys: keys.to_vec(),
            },
        );

        Ok(Some(Placement {
            task_id,
            lane,
            worker_name,
            opened,
        }))
    }

    fn least_loaded(&self, live_workers: &[String]) -> Result<String> {
        live_workers
            .iter()
            .map(|name| (self.load(name), name))
            .min()
            .map(|(_, name)| name.clone())
            .ok_or(StewardError::NoAvailableWorker)
    }

    fn load(&self, worker_name: &str) -> usize {
        self.reservations
            .values()
            .filter(|r| r.worker_name == worker_name)
            .count()
    }

    /// ルーティング済みタスクの push 先レーン
    pub fn lane_of(&self, task_id: TaskId) -> Option<LaneId> {
        self.routed.get(&task_id).map(|r| r.lane)
    }

    /// 保留タスクを外す。保留されていなければ `false`
    pub fn unpark(&mut self, task_id: TaskId) -> bool {
        let before = self.parked.len();
        self.parked.retain(|p| p.task_id != task_id);
        self.parked.len() != before
    }

    /// タスクのキーを返す。予約がなくなったレーンを返す
    pub fn release(&mut self, task_id: TaskId) -> Vec<LaneId> {
        let Some(routed) = self.routed.remove(&task_id) else {
            self.unpark(task_id);
            return Vec::new();
        };

        let mut closed = Vec::new();
        for key in &routed.keys {
            let Some(reservation) = self.reservations.get_mut(key) else {
                continue;
            };
            reservation.num_reservations = reservation.num_reservations.saturating_sub(1);
            if reservation.num_reservations == 0 {
                closed.push(reservation.lane);
                self.reservations.remove(key);
            }
        }
        closed
    }

    /// `worker_name` の所有物をすべて破棄
    pub fn reassign(&mut self, worker_name: &str) -> Reassignment {
        let dropped: Vec<ReservationKey> = self
            .reservations
            .iter()
            .filter(|(_, r)| r.worker_name == worker_name)
            .map(|(k, _)| k.clone())
            .collect();

        let mut closed = Vec::new();
        for key in &dropped {
            if let Some(reservation) = self.reservations.remove(key) {
                closed.push(reservation.lane);
            }
        }

        let mut discarded: Vec<TaskId> = self
            .routed
            .iter()
            .filter(|(_, r)| r.keys.iter().any(|k| dropped.contains(k)))
            .map(|(id, _)| *id)
            .collect();
        discarded.sort();
        for id in &discarded {
            self.routed.remove(id);
        }

        Reassignment { closed, discarded }
    }

    pub fn snapshot(&self) -> ReservationSnapshot {
        ReservationSnapshot {
            reservations: self
                .reservations
                .iter()
                .map(|(key, reservation)| ReservationEntry {
                    key: key.clone(),
                    reservation: reservation.clone(),
                })
                .collect(),
            parked: self.parked.iter().map(|p| p.task_id).collect(),
        }
    }

    pub fn has_parked(&self) -> bool {
        !self.parked.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.reservations.is_empty() && self.routed.is_empty() && self.parked.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ResourceTag;
    use ulid::Ulid;

    fn key(repo: &str) -> ReservationKey {
        ResourceTag::repository(repo).reservation_key()
    }

    fn task() -> TaskId {
        TaskId::from_ulid(Ulid::new())
    }

    fn lanes() -> impl FnMut() -> LaneId {
        || LaneId::from_ulid(Ulid::new())
    }

    fn workers(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn placed(plan: Plan) -> Placement {
        match plan {
            Plan::Place(p) => p,
            Plan::Park => panic!("expected placement, task was parked"),
        }
    }

    #[test]
    fn same_resource_reuses_worker_and_lane() {
        let mut table = ReservationTable::new();
        let live = workers(&["w-1", "w-2"]);

        let a = placed(table.acquire(task(), vec![key("foo")], &live, lanes()).unwrap());
        let b = placed(table.acquire(task(), vec![key("foo")], &live, lanes()).unwrap());

        assert_eq!(a.lane, b.lane);
        assert_eq!(a.worker_name, b.worker_name);
        assert_eq!(a.opened.len(), 1);
        assert!(b.opened.is_empty());
        assert_eq!(
            table.snapshot().get(&key("foo")).unwrap().num_reservations,
            2
        );
    }

    #[test]
    fn new_resources_spread_by_load_then_name() {
        let mut table = ReservationTable::new();
        let live = workers(&["w-2", "w-1"]);

        let foo = placed(table.acquire(task(), vec![key("foo")], &live, lanes()).unwrap());
        let bar = placed(table.acquire(task(), vec![key("bar")], &live, lanes()).unwrap());
        let baz = placed(table.acquire(task(), vec![key("baz")], &live, lanes()).unwrap());

        assert_eq!(foo.worker_name, "w-1");
        assert_eq!(bar.worker_name, "w-2");
        assert_eq!(baz.worker_name, "w-1");
    }

    #[test]
    fn no_live_worker_is_an_error() {
        let mut table = ReservationTable::new();
        let err = table
            .acquire(task(), vec![key("foo")], &[], lanes())
            .unwrap_err();
        assert!(matches!(err, StewardError::NoAvailableWorker));
        assert!(table.is_empty());
    }

    #[test]
    fn most_specific_key_picks_the_lane() {
        let mut table = ReservationTable::new();
        let live = workers(&["w-1"]);
        let importer = ResourceTag::new(crate::domain::ResourceKind::RepositoryImporter, "yum")
            .reservation_key();

        let p = placed(
            table
                .acquire(task(), vec![key("foo"), importer.clone()], &live, lanes())
                .unwrap(),
        );
        assert_eq!(p.opened.len(), 2);
        assert_eq!(p.lane, table.snapshot().get(&importer).unwrap().lane);
    }

    #[test]
    fn release_is_refcounted_and_idempotent() {
        let mut table = ReservationTable::new();
        let live = workers(&["w-1"]);
        let (a, b) = (task(), task());
        let lane = placed(table.acquire(a, vec![key("foo")], &live, lanes()).unwrap()).lane;
        table.acquire(b, vec![key("foo")], &live, lanes()).unwrap();

        assert!(table.release(a).is_empty());
        assert!(table.release(a).is_empty());
        assert_eq!(table.release(b), vec![lane]);
        assert!(table.is_empty());
    }

    #[test]
    fn conflicting_owners_park_until_release() {
        let mut table = ReservationTable::new();
        let live = workers(&["w-1", "w-2"]);
        let (on_foo, on_bar, both) = (task(), task(), task());

        let foo = placed(table.acquire(on_foo, vec![key("foo")], &live, lanes()).unwrap());
        let bar = placed(table.acquire(on_bar, vec![key("bar")], &live, lanes()).unwrap());
        assert_ne!(foo.worker_name, bar.worker_name);

        let plan = table
            .acquire(both, vec![key("foo"), key("bar")], &live, lanes())
            .unwrap();
        assert_eq!(plan, Plan::Park);

        // 保留タスクと `foo` を共有するので、その後ろに並ぶ
        let late = task();
        assert_eq!(
            table.acquire(late, vec![key("foo")], &live, lanes()).unwrap(),
            Plan::Park
        );
        assert_eq!(table.snapshot().parked, vec![both, late]);

        // まだ何も変わっていない。競合したまま
        assert_eq!(table.retry_parked(&live, lanes()), ParkedRetry::default());

        table.release(on_bar);
        let placed = table.retry_parked(&live, lanes()).placed;
        let order: Vec<TaskId> = placed.iter().map(|p| p.task_id).collect();
        assert_eq!(order, vec![both, late]);
        assert!(placed.iter().all(|p| p.worker_name == foo.worker_name));
        assert!(table.snapshot().parked.is_empty());
    }

    #[test]
    fn parked_task_without_live_worker_is_stranded_not_lost() {
        let mut table = ReservationTable::new();
        let live = workers(&["w-1", "w-2"]);
        let (on_foo, on_bar, both) = (task(), task(), task());
        placed(table.acquire(on_foo, vec![key("foo")], &live, lanes()).unwrap());
        placed(table.acquire(on_bar, vec![key("bar")], &live, lanes()).unwrap());
        assert_eq!(
            table.acquire(both, vec![key("foo"), key("bar")], &live, lanes()).unwrap(),
            Plan::Park
        );

        table.release(on_foo);
        table.release(on_bar);
        let retry = table.retry_parked(&[], lanes());
        assert!(retry.placed.is_empty());
        assert_eq!(retry.stranded, vec![both]);
        assert_eq!(table.snapshot().parked, vec![both]);

        let retry = table.retry_parked(&workers(&["w-3"]), lanes());
        assert_eq!(retry.placed.len(), 1);
        assert_eq!(retry.placed[0].worker_name, "w-3");
        assert!(retry.stranded.is_empty());
    }

    #[test]
    fn reassign_drops_worker_reservations_and_tasks() {
        let mut table = ReservationTable::new();
        let live = workers(&["w-1", "w-2"]);
        let (a, b, c) = (task(), task(), task());

        let pa = placed(table.acquire(a, vec![key("foo")], &live, lanes()).unwrap());
        table.acquire(b, vec![key("foo")], &live, lanes()).unwrap();
        let pc = placed(table.acquire(c, vec![key("bar")], &live, lanes()).unwrap());
        assert_eq!(pa.worker_name, "w-1");
        assert_eq!(pc.worker_name, "w-2");

        let mut expected = vec![a, b];
        expected.sort();
        let result = table.reassign("w-1");
        assert_eq!(result.closed, vec![pa.lane]);
        assert_eq!(result.discarded, expected);

        // 消失した worker からの遅れた解放は無害
        assert!(table.release(a).is_empty());
        let snapshot = table.snapshot();
        assert_eq!(snapshot.owned_by("w-1"), 0);
        assert_eq!(snapshot.owned_by("w-2"), 1);
    }

    #[test]
    fn unpark_removes_only_parked_tasks() {
        let mut table = ReservationTable::new();
        let live = workers(&["w-1", "w-2"]);
        let (a, b, parked) = (task(), task(), task());
        table.acquire(a, vec![key("foo")], &live, lanes()).unwrap();
        table.acquire(b, vec![key("bar")], &live, lanes()).unwrap();
        table
            .acquire(parked, vec![key("foo"), key("bar")], &live, lanes())
            .unwrap();

        assert!(!table.unpark(a));
        assert!(table.unpark(parked));
        assert!(table.snapshot().parked.is_empty());
    }
}
