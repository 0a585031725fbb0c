//! IdGenerator port - ID 生成の抽象化
//!
//! Job / Task / Node の ID は ULID。時刻部分は Clock から取るので、
//! テストでは FixedClock で timestamp を固定できる。

use ulid::Ulid;

use crate::domain::ids::{Id, IdMarker, JobId, NodeId, TaskId};
use crate::ports::Clock;

/// IdGenerator は分散環境で衝突しない ID を生成
///
/// 時刻でソート可能で、ノード間の調整は不要。
pub trait IdGenerator: Send + Sync {
    fn generate_job_id(&self) -> JobId;

    fn generate_task_id(&self) -> TaskId;

    fn generate_node_id(&self) -> NodeId;
}

/// ULID ベースの ID 生成器
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next<T: IdMarker>(&self) -> Id<T> {
        // pre-1970 clocks collapse to 0 rather than wrapping
        let timestamp_ms = u64::try_from(self.clock.now().timestamp_millis()).unwrap_or(0);
        Id::from_ulid(Ulid::from_parts(timestamp_ms, rand::random()))
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_job_id(&self) -> JobId {
        self.next()
    }

    fn generate_task_id(&self) -> TaskId {
        self.next()
    }

    fn generate_node_id(&self) -> NodeId {
        self.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn ulid_generator_generates_unique_ids() {
        let id_gen = UlidGenerator::new(SystemClock);

        let id1 = id_gen.generate_job_id();
        let id2 = id_gen.generate_job_id();
        let id3 = id_gen.generate_job_id();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn ulid_generator_with_fixed_clock_shares_timestamp() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(FixedClock::new(fixed_time));

        let id1 = id_gen.generate_task_id();
        let id2 = id_gen.generate_task_id();

        // ランダム部分があるので ID 自体は異なる
        assert_ne!(id1, id2);
        assert_eq!(id1.as_ulid().timestamp_ms(), id2.as_ulid().timestamp_ms());
        assert_eq!(
            id1.as_ulid().timestamp_ms(),
            fixed_time.timestamp_millis() as u64
        );
    }

    #[test]
    fn different_id_types_are_generated() {
        let id_gen = UlidGenerator::new(SystemClock);

        assert!(id_gen.generate_job_id().to_string().starts_with("job-"));
        assert!(id_gen.generate_task_id().to_string().starts_with("task-"));
        assert!(id_gen.generate_node_id().to_string().starts_with("node-"));
    }
}
