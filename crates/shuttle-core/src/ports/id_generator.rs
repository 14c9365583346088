//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース。同一ミリ秒内でも単調増加するため、
//!   TaskId の順序がそのまま生成順になります（worker ごとの FIFO に利用）。

use std::sync::Mutex;

use ulid::{Generator, Ulid};

use crate::domain::TaskId;
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;
}

/// Clock を使って現在時刻ベースの ULID を生成します。
pub struct UlidGenerator<C> {
    clock: C,
    generator: Mutex<Generator>,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            generator: Mutex::new(Generator::new()),
        }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        let now = self.clock.now();
        let mut generator = self.generator.lock().unwrap_or_else(|e| e.into_inner());
        let ulid = generator
            .generate_from_datetime(now.into())
            // random 部分が溢れた場合のみ（同一ミリ秒に 2^80 個）
            .unwrap_or_else(|_| {
                Ulid::from_parts(now.timestamp_millis().max(0) as u64, rand::random())
            });
        TaskId::from(ulid)
    }
}
