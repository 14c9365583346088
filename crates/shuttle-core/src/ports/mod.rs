//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」。各 trait は外部（永続化媒体、
//! push 通知の仕組み、時刻、ID 生成）への境界です。
//!
//! # 設計原則
//! - TaskStore が source of truth（正本）
//! - ActivationChannel は task_id を知らせるだけ（状態や payload は運ばない）

pub mod activation;
pub mod clock;
pub mod event_sink;
pub mod id_generator;
pub mod push_transport;
pub mod task_store;

pub use self::activation::{ActivationChannel, Subscription};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_sink::{EventSink, NoopEventSink};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::push_transport::{PushTransport, TransportError};
pub use self::task_store::{TaskCounts, TaskStore};
