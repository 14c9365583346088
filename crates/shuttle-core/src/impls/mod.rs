//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryTaskStore**: テスト・単一プロセス用の正本
//! - **FsTaskStore**: ディレクトリ上の JSON レコード（atomic rename）
//! - **PollChannel / PushChannel / HybridChannel**: ActivationChannel
//! - **InMemoryPushTransport**: プロセス内 pub/sub
//! - **BroadcastEventSink**: tokio broadcast による DomainEvent 配信

pub(crate) mod atomic_file;
pub mod broadcast_events;
pub mod fs_store;
pub mod hybrid_channel;
pub mod inmem_push;
pub mod memory_store;
pub mod poll_channel;
pub mod push_channel;

pub use self::broadcast_events::BroadcastEventSink;
pub use self::fs_store::FsTaskStore;
pub use self::hybrid_channel::HybridChannel;
pub use self::inmem_push::InMemoryPushTransport;
pub use self::memory_store::InMemoryTaskStore;
pub use self::poll_channel::PollChannel;
pub use self::push_channel::PushChannel;
