//! App - アプリケーション層
//!
//! ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **RuntimeBuilder / Runtime**: 設定からの構築とワイヤリング、背景ループの管理
//! - **Coordinator**: create / await / crash recovery
//! - **ActivationRouter**: worker ごとの TransportMode に応じた channel 選択
//! - **HeartbeatMonitor**: worker の生存記録
//! - **OrphanSweeper**: 放置 task の再配送・dead letter
//! - **TransportSelector**: metrics から Poll / Push を選ぶ
//! - **WorkerLoop**: 参照用 worker（claim→handle→complete）

pub mod builder;
pub mod coordinator;
pub mod heartbeat;
pub mod router;
pub mod runtime;
pub mod selector;
pub mod status;
pub mod sweeper;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, RuntimeBuilder};
pub use self::coordinator::Coordinator;
pub use self::heartbeat::HeartbeatMonitor;
pub use self::router::ActivationRouter;
pub use self::runtime::Runtime;
pub use self::selector::{ModeChange, TransportSelector};
pub use self::status::{StatusReport, TransportView, WorkerView};
pub use self::sweeper::{OrphanSweeper, SweepReport};
pub use self::worker_loop::{
    FnHandler, HandlerError, TaskHandler, WorkerHandle, WorkerLoop, handler_fn,
};
