//! shuttle-core
//!
//! Task dispatch and worker activation.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, state, heartbeat, dead_letter, transport, errors, events）
//! - **ports**: 抽象化レイヤー（TaskStore, ActivationChannel, PushTransport, Clock, EventSink）
//! - **impls**: ports の実装（InMemory / Fs の TaskStore, Poll / Push / Hybrid channel）
//! - **app**: アプリケーションロジック（Coordinator, OrphanSweeper, TransportSelector, WorkerLoop, Runtime）
//! - **config**: TOML 設定

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
