//! Domain model (ids, task records, heartbeats, dead letters, events).

pub mod backoff;
pub mod dead_letter;
pub mod errors;
pub mod events;
pub mod heartbeat;
pub mod ids;
pub mod state;
pub mod task;
pub mod transport;
pub mod worker;

pub use self::backoff::BackoffPolicy;
pub use self::dead_letter::{DeadLetterEntry, DeadLetterReason};
pub use self::errors::{ErrorKind, ShuttleError, ShuttleResult};
pub use self::events::DomainEvent;
pub use self::heartbeat::{HeartbeatSnapshot, WorkerHeartbeat};
pub use self::ids::TaskId;
pub use self::state::TaskState;
pub use self::task::{Payload, Task};
pub use self::transport::{ChannelHealth, TransportMetrics, TransportMode};
pub use self::worker::WorkerName;
