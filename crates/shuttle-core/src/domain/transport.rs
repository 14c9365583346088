//! Activation transport modes and the metrics used to pick one.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which activation channel serves a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    Push,
    Poll,
    Hybrid,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportMode::Push => "push",
            TransportMode::Poll => "poll",
            TransportMode::Hybrid => "hybrid",
        })
    }
}

impl FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(TransportMode::Push),
            "poll" => Ok(TransportMode::Poll),
            "hybrid" => Ok(TransportMode::Hybrid),
            other => Err(format!("unknown transport mode '{other}'")),
        }
    }
}

/// Rolling-window view of one worker's activation traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportMetrics {
    pub mean_activation_latency_ms: f64,
    pub tasks_per_minute: f64,
    pub current_queue_depth: u32,
}

/// Health of an activation channel as reported to the selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelHealth {
    Healthy,
    Degraded,
}
