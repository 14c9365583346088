//! WorkerName - worker キュー名
//!
//! 1 worker = 1 queue。名前はファイルシステム上のディレクトリ名にもなるため、
//! 生成時に検証します。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::errors::ShuttleError;

const MAX_LEN: usize = 128;

/// Logical name of a worker queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkerName(String);

impl WorkerName {
    pub fn new(name: impl Into<String>) -> Result<Self, ShuttleError> {
        let name = name.into();
        validate(&name)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn validate(name: &str) -> Result<(), ShuttleError> {
    let invalid = |reason: &str| ShuttleError::InvalidWorkerName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("empty"));
    }
    if name.len() > MAX_LEN {
        return Err(invalid("longer than 128 bytes"));
    }
    if name.starts_with('.') {
        return Err(invalid("must not start with '.'"));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(invalid(&format!("character {c:?} not allowed")));
    }
    Ok(())
}

impl TryFrom<String> for WorkerName {
    type Error = ShuttleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<WorkerName> for String {
    fn from(value: WorkerName) -> Self {
        value.0
    }
}

impl FromStr for WorkerName {
    type Err = ShuttleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for WorkerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
