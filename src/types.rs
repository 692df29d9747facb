//! Core identifier types

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

/// Unique identifier for a namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceId(pub Uuid);

impl NamespaceId {
    /// Generate a new namespace ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from string
    pub fn parse_str(s: &str) -> EngineResult<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| EngineError::InvalidArgument(format!("invalid namespace ID: {}", e)))
    }
}

impl Default for NamespaceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for one run of a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new run ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from string
    pub fn parse_str(s: &str) -> EngineResult<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| EngineError::InvalidArgument(format!("invalid run ID: {}", e)))
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// User-chosen workflow identifier, unique per open execution within a namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub String);

impl WorkflowId {
    /// Wrap a caller-supplied identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random identifier for callers that did not supply one
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkflowId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identity of a polling worker or a history host
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerIdentity(pub String);

impl WorkerIdentity {
    /// Wrap an explicit identity
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Hostname-derived identity with a random suffix to disambiguate
    /// multiple processes on one machine
    pub fn local() -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "capstan".to_string());
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}", host, &suffix[..8]))
    }

    /// The raw identity
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wall-clock deadline `d` after `from`, saturating on overflow
pub(crate) fn deadline_after(from: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    match ChronoDuration::from_std(d) {
        Ok(cd) => from + cd,
        Err(_) => DateTime::<Utc>::MAX_UTC,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_round_trip() {
        let id = RunId::new();
        let parsed = RunId::parse_str(&id.to_string()).expect("parse failed");
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_workflow_id_display() {
        let id = WorkflowId::new("order-1");
        assert_eq!(id.to_string(), "order-1");
    }

    #[test]
    fn test_deadline_after_saturates() {
        let far = deadline_after(Utc::now(), Duration::from_secs(u64::MAX));
        assert_eq!(far, DateTime::<Utc>::MAX_UTC);
    }
}
