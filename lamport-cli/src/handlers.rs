use serde::{Deserialize, Serialize};

use lamport_core::types::{CoordinatorState, Timestamp};

/// Longest deadline a caller may ask `/cs/acquire` for.
pub const MAX_ACQUIRE_TIMEOUT_MS: u64 = 10 * 60 * 1000;

// ─── Request Types ──────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct AcquireRequest {
    /// Omitted means the cluster default, which may be "wait forever".
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl AcquireRequest {
    pub fn validate(&self) -> Result<(), String> {
        match self.timeout_ms {
            Some(0) => Err("timeout_ms must be greater than 0".to_string()),
            Some(ms) if ms > MAX_ACQUIRE_TIMEOUT_MS => Err(format!(
                "timeout_ms must be at most {}",
                MAX_ACQUIRE_TIMEOUT_MS
            )),
            _ => Ok(()),
        }
    }
}

// ─── Response Types ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: u32,
    pub peers: usize,
    pub version: String,
}

#[derive(Serialize)]
pub struct TimestampResponse {
    pub timestamp: Timestamp,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub state: CoordinatorState,
}

#[derive(Serialize)]
pub struct StateResponse {
    pub state: CoordinatorState,
}
