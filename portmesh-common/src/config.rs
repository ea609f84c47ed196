//! Configuration types shared by the server and the agent

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Resource limits applied to decoded frames
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum frame size in bytes (default: 16MB)
    pub max_frame_bytes: u64,
    /// Maximum principal length in bytes
    pub max_principal_len: usize,
    /// Maximum credential length in bytes
    pub max_credential_len: usize,
    /// Maximum request or channel-type name length
    pub max_name_len: usize,
    /// Maximum payload carried by a single request or data frame
    pub max_payload_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 16 * 1024 * 1024, // 16MB
            max_principal_len: 256,
            max_credential_len: 256,
            max_name_len: 64,
            max_payload_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Liveness settings for tunnel connections
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveConfig {
    /// Interval between heartbeats sent by the dialing side
    pub heartbeat_interval: Duration,
    /// Silence after which the accepting side drops a connection
    pub session_timeout: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            session_timeout: Duration::from_secs(90),
        }
    }
}

/// Retry behaviour of the tunnel agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Fixed delay between two attempts of a retry task
    pub interval: Duration,
    /// Timeout for dialing a remote server
    pub connect_timeout: Duration,
    /// Timeout for a forwarding request reply
    pub request_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(crate::constants::DEFAULT_RETRY_INTERVAL_SECS),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}
