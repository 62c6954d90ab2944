//! Configuration Types
//!
//! All configuration structures with sensible defaults.
//! Supports global (~/.config/testflow/) and project (.testflow/) level configuration.

use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::constants::{network, session, stream, upload};
use crate::pipeline::Stage;
use crate::types::{FlowError, Result};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration version
    pub version: String,

    /// Stage REST calls
    pub api: ApiConfig,

    /// Streaming channel settings
    pub stream: StreamConfig,

    /// Document upload settings
    pub upload: UploadConfig,

    /// Session management settings
    pub session: SessionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            api: ApiConfig::default(),
            stream: StreamConfig::default(),
            upload: UploadConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl Config {
    /// Validate configuration values are within acceptable ranges.
    /// Returns `FlowError::Config` on validation failure.
    pub fn validate(&self) -> Result<()> {
        let api_url = url::Url::parse(&self.api.base_url)
            .map_err(|e| FlowError::Config(format!("api.base_url is invalid: {}", e)))?;
        if !matches!(api_url.scheme(), "http" | "https") {
            return Err(FlowError::Config(format!(
                "api.base_url must use http or https, got {}",
                api_url.scheme()
            )));
        }

        let ws_url = url::Url::parse(&self.stream.url)
            .map_err(|e| FlowError::Config(format!("stream.url is invalid: {}", e)))?;
        if !matches!(ws_url.scheme(), "ws" | "wss") {
            return Err(FlowError::Config(format!(
                "stream.url must use ws or wss, got {}",
                ws_url.scheme()
            )));
        }

        if self.api.timeout_secs == 0 {
            return Err(FlowError::Config(
                "api.timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.upload.chunk_size == 0 {
            return Err(FlowError::Config(
                "upload.chunk_size must be greater than 0".to_string(),
            ));
        }

        if self.upload.max_size_bytes == 0 {
            return Err(FlowError::Config(
                "upload.max_size_bytes must be greater than 0".to_string(),
            ));
        }

        if self.session.ttl_hours == 0 {
            return Err(FlowError::Config(
                "session.ttl_hours must be greater than 0".to_string(),
            ));
        }

        if self
            .stream
            .streaming_stages
            .iter()
            .any(|s| matches!(s, Stage::Input | Stage::Export))
        {
            return Err(FlowError::Config(
                "stream.streaming_stages may only list analysis, scenarios, cases, code, quality"
                    .to_string(),
            ));
        }

        Ok(())
    }
}

// =============================================================================
// API Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL for stage calls, e.g. `http://host:8000/api/v1`
    pub base_url: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Bearer token; never written back out
    #[serde(skip_serializing)]
    pub token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: network::DEFAULT_API_BASE_URL.to_string(),
            timeout_secs: network::DEFAULT_TIMEOUT_SECS,
            token: None,
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Configured token wrapped for redaction; empty counts as unset
    pub fn bearer_token(&self) -> Option<SecretString> {
        self.token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .map(|t| SecretString::from(t.to_string()))
    }
}

// =============================================================================
// Stream Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// WebSocket endpoint, e.g. `ws://host:8000/ws/generate`
    pub url: String,

    /// Reconnects allowed after an unexpected close
    pub max_reconnect_attempts: u32,

    /// Fixed wait between reconnects in milliseconds
    pub reconnect_interval_ms: u64,

    /// Stages whose unit of work runs over the streaming channel
    pub streaming_stages: Vec<Stage>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: stream::DEFAULT_WS_URL.to_string(),
            max_reconnect_attempts: stream::MAX_RECONNECT_ATTEMPTS,
            reconnect_interval_ms: stream::RECONNECT_INTERVAL_MS,
            streaming_stages: Vec::new(),
        }
    }
}

impl StreamConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn streams(&self, stage: Stage) -> bool {
        self.streaming_stages.contains(&stage)
    }
}

// =============================================================================
// Upload Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Maximum accepted file size in bytes
    pub max_size_bytes: u64,

    /// Read size for chunked bodies; smaller files go as one part
    pub chunk_size: usize,

    /// Lowercase extensions without the dot
    pub allowed_extensions: Vec<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: upload::MAX_SIZE_BYTES,
            chunk_size: upload::CHUNK_SIZE,
            allowed_extensions: upload::ALLOWED_EXTENSIONS
                .iter()
                .map(|e| e.to_string())
                .collect(),
        }
    }
}

// =============================================================================
// Session Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Server-side session lifetime in hours
    pub ttl_hours: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_hours: session::TTL_HOURS,
        }
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.ttl_hours as i64)
    }
}

// =============================================================================
// Tests
// =============================================================================
