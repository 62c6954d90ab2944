//! Global Constants
//!
//! Centralized constants for configuration and tuning.
//! All magic numbers should be defined here with documentation.

/// HTTP/Network constants
pub mod network {
    /// Default backend base URL for stage calls
    pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000/api/v1";

    /// Default stage request timeout (seconds)
    ///
    /// Stage calls wrap full LLM generations, so this is generous.
    pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

    /// Connection timeout (seconds)
    pub const CONNECTION_TIMEOUT_SECS: u64 = 30;
}

/// Streaming channel constants
pub mod stream {
    /// Default WebSocket endpoint for streamed stage work
    pub const DEFAULT_WS_URL: &str = "ws://localhost:8000/ws/generate";

    /// Maximum automatic reconnect attempts before the session closes
    pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

    /// Fixed wait between reconnect attempts (milliseconds)
    pub const RECONNECT_INTERVAL_MS: u64 = 3000;

    /// Error code used when a wire error frame carries no code
    pub const DEFAULT_ERROR_CODE: &str = "STREAM_ERROR";
}

/// Upload constants
pub mod upload {
    /// Maximum upload size (10 MiB)
    pub const MAX_SIZE_BYTES: u64 = 10 * 1024 * 1024;

    /// Read size for chunked bodies (256 KiB)
    pub const CHUNK_SIZE: usize = 256 * 1024;

    /// Document formats accepted by the requirement endpoint
    pub const ALLOWED_EXTENSIONS: &[&str] = &["doc", "docx", "pdf", "md", "xls", "xlsx", "txt"];

    /// Progress ceiling while bytes are in flight; 100 is reserved for a confirmed response
    pub const IN_FLIGHT_PROGRESS_CAP: u8 = 99;
}

/// Session constants
pub mod session {
    /// Server-side session lifetime (hours)
    pub const TTL_HOURS: u64 = 24;

    /// Keep the working set when the backend reports an expired session
    pub const RETAIN_WORKING_SET_ON_EXPIRY: bool = true;
}

/// Pipeline constants
pub mod pipeline {
    /// Buffered pipeline events per subscriber before lagging
    pub const EVENT_CHANNEL_CAPACITY: usize = 256;

    /// Default project name for code export
    pub const DEFAULT_PROJECT_NAME: &str = "test_automation";
}
