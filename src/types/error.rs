//! Unified Error Type System
//!
//! Centralized error types for the entire crate.
//! Backend error signals are normalized into [`ClassifiedError`] values that
//! drive retry affordances and stage recovery.
//!
//! ## Severities
//!
//! - **Transient**: network blips, upstream LLM errors, timeouts (user retry or auto reconnect)
//! - **UserFixable**: validation, unsupported file, parse failure (no auto retry)
//! - **Fatal**: session expiry, unrecoverable decode corruption (restart from Input)

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::protocol::DecodeError;
use crate::transfer::TransferError;

// =============================================================================
// Error Codes
// =============================================================================

/// Backend and client error codes known to the classifier
pub mod codes {
    pub const SESSION_EXPIRED: &str = "SESSION_EXPIRED";
    pub const SESSION_ERROR: &str = "SESSION_ERROR";
    pub const LLM_API_ERROR: &str = "LLM_API_ERROR";
    pub const DOCUMENT_PARSE_ERROR: &str = "DOCUMENT_PARSE_ERROR";
    pub const KB_SEARCH_ERROR: &str = "KB_SEARCH_ERROR";
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const TIMEOUT_ERROR: &str = "TIMEOUT_ERROR";
    pub const INVALID_INPUT: &str = "INVALID_INPUT";
    pub const RESOURCE_NOT_FOUND: &str = "RESOURCE_NOT_FOUND";
    pub const FILE_SIZE_EXCEEDED: &str = "FILE_SIZE_EXCEEDED";
    pub const UNSUPPORTED_FILE_TYPE: &str = "UNSUPPORTED_FILE_TYPE";
    pub const SCRIPT_EXECUTION_ERROR: &str = "SCRIPT_EXECUTION_ERROR";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
    pub const INTERNAL_SERVER_ERROR: &str = "INTERNAL_SERVER_ERROR";
    pub const DECODE_ERROR: &str = "DECODE_ERROR";
    pub const INVALID_PAYLOAD: &str = "INVALID_PAYLOAD";
    pub const STREAM_RECONNECT_EXHAUSTED: &str = "STREAM_RECONNECT_EXHAUSTED";
    pub const NETWORK_ERROR: &str = "NETWORK_ERROR";
    pub const UNKNOWN_ERROR: &str = "UNKNOWN_ERROR";
}

// =============================================================================
// Severity
// =============================================================================

/// How a failure affects the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// May resolve on its own; eligible for retry
    Transient,
    /// Caller must change the input before trying again
    UserFixable,
    /// Session is unusable; restart from the Input stage
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::UserFixable => write!(f, "user_fixable"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

// =============================================================================
// Classified Error
// =============================================================================

/// Normalized failure with severity and retry guidance.
///
/// Only produced by [`ErrorClassifier`]; fields are read through accessors.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifiedError {
    code: String,
    human_message: String,
    severity: Severity,
    retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    http_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

impl ClassifiedError {
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Human-readable message suitable for display
    pub fn message(&self) -> &str {
        &self.human_message
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// Whether the UI should offer a retry affordance
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn http_status(&self) -> Option<u16> {
        self.http_status
    }

    /// Backend- or client-supplied specifics (e.g. the server message)
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// Structured `details` object from the backend error body
    pub fn details(&self) -> Option<&Value> {
        self.details.as_ref()
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal
    }

    pub fn is_session_expired(&self) -> bool {
        self.code == codes::SESSION_EXPIRED
    }

    pub(crate) fn with_detail(mut self, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        if !detail.is_empty() {
            self.detail = Some(detail);
        }
        self
    }

    pub(crate) fn with_details(mut self, details: Option<Value>) -> Self {
        self.details = details.filter(|v| !v.is_null());
        self
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(
                f,
                "[{}:{}] {} ({})",
                self.severity, self.code, self.human_message, detail
            ),
            None => write!(f, "[{}:{}] {}", self.severity, self.code, self.human_message),
        }
    }
}

impl std::error::Error for ClassifiedError {}

// =============================================================================
// Error Classifier
// =============================================================================

struct ErrorRule {
    code: &'static str,
    severity: Severity,
    retryable: bool,
    message: &'static str,
}

const fn rule(
    code: &'static str,
    severity: Severity,
    retryable: bool,
    message: &'static str,
) -> ErrorRule {
    ErrorRule {
        code,
        severity,
        retryable,
        message,
    }
}

// Append new codes; existing entries are part of the client contract.
const RULES: &[ErrorRule] = &[
    rule(
        codes::SESSION_EXPIRED,
        Severity::Fatal,
        false,
        "Your session has expired. Please start again from the requirement input.",
    ),
    rule(
        codes::LLM_API_ERROR,
        Severity::Transient,
        true,
        "The AI service failed to respond. Please try again.",
    ),
    rule(
        codes::DOCUMENT_PARSE_ERROR,
        Severity::UserFixable,
        false,
        "The document could not be read. Check the file and try another format.",
    ),
    rule(
        codes::KB_SEARCH_ERROR,
        Severity::Transient,
        true,
        "Knowledge base search failed; continuing without knowledge base context.",
    ),
    rule(
        codes::VALIDATION_ERROR,
        Severity::UserFixable,
        false,
        "The request is invalid. Review the highlighted input.",
    ),
    rule(
        codes::TIMEOUT_ERROR,
        Severity::Transient,
        true,
        "The operation timed out. Please try again.",
    ),
    rule(
        codes::SESSION_ERROR,
        Severity::UserFixable,
        false,
        "The session could not be used for this request.",
    ),
    rule(
        codes::INVALID_INPUT,
        Severity::UserFixable,
        false,
        "Provide requirement text, a document, or a URL.",
    ),
    rule(
        codes::RESOURCE_NOT_FOUND,
        Severity::UserFixable,
        false,
        "The requested resource was not found.",
    ),
    rule(
        codes::FILE_SIZE_EXCEEDED,
        Severity::UserFixable,
        false,
        "The file exceeds the upload size limit.",
    ),
    rule(
        codes::UNSUPPORTED_FILE_TYPE,
        Severity::UserFixable,
        false,
        "This file type is not supported.",
    ),
    rule(
        codes::SCRIPT_EXECUTION_ERROR,
        Severity::Transient,
        true,
        "A helper script failed on the server. Please try again.",
    ),
    rule(
        codes::INTERNAL_ERROR,
        Severity::Transient,
        true,
        "The server encountered an internal error. Please try again.",
    ),
    rule(
        codes::INTERNAL_SERVER_ERROR,
        Severity::Transient,
        true,
        "The server encountered an internal error. Please try again.",
    ),
    rule(
        codes::DECODE_ERROR,
        Severity::Fatal,
        false,
        "The server response could not be understood.",
    ),
    rule(
        codes::INVALID_PAYLOAD,
        Severity::Transient,
        true,
        "The server returned a result in an unexpected shape. Please try again.",
    ),
    rule(
        codes::STREAM_RECONNECT_EXHAUSTED,
        Severity::Fatal,
        false,
        "The streaming connection was lost and could not be restored.",
    ),
];

/// Maps backend error signals to the severity taxonomy.
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Classify a backend error code with an optional HTTP status.
    ///
    /// Pure and total: identical inputs always produce identical output.
    pub fn classify(code: &str, http_status: Option<u16>) -> ClassifiedError {
        let normalized = code.trim().to_ascii_uppercase();

        if let Some(rule) = RULES.iter().find(|r| r.code == normalized) {
            return ClassifiedError {
                code: rule.code.to_string(),
                human_message: rule.message.to_string(),
                severity: rule.severity,
                retryable: rule.retryable,
                http_status,
                detail: None,
                details: None,
            };
        }

        let code = if normalized.is_empty() {
            codes::UNKNOWN_ERROR.to_string()
        } else {
            normalized
        };

        let (severity, retryable, message) = match http_status {
            Some(status) if status >= 500 => (
                Severity::Transient,
                true,
                "The server is temporarily unavailable. Please try again.",
            ),
            Some(400..=499) => (
                Severity::UserFixable,
                false,
                "The request was rejected. Review the input and try again.",
            ),
            _ => (
                Severity::UserFixable,
                false,
                "An unexpected error occurred.",
            ),
        };

        ClassifiedError {
            code,
            human_message: message.to_string(),
            severity,
            retryable,
            http_status,
            detail: None,
            details: None,
        }
    }

    /// Classify a failure where no response was received at all.
    ///
    /// Always transient and retryable, whatever code the caller guessed.
    pub fn classify_no_response(code: Option<&str>) -> ClassifiedError {
        let err = ClassifiedError {
            code: codes::NETWORK_ERROR.to_string(),
            human_message: "No response from the server. Check your connection and try again."
                .to_string(),
            severity: Severity::Transient,
            retryable: true,
            http_status: None,
            detail: None,
            details: None,
        };
        match code {
            Some(original) if !original.is_empty() => err.with_detail(original),
            _ => err,
        }
    }
}

// =============================================================================
// Application Error
// =============================================================================

#[derive(Debug, Error)]
pub enum FlowError {
    // -------------------------------------------------------------------------
    // System Errors (auto From impl)
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    // -------------------------------------------------------------------------
    // Backend Errors
    // -------------------------------------------------------------------------
    /// Structured error body returned by the backend
    #[error("{code} ({status:?}): {message}")]
    Api {
        code: String,
        status: Option<u16>,
        message: String,
        details: Option<Value>,
        path: Option<String>,
    },

    /// Request was sent but nothing came back
    #[error("No response: {0}")]
    NoResponse(String),

    /// Operation timeout with context
    #[error("Timeout after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    // -------------------------------------------------------------------------
    // Domain Errors
    // -------------------------------------------------------------------------
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Session expired")]
    SessionExpired,

    /// Already classified failure carried back out of the pipeline
    #[error("{0}")]
    Classified(#[from] ClassifiedError),

    #[error("Config error: {0}")]
    Config(String),

    /// Lower-level failure wrapped with what was being attempted
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl From<tokio_tungstenite::tungstenite::Error> for FlowError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        FlowError::WebSocket(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;

impl FlowError {
    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create an API error from a code and HTTP status
    pub fn api(code: impl Into<String>, status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Api {
            code: code.into(),
            status,
            message: message.into(),
            details: None,
            path: None,
        }
    }

    /// Route this error through the classifier
    pub fn classify(&self) -> ClassifiedError {
        match self {
            Self::Api {
                code,
                status,
                message,
                details,
                ..
            } => ErrorClassifier::classify(code, *status)
                .with_detail(message.clone())
                .with_details(details.clone()),
            Self::Http(err) => match err.status() {
                Some(status) => {
                    ErrorClassifier::classify(&format!("HTTP_{}", status.as_u16()), Some(status.as_u16()))
                        .with_detail(err.to_string())
                }
                None => ErrorClassifier::classify_no_response(None).with_detail(err.to_string()),
            },
            Self::NoResponse(msg) | Self::WebSocket(msg) => {
                ErrorClassifier::classify_no_response(None).with_detail(msg.clone())
            }
            Self::Io(err) => ErrorClassifier::classify_no_response(None).with_detail(err.to_string()),
            Self::Timeout { .. } => {
                ErrorClassifier::classify(codes::TIMEOUT_ERROR, None).with_detail(self.to_string())
            }
            Self::Json(err) => {
                ErrorClassifier::classify(codes::INVALID_PAYLOAD, None).with_detail(err.to_string())
            }
            Self::Decode(err) => {
                ErrorClassifier::classify(codes::DECODE_ERROR, None).with_detail(err.to_string())
            }
            Self::Transfer(err) => err.classify(),
            Self::Validation(msg) => {
                ErrorClassifier::classify(codes::VALIDATION_ERROR, None).with_detail(msg.clone())
            }
            Self::SessionExpired => ErrorClassifier::classify(codes::SESSION_EXPIRED, None),
            Self::Classified(err) => err.clone(),
            Self::Url(_) | Self::Config(_) => {
                ErrorClassifier::classify(codes::VALIDATION_ERROR, None).with_detail(self.to_string())
            }
            Self::Context { .. } => {
                ErrorClassifier::classify(codes::UNKNOWN_ERROR, None).with_detail(self.to_string())
            }
        }
    }

    /// Check if the classified form of this error allows retry
    pub fn is_recoverable(&self) -> bool {
        self.classify().is_retryable()
    }
}

/// Context extension trait for adding context to errors
pub trait ResultExt<T> {
    /// Add context to an error
    fn with_context<C: Into<String>>(self, context: C) -> Result<T>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ResultExt<T> for std::result::Result<T, E> {
    fn with_context<C: Into<String>>(self, context: C) -> Result<T> {
        self.map_err(|e| FlowError::Context {
            context: context.into(),
            source: Box::new(e),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
