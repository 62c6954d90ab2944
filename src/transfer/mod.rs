//! Document transfer
//!
//! Validates requirement documents against the upload policy and sends them as
//! a multipart body, streamed in fixed-size chunks when the file is larger than
//! one chunk.

mod task;
mod upload;

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{ClassifiedError, ErrorClassifier, codes};

pub use task::{FileDescriptor, UploadStatus, UploadTask};
pub use upload::{ChunkedTransfer, ProgressFn};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("file is empty: {}", .0.display())]
    Empty(PathBuf),

    #[error("file is {size} bytes, limit is {max} bytes")]
    FileTooLarge { size: u64, max: u64 },

    #[error("unsupported file type `{extension}`")]
    UnsupportedType { extension: String },

    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),

    /// Nothing usable came back; the request may never have reached the server
    #[error("transport failed: {0}")]
    Transport(#[source] reqwest::Error),

    /// Server answered with a non-success status
    #[error("upload rejected with status {status}")]
    Rejected { status: u16, body: String },

    #[error("upload response was not valid JSON: {0}")]
    InvalidResponse(String),
}

impl TransferError {
    pub fn classify(&self) -> ClassifiedError {
        match self {
            Self::NotFound(_) | Self::Empty(_) | Self::Io(_) => {
                ErrorClassifier::classify(codes::VALIDATION_ERROR, None).with_detail(self.to_string())
            }
            Self::FileTooLarge { .. } => {
                ErrorClassifier::classify(codes::FILE_SIZE_EXCEEDED, None).with_detail(self.to_string())
            }
            Self::UnsupportedType { .. } => ErrorClassifier::classify(codes::UNSUPPORTED_FILE_TYPE, None)
                .with_detail(self.to_string()),
            Self::Transport(err) => match err.status() {
                Some(status) => ErrorClassifier::classify("", Some(status.as_u16()))
                    .with_detail(err.to_string()),
                None => ErrorClassifier::classify_no_response(None).with_detail(err.to_string()),
            },
            Self::Rejected { status, body } => {
                crate::client::api_error_from_body(*status, body, None).classify()
            }
            Self::InvalidResponse(msg) => {
                ErrorClassifier::classify(codes::INVALID_PAYLOAD, None).with_detail(msg.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Severity;

    #[test]
    fn test_validation_failures_are_user_fixable() {
        let too_large = TransferError::FileTooLarge {
            size: 12 * 1024 * 1024,
            max: 10 * 1024 * 1024,
        }
        .classify();
        assert_eq!(too_large.code(), codes::FILE_SIZE_EXCEEDED);
        assert_eq!(too_large.severity(), Severity::UserFixable);

        let unsupported = TransferError::UnsupportedType {
            extension: "exe".to_string(),
        }
        .classify();
        assert_eq!(unsupported.code(), codes::UNSUPPORTED_FILE_TYPE);
        assert!(!unsupported.is_retryable());
    }

    #[test]
    fn test_rejected_uses_backend_code() {
        let err = TransferError::Rejected {
            status: 400,
            body: r#"{"detail":{"error_code":"DOCUMENT_PARSE_ERROR","message":"bad pdf"}}"#
                .to_string(),
        };
        let classified = err.classify();
        assert_eq!(classified.code(), codes::DOCUMENT_PARSE_ERROR);
        assert_eq!(classified.http_status(), Some(400));
        assert_eq!(classified.detail(), Some("bad pdf"));
    }

    #[test]
    fn test_rejected_without_body_falls_back_to_status() {
        let err = TransferError::Rejected {
            status: 503,
            body: String::new(),
        };
        let classified = err.classify();
        assert_eq!(classified.severity(), Severity::Transient);
        assert!(classified.is_retryable());
    }
}
