//! Upload task state
//!
//! Tracks one file transfer from validation to a terminal status. Progress is
//! derived from bytes handed to the transport and is capped below 100 until
//! the server confirms the upload.

use std::path::{Path, PathBuf};

use serde::Serialize;
use uuid::Uuid;

use crate::constants::upload as upload_constants;

/// Validated file ready to send
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileDescriptor {
    pub path: PathBuf,
    pub file_name: String,
    pub extension: String,
    pub size_bytes: u64,
}

impl FileDescriptor {
    /// Content type sent with the file part
    pub fn content_type(&self) -> &'static str {
        content_type_for(&self.extension)
    }
}

fn content_type_for(extension: &str) -> &'static str {
    match extension {
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "pdf" => "application/pdf",
        "md" => "text/markdown",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

/// Lowercased extension without the dot
pub(crate) fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Validating,
    Sending,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadTask {
    id: Uuid,
    file: FileDescriptor,
    chunk_size: usize,
    bytes_sent: u64,
    progress: u8,
    status: UploadStatus,
    error: Option<String>,
}

impl UploadTask {
    pub fn new(file: FileDescriptor, chunk_size: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            file,
            chunk_size: chunk_size.max(1),
            bytes_sent: 0,
            progress: 0,
            status: UploadStatus::Validating,
            error: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn file(&self) -> &FileDescriptor {
        &self.file
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn status(&self) -> UploadStatus {
        self.status
    }

    /// Transport error preserved from a failed transfer
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Files larger than one chunk are streamed
    pub fn is_chunked(&self) -> bool {
        self.file.size_bytes > self.chunk_size as u64
    }

    pub fn start(&mut self) {
        if self.status == UploadStatus::Validating {
            self.status = UploadStatus::Sending;
        }
    }

    /// Account for bytes handed to the transport.
    ///
    /// Returns the new progress when it increased.
    pub fn record_sent(&mut self, bytes: usize) -> Option<u8> {
        if self.status != UploadStatus::Sending {
            return None;
        }
        self.bytes_sent = self
            .bytes_sent
            .saturating_add(bytes as u64)
            .min(self.file.size_bytes);

        let percent = if self.file.size_bytes == 0 {
            0
        } else {
            (self.bytes_sent.saturating_mul(100) / self.file.size_bytes) as u8
        };
        let capped = percent.min(upload_constants::IN_FLIGHT_PROGRESS_CAP);

        if capped > self.progress {
            self.progress = capped;
            Some(capped)
        } else {
            None
        }
    }

    /// Server accepted the upload
    pub fn complete(&mut self) -> u8 {
        self.status = UploadStatus::Done;
        self.bytes_sent = self.file.size_bytes;
        self.progress = 100;
        self.progress
    }

    /// Freeze progress and keep the cause
    pub fn fail(&mut self, error: impl Into<String>) {
        if self.status != UploadStatus::Done {
            self.status = UploadStatus::Failed;
            self.error = Some(error.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(size: u64) -> FileDescriptor {
        FileDescriptor {
            path: PathBuf::from("req.docx"),
            file_name: "req.docx".to_string(),
            extension: "docx".to_string(),
            size_bytes: size,
        }
    }

    #[test]
    fn test_progress_capped_until_complete() {
        let mut task = UploadTask::new(descriptor(1000), 100);
        task.start();
        assert!(task.is_chunked());

        let mut seen = Vec::new();
        for _ in 0..10 {
            if let Some(p) = task.record_sent(100) {
                seen.push(p);
            }
        }
        assert_eq!(seen.last().copied(), Some(99));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(task.bytes_sent(), 1000);

        assert_eq!(task.complete(), 100);
        assert_eq!(task.status(), UploadStatus::Done);
    }

    #[test]
    fn test_record_ignored_before_start() {
        let mut task = UploadTask::new(descriptor(10), 100);
        assert_eq!(task.record_sent(10), None);
        assert_eq!(task.bytes_sent(), 0);
        assert!(!task.is_chunked());
    }

    #[test]
    fn test_failure_freezes_progress() {
        let mut task = UploadTask::new(descriptor(400), 100);
        task.start();
        task.record_sent(100);
        task.fail("connection reset by peer");

        assert_eq!(task.status(), UploadStatus::Failed);
        assert_eq!(task.progress(), 25);
        assert_eq!(task.error(), Some("connection reset by peer"));
        assert_eq!(task.record_sent(300), None);
        assert_eq!(task.progress(), 25);
    }

    #[test]
    fn test_content_type_by_extension() {
        assert_eq!(descriptor(1).content_type(), "application/vnd.openxmlformats-officedocument.wordprocessingml.document");
        assert_eq!(content_type_for("bin"), "application/octet-stream");
        assert_eq!(extension_of(Path::new("A/B/Spec.PDF")).as_deref(), Some("pdf"));
    }
}
