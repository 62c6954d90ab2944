//! Chunked multipart upload

use std::path::Path;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use super::TransferError;
use super::task::{FileDescriptor, UploadTask, extension_of};
use crate::config::UploadConfig;

type TransferResult<T> = std::result::Result<T, TransferError>;

/// Progress observer, called with each new percentage
pub type ProgressFn = Arc<dyn Fn(u8) + Send + Sync>;

/// Uploads requirement documents under a size and type policy
#[derive(Clone)]
pub struct ChunkedTransfer {
    client: reqwest::Client,
    policy: UploadConfig,
    token: Option<SecretString>,
}

impl std::fmt::Debug for ChunkedTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedTransfer")
            .field("policy", &self.policy)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl ChunkedTransfer {
    pub fn new(client: reqwest::Client, policy: UploadConfig, token: Option<SecretString>) -> Self {
        Self {
            client,
            policy,
            token,
        }
    }

    pub fn policy(&self) -> &UploadConfig {
        &self.policy
    }

    /// Check a file against the policy using metadata only.
    pub fn validate(&self, path: &Path) -> TransferResult<FileDescriptor> {
        validate_file(path, self.policy.max_size_bytes, &self.policy.allowed_extensions)
    }

    /// Validate and send `path` as the `file` part of a multipart POST.
    ///
    /// Progress never reports 100 until the server answers with success.
    /// Streamed files report as chunks are handed to the transport; a file
    /// sent as one part reports once a response arrives.
    pub async fn upload(
        &self,
        url: &str,
        path: &Path,
        fields: Vec<(String, String)>,
        on_progress: Option<ProgressFn>,
    ) -> TransferResult<Value> {
        let descriptor = self.validate(path)?;
        let tracker = Arc::new(Mutex::new(UploadTask::new(descriptor.clone(), self.policy.chunk_size)));

        let result = self
            .send(url, &descriptor, fields, tracker.clone(), on_progress.clone())
            .await;

        let mut task = lock(&tracker);
        match result {
            Ok(value) => {
                let progress = task.complete();
                drop(task);
                if let Some(cb) = &on_progress {
                    cb(progress);
                }
                info!(file = %descriptor.file_name, bytes = descriptor.size_bytes, "Upload complete");
                Ok(value)
            }
            Err(err) => {
                task.fail(err.to_string());
                warn!(
                    file = %descriptor.file_name,
                    progress = task.progress(),
                    "Upload failed: {}",
                    err
                );
                Err(err)
            }
        }
    }

    async fn send(
        &self,
        url: &str,
        descriptor: &FileDescriptor,
        fields: Vec<(String, String)>,
        tracker: Arc<Mutex<UploadTask>>,
        on_progress: Option<ProgressFn>,
    ) -> TransferResult<Value> {
        let chunked = {
            let mut task = lock(&tracker);
            task.start();
            task.is_chunked()
        };

        let mut single_part_len = None;
        let part = if chunked {
            debug!(
                file = %descriptor.file_name,
                chunk_size = self.policy.chunk_size,
                "Streaming upload body"
            );
            let file = tokio::fs::File::open(&descriptor.path).await?;
            let body = chunk_stream(file, self.policy.chunk_size, tracker.clone(), on_progress.clone());
            Part::stream_with_length(reqwest::Body::wrap_stream(body), descriptor.size_bytes)
        } else {
            let bytes = tokio::fs::read(&descriptor.path).await?;
            single_part_len = Some(bytes.len());
            Part::bytes(bytes)
        };

        let part = part
            .file_name(descriptor.file_name.clone())
            .mime_str(descriptor.content_type())
            .map_err(TransferError::Transport)?;

        let form = fields
            .into_iter()
            .fold(Form::new(), |form, (name, value)| form.text(name, value))
            .part("file", part);

        let mut request = self.client.post(url).multipart(form);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await.map_err(TransferError::Transport)?;
        // A single part is only counted once the server has read it
        if let Some(len) = single_part_len {
            report(&tracker, len, on_progress.as_ref());
        }
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransferError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let text = response.text().await.map_err(TransferError::Transport)?;
        serde_json::from_str(&text).map_err(|e| TransferError::InvalidResponse(e.to_string()))
    }
}

/// Validate a file against a size limit and an extension allow-list.
pub(crate) fn validate_file(
    path: &Path,
    max_size_bytes: u64,
    allowed_extensions: &[String],
) -> TransferResult<FileDescriptor> {
    let metadata = match std::fs::metadata(path) {
        Ok(m) if m.is_file() => m,
        Ok(_) => return Err(TransferError::NotFound(path.to_path_buf())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TransferError::NotFound(path.to_path_buf()));
        }
        Err(e) => return Err(TransferError::Io(e)),
    };

    let extension = extension_of(path).unwrap_or_default();
    if !allowed_extensions
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(&extension))
    {
        return Err(TransferError::UnsupportedType { extension });
    }

    let size = metadata.len();
    if size > max_size_bytes {
        return Err(TransferError::FileTooLarge {
            size,
            max: max_size_bytes,
        });
    }
    if size == 0 {
        return Err(TransferError::Empty(path.to_path_buf()));
    }

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload")
        .to_string();

    Ok(FileDescriptor {
        path: path.to_path_buf(),
        file_name,
        extension,
        size_bytes: size,
    })
}

/// Body stream that records progress as each chunk is pulled by the transport
fn chunk_stream<R>(
    reader: R,
    chunk_size: usize,
    tracker: Arc<Mutex<UploadTask>>,
    on_progress: Option<ProgressFn>,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send + Sync + 'static
where
    R: tokio::io::AsyncRead + Send + Sync + 'static,
{
    ReaderStream::with_capacity(reader, chunk_size.max(1)).map(move |chunk| {
        if let Ok(bytes) = &chunk {
            report(&tracker, bytes.len(), on_progress.as_ref());
        }
        chunk
    })
}

fn report(tracker: &Mutex<UploadTask>, bytes: usize, on_progress: Option<&ProgressFn>) {
    let progress = lock(tracker).record_sent(bytes);
    if let (Some(progress), Some(cb)) = (progress, on_progress) {
        cb(progress);
    }
}

fn lock(tracker: &Mutex<UploadTask>) -> std::sync::MutexGuard<'_, UploadTask> {
    tracker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
