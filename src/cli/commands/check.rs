//! Check Command
//!
//! Validate a requirement document against the upload policy without sending it.

use std::path::Path;

use crate::cli::ui::Output;
use crate::client::HttpBackend;
use crate::config::Config;
use crate::transfer::UploadTask;
use crate::types::{FlowError, Result};

pub fn run(config: &Config, path: &Path) -> Result<()> {
    let output = Output::new();
    let backend = HttpBackend::new(&config.api, &config.upload)?;
    let transfer = backend.transfer();

    let file = match transfer.validate(path) {
        Ok(file) => file,
        Err(e) => {
            output.failure(&e.classify());
            return Err(FlowError::Transfer(e));
        }
    };

    let task = UploadTask::new(file.clone(), transfer.policy().chunk_size);
    output.success(&format!("{} can be uploaded", file.file_name));
    output.field("Size:", &format!("{} bytes", file.size_bytes));
    output.field("Type:", file.content_type());
    output.field(
        "Transfer:",
        if task.is_chunked() {
            "streamed in chunks"
        } else {
            "single part"
        },
    );
    Ok(())
}
