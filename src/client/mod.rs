//! Backend client
//!
//! [`StageBackend`] is the one-shot request/response seam the pipeline talks
//! to. [`HttpBackend`] implements it over REST; tests substitute an in-memory
//! backend.
//!
//! ## Endpoints
//!
//! - `POST {base}/generate/requirement` multipart form
//! - `POST {base}/generate/{scenario|case|code|quality|optimize|supplement}` JSON
//! - `POST {base}/export/{cases|code}` binary download

mod error_body;
mod http;
mod timeout;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::pipeline as pipeline_constants;
use crate::protocol::StreamAction;
use crate::transfer::ProgressFn;
use crate::types::{RequirementInput, Result, SessionId, TestType};

pub(crate) use error_body::api_error_from_body;
pub use http::HttpBackend;
pub use timeout::with_timeout;

#[cfg(test)]
pub(crate) use http::tests::serve_once;

// =============================================================================
// Requests and Replies
// =============================================================================

/// Requirement analysis call; the only stage that may carry a document
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzeRequest {
    pub input: RequirementInput,
    pub test_type: TestType,
    pub knowledge_base_ids: Vec<i64>,
    pub session_id: Option<SessionId>,
}

impl AnalyzeRequest {
    /// Form fields sent alongside (or instead of) the file part
    pub fn form_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![("test_type".to_string(), self.test_type.to_string())];

        match &self.input {
            RequirementInput::Text(text) => fields.push(("requirement_text".to_string(), text.clone())),
            RequirementInput::Url(url) => fields.push(("url".to_string(), url.clone())),
            RequirementInput::File(_) => {}
        }

        if !self.knowledge_base_ids.is_empty() {
            let ids = self
                .knowledge_base_ids
                .iter()
                .map(i64::to_string)
                .collect::<Vec<_>>()
                .join(",");
            fields.push(("knowledge_base_ids".to_string(), ids));
        }

        if let Some(session_id) = &self.session_id {
            fields.push(("session_id".to_string(), session_id.to_string()));
        }

        fields
    }
}

/// Successful stage response
#[derive(Debug, Clone, PartialEq)]
pub struct StageReply {
    /// Echoed or newly assigned session
    pub session_id: Option<SessionId>,
    pub body: Value,
}

impl StageReply {
    pub fn from_body(body: Value) -> Self {
        let session_id = body
            .get("session_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(SessionId::from);
        Self { session_id, body }
    }
}

// =============================================================================
// Export
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CaseExportFormat {
    #[default]
    Excel,
    Word,
    Json,
    Markdown,
    Html,
    Csv,
}

impl CaseExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Excel => "excel",
            Self::Word => "word",
            Self::Json => "json",
            Self::Markdown => "markdown",
            Self::Html => "html",
            Self::Csv => "csv",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Excel => "xlsx",
            Self::Word => "docx",
            Self::Json => "json",
            Self::Markdown => "md",
            Self::Html => "html",
            Self::Csv => "csv",
        }
    }
}

impl fmt::Display for CaseExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaseExportFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "excel" | "xlsx" => Ok(Self::Excel),
            "word" | "docx" => Ok(Self::Word),
            "json" => Ok(Self::Json),
            "markdown" | "md" => Ok(Self::Markdown),
            "html" => Ok(Self::Html),
            "csv" => Ok(Self::Csv),
            _ => Err(format!(
                "Unknown case export format: {}. Valid values: excel, word, json, markdown, html, csv",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CodeExportFormat {
    #[default]
    Zip,
    Single,
    Project,
}

impl CodeExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::Single => "single",
            Self::Project => "project",
        }
    }
}

impl fmt::Display for CodeExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CodeExportFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "zip" => Ok(Self::Zip),
            "single" => Ok(Self::Single),
            "project" => Ok(Self::Project),
            _ => Err(format!(
                "Unknown code export format: {}. Valid values: zip, single, project",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportCasesOptions {
    pub format: CaseExportFormat,
    pub include_requirement: bool,
    pub include_scenarios: bool,
    pub include_cases: bool,
    pub include_quality_report: bool,
}

impl Default for ExportCasesOptions {
    fn default() -> Self {
        Self {
            format: CaseExportFormat::Excel,
            include_requirement: false,
            include_scenarios: false,
            include_cases: true,
            include_quality_report: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportCodeOptions {
    pub format: CodeExportFormat,
    pub project_name: String,
}

impl Default for ExportCodeOptions {
    fn default() -> Self {
        Self {
            format: CodeExportFormat::Zip,
            project_name: pipeline_constants::DEFAULT_PROJECT_NAME.to_string(),
        }
    }
}

/// Downloaded export
#[derive(Clone, PartialEq, Eq)]
pub struct ExportArtifact {
    pub bytes: Vec<u8>,
    pub content_type: String,
    /// Suggested name from `Content-Disposition`, or a format default
    pub filename: String,
}

impl fmt::Debug for ExportArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportArtifact")
            .field("bytes", &self.bytes.len())
            .field("content_type", &self.content_type)
            .field("filename", &self.filename)
            .finish()
    }
}

// =============================================================================
// Backend Trait
// =============================================================================

/// One-shot stage calls against the generation backend
#[async_trait]
pub trait StageBackend: Send + Sync {
    /// Requirement analysis; creates the session when `session_id` is absent
    async fn analyze(&self, request: AnalyzeRequest, on_progress: Option<ProgressFn>) -> Result<StageReply>;

    /// Any JSON stage call (`scenario`, `case`, `code`, `quality`, `optimize`, `supplement`)
    async fn invoke(&self, action: StreamAction, session_id: &SessionId, data: Value) -> Result<StageReply>;

    async fn export_cases(&self, session_id: &SessionId, options: &ExportCasesOptions) -> Result<ExportArtifact>;

    async fn export_code(&self, session_id: &SessionId, options: &ExportCodeOptions) -> Result<ExportArtifact>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_form_fields_for_text() {
        let request = AnalyzeRequest {
            input: RequirementInput::Text("Login feature".to_string()),
            test_type: TestType::Api,
            knowledge_base_ids: vec![3, 7],
            session_id: None,
        };
        let fields = request.form_fields();
        assert!(fields.contains(&("requirement_text".to_string(), "Login feature".to_string())));
        assert!(fields.contains(&("test_type".to_string(), "api".to_string())));
        assert!(fields.contains(&("knowledge_base_ids".to_string(), "3,7".to_string())));
        assert!(!fields.iter().any(|(k, _)| k == "session_id"));
    }

    #[test]
    fn test_form_fields_for_file_with_session() {
        let request = AnalyzeRequest {
            input: RequirementInput::File("req.pdf".into()),
            test_type: TestType::Ui,
            knowledge_base_ids: Vec::new(),
            session_id: Some(SessionId::from("s-9")),
        };
        let fields = request.form_fields();
        assert_eq!(fields.len(), 2);
        assert!(fields.contains(&("session_id".to_string(), "s-9".to_string())));
    }

    #[test]
    fn test_stage_reply_reads_session() {
        let reply = StageReply::from_body(json!({"session_id": "abc", "scenarios": []}));
        assert_eq!(reply.session_id, Some(SessionId::from("abc")));

        let reply = StageReply::from_body(json!({"files": {}}));
        assert!(reply.session_id.is_none());
    }

    #[test]
    fn test_export_formats_parse() {
        assert_eq!("MD".parse::<CaseExportFormat>().unwrap(), CaseExportFormat::Markdown);
        assert_eq!(CaseExportFormat::Excel.extension(), "xlsx");
        assert!("pdf".parse::<CaseExportFormat>().is_err());
        assert_eq!("project".parse::<CodeExportFormat>().unwrap(), CodeExportFormat::Project);
        assert_eq!(ExportCodeOptions::default().project_name, "test_automation");
        assert!(ExportCasesOptions::default().include_cases);
    }
}
