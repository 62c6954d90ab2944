//! REST implementation of [`StageBackend`]

use std::borrow::Cow;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use reqwest::multipart::Form;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{
    AnalyzeRequest, CodeExportFormat, ExportArtifact, ExportCasesOptions, ExportCodeOptions,
    StageBackend, StageReply, api_error_from_body, with_timeout,
};
use crate::config::{ApiConfig, UploadConfig};
use crate::constants::network as net_constants;
use crate::protocol::StreamAction;
use crate::transfer::{ChunkedTransfer, ProgressFn};
use crate::types::{FlowError, RequirementInput, Result, SessionId};

/// Stage backend over HTTP with bearer auth
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    token: Option<SecretString>,
    timeout: Duration,
    transfer: ChunkedTransfer,
}

impl std::fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackend")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl HttpBackend {
    pub fn new(api: &ApiConfig, upload: &UploadConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(net_constants::CONNECTION_TIMEOUT_SECS))
            .build()
            .map_err(|e| FlowError::Config(format!("Failed to create HTTP client: {}", e)))?;

        let token = api.bearer_token();

        Ok(Self {
            transfer: ChunkedTransfer::new(client.clone(), upload.clone(), token.clone()),
            client,
            base_url: api.base_url.trim_end_matches('/').to_string(),
            token,
            timeout: api.timeout(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn transfer(&self) -> &ChunkedTransfer {
        &self.transfer
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<reqwest::Response> {
        let request = self.authorize(self.client.post(self.endpoint(path)).json(body));
        let response = request.send().await.map_err(transport_error)?;
        ensure_success(path, response).await
    }

    async fn export(&self, path: &str, body: Value, fallback_name: String) -> Result<ExportArtifact> {
        let response = with_timeout(self.timeout, self.post_json(path, &body), path).await?;

        let headers = response.headers().clone();
        let bytes = response.bytes().await.map_err(transport_error)?;

        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let filename = headers
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(filename_from_disposition)
            .unwrap_or(fallback_name);

        info!(path, %filename, bytes = bytes.len(), "Export downloaded");
        Ok(ExportArtifact {
            bytes: bytes.to_vec(),
            content_type,
            filename,
        })
    }
}

#[async_trait]
impl StageBackend for HttpBackend {
    async fn analyze(&self, request: AnalyzeRequest, on_progress: Option<ProgressFn>) -> Result<StageReply> {
        let path = "generate/requirement";
        let url = self.endpoint(path);
        let start = Instant::now();
        let fields = request.form_fields();

        let body = match &request.input {
            RequirementInput::File(file) => {
                debug!(file = %file.display(), "Uploading requirement document");
                with_timeout(
                    self.timeout,
                    async { Ok(self.transfer.upload(&url, file, fields, on_progress).await?) },
                    "requirement analysis",
                )
                .await?
            }
            RequirementInput::Text(_) | RequirementInput::Url(_) => {
                let form = fields
                    .into_iter()
                    .fold(Form::new(), |form, (name, value)| form.text(name, value));
                with_timeout(
                    self.timeout,
                    async {
                        let response = self
                            .authorize(self.client.post(&url).multipart(form))
                            .send()
                            .await
                            .map_err(transport_error)?;
                        let response = ensure_success(path, response).await?;
                        read_json(response).await
                    },
                    "requirement analysis",
                )
                .await?
            }
        };

        info!(elapsed_ms = start.elapsed().as_millis() as u64, "Requirement analyzed");
        Ok(StageReply::from_body(body))
    }

    async fn invoke(&self, action: StreamAction, session_id: &SessionId, data: Value) -> Result<StageReply> {
        let path = format!("generate/{}", action);
        let body = request_body(session_id, data);
        let start = Instant::now();

        debug!(%action, %session_id, "Stage call");
        let value = with_timeout(
            self.timeout,
            async {
                let response = self.post_json(&path, &body).await?;
                read_json(response).await
            },
            &format!("{} generation", action),
        )
        .await?;

        info!(%action, elapsed_ms = start.elapsed().as_millis() as u64, "Stage call complete");
        Ok(StageReply::from_body(value))
    }

    async fn export_cases(&self, session_id: &SessionId, options: &ExportCasesOptions) -> Result<ExportArtifact> {
        let body = json!({
            "session_id": session_id,
            "format": options.format,
            "include_requirement": options.include_requirement,
            "include_scenarios": options.include_scenarios,
            "include_cases": options.include_cases,
            "include_quality_report": options.include_quality_report,
        });
        let fallback = format!("test_cases.{}", options.format.extension());
        self.export("export/cases", body, fallback).await
    }

    async fn export_code(&self, session_id: &SessionId, options: &ExportCodeOptions) -> Result<ExportArtifact> {
        let body = json!({
            "session_id": session_id,
            "format": options.format,
            "project_name": options.project_name,
        });
        let fallback = match options.format {
            CodeExportFormat::Single => format!("{}.py", options.project_name),
            CodeExportFormat::Zip | CodeExportFormat::Project => {
                format!("{}.zip", options.project_name)
            }
        };
        self.export("export/code", body, fallback).await
    }
}

/// Stage body: the command data with the session id alongside
fn request_body(session_id: &SessionId, data: Value) -> Value {
    let mut body = match data {
        Value::Object(map) => map,
        Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };
    body.insert("session_id".to_string(), Value::String(session_id.to_string()));
    Value::Object(body)
}

async fn ensure_success(path: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    Err(api_error_from_body(status.as_u16(), &text, Some(path)))
}

async fn read_json(response: reqwest::Response) -> Result<Value> {
    let text = response.text().await.map_err(transport_error)?;
    Ok(serde_json::from_str(&text)?)
}

/// Failures with no HTTP status never reached a handler
fn transport_error(err: reqwest::Error) -> FlowError {
    if err.status().is_some() {
        FlowError::Http(err)
    } else {
        FlowError::NoResponse(err.to_string())
    }
}

/// Extract the suggested filename from a `Content-Disposition` header
fn filename_from_disposition(header: &str) -> Option<String> {
    let mut plain = None;
    for param in header.split(';').map(str::trim) {
        if let Some(value) = param.strip_prefix("filename*=") {
            // RFC 5987: charset'lang'percent-encoded
            let encoded = value.rsplit('\'').next().unwrap_or(value);
            if let Some(decoded) = urlencoding::decode(encoded)
                .ok()
                .map(Cow::into_owned)
                .filter(|s| !s.is_empty())
            {
                return Some(decoded);
            }
        } else if let Some(value) = param.strip_prefix("filename=") {
            let value = value.trim_matches('"').trim();
            if !value.is_empty() {
                plain = Some(value.to_string());
            }
        }
    }
    plain
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::client::CaseExportFormat;
    use crate::types::{Severity, codes};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response; yields the raw request text
    pub(crate) async fn serve_once(
        status: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut response = format!("HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n", status, body.len());
        for (name, value) in headers {
            response.push_str(&format!("{}: {}\r\n", name, value));
        }
        response.push_str("\r\n");
        let mut response = response.into_bytes();
        response.extend_from_slice(body);

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                if request_complete(&request) {
                    break;
                }
            }
            socket.write_all(&response).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&request).to_string()
        });

        (format!("http://{}/api/v1", addr), handle)
    }

    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
        let Some(header_end) = text.find("\r\n\r\n") else {
            return false;
        };
        if text[..header_end]
            .to_ascii_lowercase()
            .contains("transfer-encoding: chunked")
        {
            return text.ends_with("0\r\n\r\n");
        }
        let length = text[..header_end]
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        request.len() >= header_end + 4 + length
    }

    fn backend(base_url: &str, token: Option<&str>) -> HttpBackend {
        let api = ApiConfig {
            base_url: base_url.to_string(),
            timeout_secs: 5,
            token: token.map(str::to_string),
        };
        HttpBackend::new(&api, &UploadConfig::default()).unwrap()
    }

    #[test]
    fn test_request_body_inserts_session() {
        let body = request_body(&SessionId::from("s-1"), json!({"scenarios": []}));
        assert_eq!(body["session_id"], "s-1");
        assert_eq!(body["scenarios"], json!([]));

        let body = request_body(&SessionId::from("s-1"), Value::Null);
        assert_eq!(body, json!({"session_id": "s-1"}));
    }

    #[test]
    fn test_endpoint_trims_slashes() {
        let backend = backend("http://localhost:8000/api/v1/", None);
        assert_eq!(backend.endpoint("/generate/case"), "http://localhost:8000/api/v1/generate/case");
    }

    #[test]
    fn test_filename_from_disposition() {
        assert_eq!(
            filename_from_disposition("attachment; filename=test_cases_20250101_120000.xlsx").as_deref(),
            Some("test_cases_20250101_120000.xlsx")
        );
        assert_eq!(
            filename_from_disposition(r#"attachment; filename="code.zip""#).as_deref(),
            Some("code.zip")
        );
        assert_eq!(
            filename_from_disposition("attachment; filename=x.md; filename*=UTF-8''%E6%B5%8B%E8%AF%95.md")
                .as_deref(),
            Some("测试.md")
        );
        assert_eq!(filename_from_disposition("inline"), None);
    }

    #[tokio::test]
    async fn test_invoke_posts_json_with_bearer() {
        let (base, server) = serve_once(
            "200 OK",
            &[("Content-Type", "application/json")],
            br#"{"session_id":"s-1","scenarios":[{"scenario_id":"S1","name":"valid login"}]}"#,
        )
        .await;

        let reply = backend(&base, Some("t0ken"))
            .invoke(StreamAction::Scenario, &SessionId::from("s-1"), json!({"test_type": "ui"}))
            .await
            .unwrap();
        assert_eq!(reply.session_id, Some(SessionId::from("s-1")));
        assert_eq!(reply.body["scenarios"][0]["scenario_id"], "S1");

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/v1/generate/scenario "));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer t0ken"));
        assert!(request.contains(r#""session_id":"s-1""#));
    }

    #[tokio::test]
    async fn test_invoke_maps_structured_error() {
        let (base, _server) = serve_once(
            "410 Gone",
            &[("Content-Type", "application/json")],
            br#"{"error_code":"SESSION_EXPIRED","message":"Session expired","path":"/api/v1/generate/case"}"#,
        )
        .await;

        let err = backend(&base, None)
            .invoke(StreamAction::Case, &SessionId::from("s-1"), json!({}))
            .await
            .unwrap_err();
        let classified = err.classify();
        assert!(classified.is_session_expired());
        assert_eq!(classified.http_status(), Some(410));
    }

    #[tokio::test]
    async fn test_no_response_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = backend(&format!("http://{}", addr), None)
            .invoke(StreamAction::Code, &SessionId::from("s-1"), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::NoResponse(_)));
        let classified = err.classify();
        assert_eq!(classified.code(), codes::NETWORK_ERROR);
        assert_eq!(classified.severity(), Severity::Transient);
    }

    #[tokio::test]
    async fn test_analyze_text_sends_form() {
        let (base, server) = serve_once(
            "200 OK",
            &[("Content-Type", "application/json")],
            br#"{"session_id":"new-session","function_points":["login"]}"#,
        )
        .await;

        let request = AnalyzeRequest {
            input: RequirementInput::Text("Login feature".to_string()),
            test_type: crate::types::TestType::Ui,
            knowledge_base_ids: vec![1],
            session_id: None,
        };
        let reply = backend(&base, None).analyze(request, None).await.unwrap();
        assert_eq!(reply.session_id, Some(SessionId::from("new-session")));

        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /api/v1/generate/requirement "));
        assert!(raw.contains("multipart/form-data"));
        assert!(raw.contains("name=\"requirement_text\""));
        assert!(raw.contains("Login feature"));
        assert!(raw.contains("name=\"knowledge_base_ids\""));
    }

    #[tokio::test]
    async fn test_export_cases_reads_artifact() {
        let (base, _server) = serve_once(
            "200 OK",
            &[
                ("Content-Type", "text/csv"),
                ("Content-Disposition", "attachment; filename=test_cases_20250101.csv"),
            ],
            b"case_id,title\nTC-1,login\n",
        )
        .await;

        let options = ExportCasesOptions {
            format: CaseExportFormat::Csv,
            ..Default::default()
        };
        let artifact = backend(&base, None)
            .export_cases(&SessionId::from("s-1"), &options)
            .await
            .unwrap();
        assert_eq!(artifact.filename, "test_cases_20250101.csv");
        assert_eq!(artifact.content_type, "text/csv");
        assert!(artifact.bytes.starts_with(b"case_id"));
    }

    #[tokio::test]
    async fn test_export_code_falls_back_to_project_name() {
        let (base, _server) = serve_once(
            "200 OK",
            &[("Content-Type", "application/zip")],
            b"PK\x03\x04",
        )
        .await;

        let artifact = backend(&base, None)
            .export_code(&SessionId::from("s-1"), &ExportCodeOptions::default())
            .await
            .unwrap();
        assert_eq!(artifact.filename, "test_automation.zip");
        assert_eq!(artifact.bytes, b"PK\x03\x04".to_vec());
    }
}
