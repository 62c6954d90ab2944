//! Backend error body parsing
//!
//! The backend reports failures in a few shapes depending on which handler
//! produced them:
//!
//! ```text
//! {"error_code": "SESSION_EXPIRED", "message": "...", "details": {...}, "path": "/api/v1/..."}
//! {"error_code": "HTTP_400", "message": {"error_code": "DOCUMENT_PARSE_ERROR", "message": "..."}}
//! {"detail": {"error_code": "LLM_API_ERROR", "message": "..."}}
//! {"detail": "No code available to export"}
//! ```
//!
//! The most specific code wins; anything unparseable falls back to `HTTP_<status>`.

use serde_json::{Map, Value};

use crate::types::FlowError;

/// Build an API error from a non-success response body.
pub(crate) fn api_error_from_body(status: u16, body: &str, path: Option<&str>) -> FlowError {
    let fallback_code = format!("HTTP_{}", status);

    let Ok(Value::Object(top)) = serde_json::from_str::<Value>(body) else {
        let message = match body.trim() {
            "" => format!("HTTP {}", status),
            text => text.chars().take(500).collect(),
        };
        return FlowError::Api {
            code: fallback_code,
            status: Some(status),
            message,
            details: None,
            path: path.map(str::to_string),
        };
    };

    let nested = ["detail", "message"]
        .iter()
        .filter_map(|key| top.get(*key).and_then(Value::as_object))
        .find(|obj| obj.contains_key("error_code") || obj.contains_key("message"));

    let code = nested
        .and_then(|obj| str_field(obj, "error_code"))
        .or_else(|| str_field(&top, "error_code"))
        .unwrap_or(fallback_code.as_str())
        .to_string();

    let message = nested
        .and_then(|obj| str_field(obj, "message"))
        .or_else(|| str_field(&top, "message"))
        .or_else(|| str_field(&top, "detail"))
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {}", status));

    let details = nested
        .and_then(|obj| obj.get("details"))
        .or_else(|| top.get("details"))
        .filter(|v| !is_empty_value(v))
        .cloned();

    let path = str_field(&top, "path")
        .map(str::to_string)
        .or_else(|| path.map(str::to_string));

    FlowError::Api {
        code,
        status: Some(status),
        message,
        details,
        path,
    }
}

fn str_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Severity, codes};

    fn parts(err: FlowError) -> (String, String, Option<Value>, Option<String>) {
        match err {
            FlowError::Api {
                code,
                message,
                details,
                path,
                ..
            } => (code, message, details, path),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_top_level_body() {
        let body = r#"{"error_code":"SESSION_EXPIRED","message":"Session abc expired","details":{"session_id":"abc"},"path":"/api/v1/generate/case"}"#;
        let (code, message, details, path) = parts(api_error_from_body(410, body, None));
        assert_eq!(code, codes::SESSION_EXPIRED);
        assert_eq!(message, "Session abc expired");
        assert_eq!(details.unwrap()["session_id"], "abc");
        assert_eq!(path.as_deref(), Some("/api/v1/generate/case"));
    }

    #[test]
    fn test_nested_under_detail() {
        let body = r#"{"detail":{"error_code":"LLM_API_ERROR","message":"upstream timeout"}}"#;
        let err = api_error_from_body(500, body, Some("/generate/scenario"));
        let classified = err.classify();
        assert_eq!(classified.code(), codes::LLM_API_ERROR);
        assert_eq!(classified.severity(), Severity::Transient);
        assert_eq!(classified.detail(), Some("upstream timeout"));
        assert_eq!(classified.http_status(), Some(500));
    }

    #[test]
    fn test_nested_under_message() {
        let body = r#"{"error_code":"HTTP_400","message":{"error_code":"INVALID_INPUT","message":"Must provide file, url, or requirement_text"},"details":{},"path":"/api/v1/generate/requirement"}"#;
        let (code, message, details, _) = parts(api_error_from_body(400, body, None));
        assert_eq!(code, codes::INVALID_INPUT);
        assert_eq!(message, "Must provide file, url, or requirement_text");
        assert!(details.is_none());
    }

    #[test]
    fn test_detail_string() {
        let body = r#"{"detail":"No code available to export. Please generate code first."}"#;
        let (code, message, _, path) = parts(api_error_from_body(400, body, Some("/export/code")));
        assert_eq!(code, "HTTP_400");
        assert!(message.starts_with("No code available"));
        assert_eq!(path.as_deref(), Some("/export/code"));
    }

    #[test]
    fn test_non_json_body() {
        let (code, message, _, _) = parts(api_error_from_body(502, "<html>Bad Gateway</html>", None));
        assert_eq!(code, "HTTP_502");
        assert_eq!(message, "<html>Bad Gateway</html>");

        let err = api_error_from_body(503, "", None);
        assert!(err.classify().is_retryable());
    }
}
