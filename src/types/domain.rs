//! Pipeline payload types
//!
//! Shapes exchanged with the generation backend. Field names follow the wire
//! format; unknown fields are ignored and missing collections default to empty.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type ScenarioId = String;
pub type CaseId = String;

/// Generated automation code keyed by relative file path
pub type CodeFiles = BTreeMap<String, String>;

/// Kind of test the pipeline generates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TestType {
    #[default]
    Ui,
    Api,
    Unit,
}

impl TestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ui => "ui",
            Self::Api => "api",
            Self::Unit => "unit",
        }
    }
}

impl std::fmt::Display for TestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TestType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ui" => Ok(Self::Ui),
            "api" => Ok(Self::Api),
            "unit" => Ok(Self::Unit),
            _ => Err(format!(
                "Unknown test type: {}. Valid values: ui, api, unit",
                s
            )),
        }
    }
}

/// Where the requirement text comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum RequirementInput {
    Text(String),
    Url(String),
    File(PathBuf),
}

impl RequirementInput {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.trim().is_empty(),
            Self::Url(url) => url.trim().is_empty(),
            Self::File(path) => path.as_os_str().is_empty(),
        }
    }
}

/// Last submitted requirement, kept so it can be resubmitted without retyping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementDraft {
    pub input: RequirementInput,
    pub test_type: TestType,
    #[serde(default)]
    pub knowledge_base_ids: Vec<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequirementAnalysis {
    pub function_points: Vec<String>,
    pub business_rules: Vec<String>,
    pub data_models: Vec<Value>,
    pub api_definitions: Vec<Value>,
    pub test_focus: Vec<String>,
    pub risk_points: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub scenario_id: ScenarioId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub precondition: String,
    #[serde(default)]
    pub expected_result: String,
    /// P0..P3
    #[serde(default)]
    pub priority: String,
    /// normal / exception / boundary / performance / security
    #[serde(default)]
    pub category: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestStep {
    pub step_no: u32,
    pub action: String,
    /// Free-form: string, object, or absent
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub expected: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub case_id: CaseId,
    pub title: String,
    #[serde(default)]
    pub test_type: String,
    #[serde(default)]
    pub priority: String,
    #[serde(default)]
    pub precondition: String,
    #[serde(default)]
    pub steps: Vec<TestStep>,
    #[serde(default)]
    pub test_data: Value,
    #[serde(default)]
    pub expected_result: String,
    #[serde(default)]
    pub postcondition: String,
    /// Scenario this case was derived from, when the backend reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_id: Option<ScenarioId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoverageAnalysis {
    pub coverage_rate: f64,
    pub uncovered_points: Vec<String>,
    pub missing_scenarios: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityAnalysis {
    pub duplicate_cases: Vec<String>,
    pub non_smart_cases: Vec<String>,
    pub incomplete_data: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityScore {
    pub coverage_score: f64,
    pub quality_score: f64,
    pub total_score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityReport {
    pub coverage_analysis: CoverageAnalysis,
    pub quality_analysis: QualityAnalysis,
    pub suggestions: Vec<String>,
    pub quality_score: QualityScore,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_test_type_parse() {
        assert_eq!("UI".parse::<TestType>().unwrap(), TestType::Ui);
        assert_eq!("api".parse::<TestType>().unwrap(), TestType::Api);
        assert!("e2e".parse::<TestType>().is_err());
        assert_eq!(TestType::Unit.to_string(), "unit");
    }

    #[test]
    fn test_requirement_input_empty() {
        assert!(RequirementInput::Text("   ".into()).is_empty());
        assert!(RequirementInput::Url(String::new()).is_empty());
        assert!(!RequirementInput::Text("Login feature".into()).is_empty());
        assert!(!RequirementInput::File(PathBuf::from("req.md")).is_empty());
    }

    #[test]
    fn test_case_accepts_loose_step_data() {
        let case: TestCase = serde_json::from_value(serde_json::json!({
            "case_id": "TC-001",
            "title": "Login with valid credentials",
            "steps": [
                {"step_no": 1, "action": "open login page", "expected": "form shown"},
                {"step_no": 2, "action": "submit", "data": {"user": "alice"}, "expected": "dashboard"}
            ]
        }))
        .unwrap();
        assert_eq!(case.steps.len(), 2);
        assert!(case.steps[0].data.is_null());
        assert_eq!(case.steps[1].data["user"], "alice");
        assert!(case.scenario_id.is_none());
    }

    #[test]
    fn test_quality_report_defaults() {
        let report: QualityReport =
            serde_json::from_value(serde_json::json!({"suggestions": ["add boundary cases"]}))
                .unwrap();
        assert_eq!(report.suggestions.len(), 1);
        assert_eq!(report.quality_score.total_score, 0.0);
    }
}
