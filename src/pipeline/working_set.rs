//! Accumulated pipeline data
//!
//! Owned by the orchestrator; everyone else reads clones.

use std::collections::BTreeSet;

use serde::Serialize;

use super::Stage;
use crate::types::{
    CaseId, CodeFiles, QualityReport, RequirementAnalysis, RequirementDraft, Scenario, ScenarioId,
    TestCase,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkingSet {
    /// Last requirement that was analyzed successfully
    pub draft: Option<RequirementDraft>,
    pub requirement_analysis: Option<RequirementAnalysis>,
    pub scenarios: Vec<Scenario>,
    pub selected_scenario_ids: BTreeSet<ScenarioId>,
    pub test_cases: Vec<TestCase>,
    pub selected_case_ids: BTreeSet<CaseId>,
    pub code_files: Option<CodeFiles>,
    pub quality_report: Option<QualityReport>,
}

impl WorkingSet {
    /// Drop data owned by every stage after `stage`
    pub fn clear_after(&mut self, stage: Stage) {
        if stage < Stage::Analysis {
            self.requirement_analysis = None;
        }
        if stage < Stage::Scenarios {
            self.scenarios.clear();
            self.selected_scenario_ids.clear();
        }
        if stage < Stage::Cases {
            self.test_cases.clear();
            self.selected_case_ids.clear();
        }
        if stage < Stage::Code {
            self.code_files = None;
        }
        if stage < Stage::Quality {
            self.quality_report = None;
        }
    }

    /// Whether any data belonging to a stage after `stage` is present
    pub fn has_data_after(&self, stage: Stage) -> bool {
        (stage < Stage::Analysis && self.requirement_analysis.is_some())
            || (stage < Stage::Scenarios && !self.scenarios.is_empty())
            || (stage < Stage::Cases && !self.test_cases.is_empty())
            || (stage < Stage::Code && self.code_files.is_some())
            || (stage < Stage::Quality && self.quality_report.is_some())
    }

    pub fn selected_scenarios(&self) -> Vec<Scenario> {
        self.scenarios
            .iter()
            .filter(|s| self.selected_scenario_ids.contains(&s.scenario_id))
            .cloned()
            .collect()
    }

    pub fn selected_cases(&self) -> Vec<TestCase> {
        self.test_cases
            .iter()
            .filter(|c| self.selected_case_ids.contains(&c.case_id))
            .cloned()
            .collect()
    }

    /// Replace scenarios; all start selected
    pub(crate) fn set_scenarios(&mut self, scenarios: Vec<Scenario>) {
        self.selected_scenario_ids = scenarios.iter().map(|s| s.scenario_id.clone()).collect();
        self.scenarios = scenarios;
    }

    /// Replace cases; all start selected
    pub(crate) fn set_cases(&mut self, cases: Vec<TestCase>) {
        self.selected_case_ids = cases.iter().map(|c| c.case_id.clone()).collect();
        self.test_cases = cases;
    }

    pub(crate) fn set_scenario_selected(&mut self, id: &str, selected: bool) -> bool {
        if !self.scenarios.iter().any(|s| s.scenario_id == id) {
            return false;
        }
        if selected {
            self.selected_scenario_ids.insert(id.to_string())
        } else {
            self.selected_scenario_ids.remove(id)
        }
    }

    pub(crate) fn select_all_scenarios(&mut self, selected: bool) {
        self.selected_scenario_ids = if selected {
            self.scenarios.iter().map(|s| s.scenario_id.clone()).collect()
        } else {
            BTreeSet::new()
        };
    }

    pub(crate) fn delete_scenario(&mut self, id: &str) -> bool {
        let before = self.scenarios.len();
        self.scenarios.retain(|s| s.scenario_id != id);
        self.selected_scenario_ids.remove(id);
        self.scenarios.len() != before
    }

    pub(crate) fn set_case_selected(&mut self, id: &str, selected: bool) -> bool {
        if !self.test_cases.iter().any(|c| c.case_id == id) {
            return false;
        }
        if selected {
            self.selected_case_ids.insert(id.to_string())
        } else {
            self.selected_case_ids.remove(id)
        }
    }

    pub(crate) fn select_all_cases(&mut self, selected: bool) {
        self.selected_case_ids = if selected {
            self.test_cases.iter().map(|c| c.case_id.clone()).collect()
        } else {
            BTreeSet::new()
        };
    }

    pub(crate) fn delete_case(&mut self, id: &str) -> bool {
        let before = self.test_cases.len();
        self.test_cases.retain(|c| c.case_id != id);
        self.selected_case_ids.remove(id);
        self.test_cases.len() != before
    }

    /// Replace a case by id; unknown ids leave everything unchanged
    pub(crate) fn update_case(&mut self, case: TestCase) -> bool {
        match self.test_cases.iter_mut().find(|c| c.case_id == case.case_id) {
            Some(existing) => {
                *existing = case;
                true
            }
            None => false,
        }
    }
}
