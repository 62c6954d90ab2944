//! Partial-update merge for optimize and supplement responses

use std::collections::HashMap;

use serde::Serialize;

use crate::types::{CaseId, TestCase};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    /// Ids whose existing record was replaced in place
    pub replaced: Vec<CaseId>,
    /// Ids that were new, in response order
    pub appended: Vec<CaseId>,
}

impl MergeReport {
    pub fn is_empty(&self) -> bool {
        self.replaced.is_empty() && self.appended.is_empty()
    }
}

/// Merge `incoming` into `existing` by case id.
///
/// Matches replace the existing record at its position, new ids are appended in
/// response order, and cases the response does not mention stay untouched. A
/// duplicate id inside `incoming` resolves to its last occurrence.
pub fn merge_cases(existing: &mut Vec<TestCase>, incoming: Vec<TestCase>) -> MergeReport {
    let mut index: HashMap<CaseId, usize> = existing
        .iter()
        .enumerate()
        .map(|(i, case)| (case.case_id.clone(), i))
        .collect();
    let original_len = existing.len();
    let mut report = MergeReport::default();

    for case in incoming {
        match index.get(&case.case_id) {
            Some(&i) => {
                let id = case.case_id.clone();
                existing[i] = case;
                if i < original_len && !report.replaced.contains(&id) {
                    report.replaced.push(id);
                }
            }
            None => {
                index.insert(case.case_id.clone(), existing.len());
                report.appended.push(case.case_id.clone());
                existing.push(case);
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::working_set::tests::case;
    use proptest::prelude::*;

    fn ids(cases: &[TestCase]) -> Vec<&str> {
        cases.iter().map(|c| c.case_id.as_str()).collect()
    }

    #[test]
    fn test_replace_in_place_and_append_new() {
        let mut existing = vec![case("C1", "a"), case("C2", "b"), case("C3", "c")];
        let report = merge_cases(
            &mut existing,
            vec![case("C4", "new"), case("C2", "b2")],
        );

        assert_eq!(ids(&existing), ["C1", "C2", "C3", "C4"]);
        assert_eq!(existing[1].title, "b2");
        assert_eq!(existing[0].title, "a");
        assert_eq!(report.replaced, vec!["C2".to_string()]);
        assert_eq!(report.appended, vec!["C4".to_string()]);
    }

    #[test]
    fn test_empty_response_changes_nothing() {
        let mut existing = vec![case("C1", "a")];
        let report = merge_cases(&mut existing, Vec::new());
        assert!(report.is_empty());
        assert_eq!(existing.len(), 1);
    }

    #[test]
    fn test_duplicate_incoming_id_keeps_last() {
        let mut existing = Vec::new();
        let report = merge_cases(&mut existing, vec![case("N1", "first"), case("N1", "second")]);
        assert_eq!(existing.len(), 1);
        assert_eq!(existing[0].title, "second");
        assert_eq!(report.appended, vec!["N1".to_string()]);
        assert!(report.replaced.is_empty());
    }

    proptest! {
        #[test]
        fn prop_unmentioned_cases_untouched(
            existing_ids in proptest::collection::btree_set(0u8..40, 0..12),
            incoming_ids in proptest::collection::vec(0u8..60, 0..12),
        ) {
            let mut existing: Vec<TestCase> = existing_ids
                .iter()
                .map(|i| case(&format!("C{i}"), "old"))
                .collect();
            let before = existing.clone();
            let incoming: Vec<TestCase> = incoming_ids
                .iter()
                .map(|i| case(&format!("C{i}"), "new"))
                .collect();

            let report = merge_cases(&mut existing, incoming);

            // Existing order is preserved as a prefix
            prop_assert_eq!(ids(&existing[..before.len()]), ids(&before));
            for (old, merged) in before.iter().zip(existing.iter()) {
                let mentioned = incoming_ids.iter().any(|i| format!("C{i}") == old.case_id);
                if mentioned {
                    prop_assert_eq!(&merged.title, "new");
                } else {
                    prop_assert_eq!(merged, old);
                }
            }
            prop_assert_eq!(existing.len(), before.len() + report.appended.len());

            let mut seen = std::collections::HashSet::new();
            prop_assert!(existing.iter().all(|c| seen.insert(c.case_id.clone())));
        }
    }
}
