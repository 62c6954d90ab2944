use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::protocol::StreamAction;

/// Pipeline step, strictly ordered from `Input` to `Export`
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    #[default]
    Input,
    Analysis,
    Scenarios,
    Cases,
    Code,
    Quality,
    Export,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Self::Input,
        Self::Analysis,
        Self::Scenarios,
        Self::Cases,
        Self::Code,
        Self::Quality,
        Self::Export,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Analysis => "analysis",
            Self::Scenarios => "scenarios",
            Self::Cases => "cases",
            Self::Code => "code",
            Self::Quality => "quality",
            Self::Export => "export",
        }
    }

    /// Linear successor; `Cases` branches and `Export` is last
    pub fn next(&self) -> Option<Stage> {
        match self {
            Self::Input => Some(Self::Analysis),
            Self::Analysis => Some(Self::Scenarios),
            Self::Scenarios => Some(Self::Cases),
            Self::Cases => None,
            Self::Code | Self::Quality => Some(Self::Export),
            Self::Export => None,
        }
    }

    /// Streaming action that produces this stage's data
    pub fn action(&self) -> Option<StreamAction> {
        match self {
            Self::Analysis => Some(StreamAction::Requirement),
            Self::Scenarios => Some(StreamAction::Scenario),
            Self::Cases => Some(StreamAction::Case),
            Self::Code => Some(StreamAction::Code),
            Self::Quality => Some(StreamAction::Quality),
            Self::Input | Self::Export => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|stage| stage.name().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| format!("Unknown stage: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_matches_index() {
        for pair in Stage::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
            assert_eq!(pair[0].index() + 1, pair[1].index());
        }
    }

    #[test]
    fn test_next_and_branching() {
        assert_eq!(Stage::Input.next(), Some(Stage::Analysis));
        assert_eq!(Stage::Cases.next(), None);
        assert_eq!(Stage::Quality.next(), Some(Stage::Export));
        assert_eq!(Stage::Export.next(), None);
    }

    #[test]
    fn test_serde_and_parse() {
        assert_eq!(serde_json::to_string(&Stage::Scenarios).unwrap(), "\"scenarios\"");
        assert_eq!("CODE".parse::<Stage>().unwrap(), Stage::Code);
        assert!("deploy".parse::<Stage>().is_err());
        assert_eq!(Stage::Cases.action(), Some(StreamAction::Case));
        assert_eq!(Stage::Export.action(), None);
    }
}
