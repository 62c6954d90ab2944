//! Observer events and trigger outcomes

use serde::Serialize;

use super::{MergeReport, Stage};
use crate::types::ClassifiedError;

/// Broadcast to every subscriber of the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    StageChanged {
        from: Stage,
        to: Stage,
    },
    /// Work progress for the stage being produced; uploads report `step = "upload"`
    Progress {
        stage: Stage,
        percent: u8,
        step: Option<String>,
    },
    /// Incremental streamed text
    Chunk {
        stage: Stage,
        content: String,
    },
    Reconnecting {
        stage: Stage,
        attempt: u32,
    },
    Error {
        stage: Stage,
        error: ClassifiedError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Advance {
    pub from: Stage,
    pub to: Stage,
}

/// Result of a trigger. Expected failures are values here, never `Err`.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Applied(T),
    /// Another unit of work is outstanding; nothing happened
    Busy,
    /// Wrong stage or unmet precondition; nothing was sent
    Rejected(ClassifiedError),
    /// The unit of work failed; stage and working set are unchanged
    Failed(ClassifiedError),
    /// Session is gone; back at `Input` with the working set retained
    SessionExpired(ClassifiedError),
    /// Unrecoverable failure; back at `Input` with the session kept
    Aborted(ClassifiedError),
    /// Result arrived after a reset or cancel and was dropped
    Discarded,
}

pub type Transition = Outcome<Advance>;
pub type CaseMerge = Outcome<MergeReport>;

impl<T> Outcome<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    pub fn error(&self) -> Option<&ClassifiedError> {
        match self {
            Self::Rejected(e) | Self::Failed(e) | Self::SessionExpired(e) | Self::Aborted(e) => Some(e),
            Self::Applied(_) | Self::Busy | Self::Discarded => None,
        }
    }

    pub fn applied(self) -> Option<T> {
        match self {
            Self::Applied(value) => Some(value),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Applied(_) => "applied",
            Self::Busy => "busy",
            Self::Rejected(_) => "rejected",
            Self::Failed(_) => "failed",
            Self::SessionExpired(_) => "session_expired",
            Self::Aborted(_) => "aborted",
            Self::Discarded => "discarded",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ErrorClassifier, codes};

    #[test]
    fn test_outcome_accessors() {
        let advanced: Transition = Outcome::Applied(Advance {
            from: Stage::Input,
            to: Stage::Analysis,
        });
        assert!(advanced.is_applied());
        assert!(advanced.error().is_none());

        let failed: Transition = Outcome::Failed(ErrorClassifier::classify(codes::LLM_API_ERROR, None));
        assert_eq!(failed.error().map(|e| e.code()), Some(codes::LLM_API_ERROR));
        assert_eq!(failed.label(), "failed");
        assert!(failed.applied().is_none());
    }

    #[test]
    fn test_event_serializes_tagged() {
        let event = PipelineEvent::StageChanged {
            from: Stage::Cases,
            to: Stage::Code,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "stage_changed");
        assert_eq!(value["to"], "code");
    }
}
