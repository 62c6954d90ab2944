//! Generation pipeline
//!
//! [`PipelineOrchestrator`] sequences the stages, owns the [`WorkingSet`], and
//! reports progress through [`PipelineEvent`]s. Stages listed in
//! `stream.streaming_stages` run over a streaming session; everything else is
//! a one-shot backend call.

mod events;
mod merge;
mod orchestrator;
mod session;
mod stage;
mod stream_runner;
pub(crate) mod working_set;

pub use events::{Advance, CaseMerge, Outcome, PipelineEvent, Transition};
pub use merge::{MergeReport, merge_cases};
pub use orchestrator::{CodeOptions, PipelineOrchestrator};
pub use session::Session;
pub use stage::Stage;
pub use working_set::WorkingSet;
