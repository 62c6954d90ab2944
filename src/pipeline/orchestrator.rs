//! Stage state machine
//!
//! ```text
//! Input ─submit─▶ Analysis ─confirm_analysis─▶ Scenarios ─confirm_scenarios─▶ Cases
//!                                                                              │
//!                                         ┌──────generate_code─────────────────┤
//!                                         ▼                                    ▼
//!                                        Code ───proceed──▶ Export ◀──proceed── Quality
//! ```
//!
//! All state sits behind one mutex that is never held across an `.await`.
//! A trigger takes a [`Ticket`] under the lock, does its I/O unlocked, and
//! applies the result under the lock again only if the ticket's generation is
//! still current. At most one ticket is outstanding at a time; dropping a
//! trigger future releases its ticket.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::stream_runner::{self, RunFailure};
use super::{Advance, CaseMerge, MergeReport, Outcome, PipelineEvent, Session, Stage, Transition, WorkingSet, merge_cases};
use crate::client::{
    AnalyzeRequest, ExportArtifact, ExportCasesOptions, ExportCodeOptions, HttpBackend, StageBackend,
    StageReply,
};
use crate::config::{Config, StreamConfig};
use crate::constants::{network, pipeline as pipeline_constants, session as session_constants};
use crate::protocol::{Command, StreamAction};
use crate::stream::{Connector, StreamSession, WsConnector};
use crate::transfer::ProgressFn;
use crate::types::{
    CaseId, ClassifiedError, CodeFiles, ErrorClassifier, QualityReport, RequirementAnalysis,
    RequirementDraft, RequirementInput, Result, Scenario, SessionId, TestCase, TestType, codes,
};

/// Options for the code generation stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeOptions {
    pub use_default_stack: bool,
    /// Free-form stack description used when `use_default_stack` is false
    pub tech_stack: Option<String>,
}

impl Default for CodeOptions {
    fn default() -> Self {
        Self {
            use_default_stack: true,
            tech_stack: None,
        }
    }
}

struct Inner {
    stage: Stage,
    working: WorkingSet,
    session: Option<Session>,
    generation: u64,
    next_ticket: u64,
    in_flight: Option<InFlight>,
}

struct InFlight {
    ticket: u64,
    cancel: CancellationToken,
}

/// Claim on the single unit-of-work slot; released on drop if still held
struct Ticket<'a> {
    state: &'a Mutex<Inner>,
    id: u64,
    generation: u64,
    cancel: CancellationToken,
    from: Stage,
    session_id: Option<SessionId>,
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        let mut inner = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.in_flight.as_ref().is_some_and(|slot| slot.ticket == self.id) {
            inner.in_flight = None;
            self.cancel.cancel();
            debug!(from = %self.from, "Unit of work abandoned by caller");
        }
    }
}

enum Refusal {
    Busy,
    Invalid(ClassifiedError),
    Expired(ClassifiedError),
}

impl Refusal {
    fn into_outcome<T>(self) -> Outcome<T> {
        match self {
            Self::Busy => Outcome::Busy,
            Self::Invalid(error) => Outcome::Rejected(error),
            Self::Expired(error) => Outcome::SessionExpired(error),
        }
    }
}

pub struct PipelineOrchestrator {
    backend: Arc<dyn StageBackend>,
    connector: Option<Arc<dyn Connector>>,
    stream_config: StreamConfig,
    session_ttl: chrono::Duration,
    state: Mutex<Inner>,
    events: broadcast::Sender<PipelineEvent>,
}

impl std::fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("PipelineOrchestrator")
            .field("stage", &inner.stage)
            .field("session", &inner.session)
            .field("busy", &inner.in_flight.is_some())
            .field("streaming", &self.connector.is_some())
            .finish()
    }
}

impl PipelineOrchestrator {
    pub fn new(backend: Arc<dyn StageBackend>, config: &Config) -> Self {
        let (events, _) = broadcast::channel(pipeline_constants::EVENT_CHANNEL_CAPACITY);
        Self {
            backend,
            connector: None,
            stream_config: config.stream.clone(),
            session_ttl: config.session.ttl(),
            state: Mutex::new(Inner {
                stage: Stage::Input,
                working: WorkingSet::default(),
                session: None,
                generation: 0,
                next_ticket: 0,
                in_flight: None,
            }),
            events,
        }
    }

    /// Route the configured streaming stages over `connector`
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// HTTP backend plus a WebSocket connector when any stage streams
    pub fn from_config(config: &Config) -> Result<Self> {
        let backend = Arc::new(HttpBackend::new(&config.api, &config.upload)?);
        let orchestrator = Self::new(backend, config);

        if config.stream.streaming_stages.is_empty() {
            return Ok(orchestrator);
        }

        let connector = WsConnector::new(
            config.stream.url.clone(),
            config.api.bearer_token(),
            Duration::from_secs(network::CONNECTION_TIMEOUT_SECS),
        );
        Ok(orchestrator.with_connector(Arc::new(connector)))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn stage(&self) -> Stage {
        self.lock().stage
    }

    /// Copy of the working set
    pub fn snapshot(&self) -> WorkingSet {
        self.lock().working.clone()
    }

    pub fn session(&self) -> Option<Session> {
        self.lock().session.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.lock().in_flight.is_some()
    }

    /// Attach a previously issued session, e.g. one persisted by the caller
    pub fn resume_session(&self, session: Session) {
        info!(session_id = %session.id, "Session resumed");
        self.lock().session = Some(session);
    }

    // =========================================================================
    // Stage Triggers
    // =========================================================================

    pub async fn submit(&self, input: RequirementInput, test_type: TestType) -> Transition {
        self.submit_draft(RequirementDraft {
            input,
            test_type,
            knowledge_base_ids: Vec::new(),
        })
        .await
    }

    /// Analyze a requirement, optionally augmented by knowledge bases
    pub async fn submit_draft(&self, draft: RequirementDraft) -> Transition {
        let (ticket, ()) = match self.begin(&[Stage::Input], "submit", false, |_| {
            if draft.input.is_empty() {
                Err(invalid("requirement input is empty"))
            } else {
                Ok(())
            }
        }) {
            Ok(claimed) => claimed,
            Err(refusal) => return refusal.into_outcome(),
        };

        info!(test_type = %draft.test_type, kb = draft.knowledge_base_ids.len(), "Submitting requirement");
        let result = self.analyze(&ticket, &draft).await;

        self.finish(&ticket, result, |inner, reply| {
            let analysis: RequirementAnalysis = whole(&reply.body)?;
            let session_id = reply
                .session_id
                .or_else(|| ticket.session_id.clone())
                .ok_or_else(|| invalid_payload("analysis response has no session_id"))?;

            inner.working.clear_after(Stage::Input);
            inner.working.requirement_analysis = Some(analysis);
            inner.working.draft = Some(draft);
            self.adopt_session(inner, Some(session_id));
            Ok(self.move_to(inner, Stage::Analysis))
        })
    }

    /// Submit the last successfully analyzed requirement again
    pub async fn resubmit(&self) -> Transition {
        let draft = self.lock().working.draft.clone();
        match draft {
            Some(draft) => self.submit_draft(draft).await,
            None => Outcome::Rejected(invalid("no previous requirement to resubmit")),
        }
    }

    pub async fn confirm_analysis(&self) -> Transition {
        let (ticket, data) = match self.begin(&[Stage::Analysis], "confirm_analysis", true, |inner| {
            let analysis = inner
                .working
                .requirement_analysis
                .as_ref()
                .ok_or_else(|| invalid("no requirement analysis to confirm"))?;
            let test_type = inner
                .working
                .draft
                .as_ref()
                .map(|d| d.test_type)
                .unwrap_or_default();
            Ok(json!({
                "requirement_analysis": analysis,
                "test_type": test_type,
            }))
        }) {
            Ok(claimed) => claimed,
            Err(refusal) => return refusal.into_outcome(),
        };

        let result = self.execute(&ticket, Stage::Scenarios, data).await;

        self.finish(&ticket, result, |inner, reply| {
            let scenarios: Vec<Scenario> = field(&reply.body, "scenarios")?;
            inner.working.clear_after(Stage::Analysis);
            inner.working.set_scenarios(scenarios);
            self.adopt_session(inner, reply.session_id);
            Ok(self.move_to(inner, Stage::Scenarios))
        })
    }

    pub async fn confirm_scenarios(&self) -> Transition {
        let (ticket, data) = match self.begin(&[Stage::Scenarios], "confirm_scenarios", true, |inner| {
            let selected = inner.working.selected_scenarios();
            if selected.is_empty() {
                return Err(invalid("select at least one scenario"));
            }
            Ok(json!({ "scenarios": selected }))
        }) {
            Ok(claimed) => claimed,
            Err(refusal) => return refusal.into_outcome(),
        };

        let result = self.execute(&ticket, Stage::Cases, data).await;

        self.finish(&ticket, result, |inner, reply| {
            let cases: Vec<TestCase> = field(&reply.body, "test_cases")?;
            inner.working.clear_after(Stage::Scenarios);
            inner.working.set_cases(cases);
            self.adopt_session(inner, reply.session_id);
            Ok(self.move_to(inner, Stage::Cases))
        })
    }

    pub async fn generate_code(&self, options: CodeOptions) -> Transition {
        let (ticket, data) = match self.begin(&[Stage::Cases], "generate_code", true, |inner| {
            let selected = inner.working.selected_cases();
            if selected.is_empty() {
                return Err(invalid("select at least one test case"));
            }
            Ok(json!({
                "test_cases": selected,
                "tech_stack": options.tech_stack,
                "use_default_stack": options.use_default_stack,
            }))
        }) {
            Ok(claimed) => claimed,
            Err(refusal) => return refusal.into_outcome(),
        };

        let result = self.execute(&ticket, Stage::Code, data).await;

        self.finish(&ticket, result, |inner, reply| {
            let files: CodeFiles = field(&reply.body, "files")?;
            inner.working.clear_after(Stage::Cases);
            inner.working.code_files = Some(files);
            self.adopt_session(inner, reply.session_id);
            Ok(self.move_to(inner, Stage::Code))
        })
    }

    pub async fn analyze_quality(&self) -> Transition {
        let (ticket, data) = match self.begin(&[Stage::Cases], "analyze_quality", true, |inner| {
            if inner.working.test_cases.is_empty() {
                return Err(invalid("there are no test cases to analyze"));
            }
            Ok(json!({
                "requirement_analysis": inner.working.requirement_analysis.clone().unwrap_or_default(),
                "scenarios": inner.working.selected_scenarios(),
                "test_cases": inner.working.test_cases,
            }))
        }) {
            Ok(claimed) => claimed,
            Err(refusal) => return refusal.into_outcome(),
        };

        let result = self.execute(&ticket, Stage::Quality, data).await;

        self.finish(&ticket, result, |inner, reply| {
            let report: QualityReport = whole(&reply.body)?;
            inner.working.clear_after(Stage::Cases);
            inner.working.quality_report = Some(report);
            self.adopt_session(inner, reply.session_id);
            Ok(self.move_to(inner, Stage::Quality))
        })
    }

    /// Code or Quality to Export; no backend call
    pub fn proceed(&self) -> Transition {
        let mut inner = self.lock();
        if inner.in_flight.is_some() {
            return Outcome::Busy;
        }
        if !matches!(inner.stage, Stage::Code | Stage::Quality) {
            return Outcome::Rejected(invalid(format!(
                "proceed is not allowed in the {} stage",
                inner.stage
            )));
        }
        Outcome::Applied(self.move_to(&mut inner, Stage::Export))
    }

    /// Drop everything and return to Input; any outstanding result is discarded
    pub fn reset(&self) -> Transition {
        let mut inner = self.lock();
        inner.generation += 1;
        if let Some(slot) = inner.in_flight.take() {
            slot.cancel.cancel();
        }
        inner.working = WorkingSet::default();
        inner.session = None;
        info!("Pipeline reset");
        Outcome::Applied(self.move_to(&mut inner, Stage::Input))
    }

    /// Cancel the outstanding unit of work, if any.
    ///
    /// A streamed stage closes its session right away; a one-shot call runs to
    /// completion and its result is discarded.
    pub fn cancel(&self) -> bool {
        let mut inner = self.lock();
        match inner.in_flight.take() {
            Some(slot) => {
                inner.generation += 1;
                slot.cancel.cancel();
                info!(stage = %inner.stage, "Unit of work cancelled");
                true
            }
            None => false,
        }
    }

    // =========================================================================
    // Side Calls
    // =========================================================================

    /// Rewrite the given cases by instruction and merge the replacements
    pub async fn optimize_cases(&self, case_ids: &[CaseId], instruction: &str) -> CaseMerge {
        let (ticket, data) = match self.begin(&[Stage::Cases], "optimize_cases", true, |inner| {
            if instruction.trim().is_empty() {
                return Err(invalid("optimization instruction is empty"));
            }
            let selected: Vec<&TestCase> = inner
                .working
                .test_cases
                .iter()
                .filter(|c| case_ids.contains(&c.case_id))
                .collect();
            if selected.is_empty() {
                return Err(invalid("none of the given cases exist"));
            }
            Ok(json!({
                "selected_cases": selected,
                "instruction": instruction,
            }))
        }) {
            Ok(claimed) => claimed,
            Err(refusal) => return refusal.into_outcome(),
        };

        let result = self.side_call(&ticket, StreamAction::Optimize, data).await;

        self.finish(&ticket, result, |inner, reply| {
            let optimized: Vec<TestCase> = field(&reply.body, "optimized_cases")?;
            Ok(self.merge_into(inner, optimized, false))
        })
    }

    /// Ask for additional cases; new ones are appended and selected
    pub async fn supplement_cases(&self, requirement: &str) -> CaseMerge {
        let (ticket, data) = match self.begin(&[Stage::Cases], "supplement_cases", true, |inner| {
            if requirement.trim().is_empty() {
                return Err(invalid("supplement requirement is empty"));
            }
            Ok(json!({
                "existing_cases": inner.working.test_cases,
                "requirement": requirement,
            }))
        }) {
            Ok(claimed) => claimed,
            Err(refusal) => return refusal.into_outcome(),
        };

        let result = self.side_call(&ticket, StreamAction::Supplement, data).await;

        self.finish(&ticket, result, |inner, reply| {
            let added: Vec<TestCase> = field(&reply.body, "new_cases")?;
            Ok(self.merge_into(inner, added, true))
        })
    }

    // =========================================================================
    // Local Mutations
    // =========================================================================

    pub fn set_scenario_selected(&self, id: &str, selected: bool) -> bool {
        self.lock().working.set_scenario_selected(id, selected)
    }

    pub fn select_all_scenarios(&self, selected: bool) {
        self.lock().working.select_all_scenarios(selected)
    }

    pub fn delete_scenario(&self, id: &str) -> bool {
        self.lock().working.delete_scenario(id)
    }

    pub fn set_case_selected(&self, id: &str, selected: bool) -> bool {
        self.lock().working.set_case_selected(id, selected)
    }

    pub fn select_all_cases(&self, selected: bool) {
        self.lock().working.select_all_cases(selected)
    }

    pub fn delete_case(&self, id: &str) -> bool {
        self.lock().working.delete_case(id)
    }

    /// Replace a case by id; `false` when no case has that id
    pub fn update_case(&self, case: TestCase) -> bool {
        let updated = self.lock().working.update_case(case);
        if !updated {
            debug!("update_case ignored an unknown id");
        }
        updated
    }

    // =========================================================================
    // Export
    // =========================================================================

    pub async fn export_cases(&self, options: &ExportCasesOptions) -> std::result::Result<ExportArtifact, ClassifiedError> {
        let (generation, session_id) = self.export_session(|working| {
            if working.test_cases.is_empty() {
                Err(invalid("there are no test cases to export"))
            } else {
                Ok(())
            }
        })?;
        info!(format = %options.format, "Exporting test cases");
        let result = self.backend.export_cases(&session_id, options).await;
        self.export_result(generation, result)
    }

    pub async fn export_code(&self, options: &ExportCodeOptions) -> std::result::Result<ExportArtifact, ClassifiedError> {
        let (generation, session_id) = self.export_session(|working| {
            if working.code_files.as_ref().is_none_or(|files| files.is_empty()) {
                Err(invalid("there is no generated code to export"))
            } else {
                Ok(())
            }
        })?;
        info!(format = %options.format, project = %options.project_name, "Exporting code");
        let result = self.backend.export_code(&session_id, options).await;
        self.export_result(generation, result)
    }

    fn export_session(
        &self,
        check: impl FnOnce(&WorkingSet) -> std::result::Result<(), ClassifiedError>,
    ) -> std::result::Result<(u64, SessionId), ClassifiedError> {
        let mut inner = self.lock();
        if inner.stage != Stage::Export {
            return Err(invalid(format!("export is not allowed in the {} stage", inner.stage)));
        }
        check(&inner.working)?;
        let session_id = match &inner.session {
            None => return Err(invalid("no active session")),
            Some(session) if session.is_expired(self.session_ttl, Utc::now()) => {
                let error = expired_locally();
                self.emit(PipelineEvent::Error {
                    stage: Stage::Export,
                    error: error.clone(),
                });
                self.expire(&mut inner);
                return Err(error);
            }
            Some(session) => session.id.clone(),
        };
        Ok((inner.generation, session_id))
    }

    fn export_result(
        &self,
        generation: u64,
        result: Result<ExportArtifact>,
    ) -> std::result::Result<ExportArtifact, ClassifiedError> {
        let error = match result {
            Ok(artifact) => {
                info!(filename = %artifact.filename, bytes = artifact.bytes.len(), "Export downloaded");
                return Ok(artifact);
            }
            Err(e) => e.classify(),
        };

        warn!("Export failed: {}", error);
        let mut inner = self.lock();
        if inner.generation == generation {
            self.emit(PipelineEvent::Error {
                stage: inner.stage,
                error: error.clone(),
            });
            if error.is_session_expired() {
                self.expire(&mut inner);
            }
        }
        Err(error)
    }

    // =========================================================================
    // Unit-of-work Plumbing
    // =========================================================================

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: PipelineEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn begin<P>(
        &self,
        allowed: &[Stage],
        trigger: &str,
        needs_session: bool,
        prepare: impl FnOnce(&Inner) -> std::result::Result<P, ClassifiedError>,
    ) -> std::result::Result<(Ticket<'_>, P), Refusal> {
        let mut inner = self.lock();

        if inner.in_flight.is_some() {
            debug!(trigger, "Busy; trigger ignored");
            return Err(Refusal::Busy);
        }
        if !allowed.contains(&inner.stage) {
            return Err(Refusal::Invalid(invalid(format!(
                "{} is not allowed in the {} stage",
                trigger, inner.stage
            ))));
        }

        let expired = inner
            .session
            .as_ref()
            .is_some_and(|s| s.is_expired(self.session_ttl, Utc::now()));
        if expired {
            if needs_session {
                let error = expired_locally();
                warn!(trigger, "Session expired locally");
                self.emit(PipelineEvent::Error {
                    stage: inner.stage,
                    error: error.clone(),
                });
                self.expire(&mut inner);
                return Err(Refusal::Expired(error));
            }
            // Analysis opens a fresh session anyway
            debug!("Dropping locally expired session before submit");
            inner.session = None;
        }

        let session_id = inner.session.as_ref().map(|s| s.id.clone());
        if needs_session && session_id.is_none() {
            return Err(Refusal::Invalid(invalid("no active session; submit a requirement first")));
        }

        let prepared = prepare(&*inner).map_err(Refusal::Invalid)?;
        let cancel = CancellationToken::new();
        inner.next_ticket += 1;
        let id = inner.next_ticket;
        inner.in_flight = Some(InFlight {
            ticket: id,
            cancel: cancel.clone(),
        });

        debug!(trigger, stage = %inner.stage, generation = inner.generation, "Unit of work started");
        Ok((
            Ticket {
                state: &self.state,
                id,
                generation: inner.generation,
                cancel,
                from: inner.stage,
                session_id,
            },
            prepared,
        ))
    }

    /// Apply a unit-of-work result if its ticket is still current
    fn finish<R, T>(
        &self,
        ticket: &Ticket<'_>,
        result: std::result::Result<R, ClassifiedError>,
        apply: impl FnOnce(&mut Inner, R) -> std::result::Result<T, ClassifiedError>,
    ) -> Outcome<T> {
        let mut inner = self.lock();
        if inner.generation != ticket.generation || ticket.cancel.is_cancelled() {
            debug!(from = %ticket.from, "Discarding stale result");
            return Outcome::Discarded;
        }
        inner.in_flight = None;

        match result.and_then(|value| apply(&mut *inner, value)) {
            Ok(applied) => Outcome::Applied(applied),
            Err(error) => self.fail(&mut inner, ticket.from, error),
        }
    }

    fn fail<T>(&self, inner: &mut Inner, stage: Stage, error: ClassifiedError) -> Outcome<T> {
        self.emit(PipelineEvent::Error {
            stage,
            error: error.clone(),
        });

        if error.is_session_expired() {
            warn!(%stage, "Session expired");
            self.expire(inner);
            return Outcome::SessionExpired(error);
        }
        if error.is_fatal() {
            warn!(%stage, "Fatal failure, returning to input: {}", error);
            self.move_to(inner, Stage::Input);
            return Outcome::Aborted(error);
        }

        warn!(%stage, "Unit of work failed: {}", error);
        Outcome::Failed(error)
    }

    fn expire(&self, inner: &mut Inner) {
        inner.session = None;
        if !session_constants::RETAIN_WORKING_SET_ON_EXPIRY {
            let draft = inner.working.draft.take();
            inner.working = WorkingSet {
                draft,
                ..WorkingSet::default()
            };
        }
        self.move_to(inner, Stage::Input);
    }

    fn move_to(&self, inner: &mut Inner, to: Stage) -> Advance {
        let from = inner.stage;
        if from != to {
            inner.stage = to;
            info!(%from, %to, "Stage changed");
            self.emit(PipelineEvent::StageChanged { from, to });
        }
        Advance { from, to }
    }

    fn adopt_session(&self, inner: &mut Inner, session_id: Option<SessionId>) {
        let Some(id) = session_id else {
            return;
        };
        if inner.session.as_ref().is_some_and(|s| s.id == id) {
            return;
        }
        info!(session_id = %id, "Session started");
        inner.session = Some(Session::new(id));
    }

    fn merge_into(&self, inner: &mut Inner, incoming: Vec<TestCase>, select_new: bool) -> MergeReport {
        let report = merge_cases(&mut inner.working.test_cases, incoming);
        if select_new {
            inner
                .working
                .selected_case_ids
                .extend(report.appended.iter().cloned());
        }
        info!(
            replaced = report.replaced.len(),
            appended = report.appended.len(),
            "Cases merged"
        );
        report
    }

    async fn analyze(&self, ticket: &Ticket<'_>, draft: &RequirementDraft) -> std::result::Result<StageReply, ClassifiedError> {
        let result = self.analyze_once(ticket, draft, draft.knowledge_base_ids.clone()).await;
        match result {
            Err(error)
                if error.code() == codes::KB_SEARCH_ERROR
                    && !draft.knowledge_base_ids.is_empty()
                    && !ticket.cancel.is_cancelled() =>
            {
                warn!("Knowledge base search failed, retrying without knowledge bases");
                self.analyze_once(ticket, draft, Vec::new()).await
            }
            other => other,
        }
    }

    async fn analyze_once(
        &self,
        ticket: &Ticket<'_>,
        draft: &RequirementDraft,
        knowledge_base_ids: Vec<i64>,
    ) -> std::result::Result<StageReply, ClassifiedError> {
        // The streaming handler needs an existing session and plain text
        if let (RequirementInput::Text(text), Some(_)) = (&draft.input, &ticket.session_id) {
            if self.streams(Stage::Analysis) {
                let data = json!({
                    "requirement_text": text,
                    "test_type": draft.test_type,
                    "knowledge_base_ids": knowledge_base_ids,
                });
                return self.execute(ticket, Stage::Analysis, data).await;
            }
        }

        let on_progress = matches!(draft.input, RequirementInput::File(_)).then(|| {
            let events = self.events.clone();
            let progress: ProgressFn = Arc::new(move |percent| {
                let _ = events.send(PipelineEvent::Progress {
                    stage: Stage::Analysis,
                    percent,
                    step: Some("upload".to_string()),
                });
            });
            progress
        });

        let request = AnalyzeRequest {
            input: draft.input.clone(),
            test_type: draft.test_type,
            knowledge_base_ids,
            session_id: ticket.session_id.clone(),
        };
        self.backend
            .analyze(request, on_progress)
            .await
            .map_err(|e| e.classify())
    }

    fn streams(&self, stage: Stage) -> bool {
        self.connector.is_some() && self.stream_config.streams(stage)
    }

    /// Produce `stage`'s data over the stream when configured, else one-shot
    async fn execute(&self, ticket: &Ticket<'_>, stage: Stage, data: Value) -> std::result::Result<StageReply, ClassifiedError> {
        let action = stage
            .action()
            .ok_or_else(|| invalid(format!("the {} stage has no unit of work", stage)))?;
        let session_id = ticket
            .session_id
            .clone()
            .ok_or_else(|| invalid("no active session"))?;

        let connector = match &self.connector {
            Some(connector) if self.stream_config.streams(stage) => connector.clone(),
            _ => {
                return self
                    .backend
                    .invoke(action, &session_id, data)
                    .await
                    .map_err(|e| e.classify());
            }
        };

        debug!(%stage, %action, "Streaming unit of work");
        let mut session = StreamSession::new(connector, &self.stream_config);
        let command = Command::new(action, session_id, data);
        match stream_runner::run(&mut session, &command, stage, &self.events, &ticket.cancel).await {
            Ok(body) => Ok(StageReply::from_body(body)),
            // The ticket is cancelled, so `finish` discards this
            Err(RunFailure::Cancelled) => Err(ErrorClassifier::classify_no_response(Some("cancelled"))),
            Err(RunFailure::Failed(error)) => Err(error),
        }
    }

    async fn side_call(
        &self,
        ticket: &Ticket<'_>,
        action: StreamAction,
        data: Value,
    ) -> std::result::Result<StageReply, ClassifiedError> {
        let session_id = ticket
            .session_id
            .clone()
            .ok_or_else(|| invalid("no active session"))?;
        self.backend
            .invoke(action, &session_id, data)
            .await
            .map_err(|e| e.classify())
    }
}

fn invalid(detail: impl Into<String>) -> ClassifiedError {
    ErrorClassifier::classify(codes::VALIDATION_ERROR, None).with_detail(detail)
}

fn invalid_payload(detail: impl Into<String>) -> ClassifiedError {
    ErrorClassifier::classify(codes::INVALID_PAYLOAD, None).with_detail(detail)
}

fn expired_locally() -> ClassifiedError {
    ErrorClassifier::classify(codes::SESSION_EXPIRED, None).with_detail("session TTL elapsed locally")
}

/// Read `key` from a response body; a bare array stands in for the keyed list
fn field<T: DeserializeOwned>(body: &Value, key: &str) -> std::result::Result<T, ClassifiedError> {
    let value = match body.get(key) {
        Some(value) => value,
        None if body.is_array() => body,
        None => return Err(invalid_payload(format!("response has no `{}`", key))),
    };
    serde_json::from_value(value.clone()).map_err(|e| invalid_payload(format!("`{}`: {}", key, e)))
}

fn whole<T: DeserializeOwned>(body: &Value) -> std::result::Result<T, ClassifiedError> {
    if !body.is_object() {
        return Err(invalid_payload("response is not a JSON object"));
    }
    serde_json::from_value(body.clone()).map_err(|e| invalid_payload(e.to_string()))
}
