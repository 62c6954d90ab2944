//! testflow - staged test generation client
//!
//! Drives a backend that turns a requirement into analysed requirements,
//! test scenarios, test cases, automation code and a quality report. Each
//! stage is a one-shot REST call or a streamed unit of work over WebSocket.
//!
//! ## Core Features
//!
//! - **Pipeline Orchestrator**: stage machine with cancellation and stale-result discard
//! - **Streaming Sessions**: epoch-tagged events with fixed-interval reconnect
//! - **Chunked Upload**: validated multipart upload with progress reporting
//! - **Error Classification**: backend codes mapped to fatal, transient or user-fixable
//!
//! ## Quick Start
//!
//! ```ignore
//! use testflow::{ConfigLoader, PipelineOrchestrator, RequirementInput, TestType};
//!
//! let config = ConfigLoader::load()?;
//! let pipeline = PipelineOrchestrator::from_config(&config)?;
//! pipeline
//!     .submit(RequirementInput::Text("User login".into()), TestType::Api)
//!     .await;
//! pipeline.confirm_analysis().await;
//! ```
//!
//! ## Modules
//!
//! - [`pipeline`]: stage machine, working set, case merging
//! - [`stream`]: WebSocket session lifecycle
//! - [`protocol`]: streaming wire codec
//! - [`transfer`]: requirement document upload
//! - [`client`]: REST backend and export downloads
//! - [`types`]: payloads, error taxonomy

pub mod cli;
pub mod client;
pub mod config;
pub mod constants;
pub mod pipeline;
pub mod protocol;
pub mod stream;
pub mod transfer;
pub mod types;

// =============================================================================
// Core Re-exports
// =============================================================================

// Configuration
pub use config::{Config, ConfigLoader};

// Error Types
pub use types::error::{ClassifiedError, ErrorClassifier, FlowError, Result, ResultExt, Severity};

// Domain
pub use types::{
    CaseId, QualityReport, RequirementAnalysis, RequirementDraft, RequirementInput, Scenario,
    SessionId, TestCase, TestType,
};

// =============================================================================
// Pipeline Re-exports
// =============================================================================

pub use pipeline::{
    Advance, CaseMerge, CodeOptions, Outcome, PipelineEvent, PipelineOrchestrator, Stage,
    Transition, WorkingSet,
};

// =============================================================================
// Transport Re-exports
// =============================================================================

pub use client::{HttpBackend, StageBackend, with_timeout};
pub use protocol::{Command, MessageCodec, StreamAction, StreamEvent};
pub use stream::{Connector, SessionEvent, StreamSession, WsConnector};
pub use transfer::{ChunkedTransfer, TransferError, UploadTask};
