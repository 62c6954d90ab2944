//! Run Command
//!
//! Drives the whole pipeline non-interactively: analyze, generate scenarios
//! and cases with everything selected, then code or a quality report, and
//! finally download the requested exports.

use std::path::{Path, PathBuf};

use crate::cli::progress::ConsoleRenderer;
use crate::cli::ui::Output;
use crate::client::{
    CaseExportFormat, CodeExportFormat, ExportArtifact, ExportCasesOptions, ExportCodeOptions,
};
use crate::config::Config;
use crate::constants::pipeline as pipeline_constants;
use crate::pipeline::{CodeOptions, Outcome, PipelineOrchestrator};
use crate::types::{FlowError, RequirementDraft, Result};

/// Where the run stops after test cases exist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTarget {
    Cases,
    Code,
    Quality,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub draft: RequirementDraft,
    pub target: RunTarget,
    pub tech_stack: Option<String>,
    pub export_cases: Option<CaseExportFormat>,
    pub export_code: Option<CodeExportFormat>,
    pub project_name: Option<String>,
    pub out_dir: PathBuf,
    pub show_chunks: bool,
}

pub async fn run(config: &Config, options: RunOptions) -> Result<()> {
    let orchestrator = PipelineOrchestrator::from_config(config)?;
    let renderer = ConsoleRenderer::new()
        .with_chunks(options.show_chunks)
        .spawn(orchestrator.subscribe());

    let result = tokio::select! {
        result = drive(&orchestrator, &options) => result,
        _ = tokio::signal::ctrl_c() => {
            orchestrator.cancel();
            Err(FlowError::Validation("interrupted".to_string()))
        }
    };

    renderer.abort();
    if let Err(FlowError::Classified(error)) = &result {
        Output::new().failure(error);
    }
    result
}

async fn drive(orchestrator: &PipelineOrchestrator, options: &RunOptions) -> Result<()> {
    let output = Output::new();
    output.header("testflow");

    applied(orchestrator.submit_draft(options.draft.clone()).await)?;
    let ws = orchestrator.snapshot();
    if let Some(analysis) = &ws.requirement_analysis {
        output.field("Functions:", &analysis.function_points.len().to_string());
        output.field("Rules:", &analysis.business_rules.len().to_string());
    }
    if let Some(session) = orchestrator.session() {
        output.field("Session:", session.id.as_str());
    }

    applied(orchestrator.confirm_analysis().await)?;
    output.field("Scenarios:", &orchestrator.snapshot().scenarios.len().to_string());

    applied(orchestrator.confirm_scenarios().await)?;
    output.field("Cases:", &orchestrator.snapshot().test_cases.len().to_string());

    match options.target {
        RunTarget::Cases => {
            output.success("Test cases generated");
            return Ok(());
        }
        RunTarget::Code => {
            let code = CodeOptions {
                use_default_stack: options.tech_stack.is_none(),
                tech_stack: options.tech_stack.clone(),
            };
            applied(orchestrator.generate_code(code).await)?;
            let files = orchestrator.snapshot().code_files.unwrap_or_default();
            output.section("Generated files");
            for path in files.keys() {
                println!("  {}", path);
            }
        }
        RunTarget::Quality => {
            applied(orchestrator.analyze_quality().await)?;
            if let Some(report) = orchestrator.snapshot().quality_report {
                output.section("Quality");
                output.field("Total score:", &format!("{:.1}", report.quality_score.total_score));
                output.field(
                    "Coverage:",
                    &format!("{:.1}%", report.coverage_analysis.coverage_rate),
                );
                for suggestion in &report.suggestions {
                    println!("  - {}", suggestion);
                }
            }
        }
    }

    applied(orchestrator.proceed())?;

    if let Some(format) = options.export_cases {
        let artifact = orchestrator
            .export_cases(&ExportCasesOptions {
                format,
                include_requirement: true,
                include_scenarios: true,
                include_cases: true,
                include_quality_report: options.target == RunTarget::Quality,
            })
            .await?;
        let path = write_artifact(&options.out_dir, &artifact)?;
        output.success(&format!("Cases exported to {}", path.display()));
    }

    if let Some(format) = options.export_code {
        let artifact = orchestrator
            .export_code(&ExportCodeOptions {
                format,
                project_name: options
                    .project_name
                    .clone()
                    .unwrap_or_else(|| pipeline_constants::DEFAULT_PROJECT_NAME.to_string()),
            })
            .await?;
        let path = write_artifact(&options.out_dir, &artifact)?;
        output.success(&format!("Code exported to {}", path.display()));
    }

    output.success("Pipeline finished");
    Ok(())
}

fn applied<T>(outcome: Outcome<T>) -> Result<T> {
    match outcome {
        Outcome::Applied(value) => Ok(value),
        Outcome::Busy => Err(FlowError::Validation("another step is still running".to_string())),
        Outcome::Discarded => Err(FlowError::Validation("step was cancelled".to_string())),
        Outcome::Rejected(error)
        | Outcome::Failed(error)
        | Outcome::SessionExpired(error)
        | Outcome::Aborted(error) => Err(FlowError::Classified(error)),
    }
}

/// Write under `out_dir` using only the final component of the suggested name
fn write_artifact(out_dir: &Path, artifact: &ExportArtifact) -> Result<PathBuf> {
    let name = Path::new(&artifact.filename)
        .file_name()
        .map(|n| n.to_os_string())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| FlowError::Validation(format!("invalid export filename `{}`", artifact.filename)))?;

    std::fs::create_dir_all(out_dir)?;
    let path = out_dir.join(name);
    std::fs::write(&path, &artifact.bytes)?;
    Ok(path)
}
