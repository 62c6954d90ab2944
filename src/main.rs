use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use testflow::cli::commands::run::{RunOptions, RunTarget};
use testflow::client::{CaseExportFormat, CodeExportFormat};
use testflow::protocol::StreamAction;
use testflow::{Config, ConfigLoader, RequirementDraft, RequirementInput, SessionId, TestType};
use tokio::runtime::Runtime;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Parse test type from string
fn parse_test_type(s: &str) -> Result<TestType, String> {
    s.parse()
}

/// Parse stream action from string
fn parse_stream_action(s: &str) -> Result<StreamAction, String> {
    match s.to_lowercase().as_str() {
        "requirement" => Ok(StreamAction::Requirement),
        "scenario" => Ok(StreamAction::Scenario),
        "case" => Ok(StreamAction::Case),
        "code" => Ok(StreamAction::Code),
        "quality" => Ok(StreamAction::Quality),
        "optimize" => Ok(StreamAction::Optimize),
        "supplement" => Ok(StreamAction::Supplement),
        _ => Err(format!(
            "Invalid action '{}'. Valid values: requirement, scenario, case, code, quality, optimize, supplement",
            s
        )),
    }
}

#[derive(Parser)]
#[command(name = "testflow")]
#[command(version, about = "Generate test cases and automation code from requirements")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, short, help = "Load this config file instead of the global/project layers")]
    config: Option<PathBuf>,

    #[arg(long, help = "Override api.base_url")]
    api_url: Option<String>,

    #[arg(long, help = "Override stream.url")]
    stream_url: Option<String>,

    #[arg(long)]
    verbose: bool,

    #[arg(long, short)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline from a requirement to test cases, code or a quality report
    Run {
        #[arg(long, conflicts_with_all = ["file", "url"], help = "Requirement text")]
        text: Option<String>,
        #[arg(long, conflicts_with = "url", help = "Requirement document to upload")]
        file: Option<PathBuf>,
        #[arg(long, help = "URL of the requirement")]
        url: Option<String>,
        #[arg(long = "type", value_parser = parse_test_type, default_value = "api", help = "Test type: ui, api, unit")]
        test_type: TestType,
        #[arg(long = "kb", value_delimiter = ',', help = "Knowledge base IDs")]
        knowledge_base_ids: Vec<i64>,
        #[arg(long, conflicts_with = "quality", help = "Generate automation code")]
        code: bool,
        #[arg(long, help = "Generate a quality report")]
        quality: bool,
        #[arg(long, requires = "code", help = "Tech stack for code generation")]
        tech_stack: Option<String>,
        #[arg(long, help = "Export cases: excel, word, json, markdown, html, csv")]
        export_cases: Option<CaseExportFormat>,
        #[arg(long, requires = "code", help = "Export code: zip, single, project")]
        export_code: Option<CodeExportFormat>,
        #[arg(long, help = "Project name for code export")]
        project_name: Option<String>,
        #[arg(long, short, default_value = ".", help = "Directory for exports")]
        output: PathBuf,
        #[arg(long, help = "Echo streamed text")]
        show_chunks: bool,
    },

    /// Send one command over the streaming channel and print the events
    Stream {
        #[arg(value_parser = parse_stream_action, help = "Stage action")]
        action: StreamAction,
        #[arg(long, short, help = "Session ID from a previous analysis")]
        session: String,
        #[arg(long, short, default_value = "{}", help = "Command data as JSON")]
        data: String,
    },

    /// Check whether a document passes the upload policy
    Check {
        #[arg(help = "Requirement document")]
        file: PathBuf,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration (merged from all sources)
    Show {
        #[arg(short = 'g', long, help = "Show global config file only")]
        global: bool,
        #[arg(short = 'f', long, default_value = "text", help = "Output format: text, json")]
        format: String,
    },
    /// Show configuration file paths
    Path,
    /// Initialize configuration
    Init {
        #[arg(long, short, help = "Initialize global config")]
        global: bool,
        #[arg(long, help = "Overwrite existing config")]
        force: bool,
    },
}

/// Set up panic handler for graceful error reporting
fn setup_panic_handler() {
    let default_hook = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |panic_info| {
        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };

        eprintln!("\n\x1b[1;31m━━━ PANIC ━━━\x1b[0m");
        eprintln!("\x1b[31mtestflow encountered an unexpected error:\x1b[0m");
        eprintln!("  {}", message);

        if let Some(location) = panic_info.location() {
            eprintln!(
                "\x1b[90mLocation: {}:{}:{}\x1b[0m",
                location.file(),
                location.line(),
                location.column()
            );
        }
        eprintln!();

        // Backtrace when RUST_BACKTRACE=1
        default_hook(panic_info);
    }));
}

fn main() -> ExitCode {
    setup_panic_handler();

    match run_cli() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("\x1b[31mError:\x1b[0m {}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path)?,
        None => ConfigLoader::load()?,
    };

    if let Some(url) = &cli.api_url {
        config.api.base_url = url.clone();
    }
    if let Some(url) = &cli.stream_url {
        config.stream.url = url.clone();
    }
    config.validate()?;
    Ok(config)
}

fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match &cli.command {
        Commands::Run {
            text,
            file,
            url,
            test_type,
            knowledge_base_ids,
            code,
            quality,
            tech_stack,
            export_cases,
            export_code,
            project_name,
            output,
            show_chunks,
        } => {
            let input = match (text, file, url) {
                (Some(text), _, _) => RequirementInput::Text(text.clone()),
                (_, Some(file), _) => RequirementInput::File(file.clone()),
                (_, _, Some(url)) => RequirementInput::Url(url.clone()),
                _ => anyhow::bail!("Provide a requirement with --text, --file or --url"),
            };
            let target = if *code {
                RunTarget::Code
            } else if *quality {
                RunTarget::Quality
            } else {
                RunTarget::Cases
            };

            let config = load_config(&cli)?;
            let rt = Runtime::new()?;
            rt.block_on(testflow::cli::commands::run::run(
                &config,
                RunOptions {
                    draft: RequirementDraft {
                        input,
                        test_type: *test_type,
                        knowledge_base_ids: knowledge_base_ids.clone(),
                    },
                    target,
                    tech_stack: tech_stack.clone(),
                    export_cases: *export_cases,
                    export_code: *export_code,
                    project_name: project_name.clone(),
                    out_dir: output.clone(),
                    show_chunks: *show_chunks,
                },
            ))?;
        }
        Commands::Stream {
            action,
            session,
            data,
        } => {
            let data: serde_json::Value = serde_json::from_str(data)?;
            let config = load_config(&cli)?;
            let rt = Runtime::new()?;
            rt.block_on(testflow::cli::commands::stream::run(
                &config,
                *action,
                SessionId::from(session.as_str()),
                data,
            ))?;
        }
        Commands::Check { file } => {
            let config = load_config(&cli)?;
            testflow::cli::commands::check::run(&config, file)?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show { global, format } => {
                testflow::cli::commands::config::show(*global, format)?;
            }
            ConfigAction::Path => {
                testflow::cli::commands::config::path()?;
            }
            ConfigAction::Init { global, force } => {
                testflow::cli::commands::config::init(*global, *force)?;
            }
        },
    }

    Ok(())
}
