//! cf - ConversationFile workflow tool
//!
//! CLI entry point for validating, inspecting and rendering workflows.

use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tracing::{debug, info};

use convofile::cli::{Cli, Command, get_log_path};
use convofile::config::Config;
use convofile::context::validate_context;
use convofile::conversation::{Conversation, Step, global, step_directive, validate_requirements};
use convofile::cycle::TemplateVars;
use convofile::error::{ConvoError, exit_codes};
use convofile::render::{RenderMode, RenderedWorkflow};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Priority: CLI --log-level > config file > INFO
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    setup_logging(cli.log_level.as_deref(), config.log_level.as_deref()).context("Failed to setup logging")?;

    debug!(command = ?cli.command, "main: dispatching command");
    let code = match cli.command {
        Command::Validate { files } => cmd_validate(&files),
        Command::Render {
            file,
            plan,
            cycles,
            vars,
            cwd,
            output,
        } => {
            let mode = if plan { RenderMode::Plan } else { RenderMode::Full };
            cmd_render(&file, mode, cycles, vars, cwd, output.as_deref()).await?
        }
        Command::Show { file } => cmd_show(&file),
    };

    if code != exit_codes::OK {
        std::process::exit(code);
    }
    Ok(())
}

fn report_error(label: &str, err: &ConvoError) -> i32 {
    eprintln!("{} {}: {}", "✗".red(), label, err);
    eprintln!("  {}", err.remediation().dimmed());
    err.exit_code()
}

fn current_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// Compile one workflow and check its REQUIRE entries and mandatory context
fn validate_one(path: &Path, cwd: &Path) -> Result<Conversation, ConvoError> {
    debug!(?path, "validate_one: called");
    let conversation = Conversation::load(path, &global::snapshot())?;
    let config = &conversation.config;
    let base_dir = conversation.base_dir();

    let issues = validate_requirements(config, &base_dir);
    if !issues.is_empty() && !config.is_lenient() {
        return Err(ConvoError::Requirements { issues });
    }

    let cwd = match &config.cwd {
        Some(dir) => cwd.join(dir),
        None => cwd.to_path_buf(),
    };
    validate_context(config, &cwd, &base_dir)?;
    Ok(conversation)
}

fn cmd_validate(files: &[PathBuf]) -> i32 {
    debug!(count = files.len(), "cmd_validate: called");
    let cwd = current_dir();
    let mut code = exit_codes::OK;
    for file in files {
        let label = file.display().to_string();
        match validate_one(file, &cwd) {
            Ok(conversation) => {
                println!(
                    "{} {}: {} steps, {} prompts, {} cycle(s)",
                    "✓".green(),
                    label,
                    conversation.steps.len(),
                    conversation.prompt_count(),
                    conversation.config.cycles()
                );
            }
            Err(e) => {
                let failed = report_error(&label, &e);
                if code == exit_codes::OK {
                    code = failed;
                }
            }
        }
    }
    code
}

async fn cmd_render(
    file: &Path,
    mode: RenderMode,
    cycles: Option<u32>,
    vars: Vec<(String, String)>,
    cwd: Option<PathBuf>,
    output: Option<&Path>,
) -> Result<i32> {
    debug!(?file, %mode, ?cycles, "cmd_render: called");
    let cwd = cwd.unwrap_or_else(current_dir);
    let label = file.display().to_string();

    let conversation = match Conversation::load(file, &global::snapshot()) {
        Ok(c) => c,
        Err(e) => return Ok(report_error(&label, &e.into())),
    };

    let mut template_vars = TemplateVars::standard(&cwd).await;
    template_vars.extend(vars);

    let rendered = match RenderedWorkflow::render(&conversation, &cwd, &template_vars, mode, cycles) {
        Ok(r) => r,
        Err(e) => return Ok(report_error(&label, &e)),
    };
    let json = match rendered.to_json() {
        Ok(j) => j,
        Err(e) => return Ok(report_error(&label, &e)),
    };

    match output {
        Some(path) => {
            fs::write(path, json).context(format!("Failed to write {}", path.display()))?;
            info!(path = %path.display(), "Rendered workflow written");
        }
        None => println!("{}", json),
    }
    Ok(exit_codes::OK)
}

fn print_steps(steps: &[Step], depth: usize) {
    let indent = "  ".repeat(depth);
    for (i, step) in steps.iter().enumerate() {
        let text = step_directive(step);
        let first = text.lines().next().unwrap_or_default();
        println!("{}{:>3}. {} {}", indent, i + 1, format!("[{}]", step.type_name()).as_str().cyan(), first);

        let (on_failure, on_success) = step.blocks();
        if !on_failure.is_empty() {
            println!("{}     {}", indent, "ON-FAILURE".yellow());
            print_steps(on_failure, depth + 3);
        }
        if !on_success.is_empty() {
            println!("{}     {}", indent, "ON-SUCCESS".green());
            print_steps(on_success, depth + 3);
        }
    }
}

fn cmd_show(file: &Path) -> i32 {
    debug!(?file, "cmd_show: called");
    let conversation = match Conversation::load(file, &global::snapshot()) {
        Ok(c) => c,
        Err(e) => return report_error(&file.display().to_string(), &e.into()),
    };
    let config = &conversation.config;

    println!("{} {}", "Workflow:".bold(), conversation.name());
    println!("  model: {}", config.model.as_deref().unwrap_or("-"));
    println!("  session-mode: {}", config.session_mode);
    println!("  max-cycles: {}", config.cycles());
    println!("  context: {}", config.context.len() + config.context_optional.len());
    println!("{}", "Steps:".bold());
    print_steps(&conversation.steps, 1);
    exit_codes::OK
}
