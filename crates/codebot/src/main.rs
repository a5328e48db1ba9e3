use std::env;
use std::fs;
use std::io::{self, IsTerminal, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use log::{LevelFilter, debug, info, warn};
use serde::Serialize;

use codebot::config::{self, APP_NAME, AppConfig};
use codebot::executor::{ProgressSink, ProcessRegistry};
use codebot::prompt::file_request;
use codebot::render::render_result;
use codebot::{ConversationHistory, ExecutionRequest, ExecutionResult, ExecutionService, UserId};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_run(ctx: RuntimeContext, cmd: RunCommand) -> Result<()> {
    handle_run(&ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("using config file {}", ctx.config_file.display());

    match cli.command {
        Command::Run(cmd) => async_run(ctx, cmd),
        Command::Format(cmd) => handle_format(&ctx, cmd),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Codebot - run a coding agent on behalf of chat users.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true)]
    json: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Emit additional diagnostics for troubleshooting
    #[arg(long = "diagnostics", global = true)]
    diagnostics: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Send one request to the agent and print the formatted answer
    Run(RunCommand),
    /// Format text from stdin into transport chunks
    Format(FormatCommand),
    /// Create the config directory and default config file
    Init(InitCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct RunCommand {
    /// Request text (read from stdin when omitted). With --file, the caption.
    message: Option<String>,
    /// Chat user the request is run for
    #[arg(long, default_value_t = 0)]
    user: UserId,
    /// Working directory for the agent (defaults to agent.default_working_dir)
    #[arg(long, value_name = "DIR")]
    cwd: Option<PathBuf>,
    /// Deadline in seconds (defaults to agent.timeout_secs)
    #[arg(long, value_name = "SECONDS")]
    timeout: Option<u64>,
    /// JSON array of previous turns ({"user", "assistant", "timestamp"})
    #[arg(long, value_name = "FILE")]
    history: Option<PathBuf>,
    /// Ask the agent about an uploaded file
    #[arg(long, value_name = "PATH")]
    file: Option<PathBuf>,
    /// Chunk size limit (defaults to formatter.max_message_length)
    #[arg(long, value_name = "CHARS")]
    max_length: Option<usize>,
    /// Do not print progress updates to stderr
    #[arg(long = "no-progress")]
    no_progress: bool,
}

#[derive(Debug, Clone, Args)]
struct FormatCommand {
    /// Chunk size limit (defaults to formatter.max_message_length)
    #[arg(long, value_name = "CHARS")]
    max_length: Option<usize>,
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Overwrite an existing config file
    #[arg(long)]
    force: bool,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    config_file: PathBuf,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let config_file = match common.config.as_deref() {
            Some(path) => {
                let expanded = match path.to_str() {
                    Some(text) => config::expand_str_path(text)?,
                    None => path.to_path_buf(),
                };
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => config::default_config_path()?,
        };

        let config = AppConfig::load(&config_file)?;
        Ok(Self {
            common,
            config_file,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = self.effective_log_level();
        let directive = level.to_string().to_lowercase();
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("codebot={directive},codebot_format={directive}"))
        });

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(io::stderr),
                )
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color)
                        .with_target(self.common.diagnostics)
                        .with_file(self.common.diagnostics)
                        .with_line_number(self.common.diagnostics),
                )
                .try_init()
                .ok();
        }

        // Fallback when another subscriber already owns the global dispatcher.
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(level);
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn max_length(&self, flag: Option<usize>) -> usize {
        flag.unwrap_or(self.config.formatter.max_message_length)
    }
}

#[derive(Debug, Serialize)]
struct RunOutput<'a> {
    result: &'a ExecutionResult,
    chunks: &'a [String],
}

async fn handle_run(ctx: &RuntimeContext, cmd: RunCommand) -> Result<()> {
    let problems = ctx.config.validate();
    if !problems.is_empty() {
        bail!(
            "configuration in {} is not usable:\n  - {}",
            ctx.config_file.display(),
            problems.join("\n  - ")
        );
    }

    let message = match &cmd.file {
        Some(path) => {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| anyhow!("--file needs a file path, got {}", path.display()))?;
            let path = fs::canonicalize(path)
                .with_context(|| format!("resolving uploaded file {}", path.display()))?;
            let request = file_request(&name, &path, cmd.message.as_deref());
            info!("{} file request: {}", request.kind, request.label);
            request.message
        }
        None => match cmd.message.clone() {
            Some(message) => message,
            None => read_stdin()?,
        },
    };
    if message.trim().is_empty() {
        bail!("empty request");
    }

    let history = match &cmd.history {
        Some(path) => {
            let body = fs::read_to_string(path)
                .with_context(|| format!("reading history file {}", path.display()))?;
            serde_json::from_str::<ConversationHistory>(&body)
                .with_context(|| format!("parsing history file {}", path.display()))?
        }
        None => ConversationHistory::new(),
    };

    let working_directory = match cmd.cwd {
        Some(dir) => dir,
        None => ctx.config.default_working_dir()?,
    };
    let timeout = cmd
        .timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| ctx.config.timeout());

    let executor = ctx.config.executor_config()?;
    let registry = Arc::new(ProcessRegistry::new(executor.grace_period));
    let service = Arc::new(ExecutionService::new(executor, registry));

    let interrupt = {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, stopping the agent");
                service.shutdown().await;
            }
        })
    };

    let progress: Option<Arc<dyn ProgressSink>> = if cmd.no_progress {
        None
    } else {
        Some(Arc::new(|status: String| async move {
            writeln!(io::stderr(), "{status}").context("writing progress")
        }))
    };

    let request = ExecutionRequest::new(cmd.user, message, working_directory)
        .with_history(history)
        .with_timeout(timeout);
    let result = service.execute(&request, progress).await?;
    interrupt.abort();

    let chunks = render_result(&result, ctx.max_length(cmd.max_length));
    let mut stdout = io::stdout().lock();
    if ctx.common.json {
        let output = RunOutput {
            result: &result,
            chunks: &chunks,
        };
        let body =
            serde_json::to_string_pretty(&output).context("serializing run output to JSON")?;
        writeln!(stdout, "{body}")?;
    } else {
        write_chunks(&mut stdout, &chunks)?;
    }

    if result.is_success() {
        Ok(())
    } else {
        Err(anyhow!(
            "execution {} after {}ms",
            result.status,
            result.elapsed_ms
        ))
    }
}

fn handle_format(ctx: &RuntimeContext, cmd: FormatCommand) -> Result<()> {
    let input = read_stdin()?;
    let chunks = codebot_format::format_message(&input, ctx.max_length(cmd.max_length));

    let mut stdout = io::stdout().lock();
    if ctx.common.json {
        let body = serde_json::to_string_pretty(&chunks).context("serializing chunks to JSON")?;
        writeln!(stdout, "{body}")?;
    } else {
        write_chunks(&mut stdout, &chunks)?;
    }
    Ok(())
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.config_file.exists() && !cmd.force {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.config_file.display()
        ));
    }

    config::write_default_config(&ctx.config_file)?;
    info!("wrote default config to {}", ctx.config_file.display());
    Ok(())
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else {
                print!(
                    "{}",
                    toml::to_string_pretty(&ctx.config).context("serializing config to TOML")?
                );
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => config::write_default_config(&ctx.config_file),
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

fn read_stdin() -> Result<String> {
    let mut input = String::new();
    io::stdin()
        .read_to_string(&mut input)
        .context("reading stdin")?;
    Ok(input)
}

/// Chunks separated by a blank line.
fn write_chunks(out: &mut impl Write, chunks: &[String]) -> Result<()> {
    for (i, chunk) in chunks.iter().enumerate() {
        if i > 0 {
            writeln!(out)?;
        }
        writeln!(out, "{chunk}")?;
    }
    Ok(())
}
