//! `acplink` - headless host for ACP agents.
//!
//! Spawns an agent, opens a session and streams one prompt turn to stdout.
//! Diagnostics go to stderr through `tracing`.

use std::io::Write;
use std::path::PathBuf;

use acplink_core::{
    AcpClient, ConnectConfig, OperatingMode, PermissionDecision, PermissionHandler, PlanStatus,
    RequestPermissionParams, SendOptions, StopReason, StreamEvent,
};
use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "acplink",
    about = "Drive an ACP agent from the terminal",
    version,
    long_about = None
)]
struct Cli {
    /// TOML file with connection settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Working directory for the agent session
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Agent executable; overrides `binaryPath` from the config file
    #[arg(long)]
    binary: Option<String>,

    /// Extra arguments passed to the agent
    #[arg(long = "agent-arg", allow_hyphen_values = true)]
    agent_args: Vec<String>,

    #[arg(long, value_enum)]
    mode: Option<CliMode>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, clap::ValueEnum)]
enum CliMode {
    /// Serve terminal requests locally
    Native,
    /// Refuse terminal requests
    Passthrough,
}

impl From<CliMode> for OperatingMode {
    fn from(mode: CliMode) -> Self {
        match mode {
            CliMode::Native => OperatingMode::Native,
            CliMode::Passthrough => OperatingMode::Passthrough,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Send one prompt and stream the reply
    Prompt {
        /// Prompt text
        text: String,

        /// Grant every permission request
        #[arg(long, conflicts_with = "deny_all")]
        allow_all: bool,

        /// Refuse every permission request
        #[arg(long)]
        deny_all: bool,

        /// Switch the session to this mode before prompting
        #[arg(long)]
        session_mode: Option<String>,

        /// Switch the session to this model before prompting
        #[arg(long)]
        model: Option<String>,
    },

    /// List sessions known to the agent
    Sessions,

    /// Print the agent's identity and capabilities
    Info,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Policy {
    Ask,
    AllowAll,
    DenyAll,
}

struct CliPermissions {
    policy: Policy,
    input: Mutex<Lines<BufReader<Stdin>>>,
}

impl CliPermissions {
    fn new(policy: Policy) -> Self {
        Self {
            policy,
            input: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
        }
    }
}

#[async_trait]
impl PermissionHandler for CliPermissions {
    async fn decide(&self, request: &RequestPermissionParams) -> acplink_core::Result<PermissionDecision> {
        let title = request.tool_call.title.as_deref().unwrap_or("tool call");
        match self.policy {
            Policy::AllowAll => {
                info!("Allowing {}", title);
                Ok(PermissionDecision::allow())
            }
            Policy::DenyAll => {
                info!("Denying {}", title);
                Ok(PermissionDecision::deny())
            }
            Policy::Ask => {
                let mut input = self.input.lock().await;
                ask(title, request, &mut input).await
            }
        }
    }
}

async fn ask<R: AsyncBufRead + Unpin>(
    title: &str,
    request: &RequestPermissionParams,
    input: &mut Lines<R>,
) -> acplink_core::Result<PermissionDecision> {
    eprintln!("\nPermission requested: {}", title);
    for (index, option) in request.options.iter().enumerate() {
        eprintln!("  [{}] {}", index + 1, option.name);
    }
    eprint!("Choose an option (empty to deny): ");
    let _ = std::io::stderr().flush();

    let line = input
        .next_line()
        .await
        .map_err(|e| acplink_core::Error::Callback(e.to_string()))?
        .unwrap_or_default();

    let choice = line.trim().parse::<usize>().ok().and_then(|n| n.checked_sub(1));
    Ok(match choice.and_then(|index| request.options.get(index)) {
        Some(option) => PermissionDecision::select(option.option_id.clone()),
        None => PermissionDecision::deny(),
    })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn build_config(cli: &Cli) -> anyhow::Result<ConnectConfig> {
    let mut config = match &cli.config {
        Some(path) => ConnectConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ConnectConfig::default(),
    };
    if let Some(cwd) = &cli.cwd {
        config.cwd = cwd.clone();
    }
    if let Some(binary) = &cli.binary {
        config.binary_path = Some(binary.clone());
    }
    if !cli.agent_args.is_empty() {
        config.args = cli.agent_args.clone();
    }
    if let Some(mode) = cli.mode {
        config.mode = mode.into();
    }
    Ok(config)
}

/// Print one event; returns false when the turn failed
fn render(event: &StreamEvent, out: &mut impl Write) -> std::io::Result<bool> {
    match event {
        StreamEvent::MessageStart => debug!("Turn started"),
        StreamEvent::TextDelta { text } => {
            write!(out, "{}", text)?;
            out.flush()?;
        }
        StreamEvent::ThinkingDelta { text } => eprint!("{}", text),
        StreamEvent::ToolCallStart { tool_call } => {
            eprintln!("\n[tool] {} ({:?})", tool_call.title, tool_call.kind);
        }
        StreamEvent::ToolCallDelta { tool_call } => {
            debug!("Tool call {} is {:?}", tool_call.tool_call_id, tool_call.status);
        }
        StreamEvent::ToolCallComplete { tool_call } => {
            eprintln!("[tool] {} -> {:?}", tool_call.title, tool_call.status);
        }
        StreamEvent::Plan { entries } => {
            eprintln!("\n[plan]");
            for entry in entries {
                let mark = match entry.status {
                    PlanStatus::Completed => "x",
                    PlanStatus::InProgress => "~",
                    PlanStatus::Pending => " ",
                };
                eprintln!("  [{}] {}", mark, entry.content);
            }
        }
        StreamEvent::ModeChange { mode } => eprintln!("[mode] {}", mode),
        StreamEvent::ConfigChange { config_options } => {
            debug!("{} config options", config_options.len());
        }
        StreamEvent::CommandsUpdate { commands } => {
            debug!("{} commands available", commands.len());
        }
        StreamEvent::SessionInfo { title, .. } => {
            if let Some(title) = title {
                eprintln!("[session] {}", title);
            }
        }
        StreamEvent::MessageComplete { stop_reason } => {
            writeln!(out)?;
            if *stop_reason != StopReason::EndTurn {
                eprintln!("[stopped] {:?}", stop_reason);
            }
        }
        StreamEvent::Error { error } => {
            eprintln!("\n[error] {}", error);
            return Ok(false);
        }
    }
    Ok(true)
}

async fn run_prompt(client: &AcpClient, text: &str) -> anyhow::Result<bool> {
    let mut events = client.send_message(text, SendOptions::default())?;
    let mut stdout = std::io::stdout();
    let mut ok = true;

    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);
    let mut interrupted = false;

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                ok &= render(&event, &mut stdout)?;
            }
            _ = &mut interrupt, if !interrupted => {
                interrupted = true;
                warn!("Interrupted; cancelling turn");
                if let Err(e) = client.cancel().await {
                    warn!("Cancel failed: {}", e);
                }
            }
        }
    }
    Ok(ok)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = build_config(&cli)?;
    let client = AcpClient::new(config);

    let session = client.connect().await.context("connecting to agent")?;
    info!("Session {} ready in {}", session.id, session.working_directory);

    let result = match &cli.command {
        Command::Prompt {
            text,
            allow_all,
            deny_all,
            session_mode,
            model,
        } => {
            let policy = if *allow_all {
                Policy::AllowAll
            } else if *deny_all {
                Policy::DenyAll
            } else {
                Policy::Ask
            };
            client.set_permission_handler(CliPermissions::new(policy));

            if let Some(mode) = session_mode {
                client.set_mode(mode).await.context("setting mode")?;
            }
            if let Some(model) = model {
                client.set_model(model).await.context("setting model")?;
            }

            match run_prompt(&client, text).await {
                Ok(true) => Ok(()),
                Ok(false) => Err(anyhow::anyhow!("prompt failed")),
                Err(e) => Err(e),
            }
        }
        Command::Sessions => list_sessions(&client).await,
        Command::Info => {
            print_info(&client);
            Ok(())
        }
    };

    client.disconnect().await;
    result
}

async fn list_sessions(client: &AcpClient) -> anyhow::Result<()> {
    let cwd = client.config().cwd_string();
    let mut cursor = None;
    loop {
        let page = client
            .list_sessions(acplink_core::ListSessionsParams {
                cwd: Some(cwd.clone()),
                cursor: cursor.take(),
            })
            .await
            .context("listing sessions")?;
        for entry in &page.sessions {
            println!(
                "{}\t{}\t{}",
                entry.session_id,
                entry.updated_at.as_deref().unwrap_or("-"),
                entry.title.as_deref().unwrap_or("")
            );
        }
        match page.next_cursor {
            Some(next) if !page.sessions.is_empty() => cursor = Some(next),
            _ => break,
        }
    }
    Ok(())
}

fn print_info(client: &AcpClient) {
    if let Some(agent) = client.agent_info() {
        println!("agent: {} {}", agent.name, agent.version.as_deref().unwrap_or(""));
    }
    if let Some(caps) = client.capabilities() {
        println!("capabilities: {:?}", caps);
    }
    for mode in client.available_modes() {
        let current = client.current_mode().as_deref() == Some(mode.id.as_str());
        println!("mode: {}{}", mode.id, if current { " *" } else { "" });
    }
    for model in client.available_models() {
        let current = client.current_model().as_deref() == Some(model.id.as_str());
        println!("model: {}{}", model.id, if current { " *" } else { "" });
    }
}
