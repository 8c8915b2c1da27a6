use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

use undoable_core::{
    canvas_dir, daemon_settings_file, instructions_dir, jobs_state_file, logs_dir, pid_file,
    providers_file, resolve_state_dir, runs_state_file, sessions_file, skills_file,
    swarm_state_file, write_json_atomic, ActionLog, ActionPipeline, ApprovalGate,
    CancellationRegistry, ChatLoop, EventBus, InstructionsStore, RunConfigStore, RunManager,
    SessionStore, SettingsService, SkillStore, TurnRequest, UndoGuard, UndoService,
};
use undoable_providers::ProviderRegistry;
use undoable_scheduler::Scheduler;
use undoable_server::{make_payload_handler, serve, AppState};
use undoable_swarm::SwarmService;
use undoable_tools::ToolRegistry;
use undoable_types::{ChatFrame, RunInput};

#[derive(Parser, Debug)]
#[command(name = "undoable-daemon")]
#[command(about = "Local-first agent runtime with an approval/undo gate")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon and serve the HTTP/SSE API.
    Serve {
        #[arg(long, env = "NRN_HOST")]
        host: Option<String>,
        #[arg(long, env = "NRN_PORT")]
        port: Option<u16>,
        #[arg(long)]
        state_dir: Option<String>,
    },
    /// Execute a single instruction and print the reply.
    Run {
        instruction: String,
        #[arg(long)]
        state_dir: Option<String>,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PidFile {
    pid: u32,
    port: u16,
    started_at: chrono::DateTime<chrono::Utc>,
}

fn main() {
    let exit_code = run_main();
    std::process::exit(exit_code);
}

#[tokio::main]
async fn run_main() -> i32 {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            host,
            port,
            state_dir,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            match serve_daemon(state_dir, host, port).await {
                Ok(code) => code,
                Err(err) => {
                    eprintln!("fatal: {err:#}");
                    1
                }
            }
        }
        Command::Run {
            instruction,
            state_dir,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            match run_once(state_dir, instruction).await {
                Ok(()) => 0,
                Err(err) => {
                    eprintln!("error: {err:#}");
                    1
                }
            }
        }
    }
}

async fn serve_daemon(
    state_dir: PathBuf,
    host_flag: Option<String>,
    port_flag: Option<u16>,
) -> anyhow::Result<i32> {
    let (state, _log_guard) = build_state(&state_dir).await?;

    let effective = state.settings.effective().clone();
    let host = host_flag.unwrap_or(effective.host);
    let port = port_flag.unwrap_or(effective.port);
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .context("invalid host or port")?;

    write_json_atomic(
        &pid_file(&state_dir),
        &PidFile {
            pid: std::process::id(),
            port,
            started_at: chrono::Utc::now(),
        },
    )
    .await?;

    log_startup_paths(&state_dir, &addr);

    let scheduler_tick = state.scheduler.start();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let code = tokio::select! {
        result = serve(addr, state.clone()) => {
            match result {
                Ok(()) => 0,
                Err(err) => {
                    eprintln!("fatal: {err:#}");
                    1
                }
            }
        }
        _ = tokio::signal::ctrl_c() => 130,
        _ = sigterm.recv() => 143,
    };
    scheduler_tick.abort();
    // A restart must find no outstanding approvals.
    state.gate.reject_all().await;
    let _ = tokio::fs::remove_file(pid_file(&state_dir)).await;
    Ok(code)
}

async fn run_once(state_dir: PathBuf, instruction: String) -> anyhow::Result<()> {
    let (state, _log_guard) = build_state(&state_dir).await?;
    let run = state.runs.create(RunInput {
        user_id: "cli".to_string(),
        agent_id: "default".to_string(),
        instruction: instruction.clone(),
        job_id: None,
    });
    let cancel = state.cancellations.create(&run.id).await;
    let (sink, mut frames) = mpsc::unbounded_channel();
    let chat = state.chat.clone();
    let request = TurnRequest {
        session_id: format!("run-{}", run.id),
        run_id: run.id.clone(),
        message: instruction,
        attachments: Vec::new(),
        agent_id: None,
    };
    let turn = tokio::spawn(async move { chat.run_turn(request, sink, cancel).await });
    while let Some(frame) = frames.recv().await {
        match frame {
            ChatFrame::Token { delta } => print!("{delta}"),
            ChatFrame::Warning { code, message } => eprintln!("[{code}] {message}"),
            ChatFrame::Done { .. } => println!(),
            _ => {}
        }
    }
    turn.await??;
    Ok(())
}

fn log_startup_paths(state_dir: &Path, addr: &SocketAddr) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!("starting undoable-daemon on http://{addr}");
    info!(
        "startup paths: exe={} cwd={} state_dir={}",
        exe.display(),
        cwd.display(),
        state_dir.display()
    );
}

async fn build_state(
    state_dir: &Path,
) -> anyhow::Result<(AppState, undoable_observability::WorkerGuard)> {
    tokio::fs::create_dir_all(canvas_dir(state_dir)).await?;
    let (log_guard, _info) =
        undoable_observability::init_daemon_logging(&logs_dir(state_dir), 14)?;

    let settings = SettingsService::load(daemon_settings_file(state_dir)).await?;
    let bus = EventBus::new();
    let runs = RunManager::load(runs_state_file(state_dir), bus.clone()).await?;
    let sessions = SessionStore::load(sessions_file(state_dir)).await?;
    let providers = ProviderRegistry::load(providers_file(state_dir)).await?;
    let tools = ToolRegistry::with_builtins();
    let run_config = RunConfigStore::from_env();
    let gate = ApprovalGate::new(bus.clone(), run_config.get().await.approval_mode);
    let allow_irreversible = std::env::var("UNDOABLE_ALLOW_IRREVERSIBLE_ACTIONS")
        .map(|v| matches!(v.trim(), "1" | "true" | "on"))
        .unwrap_or(false);
    let guard = UndoGuard::from_policy(settings.effective().security_policy, allow_irreversible);
    let log = ActionLog::new();
    let pipeline = ActionPipeline::new(
        tools.clone(),
        log.clone(),
        gate.clone(),
        bus.clone(),
        guard,
    );
    let undo = UndoService::new(log, tools);
    let chat = ChatLoop::new(
        sessions.clone(),
        providers.clone(),
        pipeline.clone(),
        runs.clone(),
        run_config.clone(),
    );
    let scheduler = Scheduler::load(jobs_state_file(state_dir)).await?;
    let swarm = SwarmService::load(
        swarm_state_file(state_dir),
        runs.clone(),
        scheduler.clone(),
    )
    .await?;
    let instructions = InstructionsStore::new(instructions_dir(state_dir));
    let skills = SkillStore::load(skills_file(state_dir)).await;
    let cancellations = CancellationRegistry::new();

    let state = AppState {
        bus,
        runs,
        sessions,
        providers,
        pipeline,
        gate,
        undo,
        chat,
        scheduler: scheduler.clone(),
        swarm: swarm.clone(),
        settings: settings.clone(),
        run_config,
        instructions,
        skills,
        cancellations,
        run_registry: undoable_server::RunRegistry::new(),
    };

    scheduler
        .set_handler(make_payload_handler(state.clone()))
        .await;
    let pause_settings = settings.clone();
    scheduler
        .set_dispatch_gate(Arc::new(move || pause_settings.dispatch_blocked()))
        .await;
    let swarm_settings = settings.clone();
    swarm
        .set_dispatch_gate(Arc::new(move || swarm_settings.dispatch_blocked()))
        .await;

    Ok((state, log_guard))
}
