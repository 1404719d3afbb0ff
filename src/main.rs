use std::sync::Arc;

use clap::{Parser, Subcommand};
use phaselock_sync::{
    BlockId, EffectDispatcher, Lifecycle, SessionCommand, SessionController, SessionId, Snapshot, StompConnector,
    SyncConfig, SyncError, TerminalEffects, TimerApi,
};

#[derive(Parser, Debug)]
#[command(name = "phaselock", about = "PhaseLock timer sync client")]
struct Cli {
    /// REST base URL.
    #[arg(long, env = "PHASELOCK_BASE_URL")]
    base_url: Option<String>,

    /// STOMP websocket URL. Derived from the base URL when unset.
    #[arg(long, env = "PHASELOCK_WS_URL")]
    ws_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the running session, if any.
    Active,
    /// Show one session's status.
    Status { session_id: i64 },
    /// Follow a session live (the active one when no id is given).
    Watch { session_id: Option<i64> },
    /// Start a session for a block.
    Start {
        block_id: i64,
        #[arg(long, default_value_t = false)]
        watch: bool,
    },
    Pause { session_id: i64 },
    Resume { session_id: i64 },
    Restart { session_id: i64 },
    Skip { session_id: i64 },
    Cancel { session_id: i64 },
}

#[tokio::main]
async fn main() -> Result<(), SyncError> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env()?.with_overrides(cli.base_url, cli.ws_url)?;
    let api = Arc::new(TimerApi::new(&config.base_url, config.request_timeout, config.connect_timeout)?);

    match cli.command {
        Command::Active => match api.active_session().await? {
            Some(snapshot) => print_snapshot(&snapshot),
            None => println!("no active session"),
        },
        Command::Status { session_id } => print_snapshot(&api.status(SessionId(session_id)).await?),
        Command::Watch { session_id } => {
            let mut controller = controller(&config, api);
            match session_id {
                Some(id) => {
                    controller.attach(SessionId(id)).await?;
                }
                None => {
                    if controller.attach_active().await?.is_none() {
                        return Err(SyncError::NoActiveSession);
                    }
                }
            }
            watch(&mut controller).await;
        }
        Command::Start { block_id, watch: follow } => {
            let mut controller = controller(&config, api);
            controller.start_block(BlockId(block_id)).await?;
            if follow {
                watch(&mut controller).await;
            } else {
                controller.stop().await;
            }
        }
        Command::Pause { session_id } => run_command(&config, api, session_id, SessionCommand::Pause).await?,
        Command::Resume { session_id } => run_command(&config, api, session_id, SessionCommand::Resume).await?,
        Command::Restart { session_id } => run_command(&config, api, session_id, SessionCommand::Restart).await?,
        Command::Skip { session_id } => run_command(&config, api, session_id, SessionCommand::Skip).await?,
        Command::Cancel { session_id } => {
            let mut controller = controller(&config, api);
            controller.cancel(SessionId(session_id)).await?;
        }
    }
    Ok(())
}

fn controller(config: &SyncConfig, api: Arc<TimerApi>) -> SessionController {
    let connector = Arc::new(StompConnector::new(&config.ws_url, config.connect_timeout));
    let dispatcher = EffectDispatcher::new(Arc::new(TerminalEffects::new(config.assume_visible)));
    SessionController::new(api, connector, dispatcher, config.supervisor)
}

async fn run_command(
    config: &SyncConfig,
    api: Arc<TimerApi>,
    session_id: i64,
    command: SessionCommand,
) -> Result<(), SyncError> {
    let mut controller = controller(config, api);
    let snapshot = controller.command(SessionId(session_id), command).await?;
    controller.stop().await;
    print_snapshot(&snapshot);
    Ok(())
}

/// Follow the session until it tears itself down or Ctrl-C.
async fn watch(controller: &mut SessionController) {
    let mut state = controller.supervisor().subscribe_state();
    tokio::select! {
        _ = state.wait_for(|s| s.lifecycle == Lifecycle::Stopped) => {}
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
    }
    controller.stop().await;
}

fn print_snapshot(snapshot: &Snapshot) {
    println!(
        "session {} block {}: {} {} ({}) remaining {} elapsed {}",
        snapshot.session_id,
        snapshot.block_id,
        snapshot.status.display_name(),
        snapshot.current_phase.display_name(),
        snapshot.progress_label(),
        snapshot.remaining_time,
        snapshot.elapsed_time,
    );
}
