use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use put0_netplay::{
    AuthToken, CommandId, CommandPayload, CommandStatus, ConnectionState, InMemoryStore,
    NetplayConfig, NetplayError, NoPrediction, SessionHandle, SessionObserver, StateView,
    drive_observer, spawn_session,
};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

/// Put0 session probe
#[derive(Parser, Debug)]
#[command(name = "put0-probe")]
#[command(
    about = "Join a Put0 game session and print what the server publishes",
    long_about = None
)]
struct Args {
    /// STOMP WebSocket endpoint (ws:// or wss://)
    #[arg(long, conflicts_with = "base_url", required_unless_present = "base_url")]
    endpoint: Option<String>,

    /// HTTP base URL of the game server; the WebSocket endpoint is derived from it
    #[arg(long)]
    base_url: Option<String>,

    /// Game session to join
    #[arg(short, long)]
    session: String,

    /// Player id to join as
    #[arg(short, long)]
    player: String,

    /// Bearer token sent with the WebSocket upgrade and CONNECT frame
    #[arg(long, env = "PUT0_TOKEN", hide_env_values = true, default_value = "")]
    token: String,

    /// Heartbeat interval in milliseconds (0 disables heartbeats)
    #[arg(long, default_value = "10000")]
    heartbeat_ms: u64,

    /// Acknowledgement timeout in milliseconds
    #[arg(long, default_value = "5000")]
    ack_timeout_ms: u64,

    /// Commands held while disconnected before the oldest is dropped
    #[arg(long, default_value = "64")]
    queue_capacity: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: Level,
}

struct PrintObserver;

impl SessionObserver for PrintObserver {
    fn on_state_changed(&mut self, state: &StateView) {
        println!(
            "state v{} {:?} pending={:?} {}",
            state.version, state.lifecycle, state.pending, state.predicted
        );
    }

    fn on_command_status(&mut self, id: CommandId, status: &CommandStatus) {
        println!("command {id}: {status:?}");
    }

    fn on_connection_state(&mut self, state: ConnectionState) {
        println!("connection: {state:?}");
    }

    fn on_backpressure(&mut self, dropped: CommandId, queued: usize) {
        println!("queue full: dropped {dropped}, {queued} queued");
    }

    fn on_server_error(&mut self, message: &str) {
        println!("server error: {message}");
    }

    fn on_server_notice(&mut self, kind: &str, message: Option<&str>) {
        println!("{kind}: {}", message.unwrap_or("-"));
    }

    fn on_session_lost(&mut self, error: &NetplayError) {
        println!("session lost: {error}");
    }

    fn on_session_closed(&mut self, reason: &str) {
        println!("session closed: {reason}");
    }
}

/// Parse `<action> [json object]`.
fn parse_command(line: &str) -> anyhow::Result<CommandPayload> {
    let (action, rest) = line.split_once(' ').unwrap_or((line, ""));
    let body = match rest.trim() {
        "" => Map::new(),
        json => match serde_json::from_str::<Value>(json)? {
            Value::Object(map) => map,
            other => anyhow::bail!("command body must be a JSON object, got {other}"),
        },
    };
    Ok(CommandPayload {
        action: action.to_string(),
        body,
    })
}

async fn read_commands(handle: SessionHandle, ack_timeout: Duration) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            "leave" | "quit" => break,
            "state" => {
                let view = handle.state();
                println!("{}", serde_json::to_string_pretty(&view.predicted)?);
            }
            _ => {
                let payload = match parse_command(line) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Ignoring input: {}", e);
                        continue;
                    }
                };
                match handle.submit(payload).await {
                    Ok(ticket) => {
                        tokio::spawn(async move {
                            if let Err(e) = ticket.outcome(ack_timeout * 2).await {
                                warn!("Command {}: {}", ticket.id, e);
                            }
                        });
                    }
                    Err(e) if e.is_fatal() => return Err(e.into()),
                    Err(e) => warn!("Submit failed: {}", e),
                }
            }
        }
    }
    leave(&handle).await
}

/// Leave unless the session already ended.
async fn leave(handle: &SessionHandle) -> anyhow::Result<()> {
    match handle.leave().await {
        Ok(()) | Err(NetplayError::SessionClosed | NetplayError::ChannelRecv) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    // wss:// endpoints need a process-wide crypto provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let endpoint = match (args.endpoint, args.base_url) {
        (Some(endpoint), _) => endpoint,
        (None, Some(base)) => NetplayConfig::endpoint_from_http_base(&base),
        (None, None) => anyhow::bail!("either --endpoint or --base-url is required"),
    };
    let heartbeat = Duration::from_millis(args.heartbeat_ms);
    let ack_timeout = Duration::from_millis(args.ack_timeout_ms);
    let config = NetplayConfig::new(endpoint, args.session, args.player)
        .with_heartbeat(heartbeat, (heartbeat * 5 / 2).max(Duration::from_secs(1)))
        .with_ack_timeout(ack_timeout)
        .with_command_queue_capacity(args.queue_capacity);

    info!(
        "Joining {} as {} via {}",
        config.session_id, config.participant_id, config.endpoint
    );

    let (handle, events, session) = spawn_session(
        config,
        AuthToken::new(args.token),
        Arc::new(InMemoryStore::new()),
        Box::new(NoPrediction),
    )?;
    let observer = tokio::spawn(drive_observer(events, PrintObserver));
    let mut session = session;

    tokio::select! {
        res = read_commands(handle.clone(), ack_timeout) => res?,
        _ = tokio::signal::ctrl_c() => leave(&handle).await?,
        res = &mut session => {
            let _ = observer.await;
            return Ok(res??);
        }
    }

    session.await??;
    let _ = observer.await;
    Ok(())
}
