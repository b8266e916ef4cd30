//! STOMP-over-WebSocket connection to the game server.
//!
//! This module handles:
//! - The WebSocket upgrade and the CONNECT/CONNECTED handshake
//! - Heartbeat negotiation, idle heartbeats and the liveness deadline
//! - Async send/receive loops feeding a single event queue

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use put0_netproto::{
    codec::{Inbound, decode_frame, encode_frame, try_decode_frames},
    command::StompCommand,
    error::CodecError,
    frame::Frame,
};
use tokio::{
    sync::{Notify, mpsc},
    time::{self, Instant, MissedTickBehavior},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self, Message,
        client::IntoClientRequest,
        http::{HeaderValue, header::AUTHORIZATION},
    },
};
use tracing::{debug, info, trace, warn};

use crate::{error::NetplayError, identity::AuthToken};

/// Negotiated heartbeat periods of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPlan {
    /// How often we must send something. `None` disables outgoing heartbeats.
    pub outgoing: Option<Duration>,
    /// How often the server promised to send something. `None` disables the check.
    pub incoming: Option<Duration>,
}

impl HeartbeatPlan {
    /// Combine the `heart-beat` values of CONNECT (`client`) and CONNECTED (`server`).
    pub fn negotiate(client: (u64, u64), server: (u64, u64)) -> Self {
        let pick = |ours: u64, theirs: u64| {
            (ours != 0 && theirs != 0).then(|| Duration::from_millis(ours.max(theirs)))
        };
        Self {
            outgoing: pick(client.0, server.1),
            incoming: pick(client.1, server.0),
        }
    }

    /// Longest tolerated inbound silence.
    pub fn liveness_deadline(&self, floor: Duration) -> Option<Duration> {
        self.incoming.map(|period| period.mul_f64(1.5).max(floor))
    }
}

/// Parameters of a single connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub connect_timeout: Duration,
    pub outbound_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The server closed the WebSocket.
    Closed(String),
    /// Nothing arrived within the liveness deadline.
    HeartbeatTimeout,
    /// Read or write failure on the socket.
    Error(String),
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::Closed(reason) => write!(f, "closed by server: {reason}"),
            DisconnectReason::HeartbeatTimeout => f.write_str("heartbeat timeout"),
            DisconnectReason::Error(err) => write!(f, "connection error: {err}"),
        }
    }
}

/// Events sent from a connection to its owner.
#[derive(Debug)]
pub struct TransportEvent {
    /// Connection the event belongs to; owners ignore events of replaced connections.
    pub conn_id: u64,
    pub kind: TransportEventKind,
}

#[derive(Debug)]
pub enum TransportEventKind {
    Frame(Frame),
    /// An inbound message could not be decoded. The connection stays up.
    Malformed(CodecError),
    /// Emitted once, unless the connection was closed locally.
    Disconnected { reason: DisconnectReason },
}

enum TransportCommand {
    Send(Message),
    Close,
}

/// Handle to a live connection.
#[derive(Clone)]
pub struct TransportHandle {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    conn_id: u64,
    heartbeat: HeartbeatPlan,
    cmd_tx: mpsc::Sender<TransportCommand>,
    connected: Arc<AtomicBool>,
    closed: AtomicBool,
    shutdown: Arc<Notify>,
}

impl Drop for TransportInner {
    fn drop(&mut self) {
        self.shutdown.notify_one();
    }
}

impl TransportHandle {
    pub fn conn_id(&self) -> u64 {
        self.inner.conn_id
    }

    pub fn heartbeat(&self) -> HeartbeatPlan {
        self.inner.heartbeat
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Queue a frame for sending.
    ///
    /// Suspends while the outbound queue is full.
    pub async fn send(&self, frame: &Frame) -> Result<(), NetplayError> {
        if !self.is_connected() {
            return Err(NetplayError::SendFailure("not connected".to_string()));
        }
        let bytes = encode_frame(frame)?;
        trace!(
            conn_id = self.inner.conn_id,
            command = %frame.command,
            len = bytes.len(),
            "Queue frame"
        );
        self.inner
            .cmd_tx
            .send(TransportCommand::Send(to_ws_message(bytes)))
            .await
            .map_err(|_| NetplayError::SendFailure("connection writer stopped".to_string()))
    }

    /// Send DISCONNECT, close the socket and stop both loops. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(conn_id = self.inner.conn_id, "Closing connection");
        self.inner.connected.store(false, Ordering::Release);
        let _ = self.inner.cmd_tx.send(TransportCommand::Close).await;
        self.inner.shutdown.notify_one();
    }
}

/// Open a connection and complete the STOMP handshake.
///
/// Inbound frames are delivered on `event_tx` tagged with `conn_id`.
pub async fn connect(
    endpoint: &str,
    token: &AuthToken,
    opts: &ConnectOptions,
    conn_id: u64,
    event_tx: mpsc::Sender<TransportEvent>,
) -> Result<TransportHandle, NetplayError> {
    info!(endpoint, conn_id, "Connecting to game server");

    let mut request = endpoint
        .into_client_request()
        .map_err(|e| NetplayError::ConnectFailure(format!("invalid endpoint {endpoint}: {e}")))?;
    let host = request.uri().host().unwrap_or_default().to_string();
    let bearer = (!token.is_empty()).then(|| token.expose());
    if let Some(bearer) = bearer {
        let value = HeaderValue::from_str(&format!("Bearer {bearer}")).map_err(|_| {
            NetplayError::ConnectFailure("token is not a valid header value".to_string())
        })?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let hb_ms = u64::try_from(opts.heartbeat_interval.as_millis()).unwrap_or(u64::MAX);
    let client_hb = (hb_ms, hb_ms);

    let handshake = async {
        let (mut ws, _) = connect_async(request)
            .await
            .map_err(|e| NetplayError::ConnectFailure(format!("websocket upgrade failed: {e}")))?;
        let connect = encode_frame(&Frame::connect(&host, client_hb, bearer))?;
        ws.send(to_ws_message(connect))
            .await
            .map_err(|e| NetplayError::ConnectFailure(format!("failed to send CONNECT: {e}")))?;
        let connected = await_connected(&mut ws).await?;
        Ok::<_, NetplayError>((ws, connected))
    };
    let (ws, connected) = time::timeout(opts.connect_timeout, handshake)
        .await
        .map_err(|_| {
            NetplayError::ConnectFailure(format!(
                "handshake timed out after {:?}",
                opts.connect_timeout
            ))
        })??;

    let heartbeat = HeartbeatPlan::negotiate(client_hb, connected.heartbeat());
    let deadline = heartbeat.liveness_deadline(opts.heartbeat_timeout);
    info!(
        conn_id,
        server = connected.header("server").unwrap_or("unknown"),
        outgoing = ?heartbeat.outgoing,
        liveness = ?deadline,
        "STOMP session established"
    );

    let (sink, stream) = ws.split();
    let (cmd_tx, cmd_rx) = mpsc::channel(opts.outbound_capacity.max(1));
    let connected = Arc::new(AtomicBool::new(true));
    let shutdown = Arc::new(Notify::new());

    let writer_ctx = LoopContext {
        conn_id,
        event_tx: event_tx.clone(),
        connected: connected.clone(),
    };
    tokio::spawn(async move {
        writer_loop(sink, cmd_rx, heartbeat.outgoing, writer_ctx).await;
    });

    let reader_ctx = LoopContext {
        conn_id,
        event_tx,
        connected: connected.clone(),
    };
    let reader_shutdown = shutdown.clone();
    tokio::spawn(async move {
        reader_loop(stream, deadline, reader_shutdown, reader_ctx).await;
    });

    Ok(TransportHandle {
        inner: Arc::new(TransportInner {
            conn_id,
            heartbeat,
            cmd_tx,
            connected,
            closed: AtomicBool::new(false),
            shutdown,
        }),
    })
}

/// Wait for CONNECTED, skipping heartbeats and control messages.
async fn await_connected<S>(ws: &mut S) -> Result<Frame, NetplayError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(msg) = ws.next().await {
        let msg = msg.map_err(|e| NetplayError::ConnectFailure(e.to_string()))?;
        let inbound = match &msg {
            Message::Text(text) => decode_frame(text.as_bytes())?,
            Message::Binary(data) => decode_frame(data)?,
            Message::Close(_) => break,
            _ => continue,
        };
        match inbound {
            Inbound::Heartbeat => continue,
            Inbound::Frame(frame) => match frame.command {
                StompCommand::Connected => return Ok(frame),
                StompCommand::Error => {
                    return Err(NetplayError::ConnectFailure(frame.error_message()));
                }
                other => {
                    return Err(NetplayError::ConnectFailure(format!(
                        "expected CONNECTED, got {other}"
                    )));
                }
            },
        }
    }
    Err(NetplayError::ConnectFailure(
        "server closed the connection during the handshake".to_string(),
    ))
}

struct LoopContext {
    conn_id: u64,
    event_tx: mpsc::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
}

impl LoopContext {
    /// Report the loss once; a local close already cleared the flag.
    async fn report_disconnect(&self, reason: DisconnectReason) {
        if self.connected.swap(false, Ordering::AcqRel) {
            info!(conn_id = self.conn_id, %reason, "Connection lost");
            let _ = self
                .event_tx
                .send(TransportEvent {
                    conn_id: self.conn_id,
                    kind: TransportEventKind::Disconnected { reason },
                })
                .await;
        }
    }

    async fn emit(&self, kind: TransportEventKind) -> bool {
        self.event_tx
            .send(TransportEvent {
                conn_id: self.conn_id,
                kind,
            })
            .await
            .is_ok()
    }
}

/// Writer task: sends queued frames and fills idle periods with heartbeats.
async fn writer_loop(
    mut sink: impl Sink<Message, Error = tungstenite::Error> + Unpin,
    mut cmd_rx: mpsc::Receiver<TransportCommand>,
    heartbeat: Option<Duration>,
    ctx: LoopContext,
) {
    let mut ticker = heartbeat.map(|period| {
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        (ticker, period)
    });
    let mut last_write = Instant::now();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(TransportCommand::Send(msg)) => {
                    if let Err(e) = sink.send(msg).await {
                        warn!(conn_id = ctx.conn_id, "Write error: {}", e);
                        ctx.report_disconnect(DisconnectReason::Error(e.to_string())).await;
                        break;
                    }
                    last_write = Instant::now();
                }
                Some(TransportCommand::Close) | None => {
                    if let Ok(bytes) = encode_frame(&Frame::disconnect(None)) {
                        let _ = sink.send(to_ws_message(bytes)).await;
                    }
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = next_tick(&mut ticker) => {
                let Some((_, period)) = &ticker else { continue };
                if last_write.elapsed() + Duration::from_millis(1) < *period {
                    continue;
                }
                trace!(conn_id = ctx.conn_id, "Send heartbeat");
                if let Err(e) = sink.send(Message::text("\n")).await {
                    warn!(conn_id = ctx.conn_id, "Heartbeat write error: {}", e);
                    ctx.report_disconnect(DisconnectReason::Error(e.to_string())).await;
                    break;
                }
                last_write = Instant::now();
            }
        }
    }

    let _ = sink.close().await;
}

async fn next_tick(ticker: &mut Option<(time::Interval, Duration)>) {
    match ticker {
        Some((ticker, _)) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Reader task: decodes inbound messages and enforces the liveness deadline.
async fn reader_loop(
    mut stream: impl Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    deadline: Option<Duration>,
    shutdown: Arc<Notify>,
    ctx: LoopContext,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.notified() => {
                debug!(conn_id = ctx.conn_id, "Reader stopped");
                return;
            }
            next = read_next(&mut stream, deadline) => next,
        };

        let msg = match next {
            Err(_) => {
                warn!(
                    conn_id = ctx.conn_id,
                    "No traffic from server within {:?}", deadline
                );
                ctx.report_disconnect(DisconnectReason::HeartbeatTimeout).await;
                return;
            }
            Ok(None) => {
                ctx.report_disconnect(DisconnectReason::Closed("stream ended".to_string()))
                    .await;
                return;
            }
            Ok(Some(Err(e))) => {
                ctx.report_disconnect(DisconnectReason::Error(e.to_string())).await;
                return;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        let delivered = match &msg {
            Message::Text(text) => deliver(text.as_bytes(), &ctx).await,
            Message::Binary(data) => deliver(data, &ctx).await,
            Message::Close(frame) => {
                let reason = frame
                    .as_ref()
                    .map(|f| f.reason.as_str().to_string())
                    .unwrap_or_default();
                ctx.report_disconnect(DisconnectReason::Closed(reason)).await;
                return;
            }
            // Pings are answered by tungstenite; both still count as liveness.
            _ => true,
        };
        if !delivered {
            debug!(conn_id = ctx.conn_id, "Event channel closed");
            return;
        }
    }
}

async fn read_next<S>(
    stream: &mut S,
    deadline: Option<Duration>,
) -> Result<Option<Result<Message, tungstenite::Error>>, time::error::Elapsed>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    match deadline {
        Some(deadline) => time::timeout(deadline, stream.next()).await,
        None => Ok(stream.next().await),
    }
}

/// Decode one WebSocket message and forward its frames.
///
/// Returns `false` once the owner has gone away.
async fn deliver(data: &[u8], ctx: &LoopContext) -> bool {
    match try_decode_frames(data) {
        Ok((items, consumed)) => {
            for item in items {
                match item {
                    Inbound::Heartbeat => trace!(conn_id = ctx.conn_id, "Heartbeat received"),
                    Inbound::Frame(frame) => {
                        debug!(
                            conn_id = ctx.conn_id,
                            command = %frame.command,
                            destination = frame.destination().unwrap_or("-"),
                            "Received frame"
                        );
                        if !ctx.emit(TransportEventKind::Frame(frame)).await {
                            return false;
                        }
                    }
                }
            }
            if consumed < data.len() {
                warn!(conn_id = ctx.conn_id, "Dropping truncated frame");
                return ctx
                    .emit(TransportEventKind::Malformed(CodecError::Incomplete))
                    .await;
            }
            true
        }
        Err(e) => {
            warn!(conn_id = ctx.conn_id, "Dropping malformed frame: {}", e);
            ctx.emit(TransportEventKind::Malformed(e)).await
        }
    }
}

/// Text frames unless the body is not valid UTF-8.
fn to_ws_message(bytes: Vec<u8>) -> Message {
    match String::from_utf8(bytes) {
        Ok(text) => Message::text(text),
        Err(e) => Message::binary(e.into_bytes()),
    }
}
