#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use put0_netplay::{
    AuthToken, BackoffPolicy, InMemoryStore, NetplayConfig, NetplayError, NetplayEvent,
    NoPrediction, SessionHandle, spawn_session,
};
use put0_netproto::{
    codec::{Inbound, encode_frame, try_decode_frames},
    command::StompCommand,
    constants::{CONTENT_TYPE_JSON, HDR_CONTENT_TYPE, HDR_DESTINATION},
    frame::Frame,
    messages::ServerUpdate,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        Message,
        handshake::server::{ErrorResponse, Request, Response},
        http::header::AUTHORIZATION,
    },
};

pub const WAIT: Duration = Duration::from_secs(5);

/// What the mock broker saw.
#[derive(Debug)]
pub enum MockEvent {
    Connected {
        conn: usize,
        auth: Option<String>,
        outbound: mpsc::Sender<MockCommand>,
    },
    Frame {
        conn: usize,
        frame: Frame,
    },
    Heartbeat {
        conn: usize,
    },
    Closed {
        conn: usize,
    },
}

#[derive(Debug)]
pub enum MockCommand {
    Send(Frame),
    /// Drop the socket without a closing handshake.
    Kill,
}

/// Minimal STOMP broker: answers CONNECT and reports everything else.
pub struct MockBroker {
    pub url: String,
    events: mpsc::Receiver<MockEvent>,
}

/// One accepted client connection.
pub struct MockConn {
    pub conn: usize,
    pub auth: Option<String>,
    outbound: mpsc::Sender<MockCommand>,
    message_seq: u64,
}

impl MockBroker {
    /// `heart_beat` is the CONNECTED `heart-beat` header, e.g. `"0,0"`.
    pub async fn start(heart_beat: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, events) = mpsc::channel(256);
        let heart_beat = heart_beat.to_string();

        tokio::spawn(async move {
            let mut next_conn = 0;
            while let Ok((stream, _)) = listener.accept().await {
                next_conn += 1;
                tokio::spawn(serve(stream, next_conn, heart_beat.clone(), tx.clone()));
            }
        });

        Self {
            url: format!("ws://{addr}/ws/websocket"),
            events,
        }
    }

    pub async fn next_event(&mut self) -> MockEvent {
        tokio::time::timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for the client")
            .expect("broker stopped")
    }

    /// Next new connection, skipping heartbeats and the tail of older connections.
    pub async fn accept(&mut self) -> MockConn {
        loop {
            match self.next_event().await {
                MockEvent::Connected {
                    conn,
                    auth,
                    outbound,
                } => {
                    return MockConn {
                        conn,
                        auth,
                        outbound,
                        message_seq: 0,
                    };
                }
                _ => continue,
            }
        }
    }

    /// Next frame sent by the client, skipping heartbeats and closes.
    pub async fn frame(&mut self) -> Frame {
        loop {
            match self.next_event().await {
                MockEvent::Frame { frame, .. } => return frame,
                MockEvent::Connected { conn, .. } => panic!("unexpected connection {conn}"),
                _ => continue,
            }
        }
    }

    /// Next frame with the given command.
    pub async fn frame_of(&mut self, command: StompCommand) -> Frame {
        loop {
            let frame = self.frame().await;
            if frame.command == command {
                return frame;
            }
        }
    }
}

impl MockConn {
    /// Publish `update` as a MESSAGE on `destination`.
    pub async fn publish(&mut self, destination: &str, update: &ServerUpdate) {
        let body = serde_json::to_vec(update).unwrap();
        self.message_seq += 1;
        let frame = Frame::new(StompCommand::Message)
            .with_header(HDR_DESTINATION, destination)
            .with_header("message-id", self.message_seq.to_string())
            .with_header(HDR_CONTENT_TYPE, CONTENT_TYPE_JSON)
            .with_body(body);
        self.send(frame).await;
    }

    pub async fn send(&self, frame: Frame) {
        self.outbound.send(MockCommand::Send(frame)).await.unwrap();
    }

    pub async fn kill(&self) {
        let _ = self.outbound.send(MockCommand::Kill).await;
    }
}

async fn serve(
    stream: TcpStream,
    conn: usize,
    heart_beat: String,
    events: mpsc::Sender<MockEvent>,
) {
    let mut auth = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        auth = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(resp)
    };
    let Ok(ws) = accept_hdr_async(stream, callback).await else {
        return;
    };
    let (mut sink, mut stream) = ws.split();
    let (outbound, mut outbound_rx) = mpsc::channel(64);
    let mut auth = Some(auth);

    loop {
        tokio::select! {
            msg = stream.next() => {
                let data = match msg {
                    Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
                    Some(Ok(Message::Binary(data))) => data.to_vec(),
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                let Ok((items, _)) = try_decode_frames(&data) else {
                    continue;
                };
                for item in items {
                    let event = match item {
                        Inbound::Heartbeat => MockEvent::Heartbeat { conn },
                        Inbound::Frame(frame) if frame.command == StompCommand::Connect => {
                            let connected = Frame::new(StompCommand::Connected)
                                .with_header("version", "1.2")
                                .with_header("heart-beat", heart_beat.as_str())
                                .with_header("server", "mock-broker");
                            let bytes = encode_frame(&connected).unwrap();
                            if sink.send(Message::binary(bytes)).await.is_err() {
                                return;
                            }
                            MockEvent::Connected {
                                conn,
                                auth: auth.take().flatten(),
                                outbound: outbound.clone(),
                            }
                        }
                        Inbound::Frame(frame) => MockEvent::Frame { conn, frame },
                    };
                    let _ = events.send(event).await;
                }
            }
            cmd = outbound_rx.recv() => match cmd {
                Some(MockCommand::Send(frame)) => {
                    let bytes = encode_frame(&frame).unwrap();
                    let text = String::from_utf8(bytes).unwrap();
                    if sink.send(Message::text(text)).await.is_err() {
                        break;
                    }
                }
                Some(MockCommand::Kill) | None => return,
            }
        }
    }
    let _ = events.send(MockEvent::Closed { conn }).await;
}

pub fn test_backoff() -> BackoffPolicy {
    BackoffPolicy {
        base: Duration::from_millis(20),
        cap: Duration::from_millis(200),
        jitter: 0.0,
        max_attempts: 5,
        max_elapsed: Duration::from_secs(10),
    }
}

pub fn test_config(url: &str) -> NetplayConfig {
    NetplayConfig::new(url, "g1", "p1")
        .with_heartbeat(Duration::ZERO, Duration::from_secs(5))
        .with_ack_timeout(Duration::from_secs(2))
        .with_backoff(test_backoff())
}

/// A running session plus every event it emitted.
pub struct TestSession {
    pub handle: SessionHandle,
    pub events: mpsc::Receiver<NetplayEvent>,
    pub task: JoinHandle<Result<(), NetplayError>>,
    pub store: Arc<InMemoryStore>,
}

pub fn start_session(config: NetplayConfig) -> TestSession {
    let store = Arc::new(InMemoryStore::new());
    let (handle, events, task) = spawn_session(
        config,
        AuthToken::new("secret"),
        store.clone(),
        Box::new(NoPrediction),
    )
    .unwrap();

    TestSession {
        handle,
        events,
        task,
        store,
    }
}

impl TestSession {
    /// Wait for the first event matching `pred`.
    pub async fn wait_for<F>(&mut self, mut pred: F) -> NetplayEvent
    where
        F: FnMut(&NetplayEvent) -> bool,
    {
        let wait = async {
            loop {
                let event = self.events.recv().await.expect("event stream ended");
                if pred(&event) {
                    return event;
                }
            }
        };
        tokio::time::timeout(WAIT, wait)
            .await
            .expect("timed out waiting for event")
    }

    pub async fn wait_version(&self, version: u64) {
        let mut state = self.handle.watch_state();
        tokio::time::timeout(WAIT, state.wait_for(|view| view.version == version))
            .await
            .expect("timed out waiting for version")
            .expect("session stopped");
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
