//! Session task and its handle.
//!
//! One task owns the connection, the subscription registry, the reconciler
//! and the command dispatcher. Handles, the connection loops and timers only
//! send it work over queues, so state mutation is serialized without locks.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use put0_netproto::{
    codec::encode_frame,
    command::StompCommand,
    destination::{USER_ERROR_QUEUE, game_topic, is_valid_action},
    frame::Frame,
    messages::{
        ClientMessage, CommandEnvelope, CommandId, CommandPayload, JoinRequest, LeaveRequest,
        ParticipantId, ServerUpdate, SessionId, UntypedUpdate,
    },
};
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot, watch,
    },
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::NetplayConfig,
    dispatcher::{
        CommandDispatcher, CommandStatus, CommandTicket, SequenceAllocator, TimeoutAction,
        wait_for_outcome,
    },
    error::NetplayError,
    events::{ConnectionState, NetplayEvent},
    identity::AuthToken,
    reconciler::{ApplyOutcome, Predictor, SessionLifecycle, SessionReconciler, StateView},
    store::{DocumentStore, MembershipChange, MembershipRecord},
    subscription::{
        Delivery, SubscribeOutcome, Subscription, SubscriptionId, SubscriptionRegistry,
        TopicHandler, TopicRoute,
    },
    supervisor::{ReconnectSupervisor, ResumeOutcome, ResumeSteps},
    transport::{
        self, ConnectOptions, DisconnectReason, TransportEvent, TransportEventKind,
        TransportHandle,
    },
};

/// Work sent to the session task by [`SessionHandle`]s.
pub enum SessionRequest {
    Submit {
        envelope: CommandEnvelope,
        status_tx: watch::Sender<CommandStatus>,
    },
    Watch {
        id: CommandId,
        reply: oneshot::Sender<Option<watch::Receiver<CommandStatus>>>,
    },
    Subscribe {
        topic: String,
        handler: Arc<dyn TopicHandler>,
        reply: oneshot::Sender<SubscriptionId>,
    },
    Unsubscribe {
        id: SubscriptionId,
        reply: oneshot::Sender<bool>,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable entry point for the presentation layer.
#[derive(Clone)]
pub struct SessionHandle {
    request_tx: mpsc::Sender<SessionRequest>,
    allocator: Arc<SequenceAllocator>,
    session_id: SessionId,
    participant_id: ParticipantId,
    state_rx: watch::Receiver<StateView>,
    connection_rx: watch::Receiver<ConnectionState>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    /// Submit a player command.
    ///
    /// The sequence number is assigned here, so concurrent callers never
    /// share one. Suspends only while the session's request queue is full.
    pub async fn submit(&self, payload: CommandPayload) -> Result<CommandTicket, NetplayError> {
        if !is_valid_action(&payload.action) {
            return Err(NetplayError::InvalidCommand(format!(
                "invalid action {:?}",
                payload.action
            )));
        }
        if self.request_tx.is_closed() {
            return Err(NetplayError::SessionClosed);
        }

        let id = self.allocator.next();
        let envelope = CommandEnvelope::new(
            self.session_id.clone(),
            self.participant_id.clone(),
            id,
            current_time_ms(),
            payload,
        );
        let (status_tx, status_rx) = watch::channel(CommandStatus::Pending);
        self.request_tx
            .send(SessionRequest::Submit {
                envelope,
                status_tx,
            })
            .await
            .map_err(|_| NetplayError::SessionClosed)?;
        Ok(CommandTicket::new(id, status_rx))
    }

    /// Wait for a command to be acknowledged.
    ///
    /// Fails with `TimedOut` if `timeout` elapses first; the command itself
    /// keeps going. Cancelling this future has no effect on the command.
    pub async fn await_acknowledgement(
        &self,
        id: CommandId,
        timeout: Duration,
    ) -> Result<CommandStatus, NetplayError> {
        let (reply, rx) = oneshot::channel();
        self.request_tx
            .send(SessionRequest::Watch { id, reply })
            .await
            .map_err(|_| NetplayError::SessionClosed)?;
        let status = rx
            .await
            .map_err(|_| NetplayError::ChannelRecv)?
            .ok_or(NetplayError::UnknownCommand(id))?;
        wait_for_outcome(status, id, timeout).await
    }

    /// Subscribe an extra topic. The handler runs on the session task.
    pub async fn subscribe(
        &self,
        topic: &str,
        handler: impl TopicHandler + 'static,
    ) -> Result<SubscriptionId, NetplayError> {
        let (reply, rx) = oneshot::channel();
        self.request_tx
            .send(SessionRequest::Subscribe {
                topic: topic.to_string(),
                handler: Arc::new(handler),
                reply,
            })
            .await
            .map_err(|_| NetplayError::SessionClosed)?;
        rx.await.map_err(|_| NetplayError::ChannelRecv)
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<bool, NetplayError> {
        let (reply, rx) = oneshot::channel();
        self.request_tx
            .send(SessionRequest::Unsubscribe { id, reply })
            .await
            .map_err(|_| NetplayError::SessionClosed)?;
        rx.await.map_err(|_| NetplayError::ChannelRecv)
    }

    /// Leave the session. Pending commands are reported as dropped.
    pub async fn leave(&self) -> Result<(), NetplayError> {
        let (reply, rx) = oneshot::channel();
        self.request_tx
            .send(SessionRequest::Leave { reply })
            .await
            .map_err(|_| NetplayError::SessionClosed)?;
        rx.await.map_err(|_| NetplayError::ChannelRecv)
    }

    /// Latest state published by the session task.
    pub fn state(&self) -> StateView {
        self.state_rx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<StateView> {
        self.state_rx.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection_rx.borrow()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection_rx.clone()
    }
}

/// Validate `config` and spawn the session task.
pub fn spawn_session(
    config: NetplayConfig,
    token: AuthToken,
    store: Arc<dyn DocumentStore>,
    predictor: Box<dyn Predictor>,
) -> Result<
    (
        SessionHandle,
        mpsc::Receiver<NetplayEvent>,
        JoinHandle<Result<(), NetplayError>>,
    ),
    NetplayError,
> {
    config.validate()?;
    let (handler, handle, events) = SessionHandler::new(config, token, store, predictor);
    let task = tokio::spawn(handler.run());
    Ok((handle, events, task))
}

enum Flow {
    Continue,
    Stop,
}

/// The session task.
pub struct SessionHandler {
    core: SessionCore,
    supervisor: ReconnectSupervisor,
    request_rx: mpsc::Receiver<SessionRequest>,
    transport_rx: mpsc::Receiver<TransportEvent>,
    reconnect_at: Option<Instant>,
}

impl SessionHandler {
    pub fn new(
        config: NetplayConfig,
        token: AuthToken,
        store: Arc<dyn DocumentStore>,
        predictor: Box<dyn Predictor>,
    ) -> (Self, SessionHandle, mpsc::Receiver<NetplayEvent>) {
        let (request_tx, request_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let (transport_tx, transport_rx) = mpsc::channel(config.event_capacity.max(1));
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));

        let reconciler = SessionReconciler::new(config.session_id.clone(), predictor);
        let (state_tx, state_rx) = watch::channel(reconciler.view());
        let (connection_tx, connection_rx) = watch::channel(ConnectionState::Disconnected);
        let allocator = Arc::new(SequenceAllocator::new(config.initial_sequence));

        let handle = SessionHandle {
            request_tx,
            allocator,
            session_id: config.session_id.clone(),
            participant_id: config.participant_id.clone(),
            state_rx,
            connection_rx,
        };

        let core = SessionCore {
            registry: SubscriptionRegistry::new(),
            dispatcher: CommandDispatcher::new(
                config.command_queue_capacity,
                config.ack_timeout,
                config.command_gc_grace,
            ),
            reconciler,
            transport: None,
            transport_tx,
            next_conn_id: 0,
            token,
            store,
            event_tx,
            outbox: VecDeque::new(),
            state_tx,
            connection_tx,
            config,
        };

        (
            Self {
                supervisor: ReconnectSupervisor::new(core.config.backoff.clone()),
                core,
                request_rx,
                transport_rx,
                reconnect_at: None,
            },
            handle,
            event_rx,
        )
    }

    /// Run until the session is left, terminated or lost.
    ///
    /// Returns `Err(SessionLost)` when reconnection gives up.
    pub async fn run(mut self) -> Result<(), NetplayError> {
        let result = self.drive().await;
        self.core.flush_events();
        result
    }

    async fn drive(&mut self) -> Result<(), NetplayError> {
        info!(
            session = %self.core.config.session_id,
            participant = %self.core.config.participant_id,
            endpoint = %self.core.config.endpoint,
            "Starting session"
        );
        self.core.register_default_topics();
        self.core.seed_membership().await;
        self.core.set_connection(ConnectionState::Connecting);
        self.resume().await?;

        let period = (self.core.config.ack_timeout / 4)
            .clamp(Duration::from_millis(10), Duration::from_secs(1));
        let mut ack_tick = time::interval(period);
        ack_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let event_tx = self.core.event_tx.clone();

        loop {
            // Backlogged events first, then inbound traffic so acknowledgements are
            // seen before timeouts fire.
            let flow = tokio::select! {
                biased;

                permit = event_tx.reserve(), if !self.core.outbox.is_empty() => {
                    match permit {
                        Ok(permit) => {
                            if let Some(event) = self.core.outbox.pop_front() {
                                permit.send(event);
                            }
                        }
                        Err(_) => self.core.outbox.clear(),
                    }
                    Flow::Continue
                }
                Some(event) = self.transport_rx.recv() => self.on_transport_event(event).await,
                request = self.request_rx.recv() => match request {
                    Some(request) => self.core.on_request(request).await,
                    None => {
                        info!("All session handles dropped; leaving");
                        self.core.leave("all handles dropped").await;
                        Flow::Stop
                    }
                },
                _ = ack_tick.tick() => {
                    self.core.on_tick().await;
                    Flow::Continue
                }
                _ = sleep_until(self.reconnect_at) => {
                    self.resume().await?;
                    Flow::Continue
                }
            };
            if let Flow::Stop = flow {
                return Ok(());
            }
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) -> Flow {
        if !self.core.is_current(event.conn_id) {
            trace!(conn_id = event.conn_id, "Ignoring event of a replaced connection");
            return Flow::Continue;
        }
        match event.kind {
            TransportEventKind::Frame(frame) => return self.core.on_frame(frame).await,
            TransportEventKind::Malformed(err) => warn!(error = %err, "Dropped undecodable frame"),
            TransportEventKind::Disconnected { reason } => {
                self.core.on_connection_lost(&reason).await;
                self.reconnect_at = Some(self.supervisor.on_disconnect(Instant::now()));
            }
        }
        Flow::Continue
    }

    /// Frames of the new connection stay queued until this returns, so they
    /// are routed only after the subscriptions were replayed.
    async fn resume(&mut self) -> Result<(), NetplayError> {
        self.reconnect_at = None;
        match self.supervisor.resume(&mut self.core).await {
            ResumeOutcome::Resumed => {
                self.core.publish_state();
                Ok(())
            }
            ResumeOutcome::Retry(at) => {
                self.core.abandon_transport().await;
                self.core.set_connection(ConnectionState::Reconnecting);
                self.reconnect_at = Some(at);
                Ok(())
            }
            ResumeOutcome::Lost(err) => Err(self.core.lose(err).await),
        }
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

struct SessionCore {
    config: NetplayConfig,
    token: AuthToken,
    transport: Option<TransportHandle>,
    transport_tx: mpsc::Sender<TransportEvent>,
    next_conn_id: u64,
    registry: SubscriptionRegistry,
    reconciler: SessionReconciler,
    dispatcher: CommandDispatcher,
    store: Arc<dyn DocumentStore>,
    event_tx: mpsc::Sender<NetplayEvent>,
    /// Events the receiver had no room for yet, oldest first.
    outbox: VecDeque<NetplayEvent>,
    state_tx: watch::Sender<StateView>,
    connection_tx: watch::Sender<ConnectionState>,
}

impl SessionCore {
    fn register_default_topics(&mut self) {
        let topic = game_topic(&self.config.session_id);
        self.registry.subscribe(&topic, TopicRoute::GameUpdates);
        self.registry.subscribe(USER_ERROR_QUEUE, TopicRoute::GameUpdates);
    }

    async fn seed_membership(&mut self) {
        match self.store.load_membership(&self.config.session_id).await {
            Ok(members) => {
                debug!(count = members.len(), "Loaded advisory membership");
                self.reconciler.seed_participants(members);
                self.publish_state();
            }
            Err(e) => warn!(error = %e, "Failed to load membership"),
        }
    }

    fn is_current(&self, conn_id: u64) -> bool {
        self.transport.as_ref().map(TransportHandle::conn_id) == Some(conn_id)
    }

    fn is_connected(&self) -> bool {
        self.transport
            .as_ref()
            .is_some_and(TransportHandle::is_connected)
    }

    fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            heartbeat_interval: self.config.heartbeat_interval,
            heartbeat_timeout: self.config.heartbeat_timeout,
            connect_timeout: self.config.connect_timeout,
            outbound_capacity: self.config.outbound_capacity,
        }
    }

    /// Queue an event for the presentation layer without waiting for it.
    fn emit(&mut self, event: NetplayEvent) {
        if self.outbox.is_empty() {
            match self.event_tx.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Closed(_)) => {
                    trace!("Event receiver dropped");
                    return;
                }
                Err(TrySendError::Full(event)) => self.outbox.push_back(event),
            }
        } else {
            self.outbox.push_back(event);
        }
        if self.outbox.len() == self.config.event_capacity {
            warn!(
                backlog = self.outbox.len(),
                "Event receiver is falling behind"
            );
        }
    }

    /// Hand undelivered events to a task of their own once the session stops.
    fn flush_events(&mut self) {
        if self.outbox.is_empty() {
            return;
        }
        let events = std::mem::take(&mut self.outbox);
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            for event in events {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
    }

    fn publish_state(&mut self) {
        let view = self.reconciler.view();
        self.state_tx.send_replace(view.clone());
        self.emit(NetplayEvent::StateChanged(view));
    }

    fn set_connection(&mut self, state: ConnectionState) {
        if *self.connection_tx.borrow() == state {
            return;
        }
        info!(?state, "Connection state");
        self.connection_tx.send_replace(state);
        self.emit(NetplayEvent::ConnectionState(state));
    }

    async fn send(&self, frame: &Frame) -> Result<(), NetplayError> {
        match &self.transport {
            Some(transport) => transport.send(frame).await,
            None => Err(NetplayError::SendFailure("not connected".to_string())),
        }
    }

    async fn send_resync(&mut self) -> Result<(), NetplayError> {
        let request = self
            .reconciler
            .resync_request(self.config.participant_id.clone());
        info!(known_version = request.known_version, "Requesting snapshot");
        self.send(&request.to_frame()?).await
    }

    fn membership_record(&self, change: MembershipChange) -> MembershipRecord {
        MembershipRecord {
            session_id: self.config.session_id.clone(),
            participant_id: self.config.participant_id.clone(),
            change,
            timestamp_ms: current_time_ms(),
        }
    }

    /// Fire-and-forget: the store is advisory and must not stall the session.
    fn record_membership(&self, change: MembershipChange) {
        let store = self.store.clone();
        let record = self.membership_record(change);
        tokio::spawn(async move {
            if let Err(e) = store.record_membership(record).await {
                warn!(error = %e, "Failed to record membership");
            }
        });
    }

    async fn on_request(&mut self, request: SessionRequest) -> Flow {
        match request {
            SessionRequest::Submit {
                envelope,
                status_tx,
            } => self.on_submit(envelope, status_tx).await,
            SessionRequest::Watch { id, reply } => {
                let _ = reply.send(self.dispatcher.watch(id));
            }
            SessionRequest::Subscribe {
                topic,
                handler,
                reply,
            } => {
                let id = self.subscribe(&topic, TopicRoute::Custom(handler)).await;
                let _ = reply.send(id);
            }
            SessionRequest::Unsubscribe { id, reply } => {
                let removed = self.unsubscribe(id).await;
                let _ = reply.send(removed);
            }
            SessionRequest::Leave { reply } => {
                self.leave("left").await;
                let _ = reply.send(());
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    async fn subscribe(&mut self, topic: &str, route: TopicRoute) -> SubscriptionId {
        let outcome = self.registry.subscribe(topic, route);
        if let SubscribeOutcome::Added(id) = outcome {
            if self.is_connected() {
                let frame = self.registry.get(id).map(Subscription::subscribe_frame);
                if let Some(frame) = frame {
                    match self.send(&frame).await {
                        Ok(()) => self.registry.mark_active(id),
                        Err(e) => warn!(topic, error = %e, "Subscribe deferred to next connection"),
                    }
                }
            }
        }
        outcome.id()
    }

    async fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let Some(sub) = self.registry.unsubscribe(id) else {
            return false;
        };
        if sub.active && self.is_connected() {
            if let Err(e) = self.send(&Frame::unsubscribe(&id.to_string())).await {
                warn!(topic = %sub.topic, error = %e, "Failed to send UNSUBSCRIBE");
            }
        }
        true
    }

    async fn on_submit(
        &mut self,
        envelope: CommandEnvelope,
        status_tx: watch::Sender<CommandStatus>,
    ) {
        let id = envelope.seq;
        let rejection = if self.reconciler.lifecycle() == SessionLifecycle::Closed {
            Some("session closed".to_string())
        } else {
            envelope
                .to_frame()
                .and_then(|frame| encode_frame(&frame))
                .err()
                .map(|e| e.to_string())
        };
        if let Some(reason) = rejection {
            warn!(%id, %reason, "Command refused");
            let status = CommandStatus::Dropped(reason);
            status_tx.send_replace(status.clone());
            self.emit(NetplayEvent::CommandStatus { id, status });
            return;
        }

        debug!(%id, action = %envelope.action, "Command submitted");
        let payload = CommandPayload {
            action: envelope.action.clone(),
            body: envelope.body.clone(),
        };
        self.dispatcher.admit(envelope.clone(), status_tx);
        if let Err(e) = self.reconciler.predict(id, payload) {
            warn!(%id, error = %e, "Prediction skipped");
        }
        self.emit(NetplayEvent::CommandStatus {
            id,
            status: CommandStatus::Pending,
        });
        self.publish_state();
        self.publish_or_queue(&envelope).await;
    }

    async fn publish(&mut self, envelope: &CommandEnvelope) -> Result<(), NetplayError> {
        self.send(&envelope.to_frame()?).await?;
        trace!(id = %envelope.seq, "Command published");
        self.dispatcher.mark_published(envelope.seq, Instant::now());
        Ok(())
    }

    async fn publish_or_queue(&mut self, envelope: &CommandEnvelope) {
        if self.is_connected() {
            match self.publish(envelope).await {
                Ok(()) => return,
                Err(e) => warn!(id = %envelope.seq, error = %e, "Publish failed; queueing"),
            }
        }
        self.queue(envelope.seq).await;
    }

    async fn queue(&mut self, id: CommandId) {
        if let Some(dropped) = self.dispatcher.enqueue(id, Instant::now()) {
            self.on_dropped(dropped).await;
        }
    }

    async fn on_dropped(&mut self, id: CommandId) {
        let status = self
            .dispatcher
            .status(id)
            .unwrap_or(CommandStatus::Dropped("command queue full".to_string()));
        let had_shadow = self.reconciler.discard(id);
        self.emit(NetplayEvent::CommandStatus { id, status });
        self.emit(NetplayEvent::Backpressure {
            dropped: id,
            queued: self.dispatcher.queued_len(),
        });
        if had_shadow {
            self.publish_state();
        }
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        let healthy = self.is_connected();
        for action in self.dispatcher.poll_timeouts(now, healthy) {
            match action {
                TimeoutAction::Retry(envelope) => {
                    if let Err(e) = self.publish(&envelope).await {
                        warn!(id = %envelope.seq, error = %e, "Retry deferred to reconnect");
                        self.queue(envelope.seq).await;
                    }
                }
                TimeoutAction::Expired(id) => {
                    let had_shadow = self.reconciler.discard(id);
                    self.emit(NetplayEvent::CommandStatus {
                        id,
                        status: CommandStatus::TimedOut,
                    });
                    if had_shadow {
                        self.publish_state();
                    }
                }
            }
        }
        let collected = self.dispatcher.collect_garbage(now);
        if collected > 0 {
            trace!(collected, "Collected finished commands");
        }
    }

    async fn on_frame(&mut self, frame: Frame) -> Flow {
        match frame.command {
            StompCommand::Message => match self.registry.dispatch(frame) {
                Delivery::Deliver(sub, frame) => return self.deliver(sub, frame).await,
                Delivery::Unrouted => debug!("Dropping message without an active subscription"),
            },
            StompCommand::Error => {
                let message = frame.error_message();
                warn!(%message, "Server sent ERROR frame");
                self.emit(NetplayEvent::ServerError { message });
            }
            StompCommand::Receipt => {
                debug!(receipt = frame.header("receipt-id").unwrap_or("-"), "Receipt");
            }
            other => debug!(command = %other, "Ignoring unexpected frame"),
        }
        Flow::Continue
    }

    async fn deliver(&mut self, sub: Subscription, frame: Frame) -> Flow {
        match sub.route {
            TopicRoute::Custom(handler) => {
                handler.on_message(&sub.topic, &frame);
                Flow::Continue
            }
            TopicRoute::GameUpdates => match frame.json_body::<ServerUpdate>() {
                Ok(update) => {
                    debug!(kind = update.kind(), topic = %sub.topic, "Server update");
                    self.apply_update(update).await
                }
                Err(err) if sub.topic == USER_ERROR_QUEUE => {
                    // The error queue may carry plain text.
                    debug!(error = %err, "Error queue message is not a server update");
                    let message = String::from_utf8_lossy(&frame.body).into_owned();
                    self.emit(NetplayEvent::ServerError { message });
                    Flow::Continue
                }
                Err(err) => {
                    if let Ok(UntypedUpdate { kind, message }) = frame.json_body() {
                        debug!(%kind, topic = %sub.topic, "Unversioned server update");
                        self.emit(NetplayEvent::ServerNotice { kind, message });
                    } else {
                        warn!(topic = %sub.topic, error = %err, "Dropping undecodable update");
                    }
                    Flow::Continue
                }
            },
        }
    }

    async fn apply_update(&mut self, update: ServerUpdate) -> Flow {
        let now = Instant::now();
        match update {
            ServerUpdate::JoinAck(snapshot) | ServerUpdate::Snapshot(snapshot) => {
                let joining = self.reconciler.lifecycle() == SessionLifecycle::Created;
                let outcome = self.reconciler.apply_snapshot(&snapshot);
                self.after_apply(outcome, now).await;
                if joining && self.reconciler.lifecycle() == SessionLifecycle::Active {
                    self.record_membership(MembershipChange::Joined);
                }
            }
            ServerUpdate::Delta(delta) => {
                if let Some(message) = &delta.message {
                    debug!(%message, "Delta message");
                }
                let outcome = self.reconciler.apply_delta(&delta);
                self.after_apply(outcome, now).await;
            }
            ServerUpdate::Ack(ack) => {
                self.finish_command(ack.seq, CommandStatus::Acknowledged, now)
                    .await;
            }
            ServerUpdate::Rejected(rejected) => {
                self.finish_command(rejected.seq, CommandStatus::Rejected(rejected.reason), now)
                    .await;
            }
            ServerUpdate::Error(notice) => {
                warn!(message = %notice.message, seq = ?notice.seq, "Server error notice");
                self.emit(NetplayEvent::ServerError {
                    message: notice.message.clone(),
                });
                if let Some(seq) = notice.seq {
                    self.finish_command(seq, CommandStatus::Rejected(notice.message), now)
                        .await;
                }
            }
            ServerUpdate::Terminated(notice) => {
                info!(message = %notice.message, "Session terminated by server");
                self.shutdown("session terminated", notice.message).await;
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    async fn after_apply(&mut self, outcome: ApplyOutcome, now: Instant) {
        match outcome {
            ApplyOutcome::Applied { version, confirmed } => {
                trace!(version, "State advanced");
                for id in confirmed {
                    if self.dispatcher.acknowledge(id, now) {
                        self.emit(NetplayEvent::CommandStatus {
                            id,
                            status: CommandStatus::Acknowledged,
                        });
                    }
                }
                self.publish_state();
            }
            ApplyOutcome::Stale { version } => debug!(version, "Stale update ignored"),
            ApplyOutcome::Conflict {
                local,
                base,
                discarded,
            } => {
                let conflict = NetplayError::VersionConflict { local, base };
                warn!(error = %conflict, discarded = discarded.len(), "Resynchronizing");
                self.publish_state();
                if let Err(e) = self.send_resync().await {
                    warn!(error = %e, "Resync request deferred to reconnect");
                }
            }
            ApplyOutcome::Ignored { reason } => debug!(reason, "Update ignored"),
        }
    }

    async fn finish_command(&mut self, id: CommandId, status: CommandStatus, now: Instant) {
        let finished = match &status {
            CommandStatus::Acknowledged => self.dispatcher.acknowledge(id, now),
            CommandStatus::Rejected(reason) => self.dispatcher.reject(id, reason.clone(), now),
            _ => false,
        };
        if !finished {
            debug!(%id, "Update for unknown or finished command");
            return;
        }
        let had_shadow = self.reconciler.discard(id);
        self.emit(NetplayEvent::CommandStatus { id, status });
        if had_shadow {
            self.publish_state();
        }
    }

    async fn fail_all(&mut self, reason: &str) {
        for id in self.dispatcher.fail_all(reason, Instant::now()) {
            self.emit(NetplayEvent::CommandStatus {
                id,
                status: CommandStatus::Dropped(reason.to_string()),
            });
        }
    }

    async fn on_connection_lost(&mut self, reason: &DisconnectReason) {
        warn!(%reason, "Connection lost; reconnecting");
        self.transport = None;
        self.registry.suspend();
        self.reconciler.on_connection_lost();
        for dropped in self.dispatcher.requeue_in_flight(Instant::now()) {
            self.on_dropped(dropped).await;
        }
        self.set_connection(ConnectionState::Reconnecting);
        self.publish_state();
    }

    /// Give up on a half-resumed connection before the next attempt.
    async fn abandon_transport(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
        self.registry.suspend();
        for dropped in self.dispatcher.requeue_in_flight(Instant::now()) {
            self.on_dropped(dropped).await;
        }
    }

    /// Close the session for good: fail pending commands, record the leave and
    /// drop the connection.
    async fn shutdown(&mut self, command_reason: &str, close_reason: String) {
        self.fail_all(command_reason).await;
        if self.reconciler.lifecycle() != SessionLifecycle::Created {
            self.record_membership(MembershipChange::Left);
        }
        self.reconciler.close();
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
        self.set_connection(ConnectionState::Disconnected);
        self.publish_state();
        self.emit(NetplayEvent::SessionClosed {
            reason: close_reason,
        });
    }

    async fn leave(&mut self, reason: &str) {
        info!(reason, "Leaving session");
        if self.is_connected() {
            let request = LeaveRequest {
                game_id: self.config.session_id.clone(),
                player_id: self.config.participant_id.clone(),
            };
            let sent = match request.to_frame() {
                Ok(frame) => self.send(&frame).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = sent {
                warn!(error = %e, "Failed to send leave request");
            }
        }
        self.shutdown("session left", reason.to_string()).await;
    }

    async fn lose(&mut self, err: NetplayError) -> NetplayError {
        error!(error = %err, "Session lost");
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
        self.fail_all("session lost").await;
        self.reconciler.close();
        self.set_connection(ConnectionState::Disconnected);
        self.publish_state();
        self.emit(NetplayEvent::SessionLost { error: err.clone() });
        err
    }
}

#[async_trait]
impl ResumeSteps for SessionCore {
    async fn connect(&mut self) -> Result<(), NetplayError> {
        if let Some(old) = self.transport.take() {
            old.close().await;
        }
        self.next_conn_id += 1;
        let handle = transport::connect(
            &self.config.endpoint,
            &self.token,
            &self.connect_options(),
            self.next_conn_id,
            self.transport_tx.clone(),
        )
        .await?;
        self.transport = Some(handle);
        self.set_connection(ConnectionState::Connected);
        Ok(())
    }

    async fn replay_subscriptions(&mut self) -> Result<(), NetplayError> {
        let frames = self.registry.replay();
        debug!(count = frames.len(), "Replaying subscriptions");
        for frame in &frames {
            self.send(frame).await?;
        }
        Ok(())
    }

    async fn request_resync(&mut self) -> Result<(), NetplayError> {
        if self.reconciler.lifecycle() == SessionLifecycle::Created {
            let join = JoinRequest {
                game_id: self.config.session_id.clone(),
                player_id: self.config.participant_id.clone(),
            };
            info!(session = %join.game_id, "Joining session");
            return self.send(&join.to_frame()?).await;
        }
        self.send_resync().await
    }

    async fn flush_commands(&mut self) -> Result<(), NetplayError> {
        let queued = self.dispatcher.take_queued();
        if !queued.is_empty() {
            info!(count = queued.len(), "Flushing queued commands");
        }
        let mut pending = queued.into_iter();
        while let Some(envelope) = pending.next() {
            if let Err(e) = self.publish(&envelope).await {
                self.queue(envelope.seq).await;
                for rest in pending {
                    self.queue(rest.seq).await;
                }
                return Err(e);
            }
        }
        Ok(())
    }
}

fn current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
