//! Command dispatcher.
//!
//! Sequence numbers come from an atomic counter shared with every
//! [`SessionHandle`](crate::handler::SessionHandle), so submission is safe from
//! any task. Everything else lives in [`CommandDispatcher`], which only the
//! session task touches.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use put0_netproto::messages::{CommandEnvelope, CommandId};
use tokio::{sync::watch, time::Instant};
use tracing::{debug, warn};

use crate::error::NetplayError;

/// Per-session sequence number source.
#[derive(Debug)]
pub struct SequenceAllocator {
    next: AtomicU64,
}

impl SequenceAllocator {
    pub fn new(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    pub fn next(&self) -> CommandId {
        CommandId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandStatus {
    Pending,
    Acknowledged,
    TimedOut,
    Rejected(String),
    /// Dropped before the server saw it: queue overflow, leave or session loss.
    Dropped(String),
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CommandStatus::Pending)
    }

    /// `Ok` only for an acknowledged command.
    pub fn into_result(self, id: CommandId) -> Result<CommandStatus, NetplayError> {
        match self {
            CommandStatus::Acknowledged | CommandStatus::Pending => Ok(self),
            CommandStatus::TimedOut => Err(NetplayError::TimedOut { id }),
            CommandStatus::Rejected(reason) => Err(NetplayError::Rejected { id, reason }),
            CommandStatus::Dropped(reason) => Err(NetplayError::CommandDropped { id, reason }),
        }
    }
}

/// Caller-side view of a submitted command.
#[derive(Debug, Clone)]
pub struct CommandTicket {
    pub id: CommandId,
    status: watch::Receiver<CommandStatus>,
}

impl CommandTicket {
    pub fn new(id: CommandId, status: watch::Receiver<CommandStatus>) -> Self {
        Self { id, status }
    }

    pub fn status(&self) -> CommandStatus {
        self.status.borrow().clone()
    }

    /// Wait until the command is acknowledged or fails.
    ///
    /// Dropping the future, or `timeout` elapsing, does not affect the command.
    pub async fn outcome(&self, timeout: Duration) -> Result<CommandStatus, NetplayError> {
        wait_for_outcome(self.status.clone(), self.id, timeout).await
    }
}

pub async fn wait_for_outcome(
    mut status: watch::Receiver<CommandStatus>,
    id: CommandId,
    timeout: Duration,
) -> Result<CommandStatus, NetplayError> {
    let wait = async {
        status
            .wait_for(CommandStatus::is_terminal)
            .await
            .map(|s| CommandStatus::clone(&s))
            .map_err(|_| NetplayError::SessionClosed)
    };
    let status = tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| NetplayError::TimedOut { id })??;
    status.into_result(id)
}

struct CommandRecord {
    envelope: CommandEnvelope,
    status_tx: watch::Sender<CommandStatus>,
    published_at: Option<Instant>,
    /// Number of times the command was put on the wire.
    publications: u32,
    timed_out_once: bool,
    finished_at: Option<Instant>,
}

impl CommandRecord {
    fn status(&self) -> CommandStatus {
        self.status_tx.borrow().clone()
    }

    fn finish(&mut self, status: CommandStatus, now: Instant) {
        self.published_at = None;
        self.finished_at = Some(now);
        self.status_tx.send_replace(status);
    }
}

/// Produced by [`CommandDispatcher::poll_timeouts`].
#[derive(Debug, Clone, PartialEq)]
pub enum TimeoutAction {
    /// First timeout on a healthy link: publish the same command again.
    Retry(CommandEnvelope),
    /// Terminal.
    Expired(CommandId),
}

pub struct CommandDispatcher {
    records: BTreeMap<CommandId, CommandRecord>,
    queue: VecDeque<CommandId>,
    capacity: usize,
    ack_timeout: Duration,
    gc_grace: Duration,
}

impl CommandDispatcher {
    pub fn new(capacity: usize, ack_timeout: Duration, gc_grace: Duration) -> Self {
        Self {
            records: BTreeMap::new(),
            queue: VecDeque::new(),
            capacity: capacity.max(1),
            ack_timeout,
            gc_grace,
        }
    }

    /// Start tracking a command. Its status is published on `status_tx`.
    pub fn admit(&mut self, envelope: CommandEnvelope, status_tx: watch::Sender<CommandStatus>) {
        let id = envelope.seq;
        status_tx.send_replace(CommandStatus::Pending);
        self.records.insert(
            id,
            CommandRecord {
                envelope,
                status_tx,
                published_at: None,
                publications: 0,
                timed_out_once: false,
                finished_at: None,
            },
        );
    }

    pub fn envelope(&self, id: CommandId) -> Option<&CommandEnvelope> {
        self.records.get(&id).map(|r| &r.envelope)
    }

    /// Hold a command until the connection is back.
    ///
    /// When the queue is full the oldest queued command is failed with
    /// `Dropped`; its id is returned.
    pub fn enqueue(&mut self, id: CommandId, now: Instant) -> Option<CommandId> {
        let mut dropped = None;
        if self.queue.len() >= self.capacity {
            if let Some(oldest) = self.queue.pop_front() {
                warn!(
                    %oldest,
                    capacity = self.capacity,
                    "Command queue full; dropping oldest command"
                );
                if let Some(record) = self.records.get_mut(&oldest) {
                    record.finish(CommandStatus::Dropped("command queue full".to_string()), now);
                }
                dropped = Some(oldest);
            }
        }
        // Keep the queue in sequence order; concurrent submitters may arrive out of order.
        let pos = self.queue.partition_point(|queued| *queued < id);
        self.queue.insert(pos, id);
        dropped
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_queue_full(&self) -> bool {
        self.queue.len() >= self.capacity
    }

    /// Drain the queue in sequence order for publishing.
    pub fn take_queued(&mut self) -> Vec<CommandEnvelope> {
        let ids: Vec<_> = self.queue.drain(..).collect();
        ids.into_iter()
            .filter_map(|id| self.records.get(&id))
            .filter(|r| !r.status().is_terminal())
            .map(|r| r.envelope.clone())
            .collect()
    }

    pub fn mark_published(&mut self, id: CommandId, now: Instant) {
        if let Some(record) = self.records.get_mut(&id) {
            record.published_at = Some(now);
            record.publications += 1;
        }
    }

    /// Returns `false` when the command is unknown or already terminal.
    pub fn acknowledge(&mut self, id: CommandId, now: Instant) -> bool {
        self.finish(id, CommandStatus::Acknowledged, now)
    }

    pub fn reject(&mut self, id: CommandId, reason: String, now: Instant) -> bool {
        self.finish(id, CommandStatus::Rejected(reason), now)
    }

    fn finish(&mut self, id: CommandId, status: CommandStatus, now: Instant) -> bool {
        let Some(record) = self.records.get_mut(&id) else {
            return false;
        };
        if record.status().is_terminal() {
            return false;
        }
        debug!(%id, ?status, "Command finished");
        record.finish(status, now);
        self.queue.retain(|queued| *queued != id);
        true
    }

    /// Expire published commands whose acknowledgement is overdue.
    ///
    /// A command is retried once if `healthy` and the queue has room; its
    /// second timeout is terminal.
    pub fn poll_timeouts(&mut self, now: Instant, healthy: bool) -> Vec<TimeoutAction> {
        let can_retry = healthy && !self.is_queue_full();
        let mut actions = Vec::new();
        for (id, record) in self.records.iter_mut() {
            let Some(published_at) = record.published_at else {
                continue;
            };
            if record.status().is_terminal() || now < published_at + self.ack_timeout {
                continue;
            }
            if !record.timed_out_once && can_retry {
                debug!(%id, "Acknowledgement overdue; retrying once");
                record.timed_out_once = true;
                record.published_at = None;
                actions.push(TimeoutAction::Retry(record.envelope.clone()));
            } else {
                warn!(%id, publications = record.publications, "Command timed out");
                record.finish(CommandStatus::TimedOut, now);
                actions.push(TimeoutAction::Expired(*id));
            }
        }
        actions
    }

    /// Connection lost: published but unacknowledged commands go back to the
    /// queue for re-sending. Returns commands dropped by queue overflow.
    pub fn requeue_in_flight(&mut self, now: Instant) -> Vec<CommandId> {
        let in_flight: Vec<_> = self
            .records
            .iter_mut()
            .filter(|(_, r)| r.published_at.is_some() && !r.status().is_terminal())
            .map(|(id, r)| {
                r.published_at = None;
                *id
            })
            .collect();
        in_flight
            .into_iter()
            .filter_map(|id| self.enqueue(id, now))
            .collect()
    }

    /// Fail every unfinished command. Returns their ids.
    pub fn fail_all(&mut self, reason: &str, now: Instant) -> Vec<CommandId> {
        self.queue.clear();
        let mut failed = Vec::new();
        for (id, record) in self.records.iter_mut() {
            if !record.status().is_terminal() {
                record.finish(CommandStatus::Dropped(reason.to_string()), now);
                failed.push(*id);
            }
        }
        failed
    }

    /// Forget terminal commands older than the grace window.
    pub fn collect_garbage(&mut self, now: Instant) -> usize {
        let grace = self.gc_grace;
        let before = self.records.len();
        self.records
            .retain(|_, r| r.finished_at.is_none_or(|at| now < at + grace));
        before - self.records.len()
    }

    pub fn watch(&self, id: CommandId) -> Option<watch::Receiver<CommandStatus>> {
        self.records.get(&id).map(|r| r.status_tx.subscribe())
    }

    pub fn status(&self, id: CommandId) -> Option<CommandStatus> {
        self.records.get(&id).map(CommandRecord::status)
    }

    pub fn pending_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| !r.status().is_terminal())
            .count()
    }
}
