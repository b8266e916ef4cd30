//! Session reconciler.
//!
//! Holds the authoritative game state of one session and the optimistic
//! shadow mutations of commands the server has not confirmed yet. The
//! predicted view is always recomputed from the authoritative state, so an
//! authoritative update can never be overridden by a local prediction.

use std::collections::BTreeMap;

use put0_netproto::messages::{
    CommandId, CommandPayload, ParticipantId, ResyncRequest, SessionId, Snapshot, StateDelta,
};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::NetplayError;

/// Session lifecycle.
///
/// `Created -(join ack)-> Active -(link lost)-> Reconnecting -(resync)-> Active`,
/// and any state may move to the terminal `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionLifecycle {
    #[default]
    Created,
    Active,
    Reconnecting,
    Closed,
}

impl SessionLifecycle {
    pub fn can_transition_to(self, next: SessionLifecycle) -> bool {
        use SessionLifecycle::*;
        matches!(
            (self, next),
            (Created, Active)
                | (Active, Reconnecting)
                | (Reconnecting, Active)
                | (Created | Active | Reconnecting, Closed)
        )
    }
}

/// Authoritative state: an opaque JSON document and its version.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GameState {
    pub version: u64,
    pub document: Value,
}

/// Computes the optimistic effect of a command.
pub trait Predictor: Send + Sync {
    /// Predicted document after `command`, or `None` to leave it unchanged.
    fn predict(&self, state: &Value, command: &CommandPayload) -> Option<Value>;
}

/// Predicts nothing; the view only moves on authoritative updates.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPrediction;

impl Predictor for NoPrediction {
    fn predict(&self, _state: &Value, _command: &CommandPayload) -> Option<Value> {
        None
    }
}

impl<F> Predictor for F
where
    F: Fn(&Value, &CommandPayload) -> Option<Value> + Send + Sync,
{
    fn predict(&self, state: &Value, command: &CommandPayload) -> Option<Value> {
        self(state, command)
    }
}

/// Snapshot of the session handed to the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub struct StateView {
    pub session_id: SessionId,
    pub lifecycle: SessionLifecycle,
    pub version: u64,
    pub participants: Vec<ParticipantId>,
    pub authoritative: Value,
    /// Authoritative state with pending shadows applied.
    pub predicted: Value,
    pub pending: Vec<CommandId>,
    pub awaiting_resync: bool,
}

/// Result of applying an authoritative update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied {
        version: u64,
        /// Commands the update reports as applied.
        confirmed: Vec<CommandId>,
    },
    /// Already at or past this version.
    Stale { version: u64 },
    /// Base version mismatch. Shadows were discarded and a resync is needed.
    Conflict {
        local: u64,
        base: u64,
        discarded: Vec<CommandId>,
    },
    Ignored { reason: &'static str },
}

pub struct SessionReconciler {
    session_id: SessionId,
    lifecycle: SessionLifecycle,
    participants: Vec<ParticipantId>,
    state: GameState,
    shadows: BTreeMap<CommandId, CommandPayload>,
    predicted: Value,
    awaiting_resync: bool,
    predictor: Box<dyn Predictor>,
}

impl SessionReconciler {
    pub fn new(session_id: SessionId, predictor: Box<dyn Predictor>) -> Self {
        Self {
            session_id,
            lifecycle: SessionLifecycle::Created,
            participants: Vec::new(),
            state: GameState::default(),
            shadows: BTreeMap::new(),
            predicted: Value::Null,
            awaiting_resync: false,
            predictor,
        }
    }

    pub fn lifecycle(&self) -> SessionLifecycle {
        self.lifecycle
    }

    pub fn state(&self) -> &GameState {
        &self.state
    }

    pub fn predicted(&self) -> &Value {
        &self.predicted
    }

    pub fn awaiting_resync(&self) -> bool {
        self.awaiting_resync
    }

    pub fn has_shadow(&self, id: CommandId) -> bool {
        self.shadows.contains_key(&id)
    }

    pub fn view(&self) -> StateView {
        StateView {
            session_id: self.session_id.clone(),
            lifecycle: self.lifecycle,
            version: self.state.version,
            participants: self.participants.clone(),
            authoritative: self.state.document.clone(),
            predicted: self.predicted.clone(),
            pending: self.shadows.keys().copied().collect(),
            awaiting_resync: self.awaiting_resync,
        }
    }

    /// Advisory membership from the document store, shown until the first snapshot.
    pub fn seed_participants(&mut self, participants: Vec<ParticipantId>) {
        if self.lifecycle == SessionLifecycle::Created && self.participants.is_empty() {
            self.participants = participants;
        }
    }

    pub fn transition(&mut self, next: SessionLifecycle) -> Result<(), NetplayError> {
        if self.lifecycle == next {
            return Ok(());
        }
        if !self.lifecycle.can_transition_to(next) {
            return Err(NetplayError::InvalidTransition {
                from: self.lifecycle,
                to: next,
            });
        }
        info!(session = %self.session_id, from = ?self.lifecycle, to = ?next, "Session lifecycle");
        self.lifecycle = next;
        Ok(())
    }

    /// Record the optimistic shadow of a freshly submitted command.
    pub fn predict(&mut self, id: CommandId, payload: CommandPayload) -> Result<(), NetplayError> {
        if self.lifecycle == SessionLifecycle::Closed {
            return Err(NetplayError::SessionClosed);
        }
        if let Some(next) = self.predictor.predict(&self.predicted, &payload) {
            self.predicted = next;
        }
        self.shadows.insert(id, payload);
        Ok(())
    }

    /// Drop the shadows of confirmed commands. Returns the ids that had one.
    pub fn confirm(&mut self, ids: &[CommandId]) -> Vec<CommandId> {
        let removed: Vec<_> = ids
            .iter()
            .copied()
            .filter(|id| self.shadows.remove(id).is_some())
            .collect();
        if !removed.is_empty() {
            self.rebase();
        }
        removed
    }

    /// Drop the shadow of a command the server refused or that failed.
    pub fn discard(&mut self, id: CommandId) -> bool {
        let removed = self.shadows.remove(&id).is_some();
        if removed {
            self.rebase();
        }
        removed
    }

    /// Apply an incremental update.
    ///
    /// The delta applies only on top of exactly `base_version`; otherwise the
    /// state is left untouched.
    pub fn apply_delta(&mut self, delta: &StateDelta) -> ApplyOutcome {
        if delta.game_id != self.session_id {
            return ApplyOutcome::Ignored {
                reason: "foreign session",
            };
        }
        match self.lifecycle {
            SessionLifecycle::Closed => {
                return ApplyOutcome::Ignored {
                    reason: "session closed",
                };
            }
            SessionLifecycle::Created => {
                return ApplyOutcome::Ignored {
                    reason: "not joined yet",
                };
            }
            SessionLifecycle::Active | SessionLifecycle::Reconnecting => {}
        }
        if self.awaiting_resync {
            return ApplyOutcome::Ignored {
                reason: "awaiting snapshot",
            };
        }
        if delta.version <= self.state.version {
            debug!(version = delta.version, local = self.state.version, "Stale delta");
            return ApplyOutcome::Stale {
                version: delta.version,
            };
        }
        if delta.base_version != self.state.version {
            let discarded: Vec<_> = std::mem::take(&mut self.shadows).into_keys().collect();
            self.awaiting_resync = true;
            self.predicted = self.state.document.clone();
            warn!(
                local = self.state.version,
                base = delta.base_version,
                discarded = discarded.len(),
                "Version conflict; discarding shadows and requesting a snapshot"
            );
            return ApplyOutcome::Conflict {
                local: self.state.version,
                base: delta.base_version,
                discarded,
            };
        }
        if delta.version <= delta.base_version {
            return ApplyOutcome::Ignored {
                reason: "delta does not advance the version",
            };
        }

        let mut document = self.state.document.clone();
        merge_patch(&mut document, &delta.patch);
        self.state = GameState {
            version: delta.version,
            document,
        };
        self.confirm(&delta.confirms);
        self.rebase();
        debug!(version = delta.version, confirms = delta.confirms.len(), "Applied delta");
        ApplyOutcome::Applied {
            version: delta.version,
            confirmed: delta.confirms.clone(),
        }
    }

    /// Replace the state with a full snapshot (join ack or resync reply).
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> ApplyOutcome {
        if snapshot.game_id != self.session_id {
            return ApplyOutcome::Ignored {
                reason: "foreign session",
            };
        }
        if self.lifecycle == SessionLifecycle::Closed {
            return ApplyOutcome::Ignored {
                reason: "session closed",
            };
        }
        if self.lifecycle != SessionLifecycle::Created && snapshot.version < self.state.version {
            warn!(
                version = snapshot.version,
                local = self.state.version,
                "Ignoring snapshot older than local state"
            );
            return ApplyOutcome::Stale {
                version: snapshot.version,
            };
        }

        self.state = GameState {
            version: snapshot.version,
            document: snapshot.game_state.clone(),
        };
        self.participants = snapshot.participants.clone();
        self.awaiting_resync = false;
        if matches!(
            self.lifecycle,
            SessionLifecycle::Created | SessionLifecycle::Reconnecting
        ) {
            self.lifecycle = SessionLifecycle::Active;
            info!(session = %self.session_id, version = snapshot.version, "Session active");
        }
        self.confirm(&snapshot.confirms);
        self.rebase();
        ApplyOutcome::Applied {
            version: snapshot.version,
            confirmed: snapshot.confirms.clone(),
        }
    }

    /// Build a snapshot request and stop applying deltas until it is answered.
    pub fn resync_request(&mut self, player_id: ParticipantId) -> ResyncRequest {
        self.awaiting_resync = true;
        ResyncRequest {
            game_id: self.session_id.clone(),
            player_id,
            known_version: self.state.version,
        }
    }

    /// The link dropped. An active session starts reconnecting.
    pub fn on_connection_lost(&mut self) {
        if self.lifecycle == SessionLifecycle::Active {
            self.lifecycle = SessionLifecycle::Reconnecting;
            info!(session = %self.session_id, "Session reconnecting");
        }
    }

    /// Terminal. Shadows are dropped; their commands are failed by the dispatcher.
    pub fn close(&mut self) {
        if self.lifecycle != SessionLifecycle::Closed {
            info!(session = %self.session_id, "Session closed");
        }
        self.lifecycle = SessionLifecycle::Closed;
        self.shadows.clear();
        self.predicted = self.state.document.clone();
        self.awaiting_resync = false;
    }

    fn rebase(&mut self) {
        let mut predicted = self.state.document.clone();
        for payload in self.shadows.values() {
            if let Some(next) = self.predictor.predict(&predicted, payload) {
                predicted = next;
            }
        }
        self.predicted = predicted;
    }
}

/// Apply a JSON merge patch (RFC 7386) to `target` in place.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn session() -> SessionId {
        SessionId::from("g1")
    }

    fn snapshot(version: u64, state: Value) -> Snapshot {
        Snapshot {
            game_id: session(),
            version,
            participants: vec!["p1".into(), "p2".into()],
            game_state: state,
            confirms: vec![],
        }
    }

    fn delta(base: u64, version: u64, patch: Value, confirms: Vec<u64>) -> StateDelta {
        StateDelta {
            game_id: session(),
            base_version: base,
            version,
            patch,
            confirms: confirms.into_iter().map(CommandId).collect(),
            message: None,
        }
    }

    /// Predicts a `play` by appending the card to `table`.
    fn table_predictor(state: &Value, cmd: &CommandPayload) -> Option<Value> {
        let card = cmd.body.get("card")?.clone();
        let mut next = state.clone();
        let table = next.get_mut("table")?.as_array_mut()?;
        table.push(card);
        Some(next)
    }

    fn active(version: u64) -> SessionReconciler {
        let mut r = SessionReconciler::new(session(), Box::new(table_predictor));
        r.apply_snapshot(&snapshot(version, json!({"table": [], "turn": "p1"})));
        r
    }

    #[test]
    fn join_ack_activates_session() {
        let mut r = SessionReconciler::new(session(), Box::new(NoPrediction));
        assert_eq!(r.lifecycle(), SessionLifecycle::Created);
        assert!(matches!(
            r.apply_delta(&delta(0, 1, json!({}), vec![])),
            ApplyOutcome::Ignored { .. }
        ));

        r.apply_snapshot(&snapshot(3, json!({"turn": "p1"})));
        assert_eq!(r.lifecycle(), SessionLifecycle::Active);
        assert_eq!(r.state().version, 3);
        assert_eq!(r.view().participants.len(), 2);
    }

    #[test]
    fn delta_applies_and_confirms_shadow() {
        let mut r = active(5);
        r.predict(CommandId(12), CommandPayload::new("play").with_field("card", "h7"))
            .unwrap();
        assert_eq!(r.predicted()["table"], json!(["h7"]));
        assert_eq!(r.state().document["table"], json!([]));

        let outcome = r.apply_delta(&delta(
            5,
            6,
            json!({"table": ["h7"], "turn": "p2"}),
            vec![12],
        ));
        assert_eq!(
            outcome,
            ApplyOutcome::Applied {
                version: 6,
                confirmed: vec![CommandId(12)]
            }
        );
        assert!(!r.has_shadow(CommandId(12)));
        assert_eq!(r.predicted(), &r.state().document);
        assert_eq!(r.state().document["turn"], "p2");
    }

    #[test]
    fn unconfirmed_shadows_are_rebased_on_authoritative_state() {
        let mut r = active(1);
        r.predict(CommandId(1), CommandPayload::new("play").with_field("card", "a"))
            .unwrap();
        r.apply_delta(&delta(1, 2, json!({"table": ["z"]}), vec![]));
        assert_eq!(r.state().document["table"], json!(["z"]));
        assert_eq!(r.predicted()["table"], json!(["z", "a"]));

        assert!(r.discard(CommandId(1)));
        assert_eq!(r.predicted()["table"], json!(["z"]));
    }

    #[test]
    fn base_mismatch_discards_shadows_without_touching_state() {
        let mut r = active(5);
        r.predict(CommandId(3), CommandPayload::new("play").with_field("card", "x"))
            .unwrap();
        let before = r.state().clone();

        let outcome = r.apply_delta(&delta(7, 8, json!({"turn": "p9"}), vec![]));
        assert_eq!(
            outcome,
            ApplyOutcome::Conflict {
                local: 5,
                base: 7,
                discarded: vec![CommandId(3)]
            }
        );
        assert_eq!(r.state(), &before);
        assert!(r.awaiting_resync());
        assert!(r.view().pending.is_empty());

        // Deltas wait for the snapshot.
        assert!(matches!(
            r.apply_delta(&delta(5, 6, json!({}), vec![])),
            ApplyOutcome::Ignored { .. }
        ));
        r.apply_snapshot(&snapshot(8, json!({"table": [], "turn": "p9"})));
        assert!(!r.awaiting_resync());
        assert!(matches!(
            r.apply_delta(&delta(8, 9, json!({}), vec![])),
            ApplyOutcome::Applied { version: 9, .. }
        ));
    }

    #[test]
    fn duplicate_and_old_updates_are_stale() {
        let mut r = active(5);
        assert_eq!(
            r.apply_delta(&delta(4, 5, json!({}), vec![])),
            ApplyOutcome::Stale { version: 5 }
        );
        assert_eq!(
            r.apply_snapshot(&snapshot(4, json!({}))),
            ApplyOutcome::Stale { version: 4 }
        );
        assert_eq!(r.state().version, 5);
    }

    #[test]
    fn reconnect_cycle() {
        let mut r = active(5);
        r.on_connection_lost();
        assert_eq!(r.lifecycle(), SessionLifecycle::Reconnecting);

        let req = r.resync_request("p1".into());
        assert_eq!(req.known_version, 5);
        r.apply_snapshot(&snapshot(5, json!({"table": []})));
        assert_eq!(r.lifecycle(), SessionLifecycle::Active);
    }

    #[test]
    fn closed_is_terminal() {
        let mut r = active(1);
        r.close();
        assert!(matches!(
            r.transition(SessionLifecycle::Active),
            Err(NetplayError::InvalidTransition { .. })
        ));
        assert!(matches!(
            r.apply_snapshot(&snapshot(9, json!({}))),
            ApplyOutcome::Ignored { .. }
        ));
        assert!(matches!(
            r.predict(CommandId(1), CommandPayload::new("draw")),
            Err(NetplayError::SessionClosed)
        ));
    }

    #[test]
    fn merge_patch_follows_rfc7386() {
        let mut doc = json!({"a": "b", "c": {"d": "e", "f": "g"}});
        merge_patch(&mut doc, &json!({"a": "z", "c": {"f": null}}));
        assert_eq!(doc, json!({"a": "z", "c": {"d": "e"}}));

        let mut doc = json!({"a": [1, 2]});
        merge_patch(&mut doc, &json!({"a": [3]}));
        assert_eq!(doc, json!({"a": [3]}));

        let mut doc = json!("scalar");
        merge_patch(&mut doc, &json!({"x": 1}));
        assert_eq!(doc, json!({"x": 1}));
    }

    proptest! {
        #[test]
        fn ordered_deltas_end_at_last_version(
            start in 0u64..1_000,
            steps in prop::collection::vec((1u64..5, 0i64..100), 1..40),
        ) {
            let mut r = SessionReconciler::new(session(), Box::new(NoPrediction));
            r.apply_snapshot(&snapshot(start, json!({})));

            let mut version = start;
            for (step, value) in steps {
                let next = version + step;
                let outcome = r.apply_delta(&delta(version, next, json!({"v": value}), vec![]));
                prop_assert!(matches!(outcome, ApplyOutcome::Applied { .. }), "unexpected outcome");
                prop_assert_eq!(r.state().version, next);
                version = next;
            }
            prop_assert_eq!(r.state().version, version);
        }

        #[test]
        fn mismatched_base_never_changes_state(local in 1u64..100, offset in 1u64..50) {
            let mut r = active(local);
            let before = r.state().clone();
            let base = local + offset;
            let outcome = r.apply_delta(&delta(base, base + 1, json!({"x": 1}), vec![]));
            prop_assert!(
                matches!(outcome, ApplyOutcome::Conflict { .. }),
                "expected a conflict"
            );
            prop_assert_eq!(r.state(), &before);
        }
    }
}
