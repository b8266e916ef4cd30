//! Document-store collaborator for session metadata.
//!
//! The store is advisory: membership read from it only seeds the view until
//! the server's snapshot arrives, and write failures are logged, never fatal.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use put0_netproto::messages::{ParticipantId, SessionId};
use serde::{Deserialize, Serialize};

use crate::error::NetplayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipChange {
    Joined,
    Left,
}

/// One join/leave fact as written to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipRecord {
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
    pub change: MembershipChange,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn record_membership(&self, record: MembershipRecord) -> Result<(), NetplayError>;

    /// Participants currently believed to be in the session.
    async fn load_membership(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<ParticipantId>, NetplayError>;
}

/// Process-local store, for tests and tools.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: Mutex<HashMap<SessionId, Vec<MembershipRecord>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self, session_id: &SessionId) -> Vec<MembershipRecord> {
        self.records
            .lock()
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn record_membership(&self, record: MembershipRecord) -> Result<(), NetplayError> {
        self.records
            .lock()
            .entry(record.session_id.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    async fn load_membership(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<ParticipantId>, NetplayError> {
        let records = self.records.lock();
        let mut members: Vec<ParticipantId> = Vec::new();
        for record in records.get(session_id).into_iter().flatten() {
            match record.change {
                MembershipChange::Joined => {
                    if !members.contains(&record.participant_id) {
                        members.push(record.participant_id.clone());
                    }
                }
                MembershipChange::Left => members.retain(|p| p != &record.participant_id),
            }
        }
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(who: &str, change: MembershipChange, ts: u64) -> MembershipRecord {
        MembershipRecord {
            session_id: "g1".into(),
            participant_id: who.into(),
            change,
            timestamp_ms: ts,
        }
    }

    #[tokio::test]
    async fn membership_follows_join_and_leave() {
        let store = InMemoryStore::new();
        store
            .record_membership(record("p1", MembershipChange::Joined, 1))
            .await
            .unwrap();
        store
            .record_membership(record("p2", MembershipChange::Joined, 2))
            .await
            .unwrap();
        store
            .record_membership(record("p1", MembershipChange::Left, 3))
            .await
            .unwrap();

        let members = store.load_membership(&"g1".into()).await.unwrap();
        assert_eq!(members, vec![ParticipantId::from("p2")]);
        assert_eq!(store.records(&"g1".into()).len(), 3);
        assert!(
            store
                .load_membership(&"other".into())
                .await
                .unwrap()
                .is_empty()
        );
    }
}
