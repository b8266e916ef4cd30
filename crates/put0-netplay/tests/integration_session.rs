mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::*;
use parking_lot::Mutex;
use put0_netplay::{
    CommandId, CommandPayload, CommandStatus, ConnectionState, NetplayError, NetplayEvent,
    SessionLifecycle,
};
use put0_netproto::{
    command::StompCommand,
    destination::{USER_ERROR_QUEUE, game_topic},
    frame::Frame,
    messages::{
        CommandAck, CommandRejected, ServerNotice, ServerUpdate, SessionId, Snapshot, StateDelta,
    },
};
use put0_netplay::store::MembershipChange;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::mpsc;

fn topic() -> String {
    game_topic(&SessionId::from("g1"))
}

fn snapshot(version: u64) -> Snapshot {
    Snapshot {
        game_id: "g1".into(),
        version,
        participants: vec!["p1".into(), "p2".into()],
        game_state: json!({"table": [], "turn": "p1"}),
        confirms: vec![],
    }
}

/// Expect the subscriptions and join request of a fresh session, then accept it.
async fn join(broker: &mut MockBroker, conn: &mut MockConn, version: u64) {
    let sub = broker.frame().await;
    assert_eq!(sub.command, StompCommand::Subscribe);
    assert_eq!(sub.destination(), Some(topic().as_str()));
    let sub = broker.frame().await;
    assert_eq!(sub.destination(), Some(USER_ERROR_QUEUE));

    let join = broker.frame().await;
    assert_eq!(join.command, StompCommand::Send);
    assert_eq!(join.destination(), Some("/app/game/join"));
    let body: Value = join.json_body().unwrap();
    assert_eq!(body, json!({"gameId": "g1", "playerId": "p1"}));

    conn.publish(&topic(), &ServerUpdate::JoinAck(snapshot(version)))
        .await;
}

#[tokio::test]
async fn join_then_command_acknowledged() {
    init_tracing();
    let mut broker = MockBroker::start("0,0").await;
    let mut session = start_session(test_config(&broker.url));

    let mut conn = broker.accept().await;
    assert_eq!(conn.auth.as_deref(), Some("Bearer secret"));
    join(&mut broker, &mut conn, 3).await;
    session.wait_version(3).await;

    let view = session.handle.state();
    assert_eq!(view.lifecycle, SessionLifecycle::Active);
    assert_eq!(view.participants.len(), 2);
    assert_eq!(session.handle.connection_state(), ConnectionState::Connected);

    let ticket = session
        .handle
        .submit(CommandPayload::new("draw"))
        .await
        .unwrap();
    assert_eq!(ticket.id, CommandId(1));
    let sent = broker.frame_of(StompCommand::Send).await;
    assert_eq!(sent.destination(), Some("/app/game/draw"));

    conn.publish(
        &topic(),
        &ServerUpdate::Delta(StateDelta {
            game_id: "g1".into(),
            base_version: 3,
            version: 4,
            patch: json!({"turn": "p2"}),
            confirms: vec![CommandId(1)],
            message: None,
        }),
    )
    .await;

    let status = session
        .handle
        .await_acknowledgement(ticket.id, WAIT)
        .await
        .unwrap();
    assert_eq!(status, CommandStatus::Acknowledged);
    session.wait_version(4).await;
    assert_eq!(session.handle.state().authoritative["turn"], "p2");

    // The store hears about the join asynchronously.
    let store = session.store.clone();
    tokio::time::timeout(WAIT, async move {
        while store.records(&"g1".into()).is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(
        session.store.records(&"g1".into())[0].change,
        MembershipChange::Joined
    );
}

#[tokio::test]
async fn unread_events_do_not_stall_the_session() {
    let mut broker = MockBroker::start("0,0").await;
    let mut session = start_session(test_config(&broker.url).with_event_capacity(2));

    // Nobody reads events until the command round trip is done.
    let mut conn = broker.accept().await;
    join(&mut broker, &mut conn, 3).await;
    session.wait_version(3).await;

    let ticket = session
        .handle
        .submit(CommandPayload::new("draw"))
        .await
        .unwrap();
    broker.frame_of(StompCommand::Send).await;
    conn.publish(
        &topic(),
        &ServerUpdate::Ack(CommandAck {
            seq: ticket.id,
            version: None,
        }),
    )
    .await;
    assert_eq!(
        ticket.outcome(WAIT).await.unwrap(),
        CommandStatus::Acknowledged
    );

    // The backlog is still delivered in order.
    let mut connection = Vec::new();
    let mut statuses = Vec::new();
    while statuses.len() < 2 {
        match session
            .wait_for(|e| {
                matches!(
                    e,
                    NetplayEvent::ConnectionState(_) | NetplayEvent::CommandStatus { .. }
                )
            })
            .await
        {
            NetplayEvent::ConnectionState(state) => connection.push(state),
            NetplayEvent::CommandStatus { id, status } => {
                assert_eq!(id, ticket.id);
                statuses.push(status);
            }
            _ => unreachable!(),
        }
    }
    assert_eq!(
        connection,
        [ConnectionState::Connecting, ConnectionState::Connected]
    );
    assert_eq!(
        statuses,
        [CommandStatus::Pending, CommandStatus::Acknowledged]
    );
}

#[tokio::test]
async fn concurrent_submits_get_unique_increasing_ids() {
    let mut broker = MockBroker::start("0,0").await;
    let mut session = start_session(test_config(&broker.url));
    let mut conn = broker.accept().await;
    join(&mut broker, &mut conn, 1).await;
    session.wait_version(1).await;

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let handle = session.handle.clone();
        tasks.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            for _ in 0..25 {
                let ticket = handle.submit(CommandPayload::new("draw")).await.unwrap();
                ids.push(ticket.id);
            }
            ids
        }));
    }

    let mut all = HashSet::new();
    for task in tasks {
        let ids = task.await.unwrap();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        for id in ids {
            assert!(all.insert(id), "duplicate {id}");
        }
    }
    assert_eq!(all.len(), 100);

    let mut on_wire = HashSet::new();
    while on_wire.len() < 100 {
        let frame = broker.frame_of(StompCommand::Send).await;
        let body: Value = frame.json_body().unwrap();
        on_wire.insert(CommandId(body["seq"].as_u64().unwrap()));
    }
    assert_eq!(on_wire, all);
}

#[tokio::test]
async fn server_refusals_surface_to_callers() {
    let mut broker = MockBroker::start("0,0").await;
    let mut session = start_session(test_config(&broker.url));
    let mut conn = broker.accept().await;
    join(&mut broker, &mut conn, 2).await;
    session.wait_version(2).await;

    let ticket = session
        .handle
        .submit(CommandPayload::new("play").with_field("card", "s1"))
        .await
        .unwrap();
    broker.frame_of(StompCommand::Send).await;
    conn.publish(
        USER_ERROR_QUEUE,
        &ServerUpdate::Rejected(CommandRejected {
            seq: ticket.id,
            reason: "not your turn".into(),
        }),
    )
    .await;
    let outcome = ticket.outcome(WAIT).await;
    assert!(
        matches!(&outcome, Err(NetplayError::Rejected { reason, .. }) if reason == "not your turn"),
        "{outcome:?}"
    );

    // Plain-text notices on the error queue are still reported.
    let text = Frame::new(StompCommand::Message)
        .with_header("destination", USER_ERROR_QUEUE)
        .with_body("seat taken");
    conn.send(text).await;
    let event = session
        .wait_for(|e| matches!(e, NetplayEvent::ServerError { .. }))
        .await;
    assert!(matches!(event, NetplayEvent::ServerError { message } if message == "seat taken"));

    assert!(matches!(
        session.handle.submit(CommandPayload::new("bad action")).await,
        Err(NetplayError::InvalidCommand(_))
    ));
}

#[tokio::test]
async fn version_gap_requests_snapshot() {
    let mut broker = MockBroker::start("0,0").await;
    let mut session = start_session(test_config(&broker.url));
    let mut conn = broker.accept().await;
    join(&mut broker, &mut conn, 5).await;
    session.wait_version(5).await;

    conn.publish(
        &topic(),
        &ServerUpdate::Delta(StateDelta {
            game_id: "g1".into(),
            base_version: 7,
            version: 8,
            patch: json!({"turn": "p9"}),
            confirms: vec![],
            message: None,
        }),
    )
    .await;

    let resync = broker.frame_of(StompCommand::Send).await;
    assert_eq!(resync.destination(), Some("/app/game/resync"));
    let body: Value = resync.json_body().unwrap();
    assert_eq!(body["knownVersion"], 5);
    assert_eq!(session.handle.state().version, 5);
    assert!(session.handle.state().awaiting_resync);

    let mut fresh = snapshot(8);
    fresh.game_state = json!({"table": [], "turn": "p9"});
    conn.publish(&topic(), &ServerUpdate::Snapshot(fresh)).await;
    session.wait_version(8).await;
    assert!(!session.handle.state().awaiting_resync);
}

#[tokio::test]
async fn unversioned_updates_surface_as_notices() {
    let mut broker = MockBroker::start("0,0").await;
    let mut session = start_session(test_config(&broker.url));
    let mut conn = broker.accept().await;
    join(&mut broker, &mut conn, 4).await;
    session.wait_version(4).await;

    let body = json!({
        "type": "CARD_PLAYED",
        "message": "p2 played h7",
        "gameState": {"table": ["h7"], "turn": "p1"}
    });
    let announcement = Frame::new(StompCommand::Message)
        .with_header("destination", topic())
        .with_header("content-type", "application/json")
        .with_body(serde_json::to_vec(&body).unwrap());
    conn.send(announcement).await;

    let event = session
        .wait_for(|e| matches!(e, NetplayEvent::ServerNotice { .. }))
        .await;
    assert!(matches!(
        event,
        NetplayEvent::ServerNotice { kind, message }
            if kind == "CARD_PLAYED" && message.as_deref() == Some("p2 played h7")
    ));
    let view = session.handle.state();
    assert_eq!(view.version, 4);
    assert_eq!(view.authoritative["table"], json!([]));
}

#[tokio::test]
async fn custom_topic_handler_receives_messages() {
    let mut broker = MockBroker::start("0,0").await;
    let mut session = start_session(test_config(&broker.url));
    let mut conn = broker.accept().await;
    join(&mut broker, &mut conn, 1).await;
    session.wait_version(1).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = session
        .handle
        .subscribe("/topic/chat/g1", move |topic: &str, frame: &Frame| {
            sink.lock().push(topic.to_string());
            let _ = tx.send(frame.body_str().unwrap_or_default().to_string());
        })
        .await
        .unwrap();

    let sub = broker.frame_of(StompCommand::Subscribe).await;
    assert_eq!(sub.destination(), Some("/topic/chat/g1"));
    assert_eq!(sub.header("id"), Some(id.to_string().as_str()));

    let message = Frame::new(StompCommand::Message)
        .with_header("destination", "/topic/chat/g1")
        .with_header("subscription", id.to_string())
        .with_body("hello");
    conn.send(message).await;
    let body = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(body, "hello");
    assert_eq!(seen.lock().as_slice(), ["/topic/chat/g1"]);

    assert!(session.handle.unsubscribe(id).await.unwrap());
    let unsub = broker.frame_of(StompCommand::Unsubscribe).await;
    assert_eq!(unsub.header("id"), Some(id.to_string().as_str()));
}

#[tokio::test]
async fn leave_drops_pending_commands_and_stops() {
    let mut broker = MockBroker::start("0,0").await;
    let mut session = start_session(test_config(&broker.url));
    let mut conn = broker.accept().await;
    join(&mut broker, &mut conn, 1).await;
    session.wait_version(1).await;

    let ticket = session
        .handle
        .submit(CommandPayload::new("draw"))
        .await
        .unwrap();
    broker.frame_of(StompCommand::Send).await;

    session.handle.leave().await.unwrap();
    let leave = broker.frame_of(StompCommand::Send).await;
    assert_eq!(leave.destination(), Some("/app/game/leave"));
    broker.frame_of(StompCommand::Disconnect).await;

    assert!(matches!(
        ticket.outcome(WAIT).await,
        Err(NetplayError::CommandDropped { .. })
    ));
    let closed = session
        .wait_for(|e| matches!(e, NetplayEvent::SessionClosed { .. }))
        .await;
    assert!(matches!(closed, NetplayEvent::SessionClosed { reason } if reason == "left"));

    let task = std::mem::replace(&mut session.task, tokio::spawn(async { Ok(()) }));
    assert!(task.await.unwrap().is_ok());
    assert_eq!(session.handle.state().lifecycle, SessionLifecycle::Closed);
    assert!(matches!(
        session.handle.submit(CommandPayload::new("draw")).await,
        Err(NetplayError::SessionClosed)
    ));
}

#[tokio::test]
async fn server_termination_closes_session() {
    let mut broker = MockBroker::start("0,0").await;
    let mut session = start_session(test_config(&broker.url));
    let mut conn = broker.accept().await;
    join(&mut broker, &mut conn, 1).await;
    session.wait_version(1).await;

    conn.publish(
        &topic(),
        &ServerUpdate::Terminated(ServerNotice {
            message: "game over".into(),
            seq: None,
        }),
    )
    .await;

    let closed = session
        .wait_for(|e| matches!(e, NetplayEvent::SessionClosed { .. }))
        .await;
    assert!(matches!(closed, NetplayEvent::SessionClosed { reason } if reason == "game over"));
    let task = std::mem::replace(&mut session.task, tokio::spawn(async { Ok(()) }));
    assert!(task.await.unwrap().is_ok());
    assert_eq!(
        session.handle.connection_state(),
        ConnectionState::Disconnected
    );
}
