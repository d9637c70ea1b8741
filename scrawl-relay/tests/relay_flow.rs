//! End-to-end relay flow against the in-memory directory and local hub
//!
//! Run with: cargo test --test relay_flow

use std::sync::Arc;
use tokio::sync::mpsc;

use scrawl_core::models::RoomId;
use scrawl_core::{MemoryDirectory, SessionDirectory};
use scrawl_relay::{
    ClientEnvelope, ConnectionRegistry, Point, RoomFabric, RoomHub, ServerEnvelope,
    SessionHandler, StrokeSegment,
};

struct Client {
    handler: SessionHandler,
    rx: mpsc::Receiver<ServerEnvelope>,
}

impl Client {
    fn connect(
        directory: &Arc<MemoryDirectory>,
        hub: &Arc<RoomHub>,
        registry: &ConnectionRegistry,
    ) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let handler = SessionHandler::new(
            scrawl_core::models::UserId::new(),
            directory.clone() as Arc<dyn SessionDirectory>,
            hub.clone() as Arc<dyn RoomFabric>,
            registry.clone(),
            tx,
        );
        Self { handler, rx }
    }

    fn next(&mut self) -> ServerEnvelope {
        self.rx.try_recv().expect("expected a queued envelope")
    }

    fn assert_idle(&mut self) {
        assert!(self.rx.try_recv().is_err(), "expected no queued envelope");
    }
}

fn stroke() -> StrokeSegment {
    StrokeSegment {
        from: Point { x: 0.0, y: 0.0 },
        to: Point { x: 10.0, y: 10.0 },
        color: "#000000".to_string(),
        size: 5.0,
    }
}

#[tokio::test]
async fn test_full_session_lifecycle() {
    let directory = Arc::new(MemoryDirectory::new());
    let hub = Arc::new(RoomHub::new());
    let registry = ConnectionRegistry::new();

    let mut u1 = Client::connect(&directory, &hub, &registry);
    let mut u2 = Client::connect(&directory, &hub, &registry);

    // U1 creates a room
    u1.handler.handle(ClientEnvelope::CreateRoom).await;
    let ServerEnvelope::RoomCreated { room_id, user_id } = u1.next() else {
        panic!("expected room_created");
    };
    assert_eq!(&user_id, u1.handler.user_id());

    // U2 joins; U1 is notified, U2 is not notified about itself
    u2.handler
        .handle(ClientEnvelope::JoinRoom {
            room_id: room_id.clone(),
        })
        .await;
    let ServerEnvelope::RoomJoined { room_id: joined, .. } = u2.next() else {
        panic!("expected room_joined");
    };
    assert_eq!(joined, room_id);
    u2.assert_idle();

    let ServerEnvelope::UserJoined { user_id } = u1.next() else {
        panic!("expected user_joined");
    };
    assert_eq!(&user_id, u2.handler.user_id());

    // U1 draws; U2 receives the exact payload, U1 receives nothing
    u1.handler
        .handle(ClientEnvelope::Draw { payload: stroke() })
        .await;
    let ServerEnvelope::Draw { user_id, payload } = u2.next() else {
        panic!("expected draw");
    };
    assert_eq!(&user_id, u1.handler.user_id());
    assert_eq!(payload, stroke());
    u1.assert_idle();

    // U2 leaves; U2 gets room_left, U1 gets user_left, membership shrinks
    u2.handler.handle(ClientEnvelope::LeaveRoom).await;
    let ServerEnvelope::RoomLeft { user_id } = u2.next() else {
        panic!("expected room_left");
    };
    assert_eq!(&user_id, u2.handler.user_id());
    let ServerEnvelope::UserLeft { user_id } = u1.next() else {
        panic!("expected user_left");
    };
    assert_eq!(&user_id, u2.handler.user_id());

    let users = directory.room_users(&room_id).await.expect("users");
    assert_eq!(users, vec![u1.handler.user_id().clone()]);

    // U1 disconnects; the room reaches zero members and is deleted
    u1.handler.on_disconnect().await;
    u1.assert_idle();

    let mut late = Client::connect(&directory, &hub, &registry);
    late.handler
        .handle(ClientEnvelope::JoinRoom {
            room_id: room_id.clone(),
        })
        .await;
    let ServerEnvelope::Error { message } = late.next() else {
        panic!("expected error");
    };
    assert_eq!(message, "Room not found");
    assert!(directory.room_users(&room_id).await.expect("users").is_empty());
}

#[tokio::test]
async fn test_at_most_one_room_across_arbitrary_transitions() {
    let directory = Arc::new(MemoryDirectory::new());
    let hub = Arc::new(RoomHub::new());
    let registry = ConnectionRegistry::new();

    let mut anchor = Client::connect(&directory, &hub, &registry);
    anchor.handler.handle(ClientEnvelope::CreateRoom).await;
    let ServerEnvelope::RoomCreated { room_id: stable, .. } = anchor.next() else {
        panic!("expected room_created");
    };

    let mut wanderer = Client::connect(&directory, &hub, &registry);
    let user = wanderer.handler.user_id().clone();

    for _ in 0..10 {
        // create -> join(stable) -> leave, in a loop
        wanderer.handler.handle(ClientEnvelope::CreateRoom).await;
        wanderer.next();
        wanderer
            .handler
            .handle(ClientEnvelope::JoinRoom {
                room_id: stable.clone(),
            })
            .await;
        wanderer.next();
        wanderer.handler.handle(ClientEnvelope::LeaveRoom).await;
        wanderer.next();

        // Never more than one membership: the only room that can hold the
        // wanderer at this point is none at all
        assert_eq!(wanderer.handler.current_room(), None);
        let members = directory.room_users(&stable).await.expect("users");
        assert!(!members.contains(&user));
    }

    // Only the anchor's room survives the churn
    assert_eq!(directory.room_count(), 1);

    // Drain the anchor's notifications: join/leave pairs, in order
    for _ in 0..10 {
        let ServerEnvelope::UserJoined { user_id } = anchor.next() else {
            panic!("expected user_joined");
        };
        assert_eq!(user_id, user);
        let ServerEnvelope::UserLeft { user_id } = anchor.next() else {
            panic!("expected user_left");
        };
        assert_eq!(user_id, user);
    }
    anchor.assert_idle();
}

#[tokio::test]
async fn test_join_racing_room_teardown_stays_consistent() {
    let directory = Arc::new(MemoryDirectory::new());

    // A room whose sole member is leaving while another user joins: the
    // join either lands before the leave (and keeps the room alive) or
    // finds the room gone. Membership and reverse pointer stay consistent
    // either way.
    for _ in 0..50 {
        let holder = scrawl_core::models::UserId::new();
        let joiner = scrawl_core::models::UserId::new();
        let room = directory.create_room(&holder).await.expect("create");

        let dir_leave = directory.clone();
        let dir_join = directory.clone();
        let holder_clone = holder.clone();
        let room_clone = room.clone();
        let joiner_clone = joiner.clone();

        let leave = tokio::spawn(async move { dir_leave.leave_room(&holder_clone).await });
        let join =
            tokio::spawn(async move { dir_join.join_room(&room_clone, &joiner_clone).await });

        let left = leave.await.expect("task").expect("leave");
        let joined = join.await.expect("task").expect("join");

        assert_eq!(left, Some(room.clone()));

        let members = directory.room_users(&room).await.expect("users");
        if joined {
            assert_eq!(members, vec![joiner.clone()]);
            assert_eq!(
                directory.leave_room(&joiner).await.expect("cleanup"),
                Some(room)
            );
        } else {
            // The room died before the join: identical to never existing
            assert!(members.is_empty());
            assert_eq!(directory.leave_room(&joiner).await.expect("cleanup"), None);
        }
    }
}

#[tokio::test]
async fn test_room_users_wire_shape() {
    let directory = Arc::new(MemoryDirectory::new());
    let hub = Arc::new(RoomHub::new());
    let registry = ConnectionRegistry::new();

    let mut member = Client::connect(&directory, &hub, &registry);
    member.handler.handle(ClientEnvelope::CreateRoom).await;
    let ServerEnvelope::RoomCreated { room_id, .. } = member.next() else {
        panic!("expected room_created");
    };

    member
        .handler
        .handle(ClientEnvelope::GetRoomUsers {
            room_id: room_id.clone(),
        })
        .await;
    let reply = member.next();
    let json = serde_json::to_string(&reply).expect("serialize");
    assert!(json.contains(r#""type":"room_users""#));
    assert!(json.contains(&format!(r#""roomId":"{}""#, room_id.as_str())));
    assert!(json.contains(&format!(r#""users":["{}"]"#, member.handler.user_id().as_str())));
}

#[tokio::test]
async fn test_join_never_created_room_always_fails() {
    let directory = Arc::new(MemoryDirectory::new());

    for _ in 0..5 {
        let user = scrawl_core::models::UserId::new();
        let phantom = RoomId::new();
        assert!(!directory.join_room(&phantom, &user).await.expect("join"));
    }
}
