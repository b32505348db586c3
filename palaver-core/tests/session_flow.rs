//! End-to-end protocol flows over the session hub with the in-memory
//! media engine and channel-backed event sinks.
//!
//! Run with: cargo test --test session_flow

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use palaver_core::config::MediaConfig;
use palaver_core::ids::{PeerId, ProducerId, TransportId};
use palaver_core::media::mock::MockMediaEngine;
use palaver_core::media::{
    DtlsParameters, MediaKind, MediaWorker, RtpCapabilities, RtpParameters, TransportDirection,
    TransportParams, WorkerPool, WorkerSettings,
};
use palaver_core::peer::EventSink;
use palaver_core::room::LOBBY_ROOM;
use palaver_core::signaling::{Ack, ClientRequest, ConsumeOutcome, ServerEvent};
use palaver_core::SessionHub;

struct RecordingSink {
    events: Mutex<Vec<ServerEvent>>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    fn drain(&self) -> Vec<ServerEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl EventSink for RecordingSink {
    fn deliver(&self, event: ServerEvent) -> Result<(), String> {
        self.events.lock().push(event);
        Ok(())
    }
}

async fn build_hub() -> (MockMediaEngine, Arc<SessionHub>) {
    let config = MediaConfig::default();
    let engine = MockMediaEngine::new();
    let pool = WorkerPool::build(&engine, &WorkerSettings::from_config(&config), 1)
        .await
        .expect("worker pool");
    let router = pool
        .next_worker()
        .create_router(&palaver_core::config::default_codecs())
        .await
        .expect("router");
    let hub = SessionHub::new(router, &config);
    (engine, hub)
}

fn caps_for(kinds: &[&str]) -> RtpCapabilities {
    let codecs: Vec<serde_json::Value> = kinds.iter().map(|k| json!({ "kind": k })).collect();
    RtpCapabilities(json!({ "codecs": codecs }))
}

/// Create, register and connect one transport, returning its parameters.
async fn ready_transport(
    hub: &SessionHub,
    peer_id: PeerId,
    direction: TransportDirection,
) -> TransportParams {
    let ack = hub
        .handle_request(peer_id, ClientRequest::CreateTransport { direction })
        .await
        .expect("create transport");
    let Ack::Transport(params) = ack else {
        panic!("expected transport ack, got {ack:?}");
    };
    let ack = hub
        .handle_request(
            peer_id,
            ClientRequest::ConnectTransport {
                transport_id: params.id.clone(),
                dtls_parameters: DtlsParameters(json!({ "role": "client" })),
            },
        )
        .await
        .expect("connect transport");
    assert_eq!(ack, Ack::success());
    params
}

async fn produce(
    hub: &SessionHub,
    peer_id: PeerId,
    transport_id: &TransportId,
    kind: MediaKind,
) -> ProducerId {
    let ack = hub
        .handle_request(
            peer_id,
            ClientRequest::Produce {
                transport_id: transport_id.clone(),
                kind,
                rtp_parameters: RtpParameters(json!({ "mid": "0" })),
            },
        )
        .await
        .expect("produce");
    let Ack::Produced(producer_id) = ack else {
        panic!("expected producer id ack, got {ack:?}");
    };
    producer_id
}

#[tokio::test]
async fn two_peers_see_consistent_lobby_membership() {
    let (_engine, hub) = build_hub().await;

    let sink_a = RecordingSink::new();
    let a = hub.connect(sink_a.clone()).await;

    let events = sink_a.drain();
    assert_eq!(events.len(), 1);
    let ServerEvent::RoomState(state) = &events[0] else {
        panic!("expected RoomState, got {events:?}");
    };
    assert_eq!(state.you, a.identity());
    assert_eq!(state.peers, vec![a.identity()]);
    assert!(state.messages.is_empty());

    let sink_b = RecordingSink::new();
    let b = hub.connect(sink_b.clone()).await;

    let events = sink_b.drain();
    let ServerEvent::RoomState(state) = &events[0] else {
        panic!("expected RoomState, got {events:?}");
    };
    assert_eq!(state.peers.len(), 2);
    assert!(state.peers.contains(&a.identity()));
    assert!(state.peers.contains(&b.identity()));

    // A hears exactly one join, for B — never for itself.
    let events = sink_a.drain();
    assert_eq!(
        events,
        vec![ServerEvent::PeerJoined {
            room: LOBBY_ROOM.to_string(),
            peer: b.identity(),
        }]
    );
}

#[tokio::test]
async fn produced_stream_is_announced_and_consumable() {
    let (_engine, hub) = build_hub().await;

    let sink_a = RecordingSink::new();
    let a = hub.connect(sink_a.clone()).await;
    let sink_b = RecordingSink::new();
    let b = hub.connect(sink_b.clone()).await;
    sink_a.drain();
    sink_b.drain();

    let a_send = ready_transport(&hub, a.id, TransportDirection::Send).await;
    let producer_id = produce(&hub, a.id, &a_send.id, MediaKind::Video).await;

    // B was told the stream exists, with A's producer id in the descriptor.
    let events = sink_b.drain();
    let ServerEvent::StreamAvailable { peer_id, streams } = &events[0] else {
        panic!("expected StreamAvailable, got {events:?}");
    };
    assert_eq!(*peer_id, a.id);
    assert_eq!(streams.video_producer_id, Some(producer_id.clone()));
    // The producer never hears its own announcement.
    assert!(sink_a.drain().is_empty());

    // B consumes with capabilities that can decode the stream.
    let b_recv = ready_transport(&hub, b.id, TransportDirection::Recv).await;
    let ack = hub
        .handle_request(
            b.id,
            ClientRequest::Consume {
                transport_id: b_recv.id.clone(),
                rtp_capabilities: caps_for(&["audio", "video"]),
                offer: streams.clone(),
            },
        )
        .await
        .expect("consume");
    let Ack::Consume(reply) = ack else {
        panic!("expected consume reply, got {ack:?}");
    };
    let Some(ConsumeOutcome::Ready { params }) = reply.get(MediaKind::Video) else {
        panic!("expected ready video outcome, got {reply:?}");
    };
    assert_eq!(params.producer_id, producer_id);
    assert_eq!(params.kind, MediaKind::Video);
    assert_eq!(b.consumer_count().await, 1);
}

#[tokio::test]
async fn capability_mismatch_yields_not_available_without_a_consumer() {
    let (_engine, hub) = build_hub().await;

    let sink_a = RecordingSink::new();
    let a = hub.connect(sink_a.clone()).await;
    let sink_b = RecordingSink::new();
    let b = hub.connect(sink_b.clone()).await;
    sink_b.drain();

    let a_send = ready_transport(&hub, a.id, TransportDirection::Send).await;
    produce(&hub, a.id, &a_send.id, MediaKind::Video).await;

    let events = sink_b.drain();
    let ServerEvent::StreamAvailable { streams, .. } = &events[0] else {
        panic!("expected StreamAvailable, got {events:?}");
    };

    // B only decodes audio; the video stream is not available to it.
    let b_recv = ready_transport(&hub, b.id, TransportDirection::Recv).await;
    let ack = hub
        .handle_request(
            b.id,
            ClientRequest::Consume {
                transport_id: b_recv.id.clone(),
                rtp_capabilities: caps_for(&["audio"]),
                offer: streams.clone(),
            },
        )
        .await
        .expect("consume");
    let Ack::Consume(reply) = ack else {
        panic!("expected consume reply, got {ack:?}");
    };
    assert_eq!(reply.get(MediaKind::Video), Some(&ConsumeOutcome::NotAvailable));
    assert_eq!(b.consumer_count().await, 0);
}

#[tokio::test]
async fn chat_message_id_matches_across_ack_broadcast_and_transcript() {
    let (_engine, hub) = build_hub().await;

    let sink_a = RecordingSink::new();
    let a = hub.connect(sink_a.clone()).await;
    let sink_b = RecordingSink::new();
    let _b = hub.connect(sink_b.clone()).await;
    sink_a.drain();
    sink_b.drain();

    let ack = hub
        .handle_request(
            a.id,
            ClientRequest::Chat {
                room: LOBBY_ROOM.to_string(),
                text: "hi".to_string(),
            },
        )
        .await
        .expect("chat");
    let Ack::Message(message_id) = ack else {
        panic!("expected message id ack, got {ack:?}");
    };

    // B received the same message, A received nothing.
    let events = sink_b.drain();
    let ServerEvent::Chat(message) = &events[0] else {
        panic!("expected Chat, got {events:?}");
    };
    assert_eq!(message.id, message_id);
    assert_eq!(message.text, "hi");
    assert_eq!(message.author, a.identity());
    assert!(sink_a.drain().is_empty());

    // Transcript head carries the same id.
    let lobby = hub.room(LOBBY_ROOM).await.expect("lobby");
    let transcript = lobby.transcript().await;
    assert_eq!(transcript[0].id, message_id);
}

#[tokio::test]
async fn chat_to_room_the_peer_is_not_in_is_refused() {
    let (_engine, hub) = build_hub().await;

    let sink_a = RecordingSink::new();
    let a = hub.connect(sink_a.clone()).await;

    hub.handle_request(
        a.id,
        ClientRequest::LeaveRoom {
            room: LOBBY_ROOM.to_string(),
        },
    )
    .await
    .expect("leave");

    let ack = hub
        .handle_request(
            a.id,
            ClientRequest::Chat {
                room: LOBBY_ROOM.to_string(),
                text: "outsider".to_string(),
            },
        )
        .await
        .expect("chat");
    assert_eq!(ack, Ack::refused());

    let lobby = hub.room(LOBBY_ROOM).await.expect("lobby");
    assert!(lobby.transcript().await.is_empty());
}

#[tokio::test]
async fn disconnect_cascades_producer_to_remote_consumer() {
    let (_engine, hub) = build_hub().await;

    let sink_a = RecordingSink::new();
    let a = hub.connect(sink_a.clone()).await;
    let sink_b = RecordingSink::new();
    let b = hub.connect(sink_b.clone()).await;

    // A produces video; B consumes it.
    let a_send = ready_transport(&hub, a.id, TransportDirection::Send).await;
    let producer_id = produce(&hub, a.id, &a_send.id, MediaKind::Video).await;

    let b_recv = ready_transport(&hub, b.id, TransportDirection::Recv).await;
    let a_streams = a.stream_info().await;
    let ack = hub
        .handle_request(
            b.id,
            ClientRequest::Consume {
                transport_id: b_recv.id.clone(),
                rtp_capabilities: caps_for(&["video"]),
                offer: a_streams,
            },
        )
        .await
        .expect("consume");
    let Ack::Consume(reply) = ack else {
        panic!("expected consume reply, got {ack:?}");
    };
    let Some(ConsumeOutcome::Ready { params }) = reply.get(MediaKind::Video) else {
        panic!("expected ready outcome, got {reply:?}");
    };
    let b_consumer_id = params.id.clone();

    // B produces audio; A consumes it, so A owns a consumer too.
    let b_send = ready_transport(&hub, b.id, TransportDirection::Send).await;
    produce(&hub, b.id, &b_send.id, MediaKind::Audio).await;

    let a_recv = ready_transport(&hub, a.id, TransportDirection::Recv).await;
    let b_streams = b.stream_info().await;
    hub.handle_request(
        a.id,
        ClientRequest::Consume {
            transport_id: a_recv.id.clone(),
            rtp_capabilities: caps_for(&["audio"]),
            offer: b_streams,
        },
    )
    .await
    .expect("consume");
    assert_eq!(a.consumer_count().await, 1);

    sink_a.drain();
    sink_b.drain();

    // A drops. Its producer must take B's linked consumer down with it.
    hub.disconnect(a.id).await;

    assert_eq!(a.consumer_count().await, 0);
    assert_eq!(a.transport_ids().await.len(), 0);
    assert!(a.stream_info().await.video_producer_id.is_none());
    assert_eq!(b.consumer_count().await, 0);

    let events = sink_b.drain();
    assert!(
        events.contains(&ServerEvent::ConsumerClosed {
            consumer_id: b_consumer_id,
        }),
        "B never learned its consumer died: {events:?}"
    );
    assert!(
        events.contains(&ServerEvent::PeerLeft {
            room: LOBBY_ROOM.to_string(),
            peer_id: a.id,
        }),
        "B never learned A left: {events:?}"
    );

    // A later join sees a membership without A.
    let sink_c = RecordingSink::new();
    let c = hub.connect(sink_c.clone()).await;
    let events = sink_c.drain();
    let ServerEvent::RoomState(state) = &events[0] else {
        panic!("expected RoomState, got {events:?}");
    };
    assert!(!state.peers.contains(&a.identity()));
    assert!(state.peers.contains(&b.identity()));
    assert!(state.peers.contains(&c.identity()));

    // The engine no longer knows A's producer: nobody can consume it.
    let ack = hub
        .handle_request(
            c.id,
            ClientRequest::Consume {
                transport_id: ready_transport(&hub, c.id, TransportDirection::Recv).await.id,
                rtp_capabilities: caps_for(&["video"]),
                offer: palaver_core::peer::StreamInfo {
                    video_producer_id: Some(producer_id),
                    ..Default::default()
                },
            },
        )
        .await
        .expect("consume");
    let Ack::Consume(reply) = ack else {
        panic!("expected consume reply, got {ack:?}");
    };
    assert_eq!(reply.get(MediaKind::Video), Some(&ConsumeOutcome::NotAvailable));
}

#[tokio::test]
async fn membership_invariant_holds_through_join_leave_churn() {
    let (_engine, hub) = build_hub().await;

    let sink = RecordingSink::new();
    let peer = hub.connect(sink.clone()).await;
    let lobby = hub.room(LOBBY_ROOM).await.expect("lobby");

    // In the lobby: reference and membership agree.
    assert_eq!(peer.room().await, Some(LOBBY_ROOM.to_string()));
    assert!(lobby.is_member(peer.id).await);

    // Out: both cleared together.
    hub.handle_request(
        peer.id,
        ClientRequest::LeaveRoom {
            room: LOBBY_ROOM.to_string(),
        },
    )
    .await
    .expect("leave");
    assert!(peer.room().await.is_none());
    assert!(!lobby.is_member(peer.id).await);

    // A second leave fails and changes nothing.
    let ack = hub
        .handle_request(
            peer.id,
            ClientRequest::LeaveRoom {
                room: LOBBY_ROOM.to_string(),
            },
        )
        .await
        .expect("leave");
    assert_eq!(ack, Ack::Outcome { success: false });

    // Back in: both set together.
    let ack = hub
        .handle_request(
            peer.id,
            ClientRequest::JoinRoom {
                room: LOBBY_ROOM.to_string(),
            },
        )
        .await
        .expect("join");
    assert_eq!(ack, Ack::Outcome { success: true });
    assert!(lobby.is_member(peer.id).await);
}
