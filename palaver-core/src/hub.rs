//! Session hub: binds signaling requests to peer/room operations.
//!
//! One hub is created at startup and handed to every connection handler;
//! it owns the peer and room registries, the shared router, the id
//! provider, and the cascade graph that keeps the transport → producer →
//! consumer ownership chain consistent. Handlers for different connections
//! interleave at engine await points, so every existence check here is
//! re-validated after resuming rather than assumed to still hold — a
//! disconnect may have torn the peer down in between.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::cascade::{CascadeGraph, EntityId};
use crate::config::MediaConfig;
use crate::ids::{ConsumerId, IdProvider, PeerId, ProducerId, TransportId};
use crate::media::{MediaConsumer, MediaProducer, MediaRouter, MediaTransport, TransportOptions};
use crate::peer::{ConsumerSeat, EventSink, Peer, ProducerSeat};
use crate::room::{Room, LOBBY_ROOM};
use crate::signaling::{
    Ack, ClientRequest, ConsumeOutcome, ConsumeReply, ConsumerParams, ServerEvent,
};
use crate::{Error, Result};

/// Cascade graph plus the owner of every live media-plane entity, mutated
/// under one lock so closure order and ownership can never disagree.
#[derive(Default)]
struct MediaGraph {
    cascade: CascadeGraph,
    transports: HashMap<TransportId, PeerId>,
    producers: HashMap<ProducerId, PeerId>,
    consumers: HashMap<ConsumerId, PeerId>,
}

impl MediaGraph {
    /// Close `root` and resolve the owner of everything in the closure.
    fn close(&mut self, root: EntityId) -> Vec<(EntityId, Option<PeerId>)> {
        self.cascade
            .close(root)
            .into_iter()
            .map(|entity| {
                let owner = match &entity {
                    EntityId::Transport(id) => self.transports.remove(id),
                    EntityId::Producer(id) => self.producers.remove(id),
                    EntityId::Consumer(id) => self.consumers.remove(id),
                };
                (entity, owner)
            })
            .collect()
    }
}

/// The session and signaling orchestrator.
pub struct SessionHub {
    router: Arc<dyn MediaRouter>,
    transport_options: TransportOptions,
    ids: Arc<IdProvider>,
    peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    media: Mutex<MediaGraph>,
}

impl SessionHub {
    /// Build the hub and create the lobby room.
    #[must_use]
    pub fn new(router: Arc<dyn MediaRouter>, config: &MediaConfig) -> Arc<Self> {
        let ids = Arc::new(IdProvider::new());

        let mut rooms = HashMap::new();
        rooms.insert(
            LOBBY_ROOM.to_string(),
            Arc::new(Room::new(LOBBY_ROOM, LOBBY_ROOM, Arc::clone(&ids))),
        );

        Arc::new(Self {
            router,
            transport_options: TransportOptions::from_config(config),
            ids,
            peers: RwLock::new(HashMap::new()),
            rooms: RwLock::new(rooms),
            media: Mutex::new(MediaGraph::default()),
        })
    }

    pub async fn room(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(name).cloned()
    }

    /// Register an additional named room. The room set is fixed after
    /// startup; the protocol itself never creates or destroys rooms.
    pub async fn register_room(&self, name: &str) -> Arc<Room> {
        let room = Arc::new(Room::new(name, name, Arc::clone(&self.ids)));
        self.rooms
            .write()
            .await
            .insert(name.to_string(), Arc::clone(&room));
        room
    }

    pub async fn peer(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.read().await.get(&id).cloned()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Handle a connection opening: allocate a guest peer and put it in
    /// the lobby.
    pub async fn connect(&self, sink: Arc<dyn EventSink>) -> Arc<Peer> {
        let id = PeerId(self.ids.next());
        let peer = Arc::new(Peer::new(id, format!("guest-{id}"), sink));

        self.peers.write().await.insert(id, Arc::clone(&peer));

        let connected = self.peer_count().await;
        info!(
            peer_id = %id,
            connected = connected,
            "peer connected"
        );

        match self.room(LOBBY_ROOM).await {
            Some(lobby) => {
                if let Err(e) = lobby.add_member(&peer).await {
                    error!(peer_id = %id, "failed to seat new peer in the lobby: {e}");
                }
            }
            None => error!("lobby room missing"),
        }

        peer
    }

    /// Handle a connection closing: leave the current room, close every
    /// owned resource, deregister. Idempotent; safe to race with in-flight
    /// request handlers for the same peer.
    pub async fn disconnect(&self, peer_id: PeerId) {
        let Some(peer) = self.peers.write().await.remove(&peer_id) else {
            return;
        };

        if let Some(room_name) = peer.room().await {
            match self.room(&room_name).await {
                Some(room) => {
                    if let Err(e) = room.remove_member(&peer).await {
                        warn!(peer_id = %peer_id, "disconnect cleanup could not leave room: {e}");
                    }
                }
                None => error!(peer_id = %peer_id, room = %room_name, "peer referenced an unknown room"),
            }
        }

        for transport_id in peer.transport_ids().await {
            self.close_entity(EntityId::Transport(transport_id), Some(&peer))
                .await;
        }

        let connected = self.peer_count().await;
        info!(
            peer_id = %peer_id,
            connected = connected,
            "peer disconnected"
        );
    }

    /// Move a peer into `room`, leaving its current room first.
    ///
    /// A failed leave aborts the join; the peer stays where it was.
    async fn join_room(&self, peer: &Arc<Peer>, room: &Arc<Room>) -> Result<()> {
        if let Some(current_name) = peer.room().await {
            if current_name != room.id {
                let current = self.room(&current_name).await.ok_or_else(|| {
                    Error::NotFound(format!(
                        "peer {} references unknown room {current_name}",
                        peer.id
                    ))
                })?;
                current.remove_member(peer).await?;
            }
        }
        room.add_member(peer).await
    }

    /// The request protocol state machine. Returns the acknowledgement
    /// payload; an `Err` is reported to the caller as a structured error
    /// ack by the transport binding — it never closes the connection.
    pub async fn handle_request(&self, peer_id: PeerId, request: ClientRequest) -> Result<Ack> {
        let peer = self
            .peer(peer_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("peer {peer_id} is not connected")))?;

        match request {
            ClientRequest::Capabilities => Ok(Ack::Capabilities(self.router.rtp_capabilities())),

            ClientRequest::CreateTransport { direction } => {
                // Idempotent per direction: hand back the existing
                // transport instead of allocating a duplicate.
                if let Some(existing) = peer.existing_transport(direction).await {
                    return Ok(Ack::Transport(existing.params()));
                }

                let transport = self.router.create_transport(&self.transport_options).await?;

                // The peer may have disconnected while the engine worked.
                if self.peer(peer_id).await.is_none() {
                    transport.close().await;
                    return Err(Error::NotFound(format!(
                        "peer {peer_id} disconnected during transport creation"
                    )));
                }

                let transport_id = transport.id();
                debug!(peer_id = %peer_id, transport_id = %transport_id, "transport created");

                peer.register_transport(direction, Arc::clone(&transport)).await;
                self.media
                    .lock()
                    .transports
                    .insert(transport_id, peer_id);

                Ok(Ack::Transport(transport.params()))
            }

            ClientRequest::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => {
                let transport = peer.transport(&transport_id).await.ok_or_else(|| {
                    Error::NotFound(format!(
                        "transport {transport_id} is not owned by peer {peer_id}"
                    ))
                })?;
                transport.connect(dtls_parameters).await?;
                Ok(Ack::success())
            }

            ClientRequest::JoinRoom { room } => {
                let Some(room) = self.room(&room).await else {
                    warn!(peer_id = %peer_id, room = %room, "join request for unknown room");
                    return Ok(Ack::Outcome { success: false });
                };
                let success = match self.join_room(&peer, &room).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(peer_id = %peer_id, room = %room.id, "join failed: {e}");
                        false
                    }
                };
                Ok(Ack::Outcome { success })
            }

            ClientRequest::LeaveRoom { room } => {
                let Some(room) = self.room(&room).await else {
                    warn!(peer_id = %peer_id, room = %room, "leave request for unknown room");
                    return Ok(Ack::Outcome { success: false });
                };
                let success = match room.remove_member(&peer).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(peer_id = %peer_id, room = %room.id, "leave failed: {e}");
                        false
                    }
                };
                Ok(Ack::Outcome { success })
            }

            ClientRequest::Produce {
                transport_id,
                kind,
                rtp_parameters,
            } => {
                let Some(room_name) = peer.room().await else {
                    return Ok(Ack::refused());
                };
                let Some(room) = self.room(&room_name).await else {
                    error!(peer_id = %peer_id, room = %room_name, "peer referenced an unknown room");
                    return Ok(Ack::refused());
                };

                let transport = peer.transport(&transport_id).await.ok_or_else(|| {
                    Error::NotFound(format!(
                        "transport {transport_id} is not owned by peer {peer_id}"
                    ))
                })?;

                let producer = transport.produce(kind, rtp_parameters).await?;
                let producer_id = producer.id();

                // Re-validate: a disconnect may have closed the transport
                // while the engine negotiated.
                if !peer.has_transport(&transport_id).await {
                    producer.close().await;
                    return Err(Error::NotFound(format!(
                        "transport {transport_id} closed during produce"
                    )));
                }

                peer.set_stream(
                    kind,
                    transport_id.clone(),
                    ProducerSeat {
                        id: producer_id.clone(),
                        handle: producer,
                    },
                )
                .await;

                {
                    let mut media = self.media.lock();
                    media.cascade.link(
                        EntityId::Transport(transport_id.clone()),
                        EntityId::Producer(producer_id.clone()),
                    );
                    media.producers.insert(producer_id.clone(), peer_id);
                }

                debug!(
                    peer_id = %peer_id,
                    transport_id = %transport_id,
                    producer_id = %producer_id,
                    %kind,
                    "stream accepted"
                );

                room.broadcast(
                    Some(peer_id),
                    &ServerEvent::StreamAvailable {
                        peer_id,
                        streams: peer.stream_info().await,
                    },
                )
                .await;

                Ok(Ack::Produced(producer_id))
            }

            ClientRequest::Consume {
                transport_id,
                rtp_capabilities,
                offer,
            } => {
                if peer.room().await.is_none() {
                    return Ok(Ack::refused());
                }

                let transport = peer.transport(&transport_id).await.ok_or_else(|| {
                    Error::NotFound(format!(
                        "transport {transport_id} is not owned by peer {peer_id}"
                    ))
                })?;

                let mut reply = ConsumeReply::default();
                for (kind, producer_id) in offer.entries() {
                    // Capability gate, checked before any engine call. A
                    // negative answer is "not available", not an error.
                    if !self.router.can_consume(&producer_id, &rtp_capabilities) {
                        debug!(
                            peer_id = %peer_id,
                            producer_id = %producer_id,
                            %kind,
                            "stream not available to this peer"
                        );
                        reply.set(kind, ConsumeOutcome::NotAvailable);
                        continue;
                    }

                    let consumer = transport.consume(&producer_id, &rtp_capabilities).await?;
                    let consumer_id = consumer.id();

                    if !peer.has_transport(&transport_id).await {
                        consumer.close().await;
                        return Err(Error::NotFound(format!(
                            "transport {transport_id} closed during consume"
                        )));
                    }

                    let params = ConsumerParams {
                        id: consumer_id.clone(),
                        producer_id: producer_id.clone(),
                        kind: consumer.kind(),
                        rtp_parameters: consumer.rtp_parameters(),
                    };

                    peer.add_consumer(ConsumerSeat {
                        handle: consumer,
                        kind,
                        producer_id: producer_id.clone(),
                    })
                    .await;

                    {
                        let mut media = self.media.lock();
                        media.cascade.link(
                            EntityId::Transport(transport_id.clone()),
                            EntityId::Consumer(consumer_id.clone()),
                        );
                        media.cascade.link(
                            EntityId::Producer(producer_id.clone()),
                            EntityId::Consumer(consumer_id.clone()),
                        );
                        media.consumers.insert(consumer_id.clone(), peer_id);
                    }

                    debug!(
                        peer_id = %peer_id,
                        transport_id = %transport_id,
                        consumer_id = %consumer_id,
                        producer_id = %producer_id,
                        "consuming stream"
                    );

                    reply.set(kind, ConsumeOutcome::Ready { params });
                }

                Ok(Ack::Consume(reply))
            }

            ClientRequest::Chat { room, text } => {
                let Some(room) = self.room(&room).await else {
                    warn!(peer_id = %peer_id, room = %room, "chat posted to unknown room");
                    return Ok(Ack::refused());
                };
                match room.post_message(&peer, text).await {
                    Ok(message_id) => Ok(Ack::Message(message_id)),
                    Err(e) => {
                        warn!(peer_id = %peer_id, room = %room.id, "chat rejected: {e}");
                        Ok(Ack::refused())
                    }
                }
            }
        }
    }

    /// Close an entity and everything that depends on it.
    ///
    /// The graph yields the breadth-first closure order under the lock;
    /// the engine/state effects run afterwards. `closing_peer` is the peer
    /// being torn down, whose registry entry is already gone.
    async fn close_entity(&self, root: EntityId, closing_peer: Option<&Arc<Peer>>) {
        let closure = self.media.lock().close(root);

        for (entity, owner) in closure {
            let peer = match owner {
                Some(owner_id) => match self.peer(owner_id).await {
                    Some(peer) => Some(peer),
                    None => closing_peer
                        .filter(|p| p.id == owner_id)
                        .cloned(),
                },
                None => None,
            };
            let Some(peer) = peer else {
                debug!(?entity, "cascade reached an entity with no live owner");
                continue;
            };

            match entity {
                EntityId::Transport(transport_id) => {
                    if let Some(transport) = peer.remove_transport(&transport_id).await {
                        transport.close().await;
                        debug!(peer_id = %peer.id, transport_id = %transport_id, "transport closed");
                    }
                }
                EntityId::Producer(producer_id) => {
                    if let Some((kind, seat)) = peer.take_stream_by_producer(&producer_id).await {
                        seat.handle.close().await;
                        debug!(peer_id = %peer.id, producer_id = %producer_id, %kind, "producer closed");
                    }
                }
                EntityId::Consumer(consumer_id) => {
                    if let Some(seat) = peer.remove_consumer(&consumer_id).await {
                        seat.handle.close().await;
                        debug!(peer_id = %peer.id, consumer_id = %consumer_id, "consumer closed");
                        // The disconnecting peer's own sink is already
                        // gone; only surviving owners get the notice.
                        if closing_peer.is_none_or(|p| p.id != peer.id) {
                            peer.send(ServerEvent::ConsumerClosed { consumer_id });
                        }
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for SessionHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHub").finish()
    }
}
