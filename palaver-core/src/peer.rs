//! Peer: one connected participant and the owner of its media resources.
//!
//! A peer is created when its connection opens and destroyed when it
//! closes. It owns its transports (at most one per direction), the
//! streams it produces, and the consumers it receives. Room membership is
//! kept bidirectionally consistent: `room` is set if and only if the room's
//! membership map contains the peer.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

use crate::ids::{ConsumerId, PeerId, ProducerId, TransportId};
use crate::media::{MediaConsumer, MediaKind, MediaProducer, MediaTransport, TransportDirection};
use crate::signaling::ServerEvent;

/// Identity a peer presents to the rest of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub id: PeerId,
    pub name: String,
}

/// Outbound-notification seam. The transport binding implements this over
/// its connection; tests implement it over a channel.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: ServerEvent) -> Result<(), String>;
}

/// A producer occupying one StreamSet slot.
#[derive(Clone)]
pub struct ProducerSeat {
    pub id: ProducerId,
    pub handle: Arc<dyn MediaProducer>,
}

/// A peer's outbound media: one optional producer per kind, plus the
/// transport they were produced on.
#[derive(Default)]
pub struct StreamSet {
    transport_id: Option<TransportId>,
    audio: Option<ProducerSeat>,
    video: Option<ProducerSeat>,
    screen: Option<ProducerSeat>,
}

impl StreamSet {
    fn slot_mut(&mut self, kind: MediaKind) -> &mut Option<ProducerSeat> {
        match kind {
            MediaKind::Audio => &mut self.audio,
            MediaKind::Video => &mut self.video,
            MediaKind::Screen => &mut self.screen,
        }
    }

    fn slot(&self, kind: MediaKind) -> Option<&ProducerSeat> {
        match kind {
            MediaKind::Audio => self.audio.as_ref(),
            MediaKind::Video => self.video.as_ref(),
            MediaKind::Screen => self.screen.as_ref(),
        }
    }

    pub fn set(&mut self, kind: MediaKind, transport_id: TransportId, seat: ProducerSeat) {
        self.transport_id = Some(transport_id);
        *self.slot_mut(kind) = Some(seat);
    }

    /// Clear the slot holding the given producer, returning its seat.
    pub fn take_by_producer(&mut self, producer_id: &ProducerId) -> Option<(MediaKind, ProducerSeat)> {
        for kind in MediaKind::ALL {
            if self.slot(kind).is_some_and(|seat| &seat.id == producer_id) {
                let seat = self.slot_mut(kind).take();
                return seat.map(|s| (kind, s));
            }
        }
        None
    }

    /// Zero the producing-transport reference when that transport closes.
    pub fn clear_transport(&mut self, transport_id: &TransportId) {
        if self.transport_id.as_ref() == Some(transport_id) {
            self.transport_id = None;
        }
    }

    #[must_use]
    pub fn descriptor(&self) -> StreamInfo {
        StreamInfo {
            transport_id: self.transport_id.clone(),
            audio_producer_id: self.audio.as_ref().map(|s| s.id.clone()),
            video_producer_id: self.video.as_ref().map(|s| s.id.clone()),
            screen_producer_id: self.screen.as_ref().map(|s| s.id.clone()),
        }
    }
}

/// Serializable descriptor of a peer's produced streams.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport_id: Option<TransportId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_producer_id: Option<ProducerId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_producer_id: Option<ProducerId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen_producer_id: Option<ProducerId>,
}

impl StreamInfo {
    /// The kinds offered, in a stable order.
    #[must_use]
    pub fn entries(&self) -> Vec<(MediaKind, ProducerId)> {
        let mut entries = Vec::new();
        if let Some(id) = &self.audio_producer_id {
            entries.push((MediaKind::Audio, id.clone()));
        }
        if let Some(id) = &self.video_producer_id {
            entries.push((MediaKind::Video, id.clone()));
        }
        if let Some(id) = &self.screen_producer_id {
            entries.push((MediaKind::Screen, id.clone()));
        }
        entries
    }
}

/// An inbound feed held by a peer.
#[derive(Clone)]
pub struct ConsumerSeat {
    pub handle: Arc<dyn MediaConsumer>,
    pub kind: MediaKind,
    pub producer_id: ProducerId,
}

/// One connected participant.
pub struct Peer {
    pub id: PeerId,
    identity: PeerIdentity,
    sink: Arc<dyn EventSink>,
    room: RwLock<Option<String>>,
    transports: RwLock<HashMap<TransportId, Arc<dyn MediaTransport>>>,
    send_transport: RwLock<Option<TransportId>>,
    recv_transport: RwLock<Option<TransportId>>,
    streams: RwLock<StreamSet>,
    consumers: RwLock<HashMap<ConsumerId, ConsumerSeat>>,
}

impl Peer {
    #[must_use]
    pub fn new(id: PeerId, name: String, sink: Arc<dyn EventSink>) -> Self {
        Self {
            id,
            identity: PeerIdentity { id, name },
            sink,
            room: RwLock::new(None),
            transports: RwLock::new(HashMap::new()),
            send_transport: RwLock::new(None),
            recv_transport: RwLock::new(None),
            streams: RwLock::new(StreamSet::default()),
            consumers: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn identity(&self) -> PeerIdentity {
        self.identity.clone()
    }

    /// Push a server event to this peer, logging delivery failures.
    pub fn send(&self, event: ServerEvent) {
        if let Err(e) = self.sink.deliver(event) {
            warn!(peer_id = %self.id, "failed to deliver event: {e}");
        }
    }

    /// Name of the room this peer is currently in.
    pub async fn room(&self) -> Option<String> {
        self.room.read().await.clone()
    }

    pub async fn set_room(&self, room: Option<String>) {
        *self.room.write().await = room;
    }

    pub async fn transport(&self, id: &TransportId) -> Option<Arc<dyn MediaTransport>> {
        self.transports.read().await.get(id).cloned()
    }

    pub async fn has_transport(&self, id: &TransportId) -> bool {
        self.transports.read().await.contains_key(id)
    }

    /// The live transport for a direction, if one was already created.
    pub async fn existing_transport(
        &self,
        direction: TransportDirection,
    ) -> Option<Arc<dyn MediaTransport>> {
        let slot = match direction {
            TransportDirection::Send => self.send_transport.read().await.clone(),
            TransportDirection::Recv => self.recv_transport.read().await.clone(),
        };
        match slot {
            Some(id) => self.transport(&id).await,
            None => None,
        }
    }

    pub async fn register_transport(
        &self,
        direction: TransportDirection,
        transport: Arc<dyn MediaTransport>,
    ) {
        let id = transport.id();
        self.transports.write().await.insert(id.clone(), transport);
        match direction {
            TransportDirection::Send => *self.send_transport.write().await = Some(id),
            TransportDirection::Recv => *self.recv_transport.write().await = Some(id),
        }
    }

    /// Drop a transport from the peer, clearing its direction slot and the
    /// StreamSet transport reference.
    pub async fn remove_transport(&self, id: &TransportId) -> Option<Arc<dyn MediaTransport>> {
        let removed = self.transports.write().await.remove(id);
        if removed.is_some() {
            let mut send = self.send_transport.write().await;
            if send.as_ref() == Some(id) {
                *send = None;
            }
            drop(send);
            let mut recv = self.recv_transport.write().await;
            if recv.as_ref() == Some(id) {
                *recv = None;
            }
            drop(recv);
            self.streams.write().await.clear_transport(id);
        }
        removed
    }

    pub async fn transport_ids(&self) -> Vec<TransportId> {
        self.transports.read().await.keys().cloned().collect()
    }

    pub async fn set_stream(
        &self,
        kind: MediaKind,
        transport_id: TransportId,
        seat: ProducerSeat,
    ) {
        self.streams.write().await.set(kind, transport_id, seat);
    }

    pub async fn take_stream_by_producer(
        &self,
        producer_id: &ProducerId,
    ) -> Option<(MediaKind, ProducerSeat)> {
        self.streams.write().await.take_by_producer(producer_id)
    }

    pub async fn stream_info(&self) -> StreamInfo {
        self.streams.read().await.descriptor()
    }

    pub async fn add_consumer(&self, seat: ConsumerSeat) {
        let id = seat.handle.id();
        self.consumers.write().await.insert(id, seat);
    }

    pub async fn remove_consumer(&self, id: &ConsumerId) -> Option<ConsumerSeat> {
        self.consumers.write().await.remove(id)
    }

    pub async fn consumer_count(&self) -> usize {
        self.consumers.read().await.len()
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer").field("id", &self.id).finish()
    }
}
