//! Room: a named group whose members share chat and stream visibility.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error};

use crate::ids::{IdProvider, MessageId, PeerId};
use crate::peer::{Peer, PeerIdentity, StreamInfo};
use crate::signaling::ServerEvent;
use crate::{Error, Result};

/// The well-known room every peer lands in on connect. Created once at
/// startup and never destroyed.
pub const LOBBY_ROOM: &str = "lobby";

/// A chat message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub author: PeerIdentity,
    pub text: String,
}

/// Serializable snapshot of a room, tailored to one recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomState {
    pub you: PeerIdentity,
    pub peers: Vec<PeerIdentity>,
    pub streams: Vec<StreamInfo>,
    pub messages: Vec<Message>,
}

/// A named group of peers with a shared transcript.
///
/// The transcript is most-recent-first and unbounded; there is no
/// retention policy. Membership is kept bidirectionally consistent with
/// each peer's room reference: both are set together in `add_member` and
/// cleared together in `remove_member`.
pub struct Room {
    pub id: String,
    pub name: String,
    ids: Arc<IdProvider>,
    messages: RwLock<Vec<Message>>,
    peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
}

impl Room {
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, ids: Arc<IdProvider>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ids,
            messages: RwLock::new(Vec::new()),
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn member_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_member(&self, peer_id: PeerId) -> bool {
        self.peers.read().await.contains_key(&peer_id)
    }

    /// Build the room snapshot for one recipient. Pure, no side effects.
    pub async fn snapshot(&self, for_peer: &Arc<Peer>) -> RoomState {
        let members: Vec<Arc<Peer>> = self.peers.read().await.values().cloned().collect();

        let mut peers = Vec::with_capacity(members.len());
        let mut streams = Vec::with_capacity(members.len());
        for member in &members {
            peers.push(member.identity());
            streams.push(member.stream_info().await);
        }

        RoomState {
            you: for_peer.identity(),
            peers,
            streams,
            messages: self.messages.read().await.clone(),
        }
    }

    /// Deliver an event to every member except `except`.
    pub async fn broadcast(&self, except: Option<PeerId>, event: &ServerEvent) {
        for peer in self.peers.read().await.values() {
            if Some(peer.id) == except {
                continue;
            }
            peer.send(event.clone());
        }
    }

    /// Register a peer as a member.
    ///
    /// The peer must not already be a member and must not carry a stale
    /// room reference (the orchestrator removes it from its previous room
    /// first; a reference surviving to this point means an interleaved
    /// handler desynchronized the graph). On success the new member
    /// receives the full room snapshot and everyone else a `peer_joined`
    /// notification (never the joiner itself).
    pub async fn add_member(&self, peer: &Arc<Peer>) -> Result<()> {
        if self.peers.read().await.contains_key(&peer.id) {
            error!(
                room = %self.id,
                peer_id = %peer.id,
                "peer tried to join a room it is already in"
            );
            return Err(Error::AlreadyExists(format!(
                "peer {} is already in room {}",
                peer.id, self.id
            )));
        }

        if let Some(current) = peer.room().await {
            error!(
                room = %self.id,
                peer_id = %peer.id,
                current_room = %current,
                "peer joined while still referencing another room"
            );
            return Err(Error::AlreadyExists(format!(
                "peer {} still belongs to room {current}",
                peer.id
            )));
        }

        self.peers.write().await.insert(peer.id, Arc::clone(peer));
        peer.set_room(Some(self.id.clone())).await;

        debug!(room = %self.id, peer_id = %peer.id, "peer joined room");

        let state = self.snapshot(peer).await;
        peer.send(ServerEvent::RoomState(state));

        self.broadcast(
            Some(peer.id),
            &ServerEvent::PeerJoined {
                room: self.id.clone(),
                peer: peer.identity(),
            },
        )
        .await;

        Ok(())
    }

    /// Remove a peer from the membership.
    ///
    /// Fails (and logs) if the peer carries no room reference or is not in
    /// the membership map. Both checks exist to detect desynchronization
    /// caused by an interleaved handler, not to crash on it.
    pub async fn remove_member(&self, peer: &Arc<Peer>) -> Result<()> {
        if peer.room().await.is_none() {
            error!(
                room = %self.id,
                peer_id = %peer.id,
                "peer tried to leave a room without a room reference"
            );
            return Err(Error::NotFound(format!(
                "peer {} has no room to leave",
                peer.id
            )));
        }

        if self.peers.write().await.remove(&peer.id).is_none() {
            error!(
                room = %self.id,
                peer_id = %peer.id,
                "peer tried to leave a room it is not in"
            );
            return Err(Error::NotAMember(format!(
                "peer {} is not in room {}",
                peer.id, self.id
            )));
        }

        peer.set_room(None).await;

        debug!(room = %self.id, peer_id = %peer.id, "peer left room");

        self.broadcast(
            None,
            &ServerEvent::PeerLeft {
                room: self.id.clone(),
                peer_id: peer.id,
            },
        )
        .await;

        Ok(())
    }

    /// Post a chat message from a member.
    ///
    /// Rejects non-members. The message is prepended to the transcript and
    /// broadcast to the other members; the caller receives the assigned id
    /// through the return value.
    pub async fn post_message(&self, peer: &Arc<Peer>, text: String) -> Result<MessageId> {
        if !self.is_member(peer.id).await {
            error!(
                room = %self.id,
                peer_id = %peer.id,
                "peer tried to post to a room it is not a member of"
            );
            return Err(Error::NotAMember(format!(
                "peer {} is not a member of room {}",
                peer.id, self.id
            )));
        }

        let message = Message {
            id: MessageId(self.ids.next()),
            author: peer.identity(),
            text,
        };

        self.messages.write().await.insert(0, message.clone());

        self.broadcast(Some(peer.id), &ServerEvent::Chat(message.clone()))
            .await;

        Ok(message.id)
    }

    pub async fn transcript(&self) -> Vec<Message> {
        self.messages.read().await.clone()
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room").field("id", &self.id).finish()
    }
}
