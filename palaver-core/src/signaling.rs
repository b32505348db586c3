//! Signaling protocol types
//!
//! Every inbound request is acknowledged exactly once; server-initiated
//! events are pushed without a request. The transport binding wraps these
//! in its own framing, the core only deals in the typed messages.

use serde::{Deserialize, Serialize};

use crate::ids::{ConsumerId, MessageId, PeerId, ProducerId, TransportId};
use crate::media::{
    DtlsParameters, MediaKind, RtpCapabilities, RtpParameters, TransportDirection,
    TransportParams,
};
use crate::peer::{PeerIdentity, StreamInfo};
use crate::room::{Message, RoomState};

/// Requests a peer may issue over its signaling connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Fetch the router's RTP capabilities.
    Capabilities,
    /// Allocate (or re-fetch) the transport for one direction.
    CreateTransport { direction: TransportDirection },
    /// Run the DTLS connect handshake on an allocated transport.
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },
    JoinRoom { room: String },
    LeaveRoom { room: String },
    /// Start sending one media kind ("accept my stream").
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    /// Receive another peer's streams ("send me a stream").
    Consume {
        transport_id: TransportId,
        rtp_capabilities: RtpCapabilities,
        offer: StreamInfo,
    },
    /// Post a chat message to a room.
    Chat { room: String, text: String },
}

/// Server-initiated pushes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Full room snapshot, delivered to a peer when it joins.
    RoomState(RoomState),
    PeerJoined { room: String, peer: PeerIdentity },
    PeerLeft { room: String, peer_id: PeerId },
    /// A member of the peer's room started (or changed) producing.
    StreamAvailable { peer_id: PeerId, streams: StreamInfo },
    /// A chat message from another member.
    Chat(Message),
    /// One of the peer's consumers died because its producer closed.
    ConsumerClosed { consumer_id: ConsumerId },
}

/// Parameters the consuming client needs to attach one inbound feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerParams {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// Per-kind result of a consume request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConsumeOutcome {
    Ready {
        #[serde(flatten)]
        params: ConsumerParams,
    },
    /// Capability check failed for this kind; no consumer was created.
    NotAvailable,
}

/// Reply to a consume request, one entry per kind present in the offer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumeReply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<ConsumeOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<ConsumeOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen: Option<ConsumeOutcome>,
}

impl ConsumeReply {
    pub fn set(&mut self, kind: MediaKind, outcome: ConsumeOutcome) {
        match kind {
            MediaKind::Audio => self.audio = Some(outcome),
            MediaKind::Video => self.video = Some(outcome),
            MediaKind::Screen => self.screen = Some(outcome),
        }
    }

    #[must_use]
    pub fn get(&self, kind: MediaKind) -> Option<&ConsumeOutcome> {
        match kind {
            MediaKind::Audio => self.audio.as_ref(),
            MediaKind::Video => self.video.as_ref(),
            MediaKind::Screen => self.screen.as_ref(),
        }
    }
}

/// Acknowledgement payloads, shaped per request.
///
/// Serialize-only: the server composes acks, it never parses them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Ack {
    Capabilities(RtpCapabilities),
    Transport(TransportParams),
    /// Bare status string ("success").
    Status(String),
    /// Join/leave outcome.
    Outcome { success: bool },
    /// Producer id assigned by the engine.
    Produced(ProducerId),
    Consume(ConsumeReply),
    /// Chat message id assigned by the server.
    Message(MessageId),
    /// The `false` ack for requests refused by a precondition.
    Flag(bool),
}

impl Ack {
    #[must_use]
    pub const fn refused() -> Self {
        Self::Flag(false)
    }

    #[must_use]
    pub fn success() -> Self {
        Self::Status("success".to_string())
    }
}
