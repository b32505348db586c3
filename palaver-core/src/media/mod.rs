//! Media engine facade
//!
//! The narrowest interface the signaling core needs from the external
//! media-processing engine. The core relays codec/transport parameter
//! blobs between clients and the engine without interpreting them, so the
//! parameter types are transparent wrappers around JSON values.
//!
//! A pool of workers backs one or more routers; worker selection is
//! round-robin. This process creates a single router at startup and routes
//! every room through it.

pub mod mock;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{CodecCapability, MediaConfig};
use crate::ids::{ConsumerId, ProducerId, TransportId};
use crate::{Error, Result};

/// Router RTP capabilities, relayed verbatim to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpCapabilities(pub serde_json::Value);

/// RTP parameters a client negotiated for one producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpParameters(pub serde_json::Value);

/// DTLS parameters for a transport connect handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DtlsParameters(pub serde_json::Value);

/// Media kind of a produced or consumed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
    Screen,
}

impl MediaKind {
    pub const ALL: [Self; 3] = [Self::Audio, Self::Video, Self::Screen];

    /// The codec family used on the wire (screen shares are video codecs).
    #[must_use]
    pub const fn codec_kind(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video | Self::Screen => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Screen => "screen",
        };
        write!(f, "{s}")
    }
}

/// Direction of a transport relative to the peer that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

/// Worker process settings, from static configuration.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

/// Transport allocation options, from static configuration.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub listen_ip: String,
    pub announced_ip: Option<String>,
    pub max_incoming_bitrate: u32,
    pub initial_available_outgoing_bitrate: u32,
}

impl TransportOptions {
    #[must_use]
    pub fn from_config(config: &MediaConfig) -> Self {
        Self {
            listen_ip: config.listen_ip.clone(),
            announced_ip: config.announced_ip.clone(),
            max_incoming_bitrate: config.max_incoming_bitrate,
            initial_available_outgoing_bitrate: config.initial_available_outgoing_bitrate,
        }
    }
}

impl WorkerSettings {
    #[must_use]
    pub const fn from_config(config: &MediaConfig) -> Self {
        Self {
            rtc_min_port: config.rtc_min_port,
            rtc_max_port: config.rtc_max_port,
        }
    }
}

/// Connection parameters a client needs to attach to a fresh transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportParams {
    pub id: TransportId,
    pub ice_parameters: serde_json::Value,
    pub ice_candidates: serde_json::Value,
    pub dtls_parameters: serde_json::Value,
}

/// Entry point to the external media engine.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_worker(&self, settings: &WorkerSettings) -> Result<Arc<dyn MediaWorker>>;
}

/// One engine worker process.
#[async_trait]
pub trait MediaWorker: Send + Sync {
    async fn create_router(&self, codecs: &[CodecCapability]) -> Result<Arc<dyn MediaRouter>>;
}

/// A routing context shared by every room in this process.
#[async_trait]
pub trait MediaRouter: Send + Sync {
    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// Pure predicate: may `capabilities` receive the stream of the given
    /// producer? A `false` answer is "not available", never an error.
    fn can_consume(&self, producer_id: &ProducerId, capabilities: &RtpCapabilities) -> bool;

    async fn create_transport(&self, options: &TransportOptions)
        -> Result<Arc<dyn MediaTransport>>;
}

/// A negotiated network path between one peer and the engine.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> TransportId;

    fn params(&self) -> TransportParams;

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<()>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn MediaProducer>>;

    async fn consume(
        &self,
        producer_id: &ProducerId,
        capabilities: &RtpCapabilities,
    ) -> Result<Arc<dyn MediaConsumer>>;

    async fn close(&self);
}

/// One outbound stream of a single kind on a transport.
#[async_trait]
pub trait MediaProducer: Send + Sync {
    fn id(&self) -> ProducerId;
    fn kind(&self) -> MediaKind;
    async fn close(&self);
}

/// One inbound feed linked to a remote producer.
#[async_trait]
pub trait MediaConsumer: Send + Sync {
    fn id(&self) -> ConsumerId;
    fn kind(&self) -> MediaKind;
    fn producer_id(&self) -> ProducerId;
    fn rtp_parameters(&self) -> RtpParameters;
    async fn close(&self);
}

/// Fixed set of workers with round-robin selection.
pub struct WorkerPool {
    workers: Vec<Arc<dyn MediaWorker>>,
    next: AtomicUsize,
}

impl WorkerPool {
    /// Spawn `count` workers up front. A worker that cannot be created is
    /// fatal: the engine is unusable and the process should not serve.
    pub async fn build(
        engine: &dyn MediaEngine,
        settings: &WorkerSettings,
        count: usize,
    ) -> Result<Self> {
        if count == 0 {
            return Err(Error::InvalidInput(
                "worker pool requires at least one worker".to_string(),
            ));
        }

        let mut workers = Vec::with_capacity(count);
        for _ in 0..count {
            workers.push(engine.create_worker(settings).await?);
        }

        Ok(Self {
            workers,
            next: AtomicUsize::new(0),
        })
    }

    /// Round-robin worker selection.
    pub fn next_worker(&self) -> Arc<dyn MediaWorker> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        Arc::clone(&self.workers[idx])
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockMediaEngine;
    use super::*;
    use crate::config::default_codecs;

    fn settings() -> WorkerSettings {
        WorkerSettings {
            rtc_min_port: 10101,
            rtc_max_port: 10200,
        }
    }

    #[tokio::test]
    async fn test_pool_requires_workers() {
        let engine = MockMediaEngine::new();
        let result = WorkerPool::build(&engine, &settings(), 0).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_pool_round_robin_wraps() {
        let engine = MockMediaEngine::new();
        let pool = WorkerPool::build(&engine, &settings(), 3).await.unwrap();
        assert_eq!(pool.len(), 3);

        let first = pool.next_worker();
        pool.next_worker();
        pool.next_worker();
        let wrapped = pool.next_worker();
        assert!(Arc::ptr_eq(&first, &wrapped));
    }

    #[tokio::test]
    async fn test_router_capabilities_list_codecs() {
        let engine = MockMediaEngine::new();
        let pool = WorkerPool::build(&engine, &settings(), 1).await.unwrap();
        let router = pool
            .next_worker()
            .create_router(&default_codecs())
            .await
            .unwrap();

        let caps = router.rtp_capabilities();
        let codecs = caps.0["codecs"].as_array().expect("codecs array");
        assert_eq!(codecs.len(), 2);
    }
}
