//! In-memory media engine
//!
//! Implements the full facade without touching the network: ids are
//! process-local, producers are tracked per router so `can_consume` really
//! inspects the candidate capabilities, and every failure path can be
//! injected. The test suite runs against this engine, and so does the
//! server when `media.engine = "mock"` (the default; codec negotiation and
//! RTP/DTLS mechanics live in an external engine behind the same traits).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use crate::config::CodecCapability;
use crate::ids::{ConsumerId, ProducerId, TransportId};
use crate::media::{
    DtlsParameters, MediaConsumer, MediaEngine, MediaKind, MediaProducer, MediaRouter,
    MediaTransport, MediaWorker, RtpCapabilities, RtpParameters, TransportOptions,
    TransportParams, WorkerSettings,
};
use crate::{Error, Result};

#[derive(Default)]
struct EngineState {
    counter: AtomicU64,
    fail_transports: AtomicBool,
    fail_produce: AtomicBool,
    fail_consume: AtomicBool,
}

impl EngineState {
    fn next_id(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{prefix}-{n}")
    }
}

/// In-memory implementation of [`MediaEngine`].
#[derive(Clone, Default)]
pub struct MockMediaEngine {
    state: Arc<EngineState>,
}

impl MockMediaEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `create_transport` fail.
    pub fn set_fail_transports(&self, fail: bool) {
        self.state.fail_transports.store(fail, Ordering::Relaxed);
    }

    /// Make every subsequent `produce` fail.
    pub fn set_fail_produce(&self, fail: bool) {
        self.state.fail_produce.store(fail, Ordering::Relaxed);
    }

    /// Make every subsequent `consume` fail.
    pub fn set_fail_consume(&self, fail: bool) {
        self.state.fail_consume.store(fail, Ordering::Relaxed);
    }
}

#[async_trait]
impl MediaEngine for MockMediaEngine {
    async fn create_worker(&self, _settings: &WorkerSettings) -> Result<Arc<dyn MediaWorker>> {
        Ok(Arc::new(MockWorker {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockWorker {
    state: Arc<EngineState>,
}

#[async_trait]
impl MediaWorker for MockWorker {
    async fn create_router(&self, codecs: &[CodecCapability]) -> Result<Arc<dyn MediaRouter>> {
        Ok(Arc::new(MockRouter {
            state: Arc::clone(&self.state),
            codecs: codecs.to_vec(),
            producers: Arc::new(Mutex::new(HashMap::new())),
        }))
    }
}

struct MockRouter {
    state: Arc<EngineState>,
    codecs: Vec<CodecCapability>,
    /// Producer id -> media kind, shared with the transports of this router.
    producers: Arc<Mutex<HashMap<ProducerId, MediaKind>>>,
}

#[async_trait]
impl MediaRouter for MockRouter {
    fn rtp_capabilities(&self) -> RtpCapabilities {
        let codecs: Vec<serde_json::Value> = self
            .codecs
            .iter()
            .map(|c| {
                json!({
                    "kind": c.kind,
                    "mimeType": c.mime_type,
                    "clockRate": c.clock_rate,
                    "channels": c.channels,
                })
            })
            .collect();
        RtpCapabilities(json!({ "codecs": codecs }))
    }

    fn can_consume(&self, producer_id: &ProducerId, capabilities: &RtpCapabilities) -> bool {
        let Some(kind) = self.producers.lock().get(producer_id).copied() else {
            return false;
        };

        capabilities.0["codecs"]
            .as_array()
            .is_some_and(|codecs| codecs.iter().any(|c| c["kind"] == kind.codec_kind()))
    }

    async fn create_transport(
        &self,
        options: &TransportOptions,
    ) -> Result<Arc<dyn MediaTransport>> {
        if self.state.fail_transports.load(Ordering::Relaxed) {
            return Err(Error::Engine("transport allocation refused".to_string()));
        }

        let id = TransportId::from(self.state.next_id("transport"));
        Ok(Arc::new(MockTransport {
            id,
            state: Arc::clone(&self.state),
            producers: Arc::clone(&self.producers),
            options: options.clone(),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MockTransport {
    id: TransportId,
    state: Arc<EngineState>,
    producers: Arc<Mutex<HashMap<ProducerId, MediaKind>>>,
    options: TransportOptions,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl MockTransport {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::Engine(format!("transport {} is closed", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaTransport for MockTransport {
    fn id(&self) -> TransportId {
        self.id.clone()
    }

    fn params(&self) -> TransportParams {
        let address = self
            .options
            .announced_ip
            .clone()
            .unwrap_or_else(|| self.options.listen_ip.clone());
        TransportParams {
            id: self.id.clone(),
            ice_parameters: json!({
                "usernameFragment": format!("frag-{}", self.id),
                "password": format!("pass-{}", self.id),
            }),
            ice_candidates: json!([{ "ip": address, "protocol": "udp" }]),
            dtls_parameters: json!({ "role": "auto" }),
        }
    }

    async fn connect(&self, _dtls_parameters: DtlsParameters) -> Result<()> {
        self.ensure_open()?;
        self.connected.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        _rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn MediaProducer>> {
        self.ensure_open()?;
        if self.state.fail_produce.load(Ordering::Relaxed) {
            return Err(Error::Engine("produce refused".to_string()));
        }

        let id = ProducerId::from(self.state.next_id("producer"));
        self.producers.lock().insert(id.clone(), kind);
        Ok(Arc::new(MockProducer {
            id,
            kind,
            producers: Arc::clone(&self.producers),
        }))
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        _capabilities: &RtpCapabilities,
    ) -> Result<Arc<dyn MediaConsumer>> {
        self.ensure_open()?;
        if self.state.fail_consume.load(Ordering::Relaxed) {
            return Err(Error::Engine("consume refused".to_string()));
        }

        let Some(kind) = self.producers.lock().get(producer_id).copied() else {
            return Err(Error::Engine(format!("unknown producer {producer_id}")));
        };

        Ok(Arc::new(MockConsumer {
            id: ConsumerId::from(self.state.next_id("consumer")),
            kind,
            producer_id: producer_id.clone(),
        }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

struct MockProducer {
    id: ProducerId,
    kind: MediaKind,
    producers: Arc<Mutex<HashMap<ProducerId, MediaKind>>>,
}

#[async_trait]
impl MediaProducer for MockProducer {
    fn id(&self) -> ProducerId {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn close(&self) {
        self.producers.lock().remove(&self.id);
    }
}

struct MockConsumer {
    id: ConsumerId,
    kind: MediaKind,
    producer_id: ProducerId,
}

#[async_trait]
impl MediaConsumer for MockConsumer {
    fn id(&self) -> ConsumerId {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn producer_id(&self) -> ProducerId {
        self.producer_id.clone()
    }

    fn rtp_parameters(&self) -> RtpParameters {
        RtpParameters(json!({
            "consumerId": self.id.as_str(),
            "producerId": self.producer_id.as_str(),
        }))
    }

    async fn close(&self) {}
}
