//! Shared helpers for unit tests.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::default_codecs;
use crate::media::mock::MockMediaEngine;
use crate::media::{MediaEngine, MediaRouter, MediaWorker, TransportOptions, WorkerSettings};
use crate::peer::EventSink;
use crate::signaling::ServerEvent;

/// Event sink that records everything delivered to it.
pub struct CollectingSink {
    pub events: Mutex<Vec<ServerEvent>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn drain(&self) -> Vec<ServerEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl EventSink for CollectingSink {
    fn deliver(&self, event: ServerEvent) -> Result<(), String> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Engine + router over the default codec set.
pub async fn mock_router() -> (MockMediaEngine, Arc<dyn MediaRouter>) {
    let engine = MockMediaEngine::new();
    let worker = engine
        .create_worker(&WorkerSettings {
            rtc_min_port: 10101,
            rtc_max_port: 10200,
        })
        .await
        .expect("mock worker");
    let router = worker
        .create_router(&default_codecs())
        .await
        .expect("mock router");
    (engine, router)
}

pub fn transport_options() -> TransportOptions {
    TransportOptions {
        listen_ip: "0.0.0.0".to_string(),
        announced_ip: None,
        max_incoming_bitrate: 1_500_000,
        initial_available_outgoing_bitrate: 1_000_000,
    }
}
