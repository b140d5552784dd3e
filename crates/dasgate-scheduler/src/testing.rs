//! Recording fakes shared by the unit tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::dispatch::{ConfirmRequest, OutputSink, StreamHealth, StreamSink};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Sink that remembers every delivery.
pub struct RecordingSink {
    sent: Mutex<Vec<(String, String)>>,
    accept: AtomicBool,
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            accept: AtomicBool::new(true),
        }
    }
}

impl RecordingSink {
    pub fn refusing() -> Self {
        let sink = Self::default();
        sink.accept.store(false, Ordering::SeqCst);
        sink
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        lock(&self.sent).clone()
    }

    pub fn payloads(&self) -> Vec<String> {
        lock(&self.sent).iter().map(|(_, p)| p.clone()).collect()
    }
}

impl OutputSink for RecordingSink {
    fn deliver(&self, reference: &str, payload: &str) -> bool {
        if !self.accept.load(Ordering::SeqCst) {
            return false;
        }
        lock(&self.sent).push((reference.to_string(), payload.to_string()));
        true
    }
}

/// Stream sink and health provider in one.
pub struct RecordingStream {
    writes: Mutex<Vec<(String, String)>>,
    requests: Mutex<Vec<ConfirmRequest>>,
    healthy: AtomicBool,
}

impl Default for RecordingStream {
    fn default() -> Self {
        Self {
            writes: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            healthy: AtomicBool::new(true),
        }
    }
}

impl RecordingStream {
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn writes(&self) -> Vec<(String, String)> {
        lock(&self.writes).clone()
    }

    pub fn requests(&self) -> Vec<ConfirmRequest> {
        lock(&self.requests).clone()
    }
}

impl StreamSink for RecordingStream {
    fn write(&self, stream: &str, payload: &str) -> bool {
        lock(&self.writes).push((stream.to_string(), payload.to_string()));
        true
    }

    fn register_confirmation(&self, request: ConfirmRequest) -> bool {
        lock(&self.requests).push(request);
        true
    }
}

impl StreamHealth for RecordingStream {
    fn is_healthy(&self, _stream: &str) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}
