//! Mock transports for testing
//!
//! [`MockSession`] stands in for a broker connection under
//! [`MqttPublisher`](crate::transport::MqttPublisher); [`MockPublisher`]
//! replaces the whole transport for service and API tests. Both play back a
//! script of [`MockOutcome`]s and record what they were asked to publish.

use crate::error::PublishError;
use crate::message::OutboundMessage;
use crate::transport::{Publisher, Session};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// What a mock does on one call
#[derive(Debug, Clone, PartialEq)]
pub enum MockOutcome {
    Succeed,
    NotConnected,
    Fail(String),
    Reject(String),
    Status(u16, String),
    Exhausted(u32),
    /// Never completes; only a caller-side timeout ends the call
    Hang,
    /// Succeeds after the delay
    Delay(Duration),
}

impl MockOutcome {
    async fn play(self) -> Result<(), PublishError> {
        match self {
            MockOutcome::Succeed => Ok(()),
            MockOutcome::NotConnected => Err(PublishError::not_connected("connecting")),
            MockOutcome::Fail(reason) => Err(PublishError::transport(reason)),
            MockOutcome::Reject(reason) => Err(PublishError::rejected(reason)),
            MockOutcome::Status(code, body) => Err(PublishError::Status { code, body }),
            MockOutcome::Exhausted(attempts) => Err(PublishError::RetriesExhausted {
                attempts,
                last: Box::new(PublishError::transport("mock broker unavailable")),
            }),
            MockOutcome::Hang => std::future::pending().await,
            MockOutcome::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }
}

/// Scripted outcomes, then a fallback for every later call
#[derive(Debug)]
struct Script {
    queued: Mutex<VecDeque<MockOutcome>>,
    fallback: MockOutcome,
}

impl Script {
    fn new(queued: Vec<MockOutcome>, fallback: MockOutcome) -> Self {
        Self {
            queued: Mutex::new(queued.into()),
            fallback,
        }
    }

    fn next(&self) -> MockOutcome {
        self.queued
            .lock()
            .ok()
            .and_then(|mut queued| queued.pop_front())
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// Mock broker session
#[derive(Debug)]
pub struct MockSession {
    script: Script,
    calls: AtomicU32,
    connected: AtomicBool,
    published: Mutex<Vec<OutboundMessage>>,
}

impl MockSession {
    /// Session that acknowledges every publish
    pub fn new() -> Self {
        Self::always(MockOutcome::Succeed)
    }

    pub fn always(outcome: MockOutcome) -> Self {
        Self::with_script(Vec::new(), outcome)
    }

    /// Play `outcomes` in order, then succeed
    pub fn scripted(outcomes: Vec<MockOutcome>) -> Self {
        Self::with_script(outcomes, MockOutcome::Succeed)
    }

    pub fn with_script(outcomes: Vec<MockOutcome>, fallback: MockOutcome) -> Self {
        Self {
            script: Script::new(outcomes, fallback),
            calls: AtomicU32::new(0),
            connected: AtomicBool::new(true),
            published: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Messages handed to `publish_once`, including failed attempts
    pub fn published(&self) -> Vec<OutboundMessage> {
        self.published
            .lock()
            .map(|published| published.clone())
            .unwrap_or_default()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl Default for MockSession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Session for MockSession {
    async fn publish_once(&self, message: &OutboundMessage) -> Result<(), PublishError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut published) = self.published.lock() {
            published.push(message.clone());
        }
        self.script.next().play().await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// A publish recorded by [`MockPublisher`]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedPublish {
    pub topic: String,
    pub payload: Bytes,
    pub retained: bool,
}

/// Mock transport implementing [`Publisher`] directly
#[derive(Debug)]
pub struct MockPublisher {
    script: Script,
    connected: AtomicBool,
    calls: AtomicU32,
    published: Mutex<Vec<RecordedPublish>>,
}

impl MockPublisher {
    pub fn new() -> Self {
        Self::always(MockOutcome::Succeed)
    }

    pub fn always(outcome: MockOutcome) -> Self {
        Self::scripted(Vec::new(), outcome)
    }

    pub fn scripted(outcomes: Vec<MockOutcome>, fallback: MockOutcome) -> Self {
        Self {
            script: Script::new(outcomes, fallback),
            connected: AtomicBool::new(true),
            calls: AtomicU32::new(0),
            published: Mutex::new(Vec::new()),
        }
    }

    pub fn disconnected() -> Self {
        let publisher = Self::new();
        publisher.connected.store(false, Ordering::SeqCst);
        publisher
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<RecordedPublish> {
        self.published
            .lock()
            .map(|published| published.clone())
            .unwrap_or_default()
    }
}

impl Default for MockPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        retained: bool,
    ) -> Result<(), PublishError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self.script.next();
        if outcome == MockOutcome::Succeed {
            if let Ok(mut published) = self.published.lock() {
                published.push(RecordedPublish {
                    topic: topic.to_string(),
                    payload,
                    retained,
                });
            }
        }
        outcome.play().await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
