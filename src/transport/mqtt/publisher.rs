//! Bounded-retry publishing over a broker session

use crate::config::PublishSection;
use crate::error::PublishError;
use crate::message::OutboundMessage;
use crate::observability::MetricsCollector;
use crate::transport::Publisher;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn, Instrument};

/// One delivery attempt against a broker connection
#[async_trait]
pub trait Session: Send + Sync {
    /// Queue the message and wait for its QoS 2 acknowledgement
    async fn publish_once(&self, message: &OutboundMessage) -> Result<(), PublishError>;

    fn is_connected(&self) -> bool;

    /// Release the connection; the default does nothing
    async fn close(&self) {}
}

/// Retry budget for a single publish
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Per-attempt acknowledgement deadline
    pub attempt_timeout: Duration,
    /// Pause between attempts
    pub backoff: Duration,
    pub retry_on_timeout: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(5),
            backoff: Duration::from_millis(100),
            retry_on_timeout: true,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &PublishSection) -> Self {
        Self {
            max_attempts: config.max_attempts,
            attempt_timeout: Duration::from_millis(config.timeout_ms),
            backoff: Duration::from_millis(config.backoff_ms),
            retry_on_timeout: config.retry_on_timeout,
        }
    }

    /// Upper bound on how long one publish call can block
    pub fn worst_case(&self) -> Duration {
        (self.attempt_timeout + self.backoff) * self.max_attempts.max(1)
    }
}

/// [`Publisher`] over a broker [`Session`] with timeout and bounded retry
pub struct MqttPublisher<S: Session + ?Sized> {
    session: Arc<S>,
    policy: RetryPolicy,
    metrics: Arc<MetricsCollector>,
}

impl<S: Session + ?Sized> MqttPublisher<S> {
    pub fn new(session: Arc<S>, policy: RetryPolicy, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            session,
            policy,
            metrics,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn session(&self) -> &Arc<S> {
        &self.session
    }

    /// Retry orchestrator: at most `max_attempts` attempts, each bounded by `attempt_timeout`
    async fn publish_with_retry(&self, message: OutboundMessage) -> Result<(), PublishError> {
        message.validate()?;

        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                self.metrics.publish_retried();
                debug!(
                    attempt,
                    backoff_ms = self.policy.backoff.as_millis() as u64,
                    "Retrying publish"
                );
                tokio::time::sleep(self.policy.backoff).await;
            }

            self.metrics.publish_attempted();
            let started = Instant::now();

            match self.attempt(&message).await {
                Ok(()) => {
                    self.metrics.publish_succeeded(started.elapsed());
                    if attempt > 1 {
                        info!(attempt, "Publish succeeded after retry");
                    } else {
                        debug!("Publish acknowledged");
                    }
                    return Ok(());
                }
                Err(e) if e.is_timeout() => {
                    self.metrics.publish_timed_out();
                    warn!(attempt, max_attempts, error = %e, "Publish attempt timed out");
                    if !self.policy.retry_on_timeout {
                        return Err(e);
                    }
                    last_error = Some(e);
                }
                Err(e) => {
                    self.metrics.publish_failed();
                    warn!(attempt, max_attempts, error = %e, "Publish attempt failed");
                    last_error = Some(e);
                }
            }
        }

        self.metrics.publish_exhausted();
        let last = last_error
            .unwrap_or_else(|| PublishError::transport("no publish attempt completed"));
        error!(attempts = max_attempts, error = %last, "Publish failed after all retries");

        Err(PublishError::RetriesExhausted {
            attempts: max_attempts,
            last: Box::new(last),
        })
    }

    async fn attempt(&self, message: &OutboundMessage) -> Result<(), PublishError> {
        let timeout = self.policy.attempt_timeout;
        match tokio::time::timeout(timeout, self.session.publish_once(message)).await {
            Ok(result) => result,
            Err(_) => Err(PublishError::Timeout { after: timeout }),
        }
    }
}

#[async_trait]
impl<S: Session + ?Sized + 'static> Publisher for MqttPublisher<S> {
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        retained: bool,
    ) -> Result<(), PublishError> {
        let span = crate::publish_span!(
            transport = "mqtt",
            topic = %topic,
            retained,
            payload_present = !payload.is_empty()
        );
        let message = OutboundMessage::new(topic, payload, retained);
        self.publish_with_retry(message).instrument(span).await
    }

    fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    fn name(&self) -> &'static str {
        "mqtt"
    }

    async fn shutdown(&self) {
        self.session.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::{MockOutcome, MockSession};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            attempt_timeout: Duration::from_millis(50),
            backoff: Duration::from_millis(5),
            retry_on_timeout: true,
        }
    }

    fn publisher_with(
        session: Arc<MockSession>,
        policy: RetryPolicy,
    ) -> (MqttPublisher<MockSession>, Arc<MetricsCollector>) {
        let metrics = Arc::new(MetricsCollector::new());
        let publisher = MqttPublisher::new(session, policy, Arc::clone(&metrics));
        (publisher, metrics)
    }

    #[tokio::test]
    async fn test_first_attempt_success() {
        let session = Arc::new(MockSession::new());
        let (publisher, metrics) = publisher_with(Arc::clone(&session), fast_policy());

        publisher
            .publish("room/42", Bytes::from_static(b"{}"), true)
            .await
            .unwrap();

        assert_eq!(session.calls(), 1);
        let published = session.published();
        assert_eq!(published[0].topic, "room/42");
        assert!(published[0].retained);
        assert_eq!(metrics.get_metrics().publish.successes, 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let session = Arc::new(MockSession::scripted(vec![
            MockOutcome::NotConnected,
            MockOutcome::Fail("connection reset".to_string()),
            MockOutcome::Succeed,
        ]));
        let (publisher, metrics) = publisher_with(Arc::clone(&session), fast_policy());

        let result = publisher.publish("a/b", Bytes::from_static(b"x"), false).await;

        assert!(result.is_ok());
        assert_eq!(session.calls(), 3);
        let snapshot = metrics.get_metrics();
        assert_eq!(snapshot.publish.attempts, 3);
        assert_eq!(snapshot.publish.failures, 2);
        assert_eq!(snapshot.publish.retries, 2);
    }

    #[tokio::test]
    async fn test_exhaustion_is_an_error() {
        let session = Arc::new(MockSession::always(MockOutcome::Fail("broker down".to_string())));
        let (publisher, metrics) = publisher_with(Arc::clone(&session), fast_policy());

        let result = publisher.publish("a/b", Bytes::from_static(b"x"), false).await;

        match result {
            Err(PublishError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, PublishError::Transport(_)));
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        assert_eq!(session.calls(), 3);
        assert_eq!(metrics.get_metrics().publish.exhausted, 1);
    }

    #[tokio::test]
    async fn test_timeouts_are_retried_and_bounded() {
        let session = Arc::new(MockSession::always(MockOutcome::Hang));
        let policy = fast_policy();
        let bound = policy.worst_case();
        let (publisher, metrics) = publisher_with(Arc::clone(&session), policy);

        let started = Instant::now();
        let result = publisher.publish("a/b", Bytes::from_static(b"x"), false).await;
        let elapsed = started.elapsed();

        match result {
            Err(PublishError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(last.is_timeout());
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        assert_eq!(session.calls(), 3);
        assert_eq!(metrics.get_metrics().publish.timeouts, 3);
        // Generous slack for slow CI schedulers
        assert!(elapsed < bound + Duration::from_millis(500), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn test_timeout_reported_without_retry_when_disabled() {
        let session = Arc::new(MockSession::always(MockOutcome::Hang));
        let policy = RetryPolicy {
            retry_on_timeout: false,
            ..fast_policy()
        };
        let (publisher, _) = publisher_with(Arc::clone(&session), policy);

        let result = publisher.publish("a/b", Bytes::from_static(b"x"), false).await;

        assert!(matches!(result, Err(PublishError::Timeout { .. })));
        assert_eq!(session.calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_topic_makes_no_attempt() {
        let session = Arc::new(MockSession::new());
        let (publisher, _) = publisher_with(Arc::clone(&session), fast_policy());

        let result = publisher.publish("", Bytes::from_static(b"x"), false).await;

        assert!(matches!(result, Err(PublishError::InvalidTopic { .. })));
        assert_eq!(session.calls(), 0);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_tries_once() {
        let session = Arc::new(MockSession::new());
        let policy = RetryPolicy {
            max_attempts: 0,
            ..fast_policy()
        };
        let (publisher, _) = publisher_with(Arc::clone(&session), policy);

        publisher
            .publish("a/b", Bytes::from_static(b"x"), false)
            .await
            .unwrap();
        assert_eq!(session.calls(), 1);
    }

    #[test]
    fn test_policy_from_config() {
        let section = PublishSection {
            timeout_ms: 750,
            max_attempts: 5,
            backoff_ms: 20,
            retry_on_timeout: false,
            ..PublishSection::default()
        };
        let policy = RetryPolicy::from_config(&section);

        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.attempt_timeout, Duration::from_millis(750));
        assert_eq!(policy.backoff, Duration::from_millis(20));
        assert!(!policy.retry_on_timeout);
        assert_eq!(policy.worst_case(), Duration::from_millis(5 * 770));
    }

    #[test]
    fn test_default_policy_matches_config_defaults() {
        assert_eq!(
            RetryPolicy::default(),
            RetryPolicy::from_config(&PublishSection::default())
        );
    }
}
