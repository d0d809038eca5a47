//! Thread-safe metrics collection
//!
//! Atomic counters for request and publish outcomes plus bounded latency
//! windows. One collector is created per process and shared through
//! `AppContext`.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Samples kept per latency window
const LATENCY_WINDOW: usize = 1000;

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // API requests
    requests_received: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    request_latency: LatencyWindow,

    // Publish attempts (one request may make several)
    publish_attempts: AtomicU64,
    publish_successes: AtomicU64,
    publish_failures: AtomicU64,
    publish_timeouts: AtomicU64,
    publish_retries: AtomicU64,
    publish_exhausted: AtomicU64,
    publish_latency: LatencyWindow,

    // Broker session
    mqtt_connected: AtomicBool,
    connections_established: AtomicU64,
    disconnections: AtomicU64,
    connection_start_time: AtomicU64,

    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            requests_received: AtomicU64::new(0),
            requests_succeeded: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            request_latency: LatencyWindow::default(),
            publish_attempts: AtomicU64::new(0),
            publish_successes: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            publish_timeouts: AtomicU64::new(0),
            publish_retries: AtomicU64::new(0),
            publish_exhausted: AtomicU64::new(0),
            publish_latency: LatencyWindow::default(),
            mqtt_connected: AtomicBool::new(false),
            connections_established: AtomicU64::new(0),
            disconnections: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // Request metrics
    pub fn request_received(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_completed(&self, duration: Duration, success: bool) {
        if success {
            self.requests_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.request_latency.record(duration);
    }

    // Publish metrics
    pub fn publish_attempted(&self) {
        self.publish_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_succeeded(&self, duration: Duration) {
        self.publish_successes.fetch_add(1, Ordering::Relaxed);
        self.publish_latency.record(duration);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_timed_out(&self) {
        self.publish_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_retried(&self) {
        self.publish_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_exhausted(&self) {
        self.publish_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    // MQTT session metrics
    pub fn mqtt_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn mqtt_connection_lost(&self) {
        if self.mqtt_connected.swap(false, Ordering::Relaxed) {
            self.disconnections.fetch_add(1, Ordering::Relaxed);
        }
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn is_mqtt_connected(&self) -> bool {
        self.mqtt_connected.load(Ordering::Relaxed)
    }

    fn connection_duration(&self, now: u64) -> u64 {
        let start_time = self.connection_start_time.load(Ordering::Relaxed);
        if self.mqtt_connected.load(Ordering::Relaxed) && start_time > 0 {
            now.saturating_sub(start_time)
        } else {
            0
        }
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();

        MetricsSnapshot {
            requests: RequestMetrics {
                received: self.requests_received.load(Ordering::Relaxed),
                succeeded: self.requests_succeeded.load(Ordering::Relaxed),
                failed: self.requests_failed.load(Ordering::Relaxed),
                latency: self.request_latency.summary(),
            },
            publish: PublishMetrics {
                attempts: self.publish_attempts.load(Ordering::Relaxed),
                successes: self.publish_successes.load(Ordering::Relaxed),
                failures: self.publish_failures.load(Ordering::Relaxed),
                timeouts: self.publish_timeouts.load(Ordering::Relaxed),
                retries: self.publish_retries.load(Ordering::Relaxed),
                exhausted: self.publish_exhausted.load(Ordering::Relaxed),
                latency: self.publish_latency.summary(),
            },
            mqtt: MqttMetrics {
                connected: self.mqtt_connected.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                disconnections: self.disconnections.load(Ordering::Relaxed),
                connection_duration_seconds: self.connection_duration(now),
            },
            uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Last `LATENCY_WINDOW` samples, in microseconds
#[derive(Default)]
struct LatencyWindow {
    samples: Mutex<Vec<u64>>,
}

impl LatencyWindow {
    fn record(&self, duration: Duration) {
        if let Ok(mut samples) = self.samples.lock() {
            samples.push(duration.as_micros() as u64);
            if samples.len() > LATENCY_WINDOW {
                samples.remove(0);
            }
        }
    }

    fn summary(&self) -> LatencySummary {
        let Ok(samples) = self.samples.lock() else {
            return LatencySummary::default();
        };
        if samples.is_empty() {
            return LatencySummary::default();
        }

        let mut sorted = samples.clone();
        drop(samples);
        sorted.sort_unstable();

        let to_ms = |micros: f64| micros / 1000.0;
        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;

        LatencySummary {
            samples: sorted.len(),
            avg_ms: to_ms(avg),
            p50_ms: to_ms(percentile(&sorted, 50.0)),
            p95_ms: to_ms(percentile(&sorted, 95.0)),
            p99_ms: to_ms(percentile(&sorted, 99.0)),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub requests: RequestMetrics,
    pub publish: PublishMetrics,
    pub mqtt: MqttMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct RequestMetrics {
    pub received: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub latency: LatencySummary,
}

#[derive(Debug, Serialize)]
pub struct PublishMetrics {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub retries: u64,
    pub exhausted: u64,
    pub latency: LatencySummary,
}

#[derive(Debug, Serialize)]
pub struct MqttMetrics {
    pub connected: bool,
    pub connections_established: u64,
    pub disconnections: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Default, Serialize)]
pub struct LatencySummary {
    pub samples: usize,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_value = sorted_data[index.floor() as usize] as f64;
        let upper_value = sorted_data[index.ceil() as usize] as f64;
        lower_value + (upper_value - lower_value) * index.fract()
    }
}
