//! In-process counters and health evaluation for one skill.
//!
//! Counters are cumulative since start (or the last [`MetricsCollector::reset`]);
//! latency and confidence keep the most recent [`SAMPLE_WINDOW`] samples.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::time::{Duration, Instant};

pub const SAMPLE_WINDOW: usize = 1000;

/// How an inbound intent message ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Processed,
    Rejected,
    Invalid,
    Duplicate,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    Created,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Default)]
struct Counters {
    messages_received: u64,
    messages_processed: u64,
    messages_rejected: u64,
    messages_invalid: u64,
    messages_duplicate: u64,
    messages_failed: u64,
    tasks_created: u64,
    tasks_completed: u64,
    tasks_failed: u64,
    tasks_cancelled: u64,
    publishes: u64,
    publish_failures: u64,
    reconnections: u64,
    cache_hits: u64,
    cache_misses: u64,
    cache_evictions: u64,
    cache_size: usize,
    warnings: u64,
    errors: u64,
    processing_ms: VecDeque<f64>,
    publish_ms: VecDeque<f64>,
    confidences: VecDeque<f64>,
}

fn push_sample(samples: &mut VecDeque<f64>, value: f64) {
    if samples.len() == SAMPLE_WINDOW {
        samples.pop_front();
    }
    samples.push_back(value);
}

#[derive(Debug)]
pub struct MetricsCollector {
    skill_name: String,
    started_at: Instant,
    counters: Mutex<Counters>,
}

impl MetricsCollector {
    pub fn new(skill_name: impl Into<String>) -> Self {
        Self {
            skill_name: skill_name.into(),
            started_at: Instant::now(),
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn skill_name(&self) -> &str {
        &self.skill_name
    }

    pub fn record_message(
        &self,
        outcome: MessageOutcome,
        confidence: Option<f64>,
        elapsed: Option<Duration>,
    ) {
        let mut c = self.counters.lock();
        c.messages_received += 1;
        match outcome {
            MessageOutcome::Processed => c.messages_processed += 1,
            MessageOutcome::Rejected => c.messages_rejected += 1,
            MessageOutcome::Invalid => {
                c.messages_invalid += 1;
                c.warnings += 1;
            }
            MessageOutcome::Duplicate => c.messages_duplicate += 1,
            MessageOutcome::Failed => {
                c.messages_failed += 1;
                c.errors += 1;
            }
        }
        if let Some(confidence) = confidence {
            push_sample(&mut c.confidences, confidence);
        }
        if let Some(elapsed) = elapsed {
            push_sample(&mut c.processing_ms, elapsed.as_secs_f64() * 1000.0);
        }
    }

    pub fn record_task(&self, event: TaskEvent) {
        let mut c = self.counters.lock();
        match event {
            TaskEvent::Created => c.tasks_created += 1,
            TaskEvent::Completed => c.tasks_completed += 1,
            TaskEvent::Failed => {
                c.tasks_failed += 1;
                c.errors += 1;
            }
            TaskEvent::Cancelled => c.tasks_cancelled += 1,
        }
    }

    pub fn record_publish(&self, success: bool, elapsed: Duration) {
        let mut c = self.counters.lock();
        c.publishes += 1;
        if !success {
            c.publish_failures += 1;
        }
        push_sample(&mut c.publish_ms, elapsed.as_secs_f64() * 1000.0);
    }

    pub fn record_reconnection(&self) {
        let mut c = self.counters.lock();
        c.reconnections += 1;
        c.warnings += 1;
    }

    pub fn record_cache_lookup(&self, hit: bool, size: usize) {
        let mut c = self.counters.lock();
        if hit {
            c.cache_hits += 1;
        } else {
            c.cache_misses += 1;
        }
        c.cache_size = size;
    }

    pub fn record_cache_eviction(&self) {
        self.counters.lock().cache_evictions += 1;
    }

    pub fn record_error(&self) {
        self.counters.lock().errors += 1;
    }

    pub fn reset(&self) {
        *self.counters.lock() = Counters::default();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = self.counters.lock();
        let uptime_secs = self.started_at.elapsed().as_secs_f64();
        let handled = c.messages_processed + c.messages_failed;
        let cache_lookups = c.cache_hits + c.cache_misses;

        MetricsSnapshot {
            skill_name: self.skill_name.clone(),
            uptime_secs,
            messages: MessageStats {
                received: c.messages_received,
                processed: c.messages_processed,
                rejected: c.messages_rejected,
                invalid: c.messages_invalid,
                duplicates: c.messages_duplicate,
                failed: c.messages_failed,
                success_rate: ratio(c.messages_processed, handled),
                latency_ms: LatencyStats::from_samples(&c.processing_ms),
                processing_ms_sum: c.processing_ms.iter().sum(),
                processing_count: c.processing_ms.len(),
                avg_confidence: mean(&c.confidences),
            },
            tasks: TaskStats {
                created: c.tasks_created,
                completed: c.tasks_completed,
                failed: c.tasks_failed,
                cancelled: c.tasks_cancelled,
                active: c
                    .tasks_created
                    .saturating_sub(c.tasks_completed + c.tasks_failed + c.tasks_cancelled),
            },
            publishes: PublishStats {
                total: c.publishes,
                failures: c.publish_failures,
                success_rate: ratio(c.publishes - c.publish_failures, c.publishes),
                reconnections: c.reconnections,
                latency_ms: LatencyStats::from_samples(&c.publish_ms),
            },
            cache: CacheStats {
                hits: c.cache_hits,
                misses: c.cache_misses,
                evictions: c.cache_evictions,
                size: c.cache_size,
                hit_rate: if cache_lookups == 0 {
                    0.0
                } else {
                    c.cache_hits as f64 / cache_lookups as f64
                },
            },
            warnings: c.warnings,
            errors: c.errors,
            error_rate: if c.messages_received == 0 {
                0.0
            } else {
                c.errors as f64 / c.messages_received as f64
            },
        }
    }

    /// Prometheus text exposition of the current snapshot.
    pub fn render_prometheus(&self) -> String {
        let s = self.snapshot();
        let label = format!("skill_name=\"{}\"", s.skill_name);
        let mut out = String::new();
        let series = [
            (
                "skill_messages_received_total",
                "counter",
                "Intent messages received",
                s.messages.received.to_string(),
            ),
            (
                "skill_messages_processed_total",
                "counter",
                "Accepted messages processed successfully",
                s.messages.processed.to_string(),
            ),
            (
                "skill_messages_rejected_total",
                "counter",
                "Messages rejected by the certainty gate",
                s.messages.rejected.to_string(),
            ),
            (
                "skill_messages_failed_total",
                "counter",
                "Accepted messages whose processing failed",
                s.messages.failed.to_string(),
            ),
            (
                "skill_messages_invalid_total",
                "counter",
                "Malformed messages dropped",
                s.messages.invalid.to_string(),
            ),
            (
                "skill_message_processing_duration_seconds_sum",
                "counter",
                "Total processing time of sampled messages",
                format!("{:.6}", s.messages.processing_ms_sum / 1000.0),
            ),
            (
                "skill_message_processing_duration_seconds_count",
                "counter",
                "Number of sampled messages",
                s.messages.processing_count.to_string(),
            ),
            (
                "skill_publishes_total",
                "counter",
                "Publish attempts",
                s.publishes.total.to_string(),
            ),
            (
                "skill_publish_failures_total",
                "counter",
                "Failed publish attempts",
                s.publishes.failures.to_string(),
            ),
            (
                "skill_reconnections_total",
                "counter",
                "Broker connection losses",
                s.publishes.reconnections.to_string(),
            ),
            (
                "skill_tasks_created_total",
                "counter",
                "Supervised tasks spawned",
                s.tasks.created.to_string(),
            ),
            (
                "skill_tasks_active",
                "gauge",
                "Supervised tasks still running",
                s.tasks.active.to_string(),
            ),
            (
                "skill_cache_hits_total",
                "counter",
                "Intent cache hits",
                s.cache.hits.to_string(),
            ),
            (
                "skill_cache_evictions_total",
                "counter",
                "Intent cache evictions",
                s.cache.evictions.to_string(),
            ),
            (
                "skill_uptime_seconds",
                "gauge",
                "Seconds since start",
                format!("{:.1}", s.uptime_secs),
            ),
        ];
        for (name, kind, help, value) in series {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} {kind}");
            let _ = writeln!(out, "{name}{{{label}}} {value}");
        }
        out
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        1.0
    } else {
        part as f64 / whole as f64
    }
}

fn mean(samples: &VecDeque<f64>) -> Option<f64> {
    if samples.is_empty() {
        None
    } else {
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub skill_name: String,
    pub uptime_secs: f64,
    pub messages: MessageStats,
    pub tasks: TaskStats,
    pub publishes: PublishStats,
    pub cache: CacheStats,
    pub warnings: u64,
    pub errors: u64,
    /// Errors per received message.
    pub error_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageStats {
    pub received: u64,
    pub processed: u64,
    pub rejected: u64,
    pub invalid: u64,
    pub duplicates: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub latency_ms: LatencyStats,
    #[serde(skip)]
    pub processing_ms_sum: f64,
    #[serde(skip)]
    pub processing_count: usize,
    pub avg_confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStats {
    pub created: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub active: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishStats {
    pub total: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub reconnections: u64,
    pub latency_ms: LatencyStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
    pub hit_rate: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LatencyStats {
    pub avg: f64,
    pub p95: f64,
    pub max: f64,
}

impl LatencyStats {
    fn from_samples(samples: &VecDeque<f64>) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut sorted: Vec<f64> = samples.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let p95_index = ((sorted.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
        Self {
            avg: sorted.iter().sum::<f64>() / sorted.len() as f64,
            p95: sorted[p95_index.min(sorted.len() - 1)],
            max: sorted[sorted.len() - 1],
        }
    }
}

// --- Health ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub min_message_success_rate: f64,
    pub min_publish_success_rate: f64,
    pub warning_error_rate: f64,
    pub critical_error_rate: f64,
    pub max_avg_latency_ms: f64,
    pub min_cache_hit_rate: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            min_message_success_rate: 0.95,
            min_publish_success_rate: 0.98,
            warning_error_rate: 0.01,
            critical_error_rate: 0.1,
            max_avg_latency_ms: 1000.0,
            min_cache_hit_rate: 0.8,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub alerts: Vec<String>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct HealthChecker {
    thresholds: HealthThresholds,
}

impl HealthChecker {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self { thresholds }
    }

    pub fn check(&self, snapshot: &MetricsSnapshot) -> HealthReport {
        let t = &self.thresholds;
        let mut status = HealthStatus::Healthy;
        let mut alerts = Vec::new();
        let mut recommendations = Vec::new();

        if snapshot.messages.success_rate < t.min_message_success_rate {
            status = HealthStatus::Degraded;
            alerts.push(format!(
                "message success rate {:.1}% is below {:.0}%",
                snapshot.messages.success_rate * 100.0,
                t.min_message_success_rate * 100.0
            ));
        }
        if snapshot.publishes.success_rate < t.min_publish_success_rate {
            status = HealthStatus::Degraded;
            alerts.push(format!(
                "publish success rate {:.1}% is below {:.0}%",
                snapshot.publishes.success_rate * 100.0,
                t.min_publish_success_rate * 100.0
            ));
        }
        if snapshot.error_rate >= t.critical_error_rate {
            status = HealthStatus::Unhealthy;
            alerts.push(format!("high error rate: {:.3} errors per message", snapshot.error_rate));
        } else if snapshot.error_rate >= t.warning_error_rate {
            alerts.push(format!(
                "elevated error rate: {:.3} errors per message",
                snapshot.error_rate
            ));
        }
        if snapshot.messages.latency_ms.avg > t.max_avg_latency_ms {
            recommendations.push(format!(
                "average processing latency {:.0}ms exceeds {:.0}ms",
                snapshot.messages.latency_ms.avg, t.max_avg_latency_ms
            ));
        }
        if snapshot.cache.hits > 0 && snapshot.cache.hit_rate < t.min_cache_hit_rate {
            recommendations.push(format!(
                "cache hit rate {:.1}% is low; consider a larger intent_cache_size",
                snapshot.cache.hit_rate * 100.0
            ));
        }

        HealthReport {
            status,
            alerts,
            recommendations,
        }
    }
}
