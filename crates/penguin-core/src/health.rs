// Health monitoring and performance metrics
//
// Tracks request latencies (last 1000 for percentiles), success rates,
// and task durations, and assembles the health document served by the
// external interface.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

/// Latencies kept for percentile calculation
const LATENCY_WINDOW: usize = 1000;

/// Overall service status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    AtCapacity,
}

/// Process resource usage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_mb: f64,
    pub cpu_percent: f64,
    pub threads: usize,
    pub active_tasks: usize,
}

/// Executor capacity summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCapacity {
    pub max: usize,
    pub active: usize,
    pub available: usize,
    pub utilization: f64,
}

/// Rolled-up performance numbers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub request_count: u64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub success_rate: f64,
    pub error_count: u64,
    pub task_count: u64,
    pub avg_task_duration_sec: f64,
}

/// The full health document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub uptime_sec: u64,
    pub resource_usage: ResourceUsage,
    pub agent_capacity: AgentCapacity,
    pub performance_metrics: PerformanceReport,
}

#[derive(Default)]
struct MetricsInner {
    request_count: u64,
    total_latency_ms: f64,
    latencies_ms: VecDeque<f64>,
    success_count: u64,
    error_count: u64,
    task_count: u64,
    total_task_duration_sec: f64,
}

impl MetricsInner {
    fn percentile(&self, fraction: f64) -> f64 {
        if self.latencies_ms.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.latencies_ms.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let index = ((sorted.len() as f64) * fraction) as usize;
        sorted[index.min(sorted.len() - 1)]
    }

    fn success_rate(&self) -> f64 {
        let total = self.success_count + self.error_count;
        if total == 0 {
            return 1.0;
        }
        self.success_count as f64 / total as f64
    }
}

/// Collects metrics and builds health reports
pub struct HealthMonitor {
    started: Instant,
    metrics: Mutex<MetricsInner>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            metrics: Mutex::new(MetricsInner::default()),
        }
    }

    /// Record one external request with its latency
    pub fn record_request(&self, latency_ms: f64, success: bool) {
        let mut metrics = self.metrics.lock().expect("metrics lock poisoned");
        metrics.request_count += 1;
        metrics.total_latency_ms += latency_ms;
        metrics.latencies_ms.push_back(latency_ms);
        if metrics.latencies_ms.len() > LATENCY_WINDOW {
            metrics.latencies_ms.pop_front();
        }
        if success {
            metrics.success_count += 1;
        } else {
            metrics.error_count += 1;
        }
    }

    /// Record one completed background task
    pub fn record_task(&self, duration_sec: f64) {
        let mut metrics = self.metrics.lock().expect("metrics lock poisoned");
        metrics.task_count += 1;
        metrics.total_task_duration_sec += duration_sec;
    }

    /// Assemble the health document given current executor capacity
    pub fn report(&self, capacity: AgentCapacity) -> HealthReport {
        let metrics = self.metrics.lock().expect("metrics lock poisoned");

        let performance = PerformanceReport {
            request_count: metrics.request_count,
            avg_latency_ms: if metrics.request_count == 0 {
                0.0
            } else {
                metrics.total_latency_ms / metrics.request_count as f64
            },
            p95_latency_ms: metrics.percentile(0.95),
            p99_latency_ms: metrics.percentile(0.99),
            success_rate: metrics.success_rate(),
            error_count: metrics.error_count,
            task_count: metrics.task_count,
            avg_task_duration_sec: if metrics.task_count == 0 {
                0.0
            } else {
                metrics.total_task_duration_sec / metrics.task_count as f64
            },
        };

        let status = if capacity.available == 0 {
            HealthStatus::AtCapacity
        } else if performance.success_rate < 0.9 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthReport {
            status,
            uptime_sec: self.started.elapsed().as_secs(),
            resource_usage: ResourceUsage {
                memory_mb: resident_memory_mb().unwrap_or(0.0),
                cpu_percent: 0.0,
                threads: std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1),
                active_tasks: capacity.active,
            },
            agent_capacity: capacity,
            performance_metrics: performance,
        }
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Resident set size in megabytes, when the platform exposes it
#[cfg(target_os = "linux")]
fn resident_memory_mb() -> Option<f64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: f64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / 1024.0)
}

#[cfg(not(target_os = "linux"))]
fn resident_memory_mb() -> Option<f64> {
    None
}
