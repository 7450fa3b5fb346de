use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::{TaskId, WorkerId};

/// Bookkeeping for one worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerInfo {
    pub id: WorkerId,
    /// False while the worker thread is still starting.
    pub ready: bool,
    pub busy: bool,
    pub current_task: Option<TaskId>,
    pub tasks_completed: u64,
    pub restart_count: u32,
    pub last_used: DateTime<Utc>,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PoolStats {
    pub total_workers: usize,
    pub busy_workers: usize,
    pub idle_workers: usize,
    pub queued_tasks: usize,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub timed_out_tasks: u64,
    pub crashed_tasks: u64,
    pub restarts: u64,
    pub avg_task_duration_ms: f64,
    /// Resident memory of the process, where the platform exposes it.
    pub memory_bytes: Option<u64>,
    pub workers: Vec<WorkerInfo>,
}

/// Sliding window of recent task durations.
#[derive(Debug)]
pub(crate) struct DurationHistory {
    samples: VecDeque<Duration>,
    capacity: usize,
}

impl DurationHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, duration: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(duration);
    }

    pub fn average_ms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let total: f64 = self.samples.iter().map(|d| d.as_secs_f64() * 1000.0).sum();
        total / self.samples.len() as f64
    }
}

/// Resident set size of the current process.
#[cfg(target_os = "linux")]
pub(crate) fn resident_memory_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss(&status)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn resident_memory_bytes() -> Option<u64> {
    None
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_history_is_bounded() {
        let mut history = DurationHistory::new(2);
        assert_eq!(history.average_ms(), 0.0);

        history.record(Duration::from_millis(100));
        history.record(Duration::from_millis(200));
        history.record(Duration::from_millis(400));
        assert!((history.average_ms() - 300.0).abs() < 1e-6);
    }

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\trelocator\nVmPeak:\t  2048 kB\nVmRSS:\t    1234 kB\n";
        assert_eq!(parse_vm_rss(status), Some(1234 * 1024));
        assert_eq!(parse_vm_rss("Name:\tx\n"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_resident_memory_available_on_linux() {
        assert!(resident_memory_bytes().unwrap_or(0) > 0);
    }
}
