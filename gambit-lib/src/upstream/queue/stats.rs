use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

use serde::Serialize;
use serde::ser::SerializeStruct;

use crate::upstream::window::Window;

/// Number of task durations kept for the latency figures
const LATENCY_SAMPLES: usize = 256;

/// A map of upstream names to their [`UpstreamStats`]
#[derive(Debug, Default, Serialize)]
pub struct UpstreamStatsMap(BTreeMap<String, UpstreamStats>);

impl UpstreamStatsMap {
    /// Upstreams ordered by number of tasks, busiest first
    #[must_use]
    pub fn sorted(&self) -> Vec<(String, UpstreamStats)> {
        let mut sorted: Vec<_> = self.0.clone().into_iter().collect();
        sorted.sort_by_key(|(_, stats)| std::cmp::Reverse(stats.total_tasks));
        sorted
    }

    /// Stats of one upstream
    #[must_use]
    pub fn get(&self, upstream: &str) -> Option<&UpstreamStats> {
        self.0.get(upstream)
    }
}

impl From<BTreeMap<String, UpstreamStats>> for UpstreamStatsMap {
    fn from(value: BTreeMap<String, UpstreamStats>) -> Self {
        Self(value)
    }
}

impl FromIterator<(String, UpstreamStats)> for UpstreamStatsMap {
    fn from_iter<I: IntoIterator<Item = (String, UpstreamStats)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Outcome and latency record of the tasks run by one
/// [`UpstreamQueue`](crate::upstream::UpstreamQueue)
#[derive(Debug, Clone)]
pub struct UpstreamStats {
    /// Total number of finished tasks
    pub total_tasks: u64,
    /// Number of tasks that returned a success value
    pub succeeded: u64,
    /// Number of tasks that failed, throttled ones included
    pub failed: u64,
    /// Number of failures carrying a throttling signal
    pub throttled: u64,
    /// When the last task succeeded
    pub last_success: Option<Instant>,
    /// When the provider last throttled us
    pub last_throttle: Option<Instant>,
    /// Durations of the most recent tasks
    pub task_times: Window<Duration>,
}

impl Default for UpstreamStats {
    fn default() -> Self {
        Self {
            total_tasks: 0,
            succeeded: 0,
            failed: 0,
            throttled: 0,
            last_success: None,
            last_throttle: None,
            task_times: Window::new(LATENCY_SAMPLES),
        }
    }
}

impl UpstreamStats {
    /// Record a successful task
    pub fn record_success(&mut self, task_time: Duration) {
        self.total_tasks += 1;
        self.succeeded += 1;
        self.last_success = Some(Instant::now());
        self.task_times.push(task_time);
    }

    /// Record a failed task
    pub fn record_failure(&mut self, task_time: Duration, throttled: bool) {
        self.total_tasks += 1;
        self.failed += 1;
        if throttled {
            self.throttled += 1;
            self.last_throttle = Some(Instant::now());
        }
        self.task_times.push(task_time);
    }

    /// Get median task time
    #[must_use]
    pub fn median_task_time(&self) -> Option<Duration> {
        if self.task_times.is_empty() {
            return None;
        }

        let mut times: Vec<_> = self.task_times.iter().copied().collect();
        times.sort();
        let mid = times.len() / 2;

        if times.len().is_multiple_of(2) {
            Some((times[mid - 1] + times[mid]) / 2)
        } else {
            Some(times[mid])
        }
    }

    /// Get average task time
    #[must_use]
    pub fn average_task_time(&self) -> Option<Duration> {
        if self.task_times.is_empty() {
            return None;
        }

        let total: Duration = self.task_times.iter().sum();
        #[allow(clippy::cast_possible_truncation)]
        Some(total / (self.task_times.len() as u32))
    }

    /// Get the current success rate (0.0 to 1.0)
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.total_tasks == 0 {
            1.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            let success_rate = self.succeeded as f64 / self.total_tasks as f64;
            success_rate
        }
    }

    /// Get human-readable summary of the stats
    #[must_use]
    pub fn summary(&self) -> String {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let success_pct = (self.success_rate() * 100.0) as u64;

        let avg_time = self
            .average_task_time()
            .map_or_else(|| "N/A".to_string(), |d| format!("{}ms", d.as_millis()));

        format!(
            "{} tasks ({}% success, {} throttled), avg: {}",
            self.total_tasks, success_pct, self.throttled, avg_time
        )
    }
}

impl Serialize for UpstreamStats {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let median_task_time_ms = self.median_task_time().map(|d| d.as_millis());
        let average_task_time_ms = self.average_task_time().map(|d| d.as_millis());

        let mut s = serializer.serialize_struct("UpstreamStats", 7)?;
        s.serialize_field("total_tasks", &self.total_tasks)?;
        s.serialize_field("succeeded", &self.succeeded)?;
        s.serialize_field("failed", &self.failed)?;
        s.serialize_field("throttled", &self.throttled)?;
        s.serialize_field("success_rate", &self.success_rate())?;
        s.serialize_field("median_task_time_ms", &median_task_time_ms)?;
        s.serialize_field("average_task_time_ms", &average_task_time_ms)?;
        s.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_rate() {
        let mut stats = UpstreamStats::default();
        assert!((stats.success_rate() - 1.0).abs() < f64::EPSILON);

        stats.record_success(Duration::from_millis(100));
        stats.record_failure(Duration::from_millis(20), true);
        assert!((stats.success_rate() - 0.5).abs() < f64::EPSILON);
        assert_eq!(stats.throttled, 1);
        assert!(stats.last_throttle.is_some());
    }

    #[test]
    fn test_median_and_average() {
        let mut stats = UpstreamStats::default();
        for ms in [100, 300, 200] {
            stats.record_success(Duration::from_millis(ms));
        }
        assert_eq!(stats.median_task_time(), Some(Duration::from_millis(200)));
        assert_eq!(stats.average_task_time(), Some(Duration::from_millis(200)));

        stats.record_failure(Duration::from_millis(400), false);
        assert_eq!(stats.median_task_time(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_latency_samples_are_bounded() {
        let mut stats = UpstreamStats::default();
        for _ in 0..(LATENCY_SAMPLES + 10) {
            stats.record_success(Duration::from_millis(1));
        }
        assert_eq!(stats.task_times.len(), LATENCY_SAMPLES);
        assert_eq!(stats.total_tasks, LATENCY_SAMPLES as u64 + 10);
    }

    #[test]
    fn test_summary_formatting() {
        let mut stats = UpstreamStats::default();
        stats.record_success(Duration::from_millis(150));
        stats.record_failure(Duration::from_millis(200), true);

        let summary = stats.summary();
        assert!(summary.contains("2 tasks"));
        assert!(summary.contains("50% success"));
        assert!(summary.contains("1 throttled"));
        assert!(summary.contains("175ms"));
    }

    #[test]
    fn test_serialize_shape() {
        let mut stats = UpstreamStats::default();
        stats.record_success(Duration::from_millis(10));
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["succeeded"], 1);
        assert_eq!(json["median_task_time_ms"], 10);
    }
}
