//! Performance Memory
//!
//! Rolling per-(node, task-type) history of request outcomes. The rolling
//! average of actual durations becomes the `estimated_duration` used for
//! future scoring of that pair, so predictions converge toward observed
//! behavior. A node whose recent window degrades against its own baseline
//! is reported as degraded: scored lower, never removed.

use std::collections::VecDeque;

use dashmap::DashMap;

use crate::analysis::TaskType;

/// Default bound on retained records per (node, task-type) key
pub const DEFAULT_WINDOW: usize = 50;

/// How many recent records form the degradation window
const RECENT_WINDOW: usize = 8;

/// One recorded request outcome
#[derive(Clone, Debug)]
pub struct PerformanceRecord {
    /// Node or coordinator identifier
    pub target: String,
    /// Task type of the request
    pub task_type: TaskType,
    /// Request priority (1-10)
    pub priority: u8,
    /// Duration predicted at routing time
    pub predicted_ms: f64,
    /// Observed duration
    pub actual_ms: f64,
    /// Whether the request succeeded
    pub success: bool,
}

/// Summary statistics for one (node, task-type) key
#[derive(Clone, Debug)]
pub struct KeyStats {
    /// Number of retained records
    pub samples: usize,
    /// Rolling average duration over retained records
    pub avg_duration_ms: f64,
    /// Success rate over retained records
    pub success_rate: f64,
}

/// Bounded rolling performance history
pub struct PerformanceMemory {
    histories: DashMap<(String, TaskType), VecDeque<PerformanceRecord>>,
    window: usize,
}

impl PerformanceMemory {
    /// Create with the default window size
    #[must_use]
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    /// Create with an explicit most-recent-N bound
    #[must_use]
    pub fn with_window(window: usize) -> Self {
        Self {
            histories: DashMap::new(),
            window: window.max(1),
        }
    }

    /// Append an outcome, evicting the oldest record past the window
    pub fn record(&self, record: PerformanceRecord) {
        let key = (record.target.clone(), record.task_type);
        let mut history = self.histories.entry(key).or_default();
        history.push_back(record);
        while history.len() > self.window {
            history.pop_front();
        }
    }

    /// Rolling-average duration for a (target, task-type) pair
    ///
    /// `None` until at least one sample exists.
    #[must_use]
    pub fn estimated_duration(&self, target: &str, task_type: TaskType) -> Option<f64> {
        self.stats(target, task_type).map(|s| s.avg_duration_ms)
    }

    /// Full stats for a (target, task-type) pair
    #[must_use]
    pub fn stats(&self, target: &str, task_type: TaskType) -> Option<KeyStats> {
        let history = self.histories.get(&(target.to_string(), task_type))?;
        if history.is_empty() {
            return None;
        }
        Some(summarize(history.iter()))
    }

    /// Degradation factor in `(0, 1]` for a target's recent behavior
    ///
    /// Compares the most recent records against the key's full retained
    /// baseline. Materially worse recent success rate or latency yields a
    /// factor below 1.0; healthy targets get exactly 1.0. This only ever
    /// deprioritizes; removal is the health monitor's job.
    #[must_use]
    pub fn degradation_factor(&self, target: &str, task_type: TaskType) -> f64 {
        let Some(history) = self.histories.get(&(target.to_string(), task_type)) else {
            return 1.0;
        };
        if history.len() < RECENT_WINDOW * 2 {
            // Not enough history to call a trend.
            return 1.0;
        }

        let baseline = summarize(history.iter());
        let recent = summarize(history.iter().skip(history.len() - RECENT_WINDOW));

        let mut factor = 1.0;
        if recent.success_rate < baseline.success_rate * 0.8 {
            factor *= 0.5;
        }
        if baseline.avg_duration_ms > 0.0 && recent.avg_duration_ms > baseline.avg_duration_ms * 1.5
        {
            factor *= 0.7;
        }
        factor
    }

    /// The target with the best history for a task type
    ///
    /// Best = lowest average duration among targets with enough samples
    /// and a usable success rate.
    #[must_use]
    pub fn best_target_for(&self, task_type: TaskType) -> Option<String> {
        const MIN_SAMPLES: usize = 3;

        self.histories
            .iter()
            .filter(|entry| entry.key().1 == task_type && entry.value().len() >= MIN_SAMPLES)
            .filter_map(|entry| {
                let stats = summarize(entry.value().iter());
                (stats.success_rate >= 0.5).then_some((entry.key().0.clone(), stats.avg_duration_ms))
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(target, _)| target)
    }

    /// Total retained records across all keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.histories.iter().map(|e| e.value().len()).sum()
    }

    /// Whether no records are retained
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PerformanceMemory {
    fn default() -> Self {
        Self::new()
    }
}

fn summarize<'a, I>(records: I) -> KeyStats
where
    I: Iterator<Item = &'a PerformanceRecord>,
{
    let mut samples = 0usize;
    let mut duration_sum = 0.0;
    let mut successes = 0usize;
    for record in records {
        samples += 1;
        duration_sum += record.actual_ms;
        if record.success {
            successes += 1;
        }
    }
    KeyStats {
        samples,
        avg_duration_ms: if samples > 0 {
            duration_sum / samples as f64
        } else {
            0.0
        },
        success_rate: if samples > 0 {
            successes as f64 / samples as f64
        } else {
            1.0
        },
    }
}
