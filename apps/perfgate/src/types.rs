use crate::config::ScenarioConfig;
use crate::loadgen::LoadSummary;
use crate::sampler::SamplerReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// p50/p95/p99 bundle reported by latency-shaped metrics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PercentileSet {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

impl PercentileSet {
    pub fn is_finite(&self) -> bool {
        self.p50.is_finite() && self.p95.is_finite() && self.p99.is_finite()
    }
}

/// One timestamped observation of a single metric.
///
/// `elapsed_ms` is measured on the monotonic clock from the sampler's start and
/// is the ordering key; `timestamp` is derived from it so the two never disagree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub metric: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentiles: Option<PercentileSet>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricSeries {
    pub metric: String,
    pub samples: Vec<Sample>,
    /// Sampling attempts that failed and were recorded as gaps.
    pub misses: u64,
}

impl MetricSeries {
    pub fn new(metric: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            samples: Vec::new(),
            misses: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatSummary {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    /// Percentile-of-percentiles over the run's periodic snapshots. This is an
    /// approximation of tail behaviour; per-request latencies are not retained.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentiles: Option<PercentileSet>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AggregateStat {
    /// Not enough samples to say anything. Never a zero.
    NoData { samples: usize },
    Summary(StatSummary),
}

impl AggregateStat {
    pub fn count(&self) -> usize {
        match self {
            AggregateStat::NoData { samples } => *samples,
            AggregateStat::Summary(summary) => summary.count,
        }
    }

    pub fn is_no_data(&self) -> bool {
        matches!(self, AggregateStat::NoData { .. })
    }

    pub fn statistic(&self, statistic: Statistic) -> Option<f64> {
        let AggregateStat::Summary(summary) = self else {
            return None;
        };
        match statistic {
            Statistic::Mean => Some(summary.mean),
            Statistic::Min => Some(summary.min),
            Statistic::Max => Some(summary.max),
            Statistic::P50 => summary.percentiles.map(|set| set.p50),
            Statistic::P95 => summary.percentiles.map(|set| set.p95),
            Statistic::P99 => summary.percentiles.map(|set| set.p99),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Statistic {
    #[default]
    Mean,
    Min,
    Max,
    P50,
    P95,
    P99,
}

impl Statistic {
    pub fn needs_percentiles(self) -> bool {
        matches!(self, Statistic::P50 | Statistic::P95 | Statistic::P99)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Statistic::Mean => "mean",
            Statistic::Min => "min",
            Statistic::Max => "max",
            Statistic::P50 => "p50",
            Statistic::P95 => "p95",
            Statistic::P99 => "p99",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = ">=")]
    AtLeast,
    #[serde(rename = "<=")]
    AtMost,
}

impl Comparison {
    pub fn higher_is_better(self) -> bool {
        matches!(self, Comparison::AtLeast)
    }

    pub fn satisfied(self, observed: f64, target: f64) -> bool {
        match self {
            Comparison::AtLeast => observed >= target,
            Comparison::AtMost => observed <= target,
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Comparison::AtLeast => f.write_str(">="),
            Comparison::AtMost => f.write_str("<="),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSpec {
    pub target: f64,
    pub comparison: Comparison,
    /// Relative shortfall (fraction of `target`) still graded as WARN.
    #[serde(default)]
    pub warn_tolerance: f64,
    #[serde(default)]
    pub statistic: Statistic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grade {
    Pass,
    Warn,
    Fail,
    NoData,
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Grade::Pass => "PASS",
            Grade::Warn => "WARN",
            Grade::Fail => "FAIL",
            Grade::NoData => "NO DATA",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub metric: String,
    pub observed: AggregateStat,
    /// The statistic named by `spec.statistic`, when there was data for it.
    pub observed_value: Option<f64>,
    pub spec: ThresholdSpec,
    pub grade: Grade,
    /// Relative distance from the target; positive means the target was missed.
    pub shortfall: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    ThresholdMiss,
    TargetUnreachable,
    Degradation,
    Regression,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BottleneckFinding {
    pub metric: String,
    pub kind: FindingKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade: Option<Grade>,
    pub observed: Option<f64>,
    pub target: Option<f64>,
    pub shortfall: f64,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Degradation {
    pub metric: String,
    pub before: f64,
    pub after: f64,
    /// Growth as a fraction of `before`.
    pub change: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Stable,
    Degrading,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Regression {
    pub metric: String,
    pub statistic: Statistic,
    pub baseline: f64,
    pub current: f64,
    pub change: f64,
    pub trend: Trend,
    pub regressed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Terminated by the harness during cleanup.
    Stopped,
    /// Exited on its own while the harness was watching it.
    Died,
    /// Killed because it never became ready.
    StartupFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessExitInfo {
    pub pid: Option<u32>,
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub reason: ExitReason,
    pub at: DateTime<Utc>,
}

impl fmt::Display for ProcessExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pid {
            Some(pid) => write!(f, "pid {pid}")?,
            None => f.write_str("process")?,
        }
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, " exited with code {code}"),
            (None, Some(signal)) => write!(f, " terminated by signal {signal}"),
            (None, None) => f.write_str(" is gone"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Starting,
    WarmingUp,
    Running,
    Finalizing,
    Done,
    Aborted,
}

impl RunState {
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Idle, Starting)
            | (Starting, WarmingUp)
            | (WarmingUp, Running)
            | (Running, Finalizing)
            | (Finalizing, Done) => true,
            (Idle, Aborted) | (Done, _) | (Aborted, _) => false,
            (_, Aborted) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Aborted)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunState::Idle => "idle",
            RunState::Starting => "starting",
            RunState::WarmingUp => "warming_up",
            RunState::Running => "running",
            RunState::Finalizing => "finalizing",
            RunState::Done => "done",
            RunState::Aborted => "aborted",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEnd {
    DurationElapsed,
    /// The hard wall-clock ceiling fired while load and sampling were winding down.
    HardTimeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    StartupFailed { reason: String },
    TargetDied { exit: ProcessExitInfo },
    TargetUnreachable { metric: String, consecutive_misses: u32 },
    InvalidSetup { reason: String },
    Cancelled,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::StartupFailed { reason } => f.write_str(reason),
            AbortReason::TargetDied { exit } => write!(f, "target died ({exit})"),
            AbortReason::TargetUnreachable {
                metric,
                consecutive_misses,
            } => write!(
                f,
                "target unreachable ({consecutive_misses} consecutive misses sampling {metric})"
            ),
            AbortReason::InvalidSetup { reason } => write!(f, "invalid setup: {reason}"),
            AbortReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed { end: RunEnd },
    Aborted { reason: AbortReason },
}

impl RunOutcome {
    pub fn is_aborted(&self) -> bool {
        matches!(self, RunOutcome::Aborted { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallGrade {
    Pass,
    Warn,
    Fail,
    NoData,
    Aborted,
}

impl OverallGrade {
    pub fn is_success(self) -> bool {
        matches!(self, OverallGrade::Pass | OverallGrade::Warn)
    }
}

impl fmt::Display for OverallGrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OverallGrade::Pass => "PASS",
            OverallGrade::Warn => "WARN",
            OverallGrade::Fail => "FAIL",
            OverallGrade::NoData => "NO DATA",
            OverallGrade::Aborted => "ABORTED",
        };
        f.write_str(label)
    }
}

/// Everything one scenario run produced. Written once, never amended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub run_id: Uuid,
    pub scenario: ScenarioConfig,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    /// Set when the run ended before its measured window completed.
    pub partial: bool,
    pub grade: OverallGrade,
    pub verdicts: Vec<Verdict>,
    pub bottlenecks: Vec<BottleneckFinding>,
    pub stats: BTreeMap<String, AggregateStat>,
    pub series: BTreeMap<String, MetricSeries>,
    #[serde(default)]
    pub degradations: Vec<Degradation>,
    #[serde(default)]
    pub regressions: Vec<Regression>,
    /// Load during the measured window; absent when load never started.
    pub load: Option<LoadSummary>,
    pub sampler: SamplerReport,
    pub process_exit: Option<ProcessExitInfo>,
    pub state_trace: Vec<RunState>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aborted_is_reachable_from_every_active_state() {
        for state in [
            RunState::Starting,
            RunState::WarmingUp,
            RunState::Running,
            RunState::Finalizing,
        ] {
            assert!(state.can_transition_to(RunState::Aborted), "{state}");
        }
        assert!(!RunState::Idle.can_transition_to(RunState::Aborted));
        assert!(!RunState::Done.can_transition_to(RunState::Aborted));
    }

    #[test]
    fn happy_path_transitions_are_linear() {
        assert!(RunState::Idle.can_transition_to(RunState::Starting));
        assert!(!RunState::Idle.can_transition_to(RunState::Running));
        assert!(!RunState::Running.can_transition_to(RunState::WarmingUp));
        assert!(RunState::Finalizing.can_transition_to(RunState::Done));
    }

    #[test]
    fn comparison_uses_operator_spelling_on_the_wire() {
        let spec: ThresholdSpec =
            serde_json::from_str(r#"{"target": 512, "comparison": "<="}"#).unwrap();
        assert_eq!(spec.comparison, Comparison::AtMost);
        assert_eq!(spec.statistic, Statistic::Mean);
        assert_eq!(spec.warn_tolerance, 0.0);

        let bad = serde_json::from_str::<ThresholdSpec>(r#"{"target": 1, "comparison": "=="}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn no_data_has_no_statistics() {
        let stat = AggregateStat::NoData { samples: 2 };
        assert_eq!(stat.statistic(Statistic::Mean), None);
        assert_eq!(stat.count(), 2);
    }
}
