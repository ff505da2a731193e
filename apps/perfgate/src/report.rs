use crate::types::{AggregateStat, BenchmarkResult, RunOutcome, Verdict};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io::Write as _;
use std::path::Path;

/// Stats of a previous run, keyed by scenario name then metric.
pub type Baseline = BTreeMap<String, BTreeMap<String, AggregateStat>>;

/// Write results as JSON: one object for a single scenario, an array otherwise.
pub fn write_json(path: &Path, results: &[BenchmarkResult]) -> Result<()> {
    let body = match results {
        [single] => serde_json::to_vec_pretty(single),
        many => serde_json::to_vec_pretty(many),
    }
    .context("failed to serialize results")?;
    write_atomic(path, &body)
}

pub fn write_markdown(path: &Path, results: &[BenchmarkResult]) -> Result<()> {
    write_atomic(path, markdown(results).as_bytes())
}

fn write_atomic(path: &Path, body: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create temp file in {}", parent.display()))?;
    tmp.write_all(body)
        .with_context(|| format!("failed to write {}", path.display()))?;
    tmp.persist(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[derive(Deserialize)]
struct BaselineScenario {
    name: String,
}

#[derive(Deserialize)]
struct BaselineEntry {
    scenario: BaselineScenario,
    #[serde(default)]
    stats: BTreeMap<String, AggregateStat>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BaselineFile {
    Many(Vec<BaselineEntry>),
    One(BaselineEntry),
}

/// Read a previous `--output` file for regression comparison.
pub fn load_baseline(path: &Path) -> Result<Baseline> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read baseline {}", path.display()))?;
    let parsed: BaselineFile = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse baseline {}", path.display()))?;
    let entries = match parsed {
        BaselineFile::Many(entries) => entries,
        BaselineFile::One(entry) => vec![entry],
    };
    Ok(entries
        .into_iter()
        .map(|entry| (entry.scenario.name, entry.stats))
        .collect())
}

fn fmt_value(value: Option<f64>) -> String {
    value
        .map(|v| format!("{v:.3}"))
        .unwrap_or_else(|| "-".to_string())
}

fn fmt_target(verdict: &Verdict) -> String {
    format!(
        "{} {} ({})",
        verdict.spec.comparison,
        verdict.spec.target,
        verdict.spec.statistic.as_str()
    )
}

/// Human-readable table for stdout. Aborted runs get an explicit marker row.
pub fn summary_table(results: &[BenchmarkResult]) -> String {
    let mut rows: Vec<[String; 5]> = vec![[
        "SCENARIO".to_string(),
        "METRIC".to_string(),
        "OBSERVED".to_string(),
        "TARGET".to_string(),
        "GRADE".to_string(),
    ]];
    for result in results {
        let name = result.scenario.name.clone();
        if let RunOutcome::Aborted { reason } = &result.outcome {
            rows.push([
                name.clone(),
                format!("ABORTED: {reason}"),
                String::new(),
                String::new(),
                String::new(),
            ]);
        }
        for verdict in &result.verdicts {
            rows.push([
                name.clone(),
                verdict.metric.clone(),
                fmt_value(verdict.observed_value),
                fmt_target(verdict),
                verdict.grade.to_string(),
            ]);
        }
        rows.push([
            name,
            "overall".to_string(),
            String::new(),
            String::new(),
            result.grade.to_string(),
        ]);
    }

    let mut widths = [0usize; 5];
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }
    let mut out = String::new();
    for row in &rows {
        let mut line = String::new();
        for (idx, (cell, width)) in row.iter().zip(widths).enumerate() {
            if idx > 0 {
                line.push_str("  ");
            }
            let _ = write!(line, "{cell:<width$}");
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

pub fn markdown(results: &[BenchmarkResult]) -> String {
    let mut report = String::new();
    report.push_str("# Benchmark Report\n");
    for result in results {
        let scenario = &result.scenario;
        report.push_str(&format!("\n## {}\n\n", scenario.name));
        if let Some(description) = &scenario.description {
            report.push_str(&format!("{description}\n\n"));
        }
        report.push_str(&format!(
            "- Run id: `{}`\n- Started (UTC): {}\n- Finished (UTC): {}\n- Warmup / run: `{}` ms / `{}` ms (sample every `{}` ms)\n- Concurrency: `{}`\n- Overall: **{}**{}\n",
            result.run_id,
            result.started_at.to_rfc3339(),
            result.finished_at.to_rfc3339(),
            scenario.warmup_ms,
            scenario.run_duration_ms,
            scenario.sample_interval_ms,
            scenario.concurrency,
            result.grade,
            if result.partial { " (partial)" } else { "" },
        ));
        if let RunOutcome::Aborted { reason } = &result.outcome {
            report.push_str(&format!("- ABORTED: {reason}\n"));
        }
        if let Some(exit) = &result.process_exit {
            report.push_str(&format!("- Target process: {exit} ({:?})\n", exit.reason));
        }

        report.push_str("\n### Thresholds\n\n");
        report.push_str("| Metric | Target | Samples | Result | Grade |\n");
        report.push_str("| --- | --- | --- | --- | --- |\n");
        for verdict in &result.verdicts {
            report.push_str(&format!(
                "| {} | {} | {} | {} | {} |\n",
                verdict.metric,
                fmt_target(verdict),
                verdict.observed.count(),
                fmt_value(verdict.observed_value),
                verdict.grade,
            ));
        }

        report.push_str("\n### Bottlenecks\n\n");
        if result.bottlenecks.is_empty() {
            report.push_str("- None\n");
        }
        for (rank, finding) in result.bottlenecks.iter().enumerate() {
            report.push_str(&format!(
                "{}. `{}` ({:?}): {}\n",
                rank + 1,
                finding.metric,
                finding.kind,
                finding.detail
            ));
        }

        if !result.regressions.is_empty() {
            report.push_str("\n### Baseline comparison\n\n");
            report.push_str("| Metric | Baseline | Current | Change | Trend |\n");
            report.push_str("| --- | --- | --- | --- | --- |\n");
            for regression in &result.regressions {
                report.push_str(&format!(
                    "| {} | {:.3} | {:.3} | {:+.1}% | {:?}{} |\n",
                    regression.metric,
                    regression.baseline,
                    regression.current,
                    regression.change * 100.0,
                    regression.trend,
                    if regression.regressed { " (regressed)" } else { "" },
                ));
            }
        }

        if let Some(load) = &result.load {
            report.push_str(&format!(
                "\n### Load\n\n- Requests: {} issued, {} ok, {} failed ({:.2}% errors)\n- Throughput: {:.1} req/s over {} ms\n- Workers stopped early: {} of {}\n",
                load.issued,
                load.succeeded,
                load.failed,
                load.error_rate * 100.0,
                load.throughput_per_sec,
                load.elapsed_ms,
                load.workers_stopped_early,
                load.workers,
            ));
        }
        report.push_str(&format!(
            "- Sampler: {} ticks, {} samples, {} misses\n",
            result.sampler.ticks,
            result.sampler.samples,
            result.sampler.misses.values().sum::<u64>(),
        ));
    }
    report.push_str("\n## Notes\n\n");
    report.push_str(
        "- Percentiles are percentile-of-percentiles over periodic snapshots, an approximation of tail latency.\n",
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScenarioFile;
    use crate::evaluate::{evaluate, find_bottlenecks};
    use crate::sampler::SamplerReport;
    use crate::types::{
        AbortReason, Comparison, OverallGrade, RunEnd, RunState, StatSummary, Statistic,
        ThresholdSpec,
    };
    use chrono::Utc;

    fn scenario(name: &str) -> crate::config::ScenarioConfig {
        let raw = format!(
            r#"
[[scenario]]
name = "{name}"
run_duration_ms = 1000
[[scenario.metric]]
name = "rss_mb"
source = "http"
path = "/metrics"
field = "rss_mb"
[scenario.targets.rss_mb]
target = 512
comparison = "<="
"#
        );
        ScenarioFile::from_toml_str(&raw).unwrap().scenarios.remove(0)
    }

    fn result(name: &str, outcome: RunOutcome, observed: f64) -> BenchmarkResult {
        let stat = AggregateStat::Summary(StatSummary {
            count: 4,
            mean: observed,
            min: observed,
            max: observed,
            percentiles: None,
        });
        let spec = ThresholdSpec {
            target: 512.0,
            comparison: Comparison::AtMost,
            warn_tolerance: 0.0,
            statistic: Statistic::Mean,
        };
        let verdicts = vec![evaluate("rss_mb", &stat, &spec)];
        let grade = crate::evaluate::overall_grade(&outcome, &verdicts);
        BenchmarkResult {
            run_id: uuid::Uuid::new_v4(),
            scenario: scenario(name),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            partial: outcome.is_aborted(),
            outcome,
            grade,
            bottlenecks: find_bottlenecks(&verdicts),
            verdicts,
            stats: BTreeMap::from([("rss_mb".to_string(), stat)]),
            series: BTreeMap::new(),
            degradations: Vec::new(),
            regressions: Vec::new(),
            load: None,
            sampler: SamplerReport::default(),
            process_exit: None,
            state_trace: vec![RunState::Idle, RunState::Starting],
        }
    }

    fn completed() -> RunOutcome {
        RunOutcome::Completed {
            end: RunEnd::DurationElapsed,
        }
    }

    #[test]
    fn summary_marks_aborted_runs() {
        let results = vec![
            result("steady", completed(), 612.0),
            result(
                "broken",
                RunOutcome::Aborted {
                    reason: AbortReason::StartupFailed {
                        reason: "readiness timeout".to_string(),
                    },
                },
                100.0,
            ),
        ];
        let table = summary_table(&results);
        assert!(table.contains("ABORTED: readiness timeout"), "{table}");
        assert!(table.contains("FAIL"));
        let overall: Vec<&str> = table.lines().filter(|l| l.contains("overall")).collect();
        assert_eq!(overall.len(), 2);
        assert!(overall[1].ends_with("ABORTED"));
    }

    #[test]
    fn single_result_is_written_as_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/result.json");
        write_json(&path, &[result("steady", completed(), 400.0)]).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert!(value.is_object());
        assert_eq!(value["grade"], "pass");
        assert_eq!(value["scenario"]["name"], "steady");

        write_json(
            &path,
            &[
                result("a", completed(), 400.0),
                result("b", completed(), 400.0),
            ],
        )
        .unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value.as_array().unwrap().len(), 2);
    }

    #[test]
    fn baseline_reads_back_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("baseline.json");
        write_json(&path, &[result("steady", completed(), 400.0)]).unwrap();
        let baseline = load_baseline(&path).unwrap();
        assert_eq!(
            baseline["steady"]["rss_mb"].statistic(Statistic::Mean),
            Some(400.0)
        );

        write_json(
            &path,
            &[
                result("a", completed(), 1.0),
                result("b", completed(), 2.0),
            ],
        )
        .unwrap();
        let baseline = load_baseline(&path).unwrap();
        assert_eq!(baseline.len(), 2);
    }

    #[test]
    fn markdown_lists_bottlenecks() {
        let report = markdown(&[result("steady", completed(), 612.0)]);
        assert!(report.contains("| rss_mb | <= 512 (mean) | 4 | 612.000 | FAIL |"), "{report}");
        assert!(report.contains("1. `rss_mb`"));
        assert!(report.contains(&format!("Overall: **{}**", OverallGrade::Fail)));
    }
}
