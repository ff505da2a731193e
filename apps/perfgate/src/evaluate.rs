use crate::types::{
    AggregateStat, BottleneckFinding, Comparison, Degradation, FindingKind, Grade, OverallGrade,
    Regression, RunOutcome, ThresholdSpec, Trend, Verdict,
};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Relative change inside this band counts as a stable trend.
pub const TREND_BAND: f64 = 0.05;

/// Grade one aggregated metric against its threshold. Pure.
pub fn evaluate(metric: &str, stat: &AggregateStat, spec: &ThresholdSpec) -> Verdict {
    let observed_value = stat.statistic(spec.statistic);
    let Some(value) = observed_value else {
        return Verdict {
            metric: metric.to_string(),
            observed: stat.clone(),
            observed_value: None,
            spec: spec.clone(),
            grade: Grade::NoData,
            shortfall: None,
        };
    };

    let shortfall = relative_shortfall(value, spec.target, spec.comparison);
    let grade = if spec.comparison.satisfied(value, spec.target) {
        Grade::Pass
    } else if shortfall <= spec.warn_tolerance {
        Grade::Warn
    } else {
        Grade::Fail
    };

    Verdict {
        metric: metric.to_string(),
        observed: stat.clone(),
        observed_value,
        spec: spec.clone(),
        grade,
        shortfall: Some(shortfall),
    }
}

/// How far `observed` falls short of `target`, as a fraction of the target.
/// Positive means the target was missed.
pub fn relative_shortfall(observed: f64, target: f64, comparison: Comparison) -> f64 {
    match comparison {
        Comparison::AtLeast => (target - observed) / target,
        Comparison::AtMost => (observed - target) / target,
    }
}

/// Evaluate every declared target; metrics without a stat are graded `NoData`.
pub fn evaluate_all(
    stats: &BTreeMap<String, AggregateStat>,
    targets: &BTreeMap<String, ThresholdSpec>,
) -> Vec<Verdict> {
    let missing = AggregateStat::NoData { samples: 0 };
    targets
        .iter()
        .map(|(metric, spec)| evaluate(metric, stats.get(metric).unwrap_or(&missing), spec))
        .collect()
}

/// Warn/Fail verdicts as findings, furthest from target first.
pub fn find_bottlenecks(verdicts: &[Verdict]) -> Vec<BottleneckFinding> {
    let mut findings: Vec<BottleneckFinding> = verdicts
        .iter()
        .filter(|verdict| matches!(verdict.grade, Grade::Warn | Grade::Fail))
        .filter_map(|verdict| {
            let shortfall = verdict.shortfall?;
            Some(BottleneckFinding {
                metric: verdict.metric.clone(),
                kind: FindingKind::ThresholdMiss,
                grade: Some(verdict.grade),
                observed: verdict.observed_value,
                target: Some(verdict.spec.target),
                shortfall,
                detail: format!(
                    "{} {} = {:.3} vs target {} {} ({:.1}% short)",
                    verdict.metric,
                    verdict.spec.statistic.as_str(),
                    verdict.observed_value.unwrap_or_default(),
                    verdict.spec.comparison,
                    verdict.spec.target,
                    shortfall * 100.0
                ),
            })
        })
        .collect();
    rank_findings(&mut findings);
    findings
}

pub fn rank_findings(findings: &mut [BottleneckFinding]) {
    findings.sort_by(|a, b| {
        b.shortfall
            .partial_cmp(&a.shortfall)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.metric.cmp(&b.metric))
    });
}

pub fn unreachable_finding(metric: &str, consecutive_misses: u32) -> BottleneckFinding {
    BottleneckFinding {
        metric: metric.to_string(),
        kind: FindingKind::TargetUnreachable,
        grade: Some(Grade::Fail),
        observed: None,
        target: None,
        shortfall: 1.0,
        detail: format!("target unreachable: {consecutive_misses} consecutive sample misses"),
    }
}

/// A metric that stopped answering fails regardless of the samples it gave before.
pub fn fail_unreachable(verdicts: &mut [Verdict], metric: &str) {
    for verdict in verdicts.iter_mut().filter(|verdict| verdict.metric == metric) {
        verdict.grade = Grade::Fail;
    }
}

/// Compare the idle snapshot taken before load with the one taken after it.
///
/// Only lower-is-better targets are checked: once load stops, throughput-shaped
/// metrics fall to idle, while memory and latency should return to where they were.
pub fn detect_degradation(
    before: &BTreeMap<String, f64>,
    after: &BTreeMap<String, f64>,
    targets: &BTreeMap<String, ThresholdSpec>,
    threshold: f64,
) -> Vec<Degradation> {
    targets
        .iter()
        .filter(|(_, spec)| spec.comparison == Comparison::AtMost)
        .filter_map(|(metric, _)| {
            let before = *before.get(metric)?;
            let after = *after.get(metric)?;
            if before == 0.0 {
                return None;
            }
            let change = (after - before) / before.abs();
            (change > threshold).then(|| Degradation {
                metric: metric.clone(),
                before,
                after,
                change,
            })
        })
        .collect()
}

pub fn degradation_finding(degradation: &Degradation) -> BottleneckFinding {
    BottleneckFinding {
        metric: degradation.metric.clone(),
        kind: FindingKind::Degradation,
        grade: None,
        observed: Some(degradation.after),
        target: Some(degradation.before),
        shortfall: degradation.change,
        detail: format!(
            "{} went from {:.3} before load to {:.3} after (+{:.1}%)",
            degradation.metric,
            degradation.before,
            degradation.after,
            degradation.change * 100.0
        ),
    }
}

/// Compare this run's stats with a previous run of the same scenario.
/// Positive `change` is movement in the bad direction for the target's comparison.
pub fn compare_to_baseline(
    baseline: &BTreeMap<String, AggregateStat>,
    current: &BTreeMap<String, AggregateStat>,
    targets: &BTreeMap<String, ThresholdSpec>,
    threshold: f64,
) -> Vec<Regression> {
    targets
        .iter()
        .filter_map(|(metric, spec)| {
            let previous = baseline.get(metric)?.statistic(spec.statistic)?;
            let now = current.get(metric)?.statistic(spec.statistic)?;
            if previous == 0.0 {
                return None;
            }
            let raw = (now - previous) / previous.abs();
            let change = if spec.comparison.higher_is_better() {
                -raw
            } else {
                raw
            };
            let trend = if change < -TREND_BAND {
                Trend::Improving
            } else if change > TREND_BAND {
                Trend::Degrading
            } else {
                Trend::Stable
            };
            Some(Regression {
                metric: metric.clone(),
                statistic: spec.statistic,
                baseline: previous,
                current: now,
                change,
                trend,
                regressed: change > threshold,
            })
        })
        .collect()
}

pub fn regression_finding(regression: &Regression) -> BottleneckFinding {
    BottleneckFinding {
        metric: regression.metric.clone(),
        kind: FindingKind::Regression,
        grade: None,
        observed: Some(regression.current),
        target: Some(regression.baseline),
        shortfall: regression.change,
        detail: format!(
            "{} {} regressed {:.1}% against baseline ({:.3} -> {:.3})",
            regression.metric,
            regression.statistic.as_str(),
            regression.change * 100.0,
            regression.baseline,
            regression.current
        ),
    }
}

pub fn overall_grade(outcome: &RunOutcome, verdicts: &[Verdict]) -> OverallGrade {
    if outcome.is_aborted() {
        return OverallGrade::Aborted;
    }
    let any = |grade: Grade| verdicts.iter().any(|verdict| verdict.grade == grade);
    if any(Grade::Fail) {
        OverallGrade::Fail
    } else if any(Grade::NoData) {
        OverallGrade::NoData
    } else if any(Grade::Warn) {
        OverallGrade::Warn
    } else {
        OverallGrade::Pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AbortReason, PercentileSet, RunEnd, Statistic, StatSummary};

    fn mean_stat(mean: f64) -> AggregateStat {
        AggregateStat::Summary(StatSummary {
            count: 10,
            mean,
            min: mean,
            max: mean,
            percentiles: None,
        })
    }

    fn spec(target: f64, comparison: Comparison, warn_tolerance: f64) -> ThresholdSpec {
        ThresholdSpec {
            target,
            comparison,
            warn_tolerance,
            statistic: Statistic::Mean,
        }
    }

    #[test]
    fn throughput_above_target_passes() {
        let verdict = evaluate(
            "tps",
            &mean_stat(1_820_000.0),
            &spec(1_500_000.0, Comparison::AtLeast, 0.0),
        );
        assert_eq!(verdict.grade, Grade::Pass);
        assert!(find_bottlenecks(&[verdict]).is_empty());
    }

    #[test]
    fn memory_over_budget_fails_with_shortfall() {
        let verdict = evaluate(
            "memory_mb",
            &mean_stat(612.0),
            &spec(512.0, Comparison::AtMost, 0.0),
        );
        assert_eq!(verdict.grade, Grade::Fail);
        let shortfall = verdict.shortfall.unwrap();
        assert!((shortfall - 0.1953125).abs() < 1e-9);

        let findings = find_bottlenecks(&[verdict]);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, FindingKind::ThresholdMiss);
        assert!((findings[0].shortfall - 0.195).abs() < 0.001);
    }

    #[test]
    fn small_miss_inside_tolerance_warns() {
        let verdict = evaluate(
            "tps",
            &mean_stat(1_450.0),
            &spec(1_500.0, Comparison::AtLeast, 0.05),
        );
        assert_eq!(verdict.grade, Grade::Warn);
        let verdict = evaluate(
            "tps",
            &mean_stat(1_400.0),
            &spec(1_500.0, Comparison::AtLeast, 0.05),
        );
        assert_eq!(verdict.grade, Grade::Fail);
    }

    #[test]
    fn no_data_is_never_pass_or_fail() {
        for comparison in [Comparison::AtLeast, Comparison::AtMost] {
            let verdict = evaluate(
                "m",
                &AggregateStat::NoData { samples: 0 },
                &spec(1.0, comparison, 1.0),
            );
            assert_eq!(verdict.grade, Grade::NoData);
            assert_eq!(verdict.shortfall, None);
        }
    }

    #[test]
    fn unreachable_metric_fails_despite_passing_samples() {
        let mut verdicts = vec![
            evaluate("tps", &mean_stat(1_800.0), &spec(1_500.0, Comparison::AtLeast, 0.0)),
            evaluate("rss_mb", &mean_stat(100.0), &spec(512.0, Comparison::AtMost, 0.0)),
        ];
        fail_unreachable(&mut verdicts, "rss_mb");
        assert_eq!(verdicts[0].grade, Grade::Pass);
        assert_eq!(verdicts[1].grade, Grade::Fail);
        assert_eq!(verdicts[1].observed_value, Some(100.0));
    }

    #[test]
    fn evaluate_is_deterministic() {
        let stat = mean_stat(97.5);
        let spec = spec(100.0, Comparison::AtLeast, 0.01);
        let first = evaluate("m", &stat, &spec);
        for _ in 0..100 {
            assert_eq!(evaluate("m", &stat, &spec), first);
        }
    }

    #[test]
    fn percentile_statistic_is_used_when_requested() {
        let stat = AggregateStat::Summary(StatSummary {
            count: 5,
            mean: 10.0,
            min: 5.0,
            max: 20.0,
            percentiles: Some(PercentileSet {
                p50: 10.0,
                p95: 45.0,
                p99: 80.0,
            }),
        });
        let spec = ThresholdSpec {
            statistic: Statistic::P99,
            ..spec(50.0, Comparison::AtMost, 0.0)
        };
        let verdict = evaluate("latency_ms", &stat, &spec);
        assert_eq!(verdict.observed_value, Some(80.0));
        assert_eq!(verdict.grade, Grade::Fail);
    }

    #[test]
    fn larger_shortfall_ranks_first() {
        let verdicts = vec![
            evaluate("small", &mean_stat(90.0), &spec(100.0, Comparison::AtLeast, 0.0)),
            evaluate("large", &mean_stat(50.0), &spec(100.0, Comparison::AtLeast, 0.0)),
            evaluate("ok", &mean_stat(150.0), &spec(100.0, Comparison::AtLeast, 0.0)),
        ];
        let findings = find_bottlenecks(&verdicts);
        let order: Vec<&str> = findings.iter().map(|f| f.metric.as_str()).collect();
        assert_eq!(order, vec!["large", "small"]);
    }

    #[test]
    fn degradation_only_flags_lower_is_better_growth() {
        let mut targets = BTreeMap::new();
        targets.insert("rss_mb".to_string(), spec(512.0, Comparison::AtMost, 0.0));
        targets.insert("tps".to_string(), spec(100.0, Comparison::AtLeast, 0.0));
        let before = BTreeMap::from([("rss_mb".to_string(), 200.0), ("tps".to_string(), 500.0)]);
        let after = BTreeMap::from([("rss_mb".to_string(), 260.0), ("tps".to_string(), 0.0)]);

        let found = detect_degradation(&before, &after, &targets, 0.15);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].metric, "rss_mb");
        assert!((found[0].change - 0.3).abs() < 1e-9);

        let after = BTreeMap::from([("rss_mb".to_string(), 210.0)]);
        assert!(detect_degradation(&before, &after, &targets, 0.15).is_empty());
    }

    #[test]
    fn baseline_comparison_tracks_direction() {
        let mut targets = BTreeMap::new();
        targets.insert("tps".to_string(), spec(100.0, Comparison::AtLeast, 0.0));
        targets.insert("rss_mb".to_string(), spec(512.0, Comparison::AtMost, 0.0));
        let baseline = BTreeMap::from([
            ("tps".to_string(), mean_stat(1000.0)),
            ("rss_mb".to_string(), mean_stat(400.0)),
        ]);
        let current = BTreeMap::from([
            ("tps".to_string(), mean_stat(800.0)),
            ("rss_mb".to_string(), mean_stat(390.0)),
        ]);

        let regressions = compare_to_baseline(&baseline, &current, &targets, 0.15);
        let tps = regressions.iter().find(|r| r.metric == "tps").unwrap();
        assert!(tps.regressed);
        assert_eq!(tps.trend, Trend::Degrading);
        let rss = regressions.iter().find(|r| r.metric == "rss_mb").unwrap();
        assert!(!rss.regressed);
        assert_eq!(rss.trend, Trend::Stable);
    }

    #[test]
    fn overall_grade_order() {
        let done = RunOutcome::Completed {
            end: RunEnd::DurationElapsed,
        };
        let pass = evaluate("a", &mean_stat(2.0), &spec(1.0, Comparison::AtLeast, 0.0));
        let warn = evaluate("b", &mean_stat(0.99), &spec(1.0, Comparison::AtLeast, 0.1));
        let fail = evaluate("c", &mean_stat(0.5), &spec(1.0, Comparison::AtLeast, 0.1));
        let none = evaluate(
            "d",
            &AggregateStat::NoData { samples: 0 },
            &spec(1.0, Comparison::AtLeast, 0.0),
        );

        assert_eq!(overall_grade(&done, &[pass.clone()]), OverallGrade::Pass);
        assert_eq!(
            overall_grade(&done, &[pass.clone(), warn.clone()]),
            OverallGrade::Warn
        );
        assert_eq!(
            overall_grade(&done, &[warn.clone(), none.clone()]),
            OverallGrade::NoData
        );
        assert_eq!(overall_grade(&done, &[none, fail]), OverallGrade::Fail);

        let aborted = RunOutcome::Aborted {
            reason: AbortReason::Cancelled,
        };
        assert_eq!(overall_grade(&aborted, &[pass]), OverallGrade::Aborted);
    }
}
