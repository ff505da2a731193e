use crate::types::{AggregateStat, MetricSeries, PercentileSet, Sample, StatSummary};
use std::collections::BTreeMap;

/// Per-run sample store. Owned by the single task draining the sampler channel.
#[derive(Debug, Default)]
pub struct Aggregator {
    series: BTreeMap<String, MetricSeries>,
}

#[derive(Debug, Clone, Default)]
pub struct Aggregation {
    pub series: BTreeMap<String, MetricSeries>,
    pub stats: BTreeMap<String, AggregateStat>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-register metrics so ones that never produce a sample still finalize to `NoData`.
    pub fn with_metrics<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let series = names
            .into_iter()
            .map(|name| {
                let name = name.into();
                (name.clone(), MetricSeries::new(name))
            })
            .collect();
        Self { series }
    }

    pub fn append(&mut self, sample: Sample) {
        self.series_mut(&sample.metric).samples.push(sample);
    }

    pub fn record_miss(&mut self, metric: &str) {
        self.series_mut(metric).misses += 1;
    }

    pub fn sample_count(&self, metric: &str) -> usize {
        self.series.get(metric).map(MetricSeries::len).unwrap_or(0)
    }

    pub fn finalize(self, floor: usize) -> Aggregation {
        let stats = self
            .series
            .iter()
            .map(|(name, series)| (name.clone(), summarize(&series.samples, floor)))
            .collect();
        Aggregation {
            series: self.series,
            stats,
        }
    }

    fn series_mut(&mut self, metric: &str) -> &mut MetricSeries {
        self.series
            .entry(metric.to_string())
            .or_insert_with(|| MetricSeries::new(metric))
    }
}

/// Summary statistics for one series, or `NoData` below `floor` samples.
pub fn summarize(samples: &[Sample], floor: usize) -> AggregateStat {
    let count = samples.len();
    if count == 0 || count < floor {
        return AggregateStat::NoData { samples: count };
    }

    let mut mean = 0.0;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for (idx, sample) in samples.iter().enumerate() {
        let value = sample.value;
        mean += (value - mean) / (idx + 1) as f64;
        min = min.min(value);
        max = max.max(value);
    }

    let bundles: Vec<PercentileSet> = samples.iter().filter_map(|s| s.percentiles).collect();
    let percentiles = percentile_of_percentiles(&bundles);

    AggregateStat::Summary(StatSummary {
        count,
        mean: mean.clamp(min, max),
        min,
        max,
        percentiles,
    })
}

/// p50 of the p50 snapshots, p95 of the p95 snapshots, p99 of the p99 snapshots.
pub fn percentile_of_percentiles(bundles: &[PercentileSet]) -> Option<PercentileSet> {
    let p50s: Vec<f64> = bundles.iter().map(|b| b.p50).collect();
    let p95s: Vec<f64> = bundles.iter().map(|b| b.p95).collect();
    let p99s: Vec<f64> = bundles.iter().map(|b| b.p99).collect();
    Some(PercentileSet {
        p50: percentile(&p50s, 0.50)?,
        p95: percentile(&p95s, 0.95)?,
        p99: percentile(&p99s, 0.99)?,
    })
}

pub fn percentile(values: &[f64], quantile: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut ordered = values.to_vec();
    ordered.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let q = quantile.clamp(0.0, 1.0);
    if ordered.len() == 1 {
        return ordered.first().copied();
    }
    let idx = (ordered.len() - 1) as f64 * q;
    let lo = idx.floor() as usize;
    let hi = idx.ceil() as usize;
    if lo == hi {
        return ordered.get(lo).copied();
    }
    let fraction = idx - lo as f64;
    let lower = ordered.get(lo).copied()?;
    let upper = ordered.get(hi).copied()?;
    Some(lower + (upper - lower) * fraction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample(metric: &str, elapsed_ms: u64, value: f64) -> Sample {
        Sample {
            timestamp: Utc::now(),
            elapsed_ms,
            metric: metric.to_string(),
            value,
            percentiles: None,
        }
    }

    fn latency(elapsed_ms: u64, p50: f64, p95: f64, p99: f64) -> Sample {
        Sample {
            percentiles: Some(PercentileSet { p50, p95, p99 }),
            ..sample("latency_ms", elapsed_ms, p50)
        }
    }

    #[test]
    fn empty_series_is_no_data() {
        let aggregation = Aggregator::with_metrics(["tps"]).finalize(1);
        assert_eq!(
            aggregation.stats["tps"],
            AggregateStat::NoData { samples: 0 }
        );
    }

    #[test]
    fn uniform_series_has_equal_mean_min_max() {
        for value in [0.1, 1_823_456.7, 612.0, 1e-9, 3.3333333] {
            let mut aggregator = Aggregator::new();
            for i in 0..37 {
                aggregator.append(sample("m", i, value));
            }
            let AggregateStat::Summary(stat) = aggregator.finalize(1).stats["m"].clone() else {
                panic!("expected summary");
            };
            assert_eq!(stat.count, 37);
            assert_eq!(stat.mean, value);
            assert_eq!(stat.min, value);
            assert_eq!(stat.max, value);
        }
    }

    #[test]
    fn mean_stays_between_min_and_max() {
        let mut aggregator = Aggregator::new();
        for (i, value) in [12.0, 7.5, 9.25, 30.0, 0.5].into_iter().enumerate() {
            aggregator.append(sample("m", i as u64, value));
        }
        let AggregateStat::Summary(stat) = aggregator.finalize(1).stats["m"].clone() else {
            panic!("expected summary");
        };
        assert_eq!(stat.min, 0.5);
        assert_eq!(stat.max, 30.0);
        assert!((stat.mean - 11.85).abs() < 1e-9);
        assert!(stat.percentiles.is_none());
    }

    #[test]
    fn below_floor_is_no_data() {
        let mut aggregator = Aggregator::new();
        aggregator.append(sample("m", 0, 1.0));
        aggregator.append(sample("m", 1, 2.0));
        assert_eq!(
            aggregator.finalize(3).stats["m"],
            AggregateStat::NoData { samples: 2 }
        );
    }

    #[test]
    fn percentile_of_percentiles_uses_matching_columns() {
        let mut aggregator = Aggregator::new();
        aggregator.append(latency(0, 10.0, 40.0, 90.0));
        aggregator.append(latency(1, 20.0, 50.0, 100.0));
        aggregator.append(latency(2, 30.0, 60.0, 110.0));
        let AggregateStat::Summary(stat) =
            aggregator.finalize(1).stats["latency_ms"].clone()
        else {
            panic!("expected summary");
        };
        let set = stat.percentiles.unwrap();
        assert_eq!(set.p50, 20.0);
        assert!((set.p95 - 59.0).abs() < 1e-9);
        assert!((set.p99 - 109.8).abs() < 1e-9);
    }

    #[test]
    fn misses_are_counted_without_samples() {
        let mut aggregator = Aggregator::with_metrics(["tps"]);
        aggregator.append(sample("tps", 0, 1.0));
        aggregator.record_miss("tps");
        aggregator.record_miss("tps");
        aggregator.append(sample("tps", 2, 3.0));
        let aggregation = aggregator.finalize(1);
        let series = &aggregation.series["tps"];
        assert_eq!(series.misses, 2);
        assert_eq!(series.len(), 2);
        assert_eq!(aggregation.stats["tps"].count(), 2);
    }

    #[test]
    fn samples_keep_append_order() {
        let mut aggregator = Aggregator::new();
        for i in 0..10 {
            aggregator.append(sample("m", i * 100, i as f64));
        }
        let aggregation = aggregator.finalize(1);
        let elapsed: Vec<u64> = aggregation.series["m"]
            .samples
            .iter()
            .map(|s| s.elapsed_ms)
            .collect();
        assert!(elapsed.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn percentile_interpolates() {
        assert_eq!(percentile(&[], 0.5), None);
        assert_eq!(percentile(&[4.0], 0.99), Some(4.0));
        assert_eq!(percentile(&[1.0, 2.0, 3.0, 4.0], 0.5), Some(2.5));
    }
}
