use crate::config::{MetricDef, MetricSource, PayloadFormat, PercentileFields, ProcessStat};
use crate::error::SampleError;
use crate::types::{PercentileSet, Sample};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use url::Url;

/// A raw measurement before the sampler stamps it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub value: f64,
    pub percentiles: Option<PercentileSet>,
}

impl Reading {
    pub fn scalar(value: f64) -> Self {
        Self {
            value,
            percentiles: None,
        }
    }
}

/// One measurable source for one metric.
pub trait Probe: Send + Sync {
    fn metric(&self) -> &str;
    fn read(&self) -> impl Future<Output = Result<Reading, SampleError>> + Send;
}

#[derive(Debug)]
pub enum MetricProbe {
    Http(HttpProbe),
    Process(ProcessProbe),
}

impl MetricProbe {
    pub fn from_def(
        def: &MetricDef,
        client: &reqwest::Client,
        target_url: &Url,
        pid: Option<u32>,
    ) -> Result<Self, String> {
        match &def.source {
            MetricSource::Http {
                path,
                format,
                field,
                percentiles,
                timeout_ms,
            } => {
                let url = target_url
                    .join(path)
                    .map_err(|err| format!("metric {:?}: invalid path {path:?}: {err}", def.name))?;
                Ok(MetricProbe::Http(HttpProbe {
                    metric: def.name.clone(),
                    client: client.clone(),
                    url,
                    format: *format,
                    field: field.clone(),
                    percentiles: percentiles.clone(),
                    timeout: Duration::from_millis(*timeout_ms),
                }))
            }
            MetricSource::Process { stat } => {
                let pid = pid.ok_or_else(|| {
                    format!("metric {:?}: process metrics need a target pid", def.name)
                })?;
                Ok(MetricProbe::Process(ProcessProbe::new(&def.name, pid, *stat)))
            }
        }
    }
}

impl Probe for MetricProbe {
    fn metric(&self) -> &str {
        match self {
            MetricProbe::Http(probe) => probe.metric(),
            MetricProbe::Process(probe) => probe.metric(),
        }
    }

    async fn read(&self) -> Result<Reading, SampleError> {
        match self {
            MetricProbe::Http(probe) => probe.read().await,
            MetricProbe::Process(probe) => probe.read().await,
        }
    }
}

/// Scrapes a metrics endpoint on the target.
#[derive(Debug)]
pub struct HttpProbe {
    metric: String,
    client: reqwest::Client,
    url: Url,
    format: PayloadFormat,
    field: Option<String>,
    percentiles: Option<PercentileFields>,
    timeout: Duration,
}

impl HttpProbe {
    fn reading<F>(&self, lookup: F) -> Result<Reading, SampleError>
    where
        F: Fn(&str) -> Result<f64, SampleError>,
    {
        let percentiles = match &self.percentiles {
            Some(fields) => Some(PercentileSet {
                p50: lookup(&fields.p50)?,
                p95: lookup(&fields.p95)?,
                p99: lookup(&fields.p99)?,
            }),
            None => None,
        };
        let value = match (&self.field, percentiles) {
            (Some(field), _) => lookup(field)?,
            (None, Some(set)) => set.p50,
            (None, None) => return Err(SampleError::MissingField(self.metric.clone())),
        };
        Ok(Reading { value, percentiles })
    }
}

impl Probe for HttpProbe {
    fn metric(&self) -> &str {
        &self.metric
    }

    async fn read(&self) -> Result<Reading, SampleError> {
        let resp = self
            .client
            .get(self.url.clone())
            .timeout(self.timeout)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SampleError::Status(status.as_u16()));
        }
        let body = resp.text().await?;
        match self.format {
            PayloadFormat::Json => {
                let payload: serde_json::Value =
                    serde_json::from_str(&body).map_err(|err| SampleError::Parse(err.to_string()))?;
                self.reading(|key| extract_json(&payload, key))
            }
            PayloadFormat::Text => self.reading(|key| extract_text(&body, key)),
        }
    }
}

/// OS-level stats for one PID.
pub struct ProcessProbe {
    metric: String,
    pid: Pid,
    stat: ProcessStat,
    system: Mutex<System>,
}

impl std::fmt::Debug for ProcessProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessProbe")
            .field("metric", &self.metric)
            .field("pid", &self.pid)
            .field("stat", &self.stat)
            .finish()
    }
}

impl ProcessProbe {
    pub fn new(metric: &str, pid: u32, stat: ProcessStat) -> Self {
        let pid = Pid::from_u32(pid);
        let mut system = System::new_with_specifics(
            RefreshKind::nothing().with_processes(process_refresh_kind()),
        );
        // CPU usage is a delta between refreshes; prime it so the first tick is meaningful.
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            process_refresh_kind(),
        );
        Self {
            metric: metric.to_string(),
            pid,
            stat,
            system: Mutex::new(system),
        }
    }

    fn read_now(&self) -> Result<Reading, SampleError> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            process_refresh_kind(),
        );
        let process = system
            .process(self.pid)
            .ok_or(SampleError::ProcessGone(self.pid.as_u32()))?;
        let value = match self.stat {
            ProcessStat::RssMb => bytes_to_mb(process.memory()),
            ProcessStat::CpuPercent => process.cpu_usage() as f64,
        };
        finite(&self.metric, value).map(Reading::scalar)
    }
}

impl Probe for ProcessProbe {
    fn metric(&self) -> &str {
        &self.metric
    }

    async fn read(&self) -> Result<Reading, SampleError> {
        self.read_now()
    }
}

fn process_refresh_kind() -> ProcessRefreshKind {
    ProcessRefreshKind::nothing().with_cpu().with_memory()
}

fn bytes_to_mb(bytes: u64) -> f64 {
    (bytes as f64) / (1024.0 * 1024.0)
}

fn finite(field: &str, value: f64) -> Result<f64, SampleError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(SampleError::NonFinite {
            field: field.to_string(),
            value,
        })
    }
}

/// Look up a number by JSON pointer. `a.b` and `a` are accepted as `/a/b` and `/a`.
pub fn extract_json(payload: &serde_json::Value, key: &str) -> Result<f64, SampleError> {
    let pointer = if key.starts_with('/') {
        key.to_string()
    } else {
        format!("/{}", key.replace('.', "/"))
    };
    let value = payload
        .pointer(&pointer)
        .ok_or_else(|| SampleError::MissingField(key.to_string()))?;
    let number = match value {
        serde_json::Value::Number(number) => number
            .as_f64()
            .ok_or_else(|| SampleError::Parse(format!("{key}: {number} is not an f64")))?,
        serde_json::Value::String(raw) => raw
            .trim()
            .parse::<f64>()
            .map_err(|_| SampleError::Parse(format!("{key}: {raw:?} is not a number")))?,
        other => {
            return Err(SampleError::Parse(format!(
                "{key}: expected a number, found {other}"
            )))
        }
    };
    finite(key, number)
}

/// Look up `key value` in a line-oriented exposition body.
pub fn extract_text(body: &str, key: &str) -> Result<f64, SampleError> {
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        if parts.next() != Some(key) {
            continue;
        }
        let raw = parts
            .next()
            .ok_or_else(|| SampleError::Parse(format!("{key}: line has no value")))?;
        let number = raw
            .parse::<f64>()
            .map_err(|_| SampleError::Parse(format!("{key}: {raw:?} is not a number")))?;
        return finite(key, number);
    }
    Err(SampleError::MissingField(key.to_string()))
}

#[derive(Debug, Clone)]
pub enum SamplerEvent {
    Sample(Sample),
    Miss { metric: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unreachable {
    pub metric: String,
    pub consecutive_misses: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplerReport {
    pub ticks: u64,
    pub samples: u64,
    pub misses: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unreachable: Option<Unreachable>,
}

/// Stamps readings against one monotonic origin so a run's samples never go backwards.
#[derive(Debug, Clone, Copy)]
pub struct MetricSampler {
    started: Instant,
    wall: DateTime<Utc>,
}

impl Default for MetricSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricSampler {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            wall: Utc::now(),
        }
    }

    pub async fn sample<P: Probe>(&self, probe: &P) -> Result<Sample, SampleError> {
        let reading = probe.read().await?;
        let elapsed = self.started.elapsed();
        let offset = chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());
        Ok(Sample {
            timestamp: self.wall + offset,
            elapsed_ms: elapsed.as_millis() as u64,
            metric: probe.metric().to_string(),
            value: reading.value,
            percentiles: reading.percentiles,
        })
    }

    /// Sample every probe on a fixed grid until `stop` fires or a metric goes unreachable.
    ///
    /// Ticks are anchored at the loop's start, so a slow tick delays at most itself.
    pub async fn run<P: Probe>(
        &self,
        probes: &[P],
        interval: Duration,
        stop: CancellationToken,
        sink: mpsc::Sender<SamplerEvent>,
        max_consecutive_misses: u32,
    ) -> SamplerReport {
        let mut ticker = tokio::time::interval_at(Instant::now(), interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut report = SamplerReport::default();
        let mut consecutive = vec![0u32; probes.len()];
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            report.ticks += 1;

            let results = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                results = join_all(probes.iter().map(|probe| self.sample(probe))) => results,
            };

            for ((probe, result), streak) in probes.iter().zip(results).zip(consecutive.iter_mut()) {
                let event = match result {
                    Ok(sample) => {
                        *streak = 0;
                        report.samples += 1;
                        SamplerEvent::Sample(sample)
                    }
                    Err(err) => {
                        *streak += 1;
                        *report.misses.entry(probe.metric().to_string()).or_default() += 1;
                        tracing::warn!(
                            metric = probe.metric(),
                            consecutive = *streak,
                            error = %err,
                            "sample miss"
                        );
                        SamplerEvent::Miss {
                            metric: probe.metric().to_string(),
                        }
                    }
                };
                if sink.send(event).await.is_err() {
                    tracing::debug!("sample sink closed; stopping sampler");
                    return report;
                }
                if *streak > max_consecutive_misses {
                    tracing::warn!(
                        metric = probe.metric(),
                        consecutive = *streak,
                        "metric unreachable; ending sampling early"
                    );
                    report.unreachable = Some(Unreachable {
                        metric: probe.metric().to_string(),
                        consecutive_misses: *streak,
                    });
                    return report;
                }
            }
        }
        report
    }

    /// One reading per probe outside the run window. Failed probes are left out.
    pub async fn snapshot<P: Probe>(&self, probes: &[P]) -> BTreeMap<String, f64> {
        let results = join_all(probes.iter().map(|probe| probe.read())).await;
        probes
            .iter()
            .zip(results)
            .filter_map(|(probe, result)| match result {
                Ok(reading) => Some((probe.metric().to_string(), reading.value)),
                Err(err) => {
                    tracing::debug!(metric = probe.metric(), error = %err, "snapshot read failed");
                    None
                }
            })
            .collect()
    }
}
