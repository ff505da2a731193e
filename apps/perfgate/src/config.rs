use crate::error::ConfigError;
use crate::types::ThresholdSpec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const DEFAULT_HEALTH_PATH: &str = "/health";
pub const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_STOP_GRACE_SECS: u64 = 10;

/// On-disk scenario file: file-level defaults plus a list of scenarios.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioFile {
    #[serde(default)]
    pub target_url: Option<String>,
    #[serde(default)]
    pub health_path: Option<String>,
    #[serde(default)]
    pub startup_timeout_secs: Option<u64>,
    #[serde(default)]
    pub stop_grace_secs: Option<u64>,
    #[serde(rename = "scenario", alias = "scenarios", default)]
    pub scenarios: Vec<ScenarioConfig>,
}

impl ScenarioFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());
        let parsed = match ext.as_deref() {
            Some("toml") => Self::from_toml_str(&raw),
            Some("json") => Self::from_json_str(&raw),
            _ => return Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        };
        parsed.map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, String> {
        toml::from_str(raw).map_err(|err| err.to_string())
    }

    pub fn from_json_str(raw: &str) -> Result<Self, String> {
        serde_json::from_str(raw).map_err(|err| err.to_string())
    }
}

fn default_warmup_ms() -> u64 {
    5_000
}

fn default_sample_interval_ms() -> u64 {
    1_000
}

fn default_grace_margin_ms() -> u64 {
    10_000
}

fn default_concurrency() -> usize {
    16
}

fn default_max_consecutive_misses() -> u32 {
    5
}

fn default_min_samples() -> usize {
    1
}

fn default_partial_min_samples() -> usize {
    3
}

fn default_degradation_threshold() -> f64 {
    0.15
}

/// One named benchmark scenario. Immutable once validated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_warmup_ms")]
    pub warmup_ms: u64,
    pub run_duration_ms: u64,
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    /// Added to the run duration to form the hard wall-clock ceiling.
    #[serde(default = "default_grace_margin_ms")]
    pub grace_margin_ms: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_consecutive_misses")]
    pub max_consecutive_misses: u32,
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    /// Minimum samples per metric before an aborted run is graded.
    #[serde(default = "default_partial_min_samples")]
    pub partial_min_samples: usize,
    #[serde(default = "default_degradation_threshold")]
    pub degradation_threshold: f64,
    #[serde(default)]
    pub request: RequestTemplate,
    #[serde(rename = "metric", alias = "metrics", default)]
    pub metrics: Vec<MetricDef>,
    #[serde(default)]
    pub targets: BTreeMap<String, ThresholdSpec>,
}

impl ScenarioConfig {
    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }

    pub fn run_duration(&self) -> Duration {
        Duration::from_millis(self.run_duration_ms)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn grace_margin(&self) -> Duration {
        Duration::from_millis(self.grace_margin_ms)
    }

    pub fn hard_ceiling(&self) -> Duration {
        self.run_duration() + self.grace_margin()
    }

    /// Sample floor applied when grading; aborted runs need more evidence.
    pub fn sample_floor(&self, partial: bool) -> usize {
        if partial {
            self.min_samples.max(self.partial_min_samples)
        } else {
            self.min_samples
        }
    }

    pub fn metric(&self, name: &str) -> Option<&MetricDef> {
        self.metrics.iter().find(|metric| metric.name == name)
    }

    pub fn validate(&self, ctx: &ValidationContext) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::Invalid {
            scenario: self.name.clone(),
            message,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty".to_string()));
        }
        if self.run_duration_ms == 0 {
            return Err(invalid("run_duration_ms must be > 0".to_string()));
        }
        if self.sample_interval_ms == 0 {
            return Err(invalid("sample_interval_ms must be > 0".to_string()));
        }
        if self.sample_interval_ms > self.run_duration_ms {
            return Err(invalid(format!(
                "sample_interval_ms ({}) exceeds run_duration_ms ({})",
                self.sample_interval_ms, self.run_duration_ms
            )));
        }
        if self.concurrency == 0 {
            return Err(invalid("concurrency must be > 0".to_string()));
        }
        if self.max_consecutive_misses == 0 {
            return Err(invalid("max_consecutive_misses must be > 0".to_string()));
        }
        if self.min_samples == 0 {
            return Err(invalid("min_samples must be > 0".to_string()));
        }
        if !self.degradation_threshold.is_finite() || self.degradation_threshold < 0.0 {
            return Err(invalid(
                "degradation_threshold must be a non-negative number".to_string(),
            ));
        }

        self.request.validate().map_err(invalid)?;

        if self.metrics.is_empty() {
            return Err(invalid("at least one [[scenario.metric]] is required".to_string()));
        }
        let mut seen = BTreeSet::new();
        for metric in &self.metrics {
            if metric.name.trim().is_empty() {
                return Err(invalid("metric name must not be empty".to_string()));
            }
            if !seen.insert(metric.name.as_str()) {
                return Err(invalid(format!("duplicate metric {:?}", metric.name)));
            }
            metric
                .validate(ctx)
                .map_err(|message| invalid(format!("metric {:?}: {message}", metric.name)))?;
        }

        if self.targets.is_empty() {
            return Err(invalid("at least one target is required".to_string()));
        }
        for (name, spec) in &self.targets {
            let Some(metric) = self.metric(name) else {
                return Err(invalid(format!(
                    "target {name:?} does not refer to a declared metric"
                )));
            };
            if !spec.target.is_finite() || spec.target <= 0.0 {
                return Err(invalid(format!(
                    "target {name:?} must be a positive finite number"
                )));
            }
            if !spec.warn_tolerance.is_finite() || spec.warn_tolerance < 0.0 {
                return Err(invalid(format!(
                    "target {name:?} warn_tolerance must be >= 0"
                )));
            }
            if spec.statistic.needs_percentiles() && !metric.has_percentiles() {
                return Err(invalid(format!(
                    "target {name:?} uses statistic {} but the metric has no percentiles",
                    spec.statistic.as_str()
                )));
            }
        }

        Ok(())
    }
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_request_path() -> String {
    "/".to_string()
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_max_consecutive_failures() -> u32 {
    1_000
}

/// Shape of every request a load worker issues.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestTemplate {
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_request_path")]
    pub path: String,
    /// JSON body; string values may contain `{{worker}}`, `{{seq}}` and `{{uuid}}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_request_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

impl Default for RequestTemplate {
    fn default() -> Self {
        Self {
            method: default_method(),
            path: default_request_path(),
            body: None,
            headers: BTreeMap::new(),
            timeout_ms: default_request_timeout_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

impl RequestTemplate {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn validate(&self) -> Result<(), String> {
        reqwest::Method::from_bytes(self.method.trim().as_bytes())
            .map_err(|_| format!("request method {:?} is invalid", self.method))?;
        if self.path.trim().is_empty() {
            return Err("request path must not be empty".to_string());
        }
        for (name, value) in &self.headers {
            reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| format!("request header name {name:?} is invalid"))?;
            reqwest::header::HeaderValue::from_str(value)
                .map_err(|_| format!("request header {name:?} has an invalid value"))?;
        }
        if self.timeout_ms == 0 {
            return Err("request timeout_ms must be > 0".to_string());
        }
        if self.max_consecutive_failures == 0 {
            return Err("request max_consecutive_failures must be > 0".to_string());
        }
        Ok(())
    }
}

/// Where a metric is read from during sampling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricDef {
    pub name: String,
    #[serde(flatten)]
    pub source: MetricSource,
}

impl MetricDef {
    pub fn has_percentiles(&self) -> bool {
        matches!(
            &self.source,
            MetricSource::Http {
                percentiles: Some(_),
                ..
            }
        )
    }

    fn validate(&self, ctx: &ValidationContext) -> Result<(), String> {
        match &self.source {
            MetricSource::Http {
                path,
                field,
                percentiles,
                timeout_ms,
                ..
            } => {
                if path.trim().is_empty() {
                    return Err("path must not be empty".to_string());
                }
                if field.is_none() && percentiles.is_none() {
                    return Err("http metrics need `field` or `percentiles`".to_string());
                }
                if *timeout_ms == 0 {
                    return Err("timeout_ms must be > 0".to_string());
                }
                Ok(())
            }
            MetricSource::Process { .. } => {
                if ctx.has_pid {
                    Ok(())
                } else {
                    Err("process metrics need --exec or --attach-pid".to_string())
                }
            }
        }
    }
}

fn default_probe_timeout_ms() -> u64 {
    2_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum MetricSource {
    Http {
        path: String,
        #[serde(default)]
        format: PayloadFormat,
        /// JSON pointer (`/a/b`, a bare key is treated as `/key`) or text line key.
        #[serde(default)]
        field: Option<String>,
        #[serde(default)]
        percentiles: Option<PercentileFields>,
        #[serde(default = "default_probe_timeout_ms")]
        timeout_ms: u64,
    },
    Process {
        stat: ProcessStat,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    #[default]
    Json,
    /// `name value` lines, `#` comments ignored.
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PercentileFields {
    pub p50: String,
    pub p95: String,
    pub p99: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStat {
    RssMb,
    CpuPercent,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationContext {
    /// Whether the run will know the target's PID.
    pub has_pid: bool,
}

/// How the harness relates to the process under test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessMode {
    Exec(String),
    AttachPid(u32),
    Endpoint,
}

impl ProcessMode {
    pub fn has_pid(&self) -> bool {
        !matches!(self, ProcessMode::Endpoint)
    }
}

/// Values from the command line. `None` falls through to env, then file, then default.
#[derive(Debug, Clone)]
pub struct Overrides {
    pub target_url: Option<String>,
    pub health_path: Option<String>,
    pub startup_timeout_secs: Option<u64>,
    pub stop_grace_secs: Option<u64>,
    pub process: ProcessMode,
    pub exec_log: Option<PathBuf>,
    pub scenarios: Vec<String>,
}

impl Default for Overrides {
    fn default() -> Self {
        Self {
            target_url: None,
            health_path: None,
            startup_timeout_secs: None,
            stop_grace_secs: None,
            process: ProcessMode::Endpoint,
            exec_log: None,
            scenarios: Vec::new(),
        }
    }
}

/// `PERFGATE_*` environment overrides (`.env` is loaded by the binary).
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub target_url: Option<String>,
    pub health_path: Option<String>,
    pub startup_timeout_secs: Option<u64>,
    pub stop_grace_secs: Option<u64>,
}

impl EnvOverrides {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            target_url: env_optional("PERFGATE_TARGET_URL"),
            health_path: env_optional("PERFGATE_HEALTH_PATH"),
            startup_timeout_secs: env_u64("PERFGATE_STARTUP_TIMEOUT_SECS")?,
            stop_grace_secs: env_u64("PERFGATE_STOP_GRACE_SECS")?,
        })
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64(key: &'static str) -> Result<Option<u64>, ConfigError> {
    match env_optional(key) {
        Some(value) => value
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { key, value }),
        None => Ok(None),
    }
}

/// Process-level settings shared by every scenario in one invocation.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub target_url: Url,
    pub health_url: Url,
    pub startup_timeout: Duration,
    pub stop_grace: Duration,
    pub process: ProcessMode,
    /// Where an `--exec` child's stdout is appended.
    pub exec_log: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RunPlan {
    pub settings: RunSettings,
    pub scenarios: Vec<ScenarioConfig>,
}

/// Merge CLI, env and file values, validate every scenario and apply the name filter.
pub fn resolve(
    file: ScenarioFile,
    cli: &Overrides,
    env: &EnvOverrides,
) -> Result<RunPlan, ConfigError> {
    if file.scenarios.is_empty() {
        return Err(ConfigError::NoScenarios);
    }
    let mut names = BTreeSet::new();
    for scenario in &file.scenarios {
        if !names.insert(scenario.name.as_str()) {
            return Err(ConfigError::DuplicateScenario(scenario.name.clone()));
        }
    }
    for wanted in &cli.scenarios {
        if !names.contains(wanted.as_str()) {
            return Err(ConfigError::UnknownScenario(wanted.clone()));
        }
    }

    let raw_url = cli
        .target_url
        .clone()
        .or_else(|| env.target_url.clone())
        .or_else(|| file.target_url.clone())
        .ok_or(ConfigError::MissingTargetUrl)?;
    let target_url = Url::parse(&raw_url).map_err(|source| ConfigError::InvalidUrl {
        url: raw_url.clone(),
        source,
    })?;

    let health_path = cli
        .health_path
        .clone()
        .or_else(|| env.health_path.clone())
        .or_else(|| file.health_path.clone())
        .unwrap_or_else(|| DEFAULT_HEALTH_PATH.to_string());
    let health_url = target_url
        .join(&health_path)
        .map_err(|source| ConfigError::InvalidUrl {
            url: health_path.clone(),
            source,
        })?;

    let startup_timeout_secs = cli
        .startup_timeout_secs
        .or(env.startup_timeout_secs)
        .or(file.startup_timeout_secs)
        .unwrap_or(DEFAULT_STARTUP_TIMEOUT_SECS);
    let stop_grace_secs = cli
        .stop_grace_secs
        .or(env.stop_grace_secs)
        .or(file.stop_grace_secs)
        .unwrap_or(DEFAULT_STOP_GRACE_SECS);

    let ctx = ValidationContext {
        has_pid: cli.process.has_pid(),
    };
    for scenario in &file.scenarios {
        scenario.validate(&ctx)?;
    }

    let scenarios = if cli.scenarios.is_empty() {
        file.scenarios
    } else {
        file.scenarios
            .into_iter()
            .filter(|scenario| cli.scenarios.iter().any(|name| *name == scenario.name))
            .collect()
    };

    Ok(RunPlan {
        settings: RunSettings {
            target_url,
            health_url,
            startup_timeout: Duration::from_secs(startup_timeout_secs),
            stop_grace: Duration::from_secs(stop_grace_secs),
            process: cli.process.clone(),
            exec_log: cli.exec_log.clone(),
        },
        scenarios,
    })
}
