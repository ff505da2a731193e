use crate::types::ProcessExitInfo;
use std::path::PathBuf;

/// Scenario file problems. Always raised before any process is started.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read scenario file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse scenario file {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("unsupported scenario file extension for {0} (expected .toml or .json)")]
    UnsupportedFormat(PathBuf),
    #[error("scenario file declares no scenarios")]
    NoScenarios,
    #[error("duplicate scenario name {0:?}")]
    DuplicateScenario(String),
    #[error("scenario {scenario:?}: {message}")]
    Invalid { scenario: String, message: String },
    #[error("no target URL (set target_url in the file, PERFGATE_TARGET_URL or --target-url)")]
    MissingTargetUrl,
    #[error("invalid target URL {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("invalid value {value:?} for {key}")]
    InvalidEnv { key: &'static str, value: String },
    #[error("unknown scenario {0:?}")]
    UnknownScenario(String),
}

/// The target never became ready, or could not be launched at all.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{reason}")]
pub struct StartupError {
    pub reason: String,
    pub exit: Option<ProcessExitInfo>,
}

impl StartupError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            exit: None,
        }
    }

    pub fn readiness_timeout(exit: Option<ProcessExitInfo>) -> Self {
        Self {
            reason: "readiness timeout".to_string(),
            exit,
        }
    }

    pub fn exited_during_startup(exit: ProcessExitInfo) -> Self {
        Self {
            reason: "process exited during startup".to_string(),
            exit: Some(exit),
        }
    }
}

/// One failed measurement. Recorded as a gap in the series.
#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("metrics endpoint returned HTTP {0}")]
    Status(u16),
    #[error("could not parse metrics payload: {0}")]
    Parse(String),
    #[error("field {0:?} missing from metrics payload")]
    MissingField(String),
    #[error("field {field:?} is not a finite number ({value})")]
    NonFinite { field: String, value: f64 },
    #[error("process {0} is gone")]
    ProcessGone(u32),
}

/// The owned target exited while the run was in progress.
#[derive(Debug, Clone, thiserror::Error)]
#[error("target died during run: {exit}")]
pub struct TargetDiedError {
    pub exit: ProcessExitInfo,
}
