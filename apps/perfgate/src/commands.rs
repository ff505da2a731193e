use crate::cli::RunArgs;
use crate::config::{resolve, EnvOverrides, RunPlan, ScenarioFile};
use crate::error::ConfigError;
use crate::orchestrator::Orchestrator;
use crate::report::{self, Baseline};
use anyhow::{Context, Result};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

/// Exit code for a scenario file rejected before anything started.
pub const EXIT_CONFIG: u8 = 2;

fn plan(args: &RunArgs) -> Result<RunPlan, ConfigError> {
    let file = ScenarioFile::load(&args.scenario_file)?;
    let env = EnvOverrides::from_env()?;
    resolve(file, &args.overrides(), &env)
}

pub fn validate(args: &RunArgs) -> ExitCode {
    match plan(args) {
        Ok(plan) => {
            for scenario in &plan.scenarios {
                println!(
                    "ok  {}  ({} metrics, {} targets)",
                    scenario.name,
                    scenario.metrics.len(),
                    scenario.targets.len()
                );
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("perfgate: {err}");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

pub async fn run(args: RunArgs, cancel: CancellationToken) -> Result<ExitCode> {
    let plan = match plan(&args) {
        Ok(plan) => plan,
        Err(err) => {
            tracing::error!(error = %err, "invalid scenario file");
            eprintln!("perfgate: {err}");
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    };
    let baseline = match &args.baseline {
        Some(path) => report::load_baseline(path)?,
        None => Baseline::new(),
    };

    let client = reqwest::Client::builder()
        .user_agent(concat!("perfgate/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")?;
    tracing::info!(
        scenarios = plan.scenarios.len(),
        url = %plan.settings.target_url,
        parallel = args.parallel,
        "starting benchmark run"
    );
    let orchestrator = Orchestrator::new(plan.settings, client).with_baseline(baseline);
    let results = orchestrator
        .run_all(plan.scenarios, args.parallel, cancel)
        .await;

    print!("{}", report::summary_table(&results));
    if let Some(path) = &args.output {
        report::write_json(path, &results)?;
        tracing::info!(path = %path.display(), "wrote results");
    }
    if let Some(path) = &args.report {
        report::write_markdown(path, &results)?;
        tracing::info!(path = %path.display(), "wrote report");
    }

    let success = results.iter().all(|result| result.grade.is_success());
    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
