use crate::aggregate::Aggregator;
use crate::config::{ProcessMode, RunSettings, ScenarioConfig};
use crate::error::{StartupError, TargetDiedError};
use crate::evaluate::{
    compare_to_baseline, degradation_finding, detect_degradation, evaluate_all, fail_unreachable,
    find_bottlenecks, overall_grade, rank_findings, regression_finding, unreachable_finding,
};
use crate::loadgen::{LoadGenerator, LoadSummary, TemplateRequest};
use crate::process::{AttachTarget, HttpReadinessProbe, ProcessController, ProcessHandle};
use crate::report::Baseline;
use crate::sampler::{MetricProbe, MetricSampler, SamplerEvent, SamplerReport};
use crate::types::{
    AbortReason, BenchmarkResult, ExitReason, ProcessExitInfo, RunEnd, RunOutcome, RunState,
};
use chrono::Utc;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

const SAMPLE_CHANNEL_CAPACITY: usize = 1024;

/// Ordered record of the states one run visited.
#[derive(Debug)]
struct StateTrace {
    scenario: String,
    current: RunState,
    visited: Vec<RunState>,
}

impl StateTrace {
    fn new(scenario: &str) -> Self {
        Self {
            scenario: scenario.to_string(),
            current: RunState::Idle,
            visited: vec![RunState::Idle],
        }
    }

    fn advance(&mut self, next: RunState) {
        if !self.current.can_transition_to(next) {
            tracing::warn!(
                scenario = %self.scenario,
                from = %self.current,
                to = %next,
                "ignoring invalid state transition"
            );
            return;
        }
        tracing::info!(scenario = %self.scenario, from = %self.current, to = %next, "state transition");
        self.current = next;
        self.visited.push(next);
    }
}

/// What the measured part of a run left behind, before grading.
struct Measured {
    outcome: RunOutcome,
    aggregator: Aggregator,
    load: Option<LoadSummary>,
    sampler: SamplerReport,
    before: BTreeMap<String, f64>,
    after: Option<BTreeMap<String, f64>>,
}

impl Measured {
    fn aborted(scenario: &ScenarioConfig, reason: AbortReason, before: BTreeMap<String, f64>) -> Self {
        Self {
            outcome: RunOutcome::Aborted { reason },
            aggregator: Aggregator::with_metrics(scenario.metrics.iter().map(|m| m.name.clone())),
            load: None,
            sampler: SamplerReport::default(),
            before,
            after: None,
        }
    }
}

enum RunStop {
    Elapsed,
    Abort(AbortReason),
}

/// Why a run never got past `Starting`.
struct StartAbort {
    reason: AbortReason,
    exit: Option<ProcessExitInfo>,
}

impl StartAbort {
    fn failed(err: StartupError) -> Self {
        Self {
            reason: AbortReason::StartupFailed { reason: err.reason },
            exit: err.exit,
        }
    }
}

/// How a measurement task ended at the join barrier.
#[derive(Debug)]
enum Joined<T> {
    Done(T),
    Failed,
    Overran,
}

/// Await `task` until `ceiling`; a task still running then is aborted.
async fn join_by<T>(task: &mut JoinHandle<T>, ceiling: Instant, name: &str) -> Joined<T> {
    match tokio::time::timeout_at(ceiling, &mut *task).await {
        Ok(Ok(value)) => Joined::Done(value),
        Ok(Err(err)) => {
            tracing::warn!(task = name, error = %err, "task failed");
            Joined::Failed
        }
        Err(_) => {
            tracing::warn!(task = name, "task did not stop before the hard ceiling");
            task.abort();
            Joined::Overran
        }
    }
}

/// Drives scenarios through start, warmup, measurement, grading and teardown.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    settings: Arc<RunSettings>,
    client: reqwest::Client,
    controller: ProcessController,
    loadgen: LoadGenerator,
    baseline: Arc<Baseline>,
    watchdog_interval: Duration,
}

impl Orchestrator {
    pub fn new(settings: RunSettings, client: reqwest::Client) -> Self {
        let controller = ProcessController::new().with_log(settings.exec_log.clone());
        Self {
            settings: Arc::new(settings),
            loadgen: LoadGenerator::new(client.clone()),
            client,
            controller,
            baseline: Arc::new(Baseline::new()),
            watchdog_interval: Duration::from_millis(250),
        }
    }

    pub fn with_baseline(mut self, baseline: Baseline) -> Self {
        self.baseline = Arc::new(baseline);
        self
    }

    pub fn with_watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    /// Run every scenario and return one result each, in input order.
    ///
    /// A failing scenario never prevents the others from running or reporting.
    pub async fn run_all(
        &self,
        scenarios: Vec<ScenarioConfig>,
        parallel: bool,
        cancel: CancellationToken,
    ) -> Vec<BenchmarkResult> {
        if parallel {
            let runs = scenarios
                .into_iter()
                .map(|scenario| self.run_scenario(scenario, cancel.child_token()));
            return join_all(runs).await;
        }
        let mut results = Vec::with_capacity(scenarios.len());
        for scenario in scenarios {
            results.push(self.run_scenario(scenario, cancel.child_token()).await);
        }
        results
    }

    pub async fn run_scenario(
        &self,
        scenario: ScenarioConfig,
        cancel: CancellationToken,
    ) -> BenchmarkResult {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("scenario", scenario = %scenario.name, run_id = %run_id);
        self.run_scenario_inner(run_id, scenario, cancel)
            .instrument(span)
            .await
    }

    async fn run_scenario_inner(
        &self,
        run_id: Uuid,
        scenario: ScenarioConfig,
        cancel: CancellationToken,
    ) -> BenchmarkResult {
        let started_at = Utc::now();
        let mut trace = StateTrace::new(&scenario.name);

        trace.advance(RunState::Starting);
        let mut handle = match self.acquire(&cancel).await {
            Ok(handle) => handle,
            Err(StartAbort { reason, exit }) => {
                tracing::warn!(reason = %reason, "startup did not complete; no load issued");
                trace.advance(RunState::Aborted);
                let measured = Measured::aborted(&scenario, reason, BTreeMap::new());
                return self.assemble(run_id, scenario, started_at, measured, exit, trace);
            }
        };

        let measured = self.measure(&scenario, &mut handle, &mut trace, &cancel).await;

        // Teardown runs on every path that got this far; stop is a no-op for attached targets.
        let exit = self
            .controller
            .stop(&mut handle, self.settings.stop_grace)
            .await;
        self.assemble(run_id, scenario, started_at, measured, exit, trace)
    }

    /// Spawn or attach, then wait for readiness. A cancelled startup stops what it spawned.
    async fn acquire(&self, cancel: &CancellationToken) -> Result<ProcessHandle, StartAbort> {
        let settings = &self.settings;
        let acquired = match &settings.process {
            ProcessMode::Exec(command) => self.controller.spawn(command),
            ProcessMode::AttachPid(pid) => self.controller.attach(AttachTarget::Pid(*pid)),
            ProcessMode::Endpoint => self
                .controller
                .attach(AttachTarget::Endpoint(settings.target_url.clone())),
        };
        let mut handle = acquired.map_err(StartAbort::failed)?;

        let probe = HttpReadinessProbe::new(self.client.clone(), settings.health_url.clone());
        let ready = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            ready = self.controller.wait_ready(&mut handle, &probe, settings.startup_timeout) => Some(ready),
        };
        match ready {
            Some(Ok(())) => Ok(handle),
            Some(Err(err)) => Err(StartAbort::failed(err)),
            None => {
                let exit = self
                    .controller
                    .stop(&mut handle, settings.stop_grace)
                    .await;
                Err(StartAbort {
                    reason: AbortReason::Cancelled,
                    exit,
                })
            }
        }
    }

    fn target_died(&self, handle: &mut ProcessHandle) -> Option<AbortReason> {
        if self.controller.is_alive(handle) {
            return None;
        }
        let exit = handle.exit_info().cloned().unwrap_or_else(|| ProcessExitInfo {
            pid: handle.pid(),
            code: None,
            signal: None,
            reason: ExitReason::Died,
            at: Utc::now(),
        });
        let err = TargetDiedError { exit };
        tracing::warn!(error = %err, "watchdog: target is gone");
        Some(AbortReason::TargetDied { exit: err.exit })
    }

    async fn measure(
        &self,
        scenario: &ScenarioConfig,
        handle: &mut ProcessHandle,
        trace: &mut StateTrace,
        cancel: &CancellationToken,
    ) -> Measured {
        let target = self.settings.target_url.clone();
        let probes = scenario
            .metrics
            .iter()
            .map(|def| MetricProbe::from_def(def, &self.client, &target, handle.pid()))
            .collect::<Result<Vec<_>, _>>();
        let probes = match probes {
            Ok(probes) => Arc::new(probes),
            Err(reason) => {
                trace.advance(RunState::Aborted);
                return Measured::aborted(scenario, AbortReason::InvalidSetup { reason }, BTreeMap::new());
            }
        };
        let factory = match TemplateRequest::from_template(&scenario.request) {
            Ok(factory) => Arc::new(factory),
            Err(reason) => {
                trace.advance(RunState::Aborted);
                return Measured::aborted(scenario, AbortReason::InvalidSetup { reason }, BTreeMap::new());
            }
        };

        let snapshots = MetricSampler::new();
        let before = snapshots.snapshot(probes.as_slice()).await;
        tracing::debug!(metrics = before.len(), "pre-load snapshot taken");

        trace.advance(RunState::WarmingUp);
        if !scenario.warmup().is_zero() {
            let warm_token = cancel.child_token();
            let warmup = self.loadgen.run(
                &target,
                scenario.concurrency,
                scenario.warmup(),
                Arc::clone(&factory),
                warm_token.clone(),
                scenario.request.max_consecutive_failures,
            );
            tokio::pin!(warmup);
            let mut watchdog = tokio::time::interval(self.watchdog_interval);
            watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let aborted = loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break Some(AbortReason::Cancelled),
                    _ = watchdog.tick() => {
                        if let Some(reason) = self.target_died(handle) {
                            break Some(reason);
                        }
                    }
                    summary = &mut warmup => {
                        tracing::debug!(issued = summary.issued, failed = summary.failed, "warmup discarded");
                        break None;
                    }
                }
            };
            if let Some(reason) = aborted {
                warm_token.cancel();
                trace.advance(RunState::Aborted);
                return Measured::aborted(scenario, reason, before);
            }
        }

        trace.advance(RunState::Running);
        let run_token = cancel.child_token();
        let (tx, mut rx) = mpsc::channel(SAMPLE_CHANNEL_CAPACITY);
        let run_started = Instant::now();
        let run_deadline = run_started + scenario.run_duration();
        let ceiling = run_started + scenario.hard_ceiling();

        let mut sampler_task = tokio::spawn({
            let probes = Arc::clone(&probes);
            let token = run_token.clone();
            let interval = scenario.sample_interval();
            let max_misses = scenario.max_consecutive_misses;
            async move {
                MetricSampler::new()
                    .run(probes.as_slice(), interval, token, tx, max_misses)
                    .await
            }
        });
        let mut load_task = tokio::spawn({
            let loadgen = self.loadgen.clone();
            let target = target.clone();
            let factory = Arc::clone(&factory);
            let token = run_token.clone();
            let concurrency = scenario.concurrency;
            let duration = scenario.run_duration();
            let max_failures = scenario.request.max_consecutive_failures;
            async move {
                loadgen
                    .run(&target, concurrency, duration, factory, token, max_failures)
                    .await
            }
        });

        let mut aggregator =
            Aggregator::with_metrics(scenario.metrics.iter().map(|m| m.name.clone()));
        let mut watchdog = tokio::time::interval(self.watchdog_interval);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let run_timer = tokio::time::sleep_until(run_deadline);
        tokio::pin!(run_timer);
        let mut sampler_report: Option<SamplerReport> = None;
        let mut channel_open = true;

        let stop = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break RunStop::Abort(AbortReason::Cancelled),
                _ = watchdog.tick() => {
                    if let Some(reason) = self.target_died(handle) {
                        break RunStop::Abort(reason);
                    }
                }
                event = rx.recv(), if channel_open => match event {
                    Some(event) => collect(&mut aggregator, event),
                    None => channel_open = false,
                },
                joined = &mut sampler_task, if sampler_report.is_none() => {
                    let report = joined.unwrap_or_else(|err| {
                        tracing::warn!(error = %err, "sampler task failed");
                        SamplerReport::default()
                    });
                    let unreachable = report.unreachable.clone();
                    sampler_report = Some(report);
                    if let Some(unreachable) = unreachable {
                        break RunStop::Abort(AbortReason::TargetUnreachable {
                            metric: unreachable.metric,
                            consecutive_misses: unreachable.consecutive_misses,
                        });
                    }
                }
                _ = &mut run_timer => break RunStop::Elapsed,
            }
        };

        trace.advance(RunState::Finalizing);
        run_token.cancel();

        // Join barrier: nothing is finalized while the sampler or load workers can still write.
        let mut end = RunEnd::DurationElapsed;
        let sampler = match sampler_report {
            Some(report) => report,
            None => match join_by(&mut sampler_task, ceiling, "sampler").await {
                Joined::Done(report) => report,
                Joined::Failed => SamplerReport::default(),
                Joined::Overran => {
                    end = RunEnd::HardTimeout;
                    SamplerReport::default()
                }
            },
        };
        let load = match join_by(&mut load_task, ceiling, "load").await {
            Joined::Done(summary) => Some(summary),
            Joined::Failed => None,
            Joined::Overran => {
                end = RunEnd::HardTimeout;
                None
            }
        };

        let outcome = match stop {
            RunStop::Elapsed => RunOutcome::Completed { end },
            RunStop::Abort(reason) => RunOutcome::Aborted { reason },
        };
        // Samples still queued after the target died were taken from a dead process.
        let trust_queue = !matches!(
            outcome,
            RunOutcome::Aborted {
                reason: AbortReason::TargetDied { .. }
            }
        );
        if trust_queue {
            while let Ok(event) = rx.try_recv() {
                collect(&mut aggregator, event);
            }
        }

        let after = if outcome.is_aborted() {
            None
        } else {
            Some(snapshots.snapshot(probes.as_slice()).await)
        };

        Measured {
            outcome,
            aggregator,
            load,
            sampler,
            before,
            after,
        }
    }

    fn assemble(
        &self,
        run_id: Uuid,
        scenario: ScenarioConfig,
        started_at: chrono::DateTime<Utc>,
        measured: Measured,
        process_exit: Option<ProcessExitInfo>,
        mut trace: StateTrace,
    ) -> BenchmarkResult {
        let Measured {
            outcome,
            aggregator,
            load,
            sampler,
            before,
            after,
        } = measured;
        let partial = outcome.is_aborted();

        let aggregation = aggregator.finalize(scenario.sample_floor(partial));
        let mut verdicts = evaluate_all(&aggregation.stats, &scenario.targets);
        let mut bottlenecks = find_bottlenecks(&verdicts);
        if let Some(unreachable) = &sampler.unreachable {
            fail_unreachable(&mut verdicts, &unreachable.metric);
            bottlenecks.push(unreachable_finding(
                &unreachable.metric,
                unreachable.consecutive_misses,
            ));
        }

        let degradations = after
            .map(|after| {
                detect_degradation(
                    &before,
                    &after,
                    &scenario.targets,
                    scenario.degradation_threshold,
                )
            })
            .unwrap_or_default();
        bottlenecks.extend(degradations.iter().map(degradation_finding));

        let regressions = match self.baseline.get(&scenario.name) {
            Some(previous) if !partial => compare_to_baseline(
                previous,
                &aggregation.stats,
                &scenario.targets,
                scenario.degradation_threshold,
            ),
            _ => Vec::new(),
        };
        bottlenecks.extend(
            regressions
                .iter()
                .filter(|regression| regression.regressed)
                .map(regression_finding),
        );
        rank_findings(&mut bottlenecks);

        let grade = overall_grade(&outcome, &verdicts);
        if !trace.current.is_terminal() {
            trace.advance(if partial {
                RunState::Aborted
            } else {
                RunState::Done
            });
        }
        match &outcome {
            RunOutcome::Aborted { reason } => {
                tracing::warn!(grade = %grade, reason = %reason, "scenario aborted")
            }
            RunOutcome::Completed { end } => {
                tracing::info!(grade = %grade, end = ?end, "scenario finished")
            }
        }

        BenchmarkResult {
            run_id,
            scenario,
            started_at,
            finished_at: Utc::now(),
            outcome,
            partial,
            grade,
            verdicts,
            bottlenecks,
            stats: aggregation.stats,
            series: aggregation.series,
            degradations,
            regressions,
            load,
            sampler,
            process_exit,
            state_trace: trace.visited,
        }
    }
}

fn collect(aggregator: &mut Aggregator, event: SamplerEvent) {
    match event {
        SamplerEvent::Sample(sample) => aggregator.append(sample),
        SamplerEvent::Miss { metric } => aggregator.record_miss(&metric),
    }
}
