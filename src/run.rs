//! Run orchestration.
//!
//! [`TestRun`] owns one execution: it runs the setup hook on a single context,
//! hands the executor a shared [`ExecutionContext`], optionally watches
//! thresholds while the run is live, waits for the drain, runs teardown, and
//! evaluates every threshold against the final snapshot. The lifecycle is
//!
//! ```text
//! Pending -> Running -> Draining -> Completed
//!                    \-> Aborted (threshold breach)
//! ```
//!
//! A failed setup hook is the one fatal path: the run returns
//! [`RunError::Setup`] before any virtual user starts. A threshold breach is
//! not an error; the run drains, every threshold is still evaluated and
//! reported, and the summary carries `outcome: Aborted, passed: false`.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use typed_builder::TypedBuilder;

use crate::error::{IterationError, RunError};
use crate::executor::{ExecutionContext, Executor};
use crate::http::HttpClient;
use crate::metrics::MetricRegistry;
use crate::report::RunSummary;
use crate::scenario::{Iteration, Scenario};
use crate::threshold::{evaluate_all, Threshold};

/// Lifecycle of one run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    /// Schedule finished (or a breach fired); waiting for in-flight
    /// iterations.
    Draining,
    Completed,
    Aborted,
}

/// Run-wide knobs that are not part of the scenario or the executor.
#[derive(Clone, Debug, TypedBuilder)]
pub struct RunOptions {
    /// Default per-request timeout; individual requests may override it.
    #[builder(default = Duration::from_secs(30))]
    pub request_timeout: Duration,
    /// Joined in front of relative request URLs.
    #[builder(default, setter(strip_option, into))]
    pub base_url: Option<String>,
    /// Headers applied to every request (e.g. an Authorization template).
    #[builder(default)]
    pub base_headers: Vec<(String, String)>,
    /// Evaluate thresholds while the run is live and stop early on a breach.
    #[builder(default = false)]
    pub abort_on_breach: bool,
    /// Interval between rolling threshold evaluations.
    #[builder(default = Duration::from_secs(2))]
    pub breach_check_interval: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// One configured execution: scenario + executor + thresholds + options.
#[derive(TypedBuilder)]
pub struct TestRun<S, E, F, Fut>
where
    S: Default + Send + Sync + 'static,
    E: Executor<S, F, Fut>,
    F: Fn(Iteration<S>) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<(), IterationError>> + Send + 'static,
{
    pub scenario: Scenario<S, F, Fut>,
    pub executor: E,
    #[builder(default)]
    pub thresholds: Vec<Threshold>,
    #[builder(default)]
    pub options: RunOptions,
}

impl<S, E, F, Fut> TestRun<S, E, F, Fut>
where
    S: Default + Send + Sync + 'static,
    E: Executor<S, F, Fut>,
    F: Fn(Iteration<S>) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<(), IterationError>> + Send + 'static,
{
    /// Execute the run to completion and produce its summary.
    pub async fn run(mut self) -> Result<RunSummary, RunError> {
        let registry = Arc::new(MetricRegistry::new());
        let http = HttpClient::new(registry.clone(), &self.options)?;

        let (state_tx, _state_rx) = watch::channel(RunState::Pending);
        let state = Arc::new(state_tx);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown = Arc::new(shutdown_tx);

        // One-time setup on a single context. Fatal on failure: no iteration
        // can proceed without its output.
        let setup_output = match self.scenario.setup.take() {
            Some(setup) => {
                tracing::info!(scenario = %self.scenario.name, "running setup");
                match setup(http.clone()).await {
                    Ok(output) => output,
                    Err(e) => {
                        state.send_replace(RunState::Aborted);
                        return Err(RunError::Setup(e));
                    }
                }
            }
            None => S::default(),
        };

        let ctx = ExecutionContext {
            shutdown: shutdown_rx,
            state: state.clone(),
            registry: registry.clone(),
            http: http.clone(),
            setup: Arc::new(setup_output),
        };

        let breached = Arc::new(AtomicBool::new(false));
        let checker = self.spawn_breach_checker(&registry, &shutdown, &breached);

        state.send_replace(RunState::Running);
        let started = Instant::now();
        self.executor.exec(&self.scenario, ctx).await?;
        let elapsed = started.elapsed();

        if let Some(checker) = checker {
            checker.abort();
        }

        if let Some(teardown) = self.scenario.teardown.take() {
            tracing::info!(scenario = %self.scenario.name, "running teardown");
            if let Err(e) = teardown(http).await {
                tracing::warn!(error = %e, "teardown failed");
            }
        }

        let outcome = if breached.load(Ordering::SeqCst) {
            RunState::Aborted
        } else {
            RunState::Completed
        };
        state.send_replace(outcome);

        let snapshot = registry.snapshot();
        let results = evaluate_all(&self.thresholds, &snapshot);
        let passed = outcome == RunState::Completed && results.iter().all(|r| r.passed);

        let summary = RunSummary::build(
            self.scenario.name.clone(),
            outcome,
            elapsed,
            &snapshot,
            results,
            passed,
        );
        tracing::info!(
            scenario = %summary.scenario,
            passed = summary.passed,
            "run finished"
        );
        Ok(summary)
    }

    fn spawn_breach_checker(
        &self,
        registry: &Arc<MetricRegistry>,
        shutdown: &Arc<watch::Sender<bool>>,
        breached: &Arc<AtomicBool>,
    ) -> Option<tokio::task::JoinHandle<()>> {
        if !self.options.abort_on_breach || self.thresholds.is_empty() {
            return None;
        }

        let registry = registry.clone();
        let shutdown = shutdown.clone();
        let breached = breached.clone();
        let thresholds = self.thresholds.clone();
        let interval = self.options.breach_check_interval;

        Some(tokio::spawn(async move {
            let mut next = Instant::now() + interval;
            loop {
                tokio::time::sleep_until(next).await;
                next += interval;

                let results = evaluate_all(&thresholds, &registry.snapshot());
                if let Some(breach) = results.iter().find(|r| !r.passed) {
                    tracing::warn!(
                        threshold = %format!("{}: {}", breach.selector, breach.predicate),
                        observed = ?breach.observed,
                        "threshold breached, aborting run"
                    );
                    breached.store(true, Ordering::SeqCst);
                    shutdown.send_replace(true);
                    break;
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use super::*;
    use crate::executor::{RampingVusExecutor, ThinkTime};
    use crate::metrics::names;
    use crate::stage::Stage;

    #[tokio::test]
    async fn completed_run_reports_thresholds_and_passes() {
        let scenario = Scenario::builder()
            .name("all ok")
            .action(|_it: Iteration<()>| async move { Ok::<_, IterationError>(()) })
            .build();

        let summary = TestRun::builder()
            .scenario(scenario)
            .executor(
                RampingVusExecutor::builder()
                    .stages(vec![
                        Stage::new(Duration::ZERO, 2.0),
                        Stage::new(Duration::from_millis(200), 2.0),
                    ])
                    .tick(Duration::from_millis(20))
                    .think_time(ThinkTime::fixed(Duration::from_millis(5)))
                    .build(),
            )
            .thresholds(vec![
                Threshold::parse("iterations", "count>0").unwrap(),
                Threshold::parse("iterations{status:error}", "count<1").unwrap(),
            ])
            .build()
            .run()
            .await
            .unwrap();

        assert_eq!(summary.outcome, RunState::Completed);
        assert!(summary.passed);
        assert_eq!(summary.thresholds.len(), 2);
        assert!(summary.thresholds.iter().all(|t| t.passed));
        assert!(summary.metrics.contains_key(names::ITERATIONS));
    }

    #[tokio::test]
    async fn failing_threshold_fails_the_run_but_not_the_call() {
        let scenario = Scenario::builder()
            .name("always failing")
            .action(|_it: Iteration<()>| async move {
                Err::<(), _>(IterationError::Other("down".into()))
            })
            .build();

        let summary = TestRun::builder()
            .scenario(scenario)
            .executor(
                RampingVusExecutor::builder()
                    .stages(vec![
                        Stage::new(Duration::ZERO, 1.0),
                        Stage::new(Duration::from_millis(150), 1.0),
                    ])
                    .tick(Duration::from_millis(20))
                    .think_time(ThinkTime::fixed(Duration::from_millis(5)))
                    .build(),
            )
            .thresholds(vec![
                Threshold::parse("iterations{status:error}", "count<1").unwrap()
            ])
            .build()
            .run()
            .await
            .unwrap();

        assert_eq!(summary.outcome, RunState::Completed);
        assert!(!summary.passed);
        assert!(!summary.thresholds[0].passed);
    }

    #[tokio::test]
    async fn setup_failure_aborts_before_any_iteration() {
        let calls = Arc::new(AtomicU64::new(0));
        let scenario = {
            let calls = calls.clone();
            Scenario::builder()
                .name("doomed")
                .setup(Box::new(|_http: HttpClient| {
                    Box::pin(async move { Err("registration failed".into()) })
                }))
                .action(move |_it: Iteration<()>| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, IterationError>(())
                    }
                })
                .build()
        };

        let err = TestRun::builder()
            .scenario(scenario)
            .executor(
                RampingVusExecutor::builder()
                    .stages(vec![
                        Stage::new(Duration::ZERO, 2.0),
                        Stage::new(Duration::from_millis(100), 2.0),
                    ])
                    .build(),
            )
            .build()
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::Setup(_)), "{err}");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn setup_output_is_shared_with_every_iteration() {
        #[derive(Default)]
        struct Session {
            token: String,
        }

        let seen = Arc::new(AtomicU64::new(0));
        let scenario = {
            let seen = seen.clone();
            Scenario::builder()
                .name("token flows")
                .setup(Box::new(|_http: HttpClient| {
                    Box::pin(async move {
                        Ok(Session {
                            token: "secret-token".to_string(),
                        })
                    })
                }))
                .action(move |it: Iteration<Session>| {
                    let seen = seen.clone();
                    async move {
                        if it.setup.token == "secret-token" {
                            seen.fetch_add(1, Ordering::SeqCst);
                        }
                        Ok::<_, IterationError>(())
                    }
                })
                .build()
        };

        let summary = TestRun::builder()
            .scenario(scenario)
            .executor(
                RampingVusExecutor::builder()
                    .stages(vec![
                        Stage::new(Duration::ZERO, 2.0),
                        Stage::new(Duration::from_millis(150), 2.0),
                    ])
                    .tick(Duration::from_millis(20))
                    .think_time(ThinkTime::fixed(Duration::from_millis(5)))
                    .build(),
            )
            .build()
            .run()
            .await
            .unwrap();

        assert!(summary.passed);
        assert!(seen.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn breach_aborts_early_and_still_reports_everything() {
        let scenario = Scenario::builder()
            .name("breached")
            .action(|_it: Iteration<()>| async move {
                Err::<(), _>(IterationError::Other("down".into()))
            })
            .build();

        let started = Instant::now();
        let summary = TestRun::builder()
            .scenario(scenario)
            .executor(
                RampingVusExecutor::builder()
                    .stages(vec![
                        Stage::new(Duration::ZERO, 2.0),
                        Stage::new(Duration::from_secs(30), 2.0),
                    ])
                    .tick(Duration::from_millis(20))
                    .think_time(ThinkTime::fixed(Duration::from_millis(5)))
                    .build(),
            )
            .thresholds(vec![
                Threshold::parse("iterations{status:error}", "count<3").unwrap(),
                Threshold::parse("iterations", "count>0").unwrap(),
            ])
            .options(
                RunOptions::builder()
                    .abort_on_breach(true)
                    .breach_check_interval(Duration::from_millis(50))
                    .build(),
            )
            .build()
            .run()
            .await
            .unwrap();

        assert!(
            started.elapsed() < Duration::from_secs(10),
            "breach should abort long before the 30s schedule"
        );
        assert_eq!(summary.outcome, RunState::Aborted);
        assert!(!summary.passed);
        // Both thresholds are reported even though the run was cut short.
        assert_eq!(summary.thresholds.len(), 2);
    }

    #[tokio::test]
    async fn teardown_runs_after_the_drain() {
        let torn_down = Arc::new(AtomicBool::new(false));
        let scenario = {
            let torn_down = torn_down.clone();
            Scenario::builder()
                .name("with teardown")
                .teardown(Box::new(move |_http: HttpClient| {
                    Box::pin(async move {
                        torn_down.store(true, Ordering::SeqCst);
                        Ok(())
                    })
                }))
                .action(|_it: Iteration<()>| async move { Ok::<_, IterationError>(()) })
                .build()
        };

        let summary = TestRun::builder()
            .scenario(scenario)
            .executor(
                RampingVusExecutor::builder()
                    .stages(vec![
                        Stage::new(Duration::ZERO, 1.0),
                        Stage::new(Duration::from_millis(100), 1.0),
                    ])
                    .tick(Duration::from_millis(20))
                    .think_time(ThinkTime::fixed(Duration::from_millis(5)))
                    .build(),
            )
            .build()
            .run()
            .await
            .unwrap();

        assert!(summary.passed);
        assert!(torn_down.load(Ordering::SeqCst));
    }
}
