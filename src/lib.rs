//! Surge is a small, composable load-generation engine for HTTP services.
//!
//! Surge provides the core a load test needs and nothing else: you describe
//! *what* one virtual user does (a [`Scenario`] with an async iteration
//! closure), *how* load is shaped (an [`Executor`]: staged virtual-user ramps
//! or a constant/ramping arrival rate), and *when* the run counts as passed
//! (a list of [`Threshold`]s over the collected metrics). A [`TestRun`] wires
//! those together and produces a [`RunSummary`] you can render as a table or
//! serialize as JSON.
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`Scenario`]: the benchmark definition, i.e. the per-iteration action
//!   plus optional one-time setup/teardown hooks. Setup output (an auth
//!   token, a prepared fixture) is shared read-only with every iteration.
//! - [`Executor`]: the runtime strategy. [`RampingVusExecutor`] sizes a pool
//!   of looping virtual users to follow a [`Stage`] schedule;
//!   [`ArrivalRateExecutor`] starts iterations at a scheduled rate through a
//!   token bucket, independent of how long each one takes.
//! - [`HttpClient`]: the request executor. Issues calls, enforces timeouts,
//!   classifies outcomes, and records latency/failure samples for every call.
//! - [`MetricRegistry`]: the shared sample store, sharded and keyed by metric
//!   name + tags, queried through consistent snapshots.
//! - [`Threshold`]: pass/fail predicates (`p(95)<1000`, `rate<0.10`, ...)
//!   evaluated against snapshots, optionally while the run is live
//!   (abort-on-breach).
//! - [`RunSummary`] and [`Reporter`]: pure result data and the I/O boundary
//!   that renders or exports it.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use surge::{
//!     Iteration, IterationError, RampingVusExecutor, Reporter, RequestSpec, RunOptions,
//!     Scenario, Stage, StdoutReporter, TestRun, ThinkTime, Threshold,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let scenario = Scenario::builder()
//!         .name("gateway health under spike")
//!         .action(|it: Iteration<()>| async move {
//!             let res = it.http.execute(RequestSpec::get("/actuator/health")).await?;
//!             it.check(&res, "status is 200", |r| r.status == 200);
//!             Ok::<_, IterationError>(())
//!         })
//!         .build();
//!
//!     let summary = TestRun::builder()
//!         .scenario(scenario)
//!         .executor(
//!             RampingVusExecutor::builder()
//!                 // Ramp to 100 virtual users over a minute, hold, back off.
//!                 .stages(vec![
//!                     Stage::new(Duration::from_secs(60), 100.0),
//!                     Stage::new(Duration::from_secs(120), 100.0),
//!                     Stage::new(Duration::from_secs(30), 0.0),
//!                 ])
//!                 .think_time(ThinkTime::fixed(Duration::from_millis(500)))
//!                 .build(),
//!         )
//!         .thresholds(vec![
//!             Threshold::parse("http_req_duration{expected_response:true}", "p(95)<1000")?,
//!             Threshold::parse("http_req_failed", "rate<0.10")?,
//!         ])
//!         .options(RunOptions::builder().base_url("http://localhost:8080").build())
//!         .build()
//!         .run()
//!         .await?;
//!
//!     StdoutReporter.report(&summary).await?;
//!     assert!(summary.passed);
//!     Ok(())
//! }
//! ```
//!
//! # Design goals
//!
//! - Small, well-documented core that is easy to extend; executors and
//!   reporters are replaceable.
//! - Per-iteration failures never take down the run: they are recorded as
//!   samples and the virtual user keeps looping. Only a failed setup hook is
//!   fatal.
//! - Cancellation only at iteration boundaries: an in-flight request always
//!   completes and is recorded, whether the run drains naturally or a
//!   threshold breach aborts it early.

/// Error taxonomy
pub mod error;
/// Orchestrators that define how load is generated
pub mod executor;
/// HTTP request execution
pub mod http;
/// Sample collection and aggregation
pub mod metrics;
/// Summaries and reporters
pub mod report;
/// Run orchestration and lifecycle
pub mod run;
/// Scenario definition and the per-iteration context
pub mod scenario;
/// Ramp schedules
pub mod stage;
/// Pass/fail criteria
pub mod threshold;

pub use error::{
    EngineError, HookError, IterationError, ReportError, RequestError, RunError,
    ThresholdParseError,
};
pub use executor::{ArrivalRateExecutor, ExecutionContext, Executor, RampingVusExecutor, ThinkTime};
pub use http::{HttpClient, HttpResponse, Method, RequestSpec};
pub use metrics::{MetricRegistry, MetricsSnapshot, Sample, SeriesSnapshot};
pub use report::{JsonFileReporter, JsonReporter, Reporter, RunSummary, StdoutReporter};
pub use run::{RunOptions, RunState, TestRun};
pub use scenario::{Iteration, Scenario, SetupFn, TeardownFn};
pub use stage::{target_at, total_duration, Stage};
pub use threshold::{MetricSelector, Threshold, ThresholdResult};
