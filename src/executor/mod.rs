//! The runtime strategies that drive a scenario.
//!
//! An [`Executor`] owns concurrency and pacing for one run. Two strategies are
//! built in:
//!
//! - [`RampingVusExecutor`]: a pool of virtual users whose size follows a
//!   stage schedule; each virtual user loops the action with an optional
//!   think-time pause. This is the closed, user-count model.
//! - [`ArrivalRateExecutor`]: a token-bucket governor that starts iterations
//!   at a scheduled rate regardless of how long each one takes, backed by a
//!   fixed worker pool. This is the open model used for saturation testing.
//!
//! Both drain cleanly: cancellation is observed at iteration boundaries only,
//! so an in-flight request is never abandoned and every completed iteration is
//! recorded.

pub mod rate;
pub mod vus;

pub use rate::ArrivalRateExecutor;
pub use vus::{RampingVusExecutor, ThinkTime};

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{EngineError, IterationError};
use crate::http::HttpClient;
use crate::metrics::MetricRegistry;
use crate::run::RunState;
use crate::scenario::{Iteration, Scenario};

/// Shared state an executor needs while driving a run: the abort signal, the
/// run-state channel, the sample registry, the request executor, and the
/// read-only setup output.
pub struct ExecutionContext<S> {
    /// Becomes `true` when the run should stop early (threshold breach).
    pub shutdown: watch::Receiver<bool>,
    /// Publishes run-state transitions (executors set `Draining`).
    pub state: Arc<watch::Sender<RunState>>,
    pub registry: Arc<MetricRegistry>,
    pub http: HttpClient,
    pub setup: Arc<S>,
}

impl<S> Clone for ExecutionContext<S> {
    fn clone(&self) -> Self {
        Self {
            shutdown: self.shutdown.clone(),
            state: self.state.clone(),
            registry: self.registry.clone(),
            http: self.http.clone(),
            setup: self.setup.clone(),
        }
    }
}

/// The runtime hook that executes a [`Scenario`].
pub trait Executor<S, F, Fut>
where
    Self: Send + Sync + Sized,
    S: Send + Sync + 'static,
    F: Fn(Iteration<S>) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<(), IterationError>> + Send + 'static,
{
    /// Drive the scenario to completion (or until the context's shutdown
    /// signal fires), leaving all results in the context's registry.
    fn exec(
        &self,
        scenario: &Scenario<S, F, Fut>,
        ctx: ExecutionContext<S>,
    ) -> impl Future<Output = Result<(), EngineError>> + Send;
}

/// Run one iteration of the action and record its outcome: exactly one
/// `iterations` sample per call, tagged `ok` or `error`.
pub(crate) async fn run_iteration<S, F, Fut>(action: &F, ctx: &ExecutionContext<S>, vu: u64, seq: u64)
where
    S: Send + Sync + 'static,
    F: Fn(Iteration<S>) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<(), IterationError>> + Send + 'static,
{
    let iteration = Iteration::new(
        vu,
        seq,
        ctx.setup.clone(),
        ctx.http.clone(),
        ctx.registry.clone(),
    );
    match action(iteration).await {
        Ok(()) => {
            ctx.registry
                .add_tagged(crate::metrics::names::ITERATIONS, 1.0, &[("status", "ok")]);
        }
        Err(err) => {
            tracing::warn!(vu, seq, error = %err, "iteration failed");
            ctx.registry.add_tagged(
                crate::metrics::names::ITERATIONS,
                1.0,
                &[("status", "error")],
            );
        }
    }
}
