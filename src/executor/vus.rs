//! The ramping virtual-user pool.
//!
//! A controller task wakes every `tick`, computes the scheduled concurrency
//! from the stage list, and grows or shrinks the pool to match. Each virtual
//! user is a task looping `action → think-time pause → repeat`. Scale-down
//! flips the newest users' cancel flag and parks their handles; the flag is
//! observed at the next iteration boundary, so an in-flight request always
//! completes and is recorded before the user retires. A stuck request
//! therefore delays only its own retirement, never the controller.

use std::time::Duration;

use futures::future::join_all;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use typed_builder::TypedBuilder;

use super::{run_iteration, ExecutionContext, Executor};
use crate::error::{EngineError, IterationError};
use crate::metrics::names;
use crate::run::RunState;
use crate::scenario::{Iteration, Scenario};
use crate::stage::{self, Stage};

/// Pause between iterations of one virtual user, uniform over `[min, max]`.
#[derive(Clone, Copy, Debug)]
pub struct ThinkTime {
    min: Duration,
    max: Duration,
}

impl ThinkTime {
    pub fn fixed(pause: Duration) -> Self {
        Self { min: pause, max: pause }
    }

    pub fn uniform(a: Duration, b: Duration) -> Self {
        Self {
            min: a.min(b),
            max: a.max(b),
        }
    }

    fn sample(&self) -> Duration {
        if self.min >= self.max {
            return self.min;
        }
        let secs = rand::thread_rng().gen_range(self.min.as_secs_f64()..=self.max.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

/// Executor that sizes a pool of looping virtual users to follow a stage
/// schedule (the closed model: concurrency is controlled, throughput is
/// whatever the system under test sustains).
#[derive(TypedBuilder)]
pub struct RampingVusExecutor {
    /// Concurrency schedule; targets are virtual-user counts.
    pub stages: Vec<Stage>,
    /// Control-loop interval. Finer ticks follow fast ramps more closely.
    #[builder(default = Duration::from_millis(100))]
    pub tick: Duration,
    /// Pause between iterations of each virtual user.
    #[builder(default, setter(strip_option))]
    pub think_time: Option<ThinkTime>,
    /// Hard cap on pool size, whatever the schedule says.
    #[builder(default = 10_000)]
    pub max_vus: usize,
}

struct VuHandle {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl<S, F, Fut> Executor<S, F, Fut> for RampingVusExecutor
where
    S: Send + Sync + 'static,
    F: Fn(Iteration<S>) -> Fut + Send + Sync + Clone + 'static,
    Fut: std::future::Future<Output = Result<(), IterationError>> + Send + 'static,
{
    async fn exec(
        &self,
        scenario: &Scenario<S, F, Fut>,
        ctx: ExecutionContext<S>,
    ) -> Result<(), EngineError> {
        let total = stage::total_duration(&self.stages);
        let action = scenario.action.clone();
        let mut shutdown = ctx.shutdown.clone();

        tracing::info!(
            scenario = %scenario.name,
            stages = self.stages.len(),
            schedule_secs = total.as_secs_f64(),
            "starting ramping-vus executor"
        );

        let started = Instant::now();
        let mut next_tick = started;
        let mut pool: Vec<VuHandle> = Vec::new();
        let mut retired: Vec<JoinHandle<()>> = Vec::new();
        let mut next_id: u64 = 0;

        loop {
            let elapsed = started.elapsed();
            if elapsed >= total || *shutdown.borrow() {
                break;
            }

            let desired = (stage::target_at(&self.stages, elapsed).round().max(0.0) as usize)
                .min(self.max_vus);

            while pool.len() < desired {
                next_id += 1;
                let (cancel_tx, cancel_rx) = watch::channel(false);
                let handle = tokio::spawn(vu_loop(
                    next_id,
                    action.clone(),
                    ctx.clone(),
                    cancel_rx,
                    self.think_time,
                ));
                pool.push(VuHandle {
                    cancel: cancel_tx,
                    handle,
                });
            }
            while pool.len() > desired {
                if let Some(vu) = pool.pop() {
                    let _ = vu.cancel.send(true);
                    retired.push(vu.handle);
                }
            }

            ctx.registry.add(names::VUS, pool.len() as f64);

            next_tick += self.tick;
            tokio::select! {
                _ = tokio::time::sleep_until(next_tick) => {}
                _ = shutdown.wait_for(|stop| *stop) => {}
            }
        }

        ctx.state.send_replace(RunState::Draining);
        tracing::info!(live = pool.len(), "schedule complete, draining virtual users");
        for vu in pool {
            let _ = vu.cancel.send(true);
            retired.push(vu.handle);
        }
        for result in join_all(retired).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "virtual user task failed");
            }
        }

        Ok(())
    }
}

/// One virtual user: run the action, record the outcome, pause, repeat until
/// cancelled. Cancellation is only observed here, between iterations.
async fn vu_loop<S, F, Fut>(
    id: u64,
    action: F,
    ctx: ExecutionContext<S>,
    mut cancel: watch::Receiver<bool>,
    think_time: Option<ThinkTime>,
) where
    S: Send + Sync + 'static,
    F: Fn(Iteration<S>) -> Fut + Send + Sync + Clone + 'static,
    Fut: std::future::Future<Output = Result<(), IterationError>> + Send + 'static,
{
    tracing::debug!(vu = id, "virtual user started");
    let mut shutdown = ctx.shutdown.clone();
    let mut seq = 0u64;

    loop {
        if *cancel.borrow() || *shutdown.borrow() {
            break;
        }
        seq += 1;
        run_iteration(&action, &ctx, id, seq).await;

        if let Some(think) = think_time {
            // The iteration is already complete and recorded; the pause may be
            // cut short by cancellation.
            tokio::select! {
                _ = tokio::time::sleep(think.sample()) => {}
                _ = cancel.wait_for(|c| *c) => {}
                _ = shutdown.wait_for(|stop| *stop) => {}
            }
        }
    }
    tracing::debug!(vu = id, iterations = seq, "virtual user retired");
}
