//! The arrival-rate executor.
//!
//! Open-model pacing: a governor task converts the scheduled rate (iterations
//! per second, interpolated from the stage list) into discrete tokens, adding
//! them to a semaphore every `tick`; a fixed pool of workers each claim one
//! token per iteration. Iteration starts therefore track the schedule
//! independently of how long each iteration takes. This is the
//! saturation-testing mode, where latency degradation shows up as token
//! backlog instead of a falling request rate.
//!
//! Fractional tokens are carried between ticks so the long-term average
//! matches the schedule exactly (a 12.5/s rate ticked at 100ms adds 1 token
//! on three ticks and 2 on the fourth).

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use typed_builder::TypedBuilder;

use super::{run_iteration, ExecutionContext, Executor};
use crate::error::{EngineError, IterationError};
use crate::run::RunState;
use crate::scenario::{Iteration, Scenario};
use crate::stage::{self, Stage};

/// The semaphore implementation reserves 3 bits of usize for flags; cap token
/// grants below that to avoid panicking the bucket.
const MAX_TOKENS: usize = usize::MAX >> 3;

/// Executor that starts iterations at a scheduled rate via a token bucket.
#[derive(TypedBuilder)]
pub struct ArrivalRateExecutor {
    /// Rate schedule; targets are iterations per second.
    pub stages: Vec<Stage>,
    /// Granularity of governor updates. Smaller ticks reduce quantization
    /// error but cause more wakeups.
    #[builder(default = Duration::from_millis(100))]
    pub tick: Duration,
    /// Maximum surplus tokens stored from previous ticks; bounds how large a
    /// burst can get after a stall.
    #[builder(default = MAX_TOKENS)]
    pub bucket_capacity: usize,
    /// Number of pre-allocated workers claiming tokens. Caps the concurrency
    /// the schedule can actually reach.
    #[builder(default = num_cpus::get() * 120)]
    pub workers: usize,
}

impl<S, F, Fut> Executor<S, F, Fut> for ArrivalRateExecutor
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
        let tokens = Arc::new(Semaphore::new(0));
        let (start_tx, start_rx) = watch::channel(false);

        tracing::info!(
            scenario = %scenario.name,
            workers = self.workers,
            "starting arrival-rate executor"
        );
        let governor = tokio::spawn(pacing_governor(
            self.stages.clone(),
            self.tick,
            self.bucket_capacity,
            tokens.clone(),
            ctx.shutdown.clone(),
            start_rx.clone(),
        ));

        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(self.workers);
        for worker in 0..self.workers {
            handles.push(tokio::spawn(worker_loop(
                worker as u64 + 1,
                scenario.action.clone(),
                ctx.clone(),
                tokens.clone(),
                start_rx.clone(),
            )));
        }

        start_tx.send_replace(true);
        governor.await?;

        ctx.state.send_replace(RunState::Draining);
        tracing::info!("schedule complete, draining workers");
        // Closing the bucket makes every idle worker's acquire fail; workers
        // mid-iteration finish first.
        tokens.close();
        for result in join_all(handles).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "worker task failed");
            }
        }

        Ok(())
    }
}

/// Tokens to add for one tick at `rate` iterations/second, carrying the
/// fractional remainder to the next tick.
fn tokens_for_tick(rate: f64, tick: Duration, fractional: f64) -> (usize, f64) {
    let owed = rate.max(0.0) * tick.as_secs_f64() + fractional;
    let grant = owed.floor();
    let fractional = owed - grant;

    let grant = if grant >= MAX_TOKENS as f64 {
        MAX_TOKENS
    } else {
        grant as usize
    };
    (grant, fractional)
}

/// Governor task: adds tokens to the bucket according to the schedule.
async fn pacing_governor(
    stages: Vec<Stage>,
    tick: Duration,
    bucket_capacity: usize,
    tokens: Arc<Semaphore>,
    mut shutdown: watch::Receiver<bool>,
    mut start: watch::Receiver<bool>,
) {
    if start.wait_for(|s| *s).await.is_err() {
        return;
    }

    let total = stage::total_duration(&stages);
    let started = Instant::now();
    let mut next_tick = started;
    let mut fractional = 0.0;

    loop {
        let elapsed = started.elapsed();
        if elapsed >= total || *shutdown.borrow() {
            break;
        }

        let rate = stage::target_at(&stages, elapsed);
        let (grant, carry) = tokens_for_tick(rate, tick, fractional);
        fractional = carry;

        if grant > 0 {
            let available = tokens.available_permits();
            if available < bucket_capacity {
                tokens.add_permits(grant.min(bucket_capacity - available));
            }
        }

        next_tick += tick;
        tokio::select! {
            _ = tokio::time::sleep_until(next_tick) => {}
            _ = shutdown.wait_for(|stop| *stop) => {}
        }
    }
    tracing::debug!("governor finished");
}

/// Worker task: claim one token per iteration. The claimed permit is
/// forgotten; only the governor ever adds permits back.
async fn worker_loop<S, F, Fut>(
    id: u64,
    action: F,
    ctx: ExecutionContext<S>,
    tokens: Arc<Semaphore>,
    mut start: watch::Receiver<bool>,
) where
    S: Send + Sync + 'static,
    F: Fn(Iteration<S>) -> Fut + Send + Sync + Clone + 'static,
    Fut: std::future::Future<Output = Result<(), IterationError>> + Send + 'static,
{
    if start.wait_for(|s| *s).await.is_err() {
        return;
    }

    let mut shutdown = ctx.shutdown.clone();
    let mut seq = 0u64;

    loop {
        if *shutdown.borrow() {
            break;
        }
        let claimed = tokio::select! {
            permit = tokens.acquire() => match permit {
                Ok(p) => {
                    p.forget();
                    true
                }
                Err(_closed) => break,
            },
            _ = shutdown.wait_for(|stop| *stop) => false,
        };
        if !claimed {
            break;
        }

        seq += 1;
        // Awaited outside any select: an iteration, once started, always
        // completes and is recorded.
        run_iteration(&action, &ctx, id, seq).await;
    }
    tracing::debug!(worker = id, iterations = seq, "worker retired");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::http::HttpClient;
    use crate::metrics::{names, MetricRegistry};
    use crate::run::RunOptions;

    mod tokens_for_tick {
        use super::*;

        #[test]
        fn whole_rates_carry_nothing() {
            let mut rate = 10.0;
            let mut expected = 1;
            for _ in 0..6 {
                let (grant, carry) = tokens_for_tick(rate, Duration::from_millis(100), 0.0);
                assert_eq!(grant, expected);
                assert_eq!(carry, 0.0);
                rate *= 10.0;
                expected *= 10;
            }
        }

        #[test]
        fn fractions_accumulate_across_ticks() {
            // 12.5/s at 100ms ticks: 1.25 tokens per tick.
            let mut carry = 0.0;
            let mut granted = 0;
            for _ in 0..8 {
                let (grant, c) = tokens_for_tick(12.5, Duration::from_millis(100), carry);
                carry = c;
                granted += grant;
            }
            // 8 ticks * 1.25 = exactly 10 tokens, none lost to rounding.
            assert_eq!(granted, 10);
            assert_eq!(carry, 0.0);
        }

        #[test]
        fn negative_rate_grants_nothing() {
            let (grant, carry) = tokens_for_tick(-100.0, Duration::from_millis(100), 0.0);
            assert_eq!(grant, 0);
            assert_eq!(carry, 0.0);
        }

        #[test]
        fn extreme_rate_caps_at_the_semaphore_limit() {
            let (grant, _) = tokens_for_tick(f64::MAX, Duration::from_secs(1), 0.0);
            assert_eq!(grant, MAX_TOKENS);
        }
    }

    fn test_ctx() -> (
        ExecutionContext<()>,
        watch::Sender<bool>,
        std::sync::Arc<MetricRegistry>,
    ) {
        let registry = std::sync::Arc::new(MetricRegistry::new());
        let http = HttpClient::new(registry.clone(), &RunOptions::builder().build()).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, _state_rx) = watch::channel(RunState::Running);
        let ctx = ExecutionContext {
            shutdown: shutdown_rx,
            state: std::sync::Arc::new(state_tx),
            registry: registry.clone(),
            http,
            setup: std::sync::Arc::new(()),
        };
        (ctx, shutdown_tx, registry)
    }

    #[tokio::test]
    async fn paces_iterations_near_the_scheduled_rate() {
        let calls = std::sync::Arc::new(AtomicU64::new(0));
        let scenario = {
            let calls = calls.clone();
            Scenario::builder()
                .name("paced")
                .action(move |_it: Iteration<()>| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, IterationError>(())
                    }
                })
                .build()
        };

        let executor = ArrivalRateExecutor::builder()
            .stages(vec![
                Stage::new(Duration::ZERO, 50.0),
                Stage::new(Duration::from_millis(500), 50.0),
            ])
            .tick(Duration::from_millis(20))
            .workers(8)
            .build();

        let (ctx, _shutdown, registry) = test_ctx();
        executor.exec(&scenario, ctx).await.unwrap();

        // 50/s over 0.5s is 25 scheduled starts; allow generous scheduling
        // slop in either direction.
        let total = calls.load(Ordering::SeqCst);
        assert!((5..=45).contains(&total), "unexpected iteration count {total}");

        let recorded = registry.snapshot().get(names::ITERATIONS).unwrap();
        assert_eq!(recorded.count, total);
    }

    #[tokio::test]
    async fn drains_workers_when_the_schedule_ends() {
        let scenario = Scenario::builder()
            .name("noop")
            .action(|_it: Iteration<()>| async move { Ok::<_, IterationError>(()) })
            .build();

        let executor = ArrivalRateExecutor::builder()
            .stages(vec![
                Stage::new(Duration::ZERO, 20.0),
                Stage::new(Duration::from_millis(200), 20.0),
            ])
            .tick(Duration::from_millis(20))
            .workers(4)
            .build();

        let (ctx, _shutdown, _registry) = test_ctx();
        let started = Instant::now();
        executor.exec(&scenario, ctx).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
