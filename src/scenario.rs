//! Scenario definition: the iteration closure and its one-time hooks.
//!
//! A [`Scenario`] ties together a name, the per-iteration action every virtual
//! user runs in a loop, and optional setup/teardown hooks. The setup hook runs
//! once on a single context before any virtual user starts; its output is
//! shared read-only (`Arc<S>`) with every iteration, the place for an auth
//! token or any other prepared fixture. If setup fails the run aborts, since
//! no iteration can proceed without its result. Teardown runs once after the
//! pool has drained.
//!
//! ```no_run
//! use surge::{HookError, HttpClient, Iteration, IterationError, RequestSpec, Scenario};
//!
//! #[derive(Default)]
//! struct Session {
//!     token: String,
//! }
//!
//! let scenario = Scenario::builder()
//!     .name("create trips")
//!     .setup(Box::new(|http: HttpClient| {
//!         Box::pin(async move {
//!             let res = http
//!                 .execute(RequestSpec::post("/api/users/login").json(&serde_json::json!({
//!                     "email": "loadtest@example.com",
//!                     "password": "hunter2",
//!                 })))
//!                 .await?;
//!             let body: serde_json::Value = res.json()?;
//!             let token = body["accessToken"].as_str().unwrap_or_default().to_string();
//!             Ok::<_, HookError>(Session { token })
//!         })
//!     }))
//!     .action(|it: Iteration<Session>| async move {
//!         let res = it
//!             .http
//!             .execute(
//!                 RequestSpec::post("/api/trips/create")
//!                     .header("authorization", format!("Bearer {}", it.setup.token))
//!                     .expect_status([200, 201]),
//!             )
//!             .await?;
//!         it.check(&res, "trip has an id", |r| {
//!             r.json::<serde_json::Value>()
//!                 .map(|b| !b["id"].is_null())
//!                 .unwrap_or(false)
//!         });
//!         Ok::<_, IterationError>(())
//!     })
//!     .build();
//! # let _ = scenario;
//! ```

use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;
use typed_builder::TypedBuilder;

use crate::error::{HookError, IterationError};
use crate::http::HttpClient;
use crate::metrics::{names, MetricRegistry};

/// One-time setup hook: receives the shared HTTP client, produces the value
/// threaded into every iteration.
pub type SetupFn<S> =
    Box<dyn FnOnce(HttpClient) -> BoxFuture<'static, Result<S, HookError>> + Send + Sync>;

/// One-time teardown hook, run after the pool drains. Failures are logged,
/// never fatal.
pub type TeardownFn =
    Box<dyn FnOnce(HttpClient) -> BoxFuture<'static, Result<(), HookError>> + Send + Sync>;

/// Context handed to the action for one iteration of one virtual user.
pub struct Iteration<S> {
    /// Id of the virtual user running this iteration.
    pub vu: u64,
    /// 1-based iteration number within this virtual user.
    pub seq: u64,
    /// Read-only setup output, shared by every virtual user.
    pub setup: Arc<S>,
    /// The shared request executor.
    pub http: HttpClient,
    registry: Arc<MetricRegistry>,
}

impl<S> Iteration<S> {
    pub(crate) fn new(
        vu: u64,
        seq: u64,
        setup: Arc<S>,
        http: HttpClient,
        registry: Arc<MetricRegistry>,
    ) -> Self {
        Self {
            vu,
            seq,
            setup,
            http,
            registry,
        }
    }

    /// Evaluate a named check against a response (or anything else), record
    /// it on the `checks` series, and hand back the verdict.
    pub fn check<T>(&self, target: &T, name: &str, predicate: impl FnOnce(&T) -> bool) -> bool {
        let passed = predicate(target);
        self.registry.add_tagged(
            names::CHECKS,
            if passed { 1.0 } else { 0.0 },
            &[("check", name)],
        );
        passed
    }

    /// Record a hit/miss observation on a custom rate series.
    pub fn rate(&self, name: &str, hit: bool) {
        self.registry.add(name, if hit { 1.0 } else { 0.0 });
    }

    /// Add to a custom counter series.
    pub fn count(&self, name: &str, n: f64) {
        self.registry.add(name, n);
    }

    /// Record an arbitrary value on a custom trend series.
    pub fn observe(&self, name: &str, value: f64) {
        self.registry.add(name, value);
    }
}

/// The benchmark definition: a name, the iteration action, and optional
/// one-time hooks.
#[derive(TypedBuilder)]
pub struct Scenario<S, F, Fut>
where
    S: Send + Sync + 'static,
    F: Fn(Iteration<S>) -> Fut + Send + Sync + Clone + 'static,
    Fut: std::future::Future<Output = Result<(), IterationError>> + Send + 'static,
{
    #[builder(setter(into))]
    pub name: String,
    pub action: F,
    #[builder(default, setter(strip_option))]
    pub setup: Option<SetupFn<S>>,
    #[builder(default, setter(strip_option))]
    pub teardown: Option<TeardownFn>,
    #[builder(default, setter(skip))]
    _marker: PhantomData<fn() -> Fut>,
}
