//! Staged stress test against a local HTTP service.
//!
//! Ramps virtual users in steps, spikes, backs off, and judges the run with
//! latency and error-rate thresholds. Run with a service listening on
//! localhost:8080 (any JSON API will do).

use std::time::Duration;

use surge::{
    Iteration, IterationError, JsonFileReporter, RampingVusExecutor, Reporter, RequestSpec,
    RunOptions, Scenario, Stage, StdoutReporter, TestRun, ThinkTime, Threshold,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().init();

    let scenario = Scenario::builder()
        .name("api gateway stress")
        .action(|it: Iteration<()>| async move {
            let res = it.http.execute(RequestSpec::get("/actuator/health")).await?;
            it.check(&res, "status is 200", |r| r.status == 200);
            Ok::<_, IterationError>(())
        })
        .build();

    let summary = TestRun::builder()
        .scenario(scenario)
        .executor(
            RampingVusExecutor::builder()
                .stages(vec![
                    // Warm up, then two spikes with holds, then back off.
                    Stage::new(Duration::from_secs(30), 100.0),
                    Stage::new(Duration::from_secs(10), 500.0),
                    Stage::new(Duration::from_secs(30), 500.0),
                    Stage::new(Duration::from_secs(10), 1000.0),
                    Stage::new(Duration::from_secs(60), 1000.0),
                    Stage::new(Duration::from_secs(30), 0.0),
                ])
                .think_time(ThinkTime::fixed(Duration::from_millis(50)))
                .build(),
        )
        .thresholds(vec![
            Threshold::parse("http_req_duration{expected_response:true}", "p(95)<1000")?,
            Threshold::parse("http_req_duration{expected_response:true}", "p(99)<2000")?,
            Threshold::parse("http_req_failed", "rate<0.10")?,
            Threshold::parse("checks", "rate>0.90")?,
        ])
        .options(RunOptions::builder().base_url("http://localhost:8080").build())
        .build()
        .run()
        .await?;

    StdoutReporter.report(&summary).await?;
    JsonFileReporter::new("surge-summary.json").report(&summary).await?;

    std::process::exit(if summary.passed { 0 } else { 1 });
}
