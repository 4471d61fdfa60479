use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;
use squall_runner::prelude::*;

const DEFAULT_URL: &str = "https://api.example.com/init";

#[derive(Debug, Default)]
struct BaselineRunnerContext {
    url: String,
}

impl UserValuesConstraint for BaselineRunnerContext {}

#[derive(Debug, Default)]
struct BaselineVuContext {
    logins_failed: u32,
}

impl UserValuesConstraint for BaselineVuContext {}

type Ctx = VuContext<BaselineRunnerContext, BaselineVuContext>;

/// Stands in for a real HTTP client: answers after a random delay and fails a fixed share of
/// requests with a 503.
#[derive(Debug)]
struct SimulatedTransport {
    min_latency: Duration,
    max_latency: Duration,
    failure_rate: f64,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self {
            min_latency: Duration::from_millis(20),
            max_latency: Duration::from_millis(400),
            failure_rate: 0.05,
        }
    }
}

#[async_trait::async_trait]
impl Transport for SimulatedTransport {
    async fn request(&self, request: &Request) -> Result<Response, TransportError> {
        let (latency, failed) = {
            let mut rng = rand::thread_rng();
            let latency = rng.gen_range(
                self.min_latency.as_millis() as u64..=self.max_latency.as_millis() as u64,
            );
            (Duration::from_millis(latency), rng.gen_bool(self.failure_rate))
        };

        log::trace!("{} {} answered in {latency:?}", request.method, request.target);
        tokio::time::sleep(latency).await;

        if failed {
            Ok(Response::new(503, latency))
        } else {
            Ok(Response::new(200, latency).with_body(r#"{"isLogin":true}"#))
        }
    }
}

fn base_url() -> SquallResult<String> {
    match std::env::var("BASELINE_URL") {
        Ok(url) if !url.trim().is_empty() => Ok(url),
        Ok(_) => anyhow::bail!("BASELINE_URL is set but empty"),
        Err(_) => Ok(DEFAULT_URL.to_string()),
    }
}

fn setup(ctx: &mut RunnerContext<BaselineRunnerContext>) -> HookResult {
    ctx.get_mut().url = base_url()?;
    log::info!("Checking login state at {}", ctx.get().url);
    Ok(())
}

fn is_login(ctx: &mut Ctx) -> BoxFuture<'_, bool> {
    async move {
        let url = ctx.runner_context().get().url.clone();
        let response = ctx
            .request(Request::get(&url).with_name("isLogin"))
            .await;

        ctx.check(
            &response,
            Checks::new()
                .with("status is 200", |r: &Response| r.status == 200)
                .with("response time < 2000ms", |r: &Response| {
                    r.duration < Duration::from_secs(2)
                }),
        )
    }
    .boxed()
}

fn check_login(ctx: &mut Ctx) -> BoxFuture<'_, IterationResult> {
    async move {
        let policy = RetryPolicy::new(2, Backoff::Fixed(Duration::from_secs(1)))
            .with_error_metric("errors");
        let outcome = ctx.retry(&policy, is_login, |passed: &bool| *passed).await;

        let think_time = Duration::from_millis(rand::thread_rng().gen_range(0..500));
        ctx.sleep(think_time).await;

        if outcome.succeeded {
            Ok(())
        } else {
            ctx.get_mut().logins_failed += 1;
            Err(IterationError::assertion(format!(
                "isLogin failed after {} attempts",
                outcome.attempts
            )))
        }
    }
    .boxed()
}

fn vu_teardown(ctx: &mut Ctx) -> BoxFuture<'_, HookResult> {
    async move {
        if ctx.get().logins_failed > 0 {
            log::info!(
                "VU {} gave up on {} logins",
                ctx.vu_id(),
                ctx.get().logins_failed
            );
        }
        Ok(())
    }
    .boxed()
}

fn teardown(ctx: Arc<RunnerContext<BaselineRunnerContext>>) -> HookResult {
    log::info!(
        "Baseline finished after {} iterations",
        ctx.run_state().iterations_completed()
    );
    Ok(())
}

fn main() {
    let builder =
        ScenarioDefinitionBuilder::<BaselineRunnerContext, BaselineVuContext>::new_with_init(
            env!("CARGO_PKG_NAME"),
        )
        .with_scenario(
            "baseline",
            ScenarioConfig::ramping_vus(
                0,
                vec![
                    Stage::new(Duration::from_secs(5), 100.0),
                    Stage::new(Duration::from_secs(120), 100.0),
                    Stage::new(Duration::from_secs(5), 0.0),
                ],
            ),
        )
        .with_transport(SimulatedTransport::default())
        .declare_metric("errors", MetricKind::Rate)
        .with_threshold(ThresholdConfig::new("http_req_duration", ["p(95)<2000"]))
        .with_threshold(ThresholdConfig::new("errors", ["rate<0.1"]))
        .with_threshold(ThresholdConfig::new("http_req_failed", ["rate<0.1"]))
        .add_capture_env("BASELINE_URL")
        .use_setup(setup)
        .use_iteration(check_login)
        .use_vu_teardown(vu_teardown)
        .use_teardown(teardown);

    let result = run(builder);
    if let Err(e) = &result {
        log::error!("Run failed: {e:?}");
    }

    std::process::exit(exit_code(&result));
}
