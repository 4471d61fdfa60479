use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use squall_core::prelude::{DelegatedShutdownListener, ShutdownHandle};
use squall_instruments::{builtin, Counter, MetricKind, MetricsError, MetricsRegistry, Rate, Tags, Trend};
use tokio::time::Instant;

use crate::check::{Checks, Predicate};
use crate::executor::Executor;
use crate::retry::{RetryOutcome, RetryPolicy};
use crate::run_state::RunState;
use crate::transport::{Request, Response, Transport};

pub trait UserValuesConstraint: Default + Debug + Send + Sync + 'static {}

/// State shared by the whole run.
///
/// The global setup hook gets mutable access to it. After setup it is shared read-only by every VU.
#[derive(Debug)]
pub struct RunnerContext<RV: UserValuesConstraint> {
    executor: Arc<Executor>,
    registry: Arc<MetricsRegistry>,
    transport: Arc<dyn Transport>,
    run_stop: ShutdownHandle,
    run_state: Arc<RunState>,
    run_id: String,
    value: RV,
}

impl<RV: UserValuesConstraint> RunnerContext<RV> {
    pub(crate) fn new(
        executor: Arc<Executor>,
        registry: Arc<MetricsRegistry>,
        transport: Arc<dyn Transport>,
        run_stop: ShutdownHandle,
        run_state: Arc<RunState>,
        run_id: String,
    ) -> Self {
        Self {
            executor,
            registry,
            transport,
            run_stop,
            run_state,
            run_id,
            value: Default::default(),
        }
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn run_state(&self) -> &Arc<RunState> {
        &self.run_state
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Begin draining every scenario. VUs finish the iteration they are in and then stop.
    pub fn force_stop_run(&self) {
        log::info!("Run stop requested");
        self.run_stop.shutdown();
    }

    pub fn get_mut(&mut self) -> &mut RV {
        &mut self.value
    }

    pub fn get(&self) -> &RV {
        &self.value
    }
}

/// The scenario a VU belongs to.
#[derive(Debug)]
pub(crate) struct ScenarioInfo {
    pub(crate) name: String,
    pub(crate) tags: Tags,
}

/// Handles for the metrics a VU records on behalf of the iteration body.
#[derive(Debug, Clone)]
pub(crate) struct RequestMetrics {
    http_reqs: Counter,
    http_req_duration: Trend,
    http_req_failed: Rate,
    group_duration: Trend,
    checks: Rate,
}

impl RequestMetrics {
    pub(crate) fn new(registry: &MetricsRegistry) -> Result<Self, MetricsError> {
        Ok(Self {
            http_reqs: registry.counter(builtin::HTTP_REQS)?,
            http_req_duration: registry.trend(builtin::HTTP_REQ_DURATION)?,
            http_req_failed: registry.rate(builtin::HTTP_REQ_FAILED)?,
            group_duration: registry.trend(builtin::GROUP_DURATION)?,
            checks: registry.rate(builtin::CHECKS)?,
        })
    }
}

pub(crate) fn log_metric_error(result: Result<(), MetricsError>) {
    if let Err(e) = result {
        log::warn!("Failed to record metric: {e}");
    }
}

/// Everything an iteration body can see and do. One per VU, reused for every iteration it runs.
pub struct VuContext<RV: UserValuesConstraint, V: UserValuesConstraint> {
    vu_id: u64,
    iteration: u64,
    scenario: Arc<ScenarioInfo>,
    runner_context: Arc<RunnerContext<RV>>,
    shutdown_listener: DelegatedShutdownListener,
    metrics: RequestMetrics,
    groups: Vec<String>,
    value: V,
}

impl<RV: UserValuesConstraint, V: UserValuesConstraint> VuContext<RV, V> {
    pub(crate) fn new(
        vu_id: u64,
        scenario: Arc<ScenarioInfo>,
        runner_context: Arc<RunnerContext<RV>>,
        shutdown_listener: DelegatedShutdownListener,
        metrics: RequestMetrics,
    ) -> Self {
        Self {
            vu_id,
            iteration: 0,
            scenario,
            runner_context,
            shutdown_listener,
            metrics,
            groups: Vec::new(),
            value: Default::default(),
        }
    }

    /// Called by the VU before each iteration.
    pub(crate) fn start_iteration(&mut self, iteration: u64) {
        self.iteration = iteration;
        self.groups.clear();
    }

    /// The VU id, unique across the whole run.
    pub fn vu_id(&self) -> u64 {
        self.vu_id
    }

    /// The number of iterations this VU started before the current one.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn scenario_name(&self) -> &str {
        &self.scenario.name
    }

    pub fn runner_context(&self) -> &Arc<RunnerContext<RV>> {
        &self.runner_context
    }

    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        self.runner_context.registry()
    }

    /// Raised when this VU has been asked to stop. The VU stops by itself at the end of the current
    /// iteration, so listening is only needed to end a long iteration early.
    pub fn shutdown_listener(&mut self) -> &mut DelegatedShutdownListener {
        &mut self.shutdown_listener
    }

    pub fn get_mut(&mut self) -> &mut V {
        &mut self.value
    }

    pub fn get(&self) -> &V {
        &self.value
    }

    fn group_path(&self) -> String {
        self.groups.iter().map(|g| format!("::{g}")).collect()
    }

    /// The tags attached to every sample recorded from here: the scenario's tags, plus `scenario`
    /// and `group`.
    pub fn tags(&self) -> Tags {
        let mut tags = self.scenario.tags.clone();
        tags.insert("scenario".to_string(), self.scenario.name.clone());
        tags.insert("group".to_string(), self.group_path());
        tags
    }

    /// Send a request through the transport and record `http_reqs`, `http_req_duration` and
    /// `http_req_failed` for it.
    ///
    /// Transport errors don't fail the iteration. They come back as a response with status 0.
    pub async fn request(&self, request: Request) -> Response {
        let transport = self.runner_context.transport().clone();
        let start = Instant::now();
        let response = match transport.request(&request).await {
            Ok(response) => response,
            Err(e) => {
                log::debug!("Request {} {} failed: {e}", request.method, request.target);
                Response::failed(e.to_string(), start.elapsed())
            }
        };

        let mut tags = self.tags();
        tags.insert("name".to_string(), request.name().to_string());
        tags.insert("method".to_string(), request.method.clone());
        tags.insert("status".to_string(), response.status.to_string());
        tags.extend(request.tags);

        log_metric_error(self.metrics.http_reqs.incr(&tags));
        log_metric_error(
            self.metrics
                .http_req_duration
                .add_duration(response.duration, &tags),
        );
        log_metric_error(self.metrics.http_req_failed.add(response.is_failed(), &tags));

        response
    }

    /// Run `body` as a named group. Samples recorded inside carry the group path as their `group`
    /// tag, e.g. `::checkout::payment` for nested groups, and the time spent is recorded in
    /// `group_duration`.
    pub async fn group<T, F>(&mut self, name: &str, body: F) -> T
    where
        F: for<'b> FnOnce(&'b mut Self) -> BoxFuture<'b, T> + Send,
    {
        self.groups.push(name.to_string());
        let tags = self.tags();
        let start = Instant::now();

        let value = body(self).await;

        log_metric_error(
            self.metrics
                .group_duration
                .add_duration(start.elapsed(), &tags),
        );
        self.groups.pop();
        value
    }

    /// Run every check against `value` and record each result in `checks`, tagged with the check
    /// name. Returns true if all of them passed.
    pub fn check<T: ?Sized>(&self, value: &T, checks: Checks<'_, T>) -> bool {
        let tags = self.tags();
        let mut all_passed = true;
        for (name, passed) in checks.run(value) {
            let mut tags = tags.clone();
            tags.insert("check".to_string(), name.to_string());
            log_metric_error(self.metrics.checks.add(passed, &tags));

            if !passed {
                log::debug!("VU {} check failed: {name}", self.vu_id);
                all_passed = false;
            }
        }
        all_passed
    }

    /// Run `operation` under the retry policy, see [crate::retry::retry].
    pub async fn retry<T, Op, P>(
        &mut self,
        policy: &RetryPolicy,
        operation: Op,
        predicate: P,
    ) -> RetryOutcome<T>
    where
        T: Send,
        Op: for<'b> FnMut(&'b mut Self) -> BoxFuture<'b, T> + Send,
        P: Predicate<T> + Send,
    {
        let registry = self.runner_context.registry().clone();
        let tags = self.tags();
        crate::retry::retry(self, policy, &registry, &tags, operation, predicate).await
    }

    /// Think time.
    pub async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    /// Record a sample in a custom metric, tagged like every other sample from this VU.
    pub fn record(&self, name: &str, kind: MetricKind, value: f64) {
        log_metric_error(self.registry().record(name, kind, value, &self.tags()));
    }

    pub fn force_stop_run(&self) {
        self.runner_context.force_stop_run();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use futures::FutureExt;
    use squall_instruments::{MetricRef, MetricValue};
    use tokio::runtime::Handle;

    #[derive(Debug, Default)]
    struct Values;

    impl UserValuesConstraint for Values {}

    type Ctx = VuContext<Values, Values>;

    #[derive(Debug)]
    struct StatusFromPath;

    #[async_trait]
    impl Transport for StatusFromPath {
        async fn request(&self, request: &Request) -> Result<Response, TransportError> {
            match request.target.as_str() {
                "/down" => Err(TransportError::Connect("refused".to_string())),
                "/error" => Ok(Response::new(500, Duration::from_millis(3))),
                _ => Ok(Response::new(200, Duration::from_millis(7))),
            }
        }
    }

    fn vu_context(run_stop: &ShutdownHandle) -> Ctx {
        let registry = Arc::new(MetricsRegistry::new());
        builtin::register_builtin(&registry).unwrap();
        let metrics = RequestMetrics::new(&registry).unwrap();
        let runner_context = Arc::new(RunnerContext::new(
            Arc::new(Executor::new(Handle::current(), ShutdownHandle::new())),
            registry,
            Arc::new(StatusFromPath),
            run_stop.clone(),
            Arc::new(RunState::new()),
            "test-run".to_string(),
        ));

        VuContext::new(
            7,
            Arc::new(ScenarioInfo {
                name: "browse".to_string(),
                tags: Tags::from([("env".to_string(), "test".to_string())]),
            }),
            runner_context,
            run_stop.new_listener(),
            metrics,
        )
    }

    fn value(ctx: &Ctx, reference: &str) -> MetricValue {
        let reference = MetricRef::parse(reference).unwrap();
        ctx.registry().add_submetric(&reference).unwrap();
        ctx.registry().value(&reference).unwrap()
    }

    fn track(ctx: &Ctx, reference: &str) {
        ctx.registry()
            .add_submetric(&MetricRef::parse(reference).unwrap())
            .unwrap();
    }

    #[tokio::test]
    async fn requests_are_recorded_with_their_tags() {
        let run_stop = ShutdownHandle::new();
        let ctx = vu_context(&run_stop);
        track(&ctx, "http_reqs{name:health,env:test}");
        track(&ctx, "http_req_failed{status:0}");

        ctx.request(Request::get("/")).await;
        ctx.request(Request::get("/health").with_name("health")).await;
        let error = ctx.request(Request::get("/error")).await;
        let down = ctx.request(Request::get("/down")).await;

        assert_eq!(500, error.status);
        assert_eq!(0, down.status);
        assert!(down.error.is_some());

        match value(&ctx, "http_reqs") {
            MetricValue::Counter(c) => assert_eq!(4.0, c.sum),
            other => panic!("Expected a counter, got {other:?}"),
        }
        match value(&ctx, "http_reqs{name:health,env:test}") {
            MetricValue::Counter(c) => assert_eq!(1.0, c.sum),
            other => panic!("Expected a counter, got {other:?}"),
        }
        match value(&ctx, "http_req_failed") {
            MetricValue::Rate(r) => assert_eq!((2, 4), (r.trues, r.total)),
            other => panic!("Expected a rate, got {other:?}"),
        }
        match value(&ctx, "http_req_failed{status:0}") {
            MetricValue::Rate(r) => assert_eq!((1, 1), (r.trues, r.total)),
            other => panic!("Expected a rate, got {other:?}"),
        }
        match value(&ctx, "http_req_duration") {
            MetricValue::Trend(t) => assert_eq!(4, t.count()),
            other => panic!("Expected a trend, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn nested_groups_tag_samples_with_their_path() {
        let run_stop = ShutdownHandle::new();
        let mut ctx = vu_context(&run_stop);
        track(&ctx, "http_reqs{group:::checkout::payment}");
        track(&ctx, "http_reqs{group:::checkout}");

        let status = ctx
            .group("checkout", |ctx: &mut Ctx| {
                async move {
                    ctx.request(Request::get("/basket")).await;
                    ctx.group("payment", |ctx: &mut Ctx| {
                        async move { ctx.request(Request::get("/pay")).await.status }.boxed()
                    })
                    .await
                }
                .boxed()
            })
            .await;

        assert_eq!(200, status);
        assert_eq!("", ctx.tags()["group"]);
        match value(&ctx, "http_reqs{group:::checkout::payment}") {
            MetricValue::Counter(c) => assert_eq!(1.0, c.sum),
            other => panic!("Expected a counter, got {other:?}"),
        }
        match value(&ctx, "http_reqs{group:::checkout}") {
            MetricValue::Counter(c) => assert_eq!(1.0, c.sum),
            other => panic!("Expected a counter, got {other:?}"),
        }
        match value(&ctx, "group_duration") {
            MetricValue::Trend(t) => assert_eq!(2, t.count()),
            other => panic!("Expected a trend, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn checks_record_every_result() {
        let run_stop = ShutdownHandle::new();
        let ctx = vu_context(&run_stop);
        track(&ctx, "checks{check:fast}");

        let response = ctx.request(Request::get("/error")).await;
        let passed = ctx.check(
            &response,
            Checks::new()
                .with("status is 200", |r: &Response| r.status == 200)
                .with("fast", |r: &Response| r.duration < Duration::from_secs(1)),
        );

        assert!(!passed);
        match value(&ctx, "checks") {
            MetricValue::Rate(r) => assert_eq!((1, 2), (r.trues, r.total)),
            other => panic!("Expected a rate, got {other:?}"),
        }
        match value(&ctx, "checks{check:fast}") {
            MetricValue::Rate(r) => assert_eq!((1, 1), (r.trues, r.total)),
            other => panic!("Expected a rate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn custom_metric_with_the_wrong_kind_is_not_recorded() {
        let run_stop = ShutdownHandle::new();
        let ctx = vu_context(&run_stop);

        ctx.record("orders", MetricKind::Counter, 3.0);
        ctx.record("orders", MetricKind::Trend, 1.0);

        match value(&ctx, "orders") {
            MetricValue::Counter(c) => assert_eq!(3.0, c.sum),
            other => panic!("Expected a counter, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn force_stop_run_raises_the_run_stop() {
        let run_stop = ShutdownHandle::new();
        let ctx = vu_context(&run_stop);

        ctx.force_stop_run();

        assert!(run_stop.is_shutdown());
    }
}
