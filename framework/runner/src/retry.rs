use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use squall_instruments::{builtin, MetricsRegistry, Tags};

use crate::check::Predicate;

/// How long to wait between attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    Fixed(Duration),
    /// A uniformly random delay between `min` and `max`, inclusive
    Jittered { min: Duration, max: Duration },
}

impl Backoff {
    pub fn delay(&self) -> Duration {
        match self {
            Backoff::Fixed(d) => *d,
            Backoff::Jittered { min, max } => {
                let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
                rand::thread_rng().gen_range(*lo..=*hi)
            }
        }
    }
}

/// Bounded retries for a single logical operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt, so at most `retries + 1` attempts are made
    pub retries: u32,
    pub backoff: Backoff,
    /// A Rate metric that gets one sample per call: true if every attempt failed, false otherwise
    pub error_metric: Option<String>,
}

impl RetryPolicy {
    pub fn new(retries: u32, backoff: Backoff) -> Self {
        Self {
            retries,
            backoff,
            error_metric: None,
        }
    }

    pub fn with_error_metric(mut self, name: &str) -> Self {
        self.error_metric = Some(name.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome<T> {
    pub attempts: u32,
    pub succeeded: bool,
    /// The value from the last attempt
    pub value: T,
}

/// Run `operation` until `predicate` accepts its value or the policy runs out of attempts.
///
/// Waits between attempts with a cooperative sleep, never after the last one. Records one sample
/// in the policy's error metric and the number of attempts in [builtin::RETRY_ATTEMPTS]. Metric
/// errors are logged and don't affect the outcome.
pub async fn retry<S, T, Op, P>(
    state: &mut S,
    policy: &RetryPolicy,
    registry: &MetricsRegistry,
    tags: &Tags,
    mut operation: Op,
    predicate: P,
) -> RetryOutcome<T>
where
    S: Send,
    T: Send,
    Op: for<'b> FnMut(&'b mut S) -> BoxFuture<'b, T> + Send,
    P: Predicate<T> + Send,
{
    let max_attempts = policy.retries.saturating_add(1);
    let mut attempts = 0;
    loop {
        attempts += 1;
        let value = operation(state).await;
        let succeeded = predicate.test(&value);

        if succeeded || attempts >= max_attempts {
            if !succeeded {
                log::debug!("Giving up after {attempts} attempts");
            }
            record(registry, policy, tags, attempts, succeeded);
            return RetryOutcome {
                attempts,
                succeeded,
                value,
            };
        }

        drop(value);
        let delay = policy.backoff.delay();
        log::trace!("Attempt {attempts} failed, retrying in {delay:?}");
        tokio::time::sleep(delay).await;
    }
}

fn record(
    registry: &MetricsRegistry,
    policy: &RetryPolicy,
    tags: &Tags,
    attempts: u32,
    succeeded: bool,
) {
    if let Some(name) = &policy.error_metric {
        if let Err(e) = registry.rate(name).and_then(|r| r.add(!succeeded, tags)) {
            log::warn!("Failed to record retry outcome: {e}");
        }
    }
    if let Err(e) = registry
        .trend(builtin::RETRY_ATTEMPTS)
        .and_then(|t| t.add(attempts as f64, tags))
    {
        log::warn!("Failed to record retry attempts: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use pretty_assertions::assert_eq;
    use squall_instruments::{MetricRef, MetricValue, RateValue};
    use tokio::time::Instant;

    #[derive(Default)]
    struct Attempts {
        calls: u32,
        succeed_on: Option<u32>,
    }

    fn attempt(state: &mut Attempts) -> BoxFuture<'_, bool> {
        async move {
            state.calls += 1;
            Some(state.calls) == state.succeed_on
        }
        .boxed()
    }

    fn error_rate(registry: &MetricsRegistry) -> RateValue {
        match registry.value(&MetricRef::parse("errors").unwrap()) {
            Some(MetricValue::Rate(r)) => r,
            other => panic!("Unexpected value {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_record_one_failure() {
        let registry = MetricsRegistry::new();
        let policy =
            RetryPolicy::new(2, Backoff::Fixed(Duration::from_secs(1))).with_error_metric("errors");
        let mut state = Attempts::default();

        let start = Instant::now();
        let outcome = retry(
            &mut state,
            &policy,
            &registry,
            &Tags::new(),
            attempt,
            |ok: &bool| *ok,
        )
        .await;

        assert_eq!(3, outcome.attempts);
        assert!(!outcome.succeeded);
        assert_eq!(3, state.calls);
        assert_eq!(RateValue { trues: 1, total: 1 }, error_rate(&registry));
        // Two delays, none after the final attempt
        assert_eq!(Duration::from_secs(2), start.elapsed());
    }

    #[tokio::test(start_paused = true)]
    async fn success_short_circuits() {
        let registry = MetricsRegistry::new();
        let policy =
            RetryPolicy::new(5, Backoff::Fixed(Duration::from_secs(1))).with_error_metric("errors");
        let mut state = Attempts {
            calls: 0,
            succeed_on: Some(2),
        };

        let outcome = retry(
            &mut state,
            &policy,
            &registry,
            &Tags::new(),
            attempt,
            |ok: &bool| *ok,
        )
        .await;

        assert_eq!(2, outcome.attempts);
        assert!(outcome.succeeded);
        assert!(outcome.value);
        assert_eq!(RateValue { trues: 0, total: 1 }, error_rate(&registry));
    }

    #[test]
    fn jittered_backoff_stays_in_range() {
        let backoff = Backoff::Jittered {
            min: Duration::from_millis(100),
            max: Duration::from_millis(300),
        };
        for _ in 0..100 {
            let d = backoff.delay();
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(300));
        }
    }

    #[test]
    fn sub_millisecond_jitter_is_not_truncated() {
        let backoff = Backoff::Jittered {
            min: Duration::from_micros(10),
            max: Duration::from_micros(900),
        };
        let delays: Vec<Duration> = (0..200).map(|_| backoff.delay()).collect();
        assert!(delays
            .iter()
            .all(|d| *d >= Duration::from_micros(10) && *d <= Duration::from_micros(900)));
        assert!(delays.iter().any(|d| *d > Duration::from_micros(10)));
    }
}
