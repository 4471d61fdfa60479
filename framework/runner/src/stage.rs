use std::cmp::Ordering;
use std::time::Duration;

/// One leg of a ramping profile: move linearly to `target` over `duration`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stage {
    pub duration: Duration,
    pub target: f64,
}

impl Stage {
    pub fn new(duration: Duration, target: f64) -> Self {
        Self { duration, target }
    }
}

/// A piecewise linear profile over time, starting from `start`.
///
/// Used both for VU targets and for arrival rates. Past the last stage the value holds at the
/// last target.
#[derive(Debug, Clone, PartialEq)]
pub struct Stages {
    start: f64,
    stages: Vec<Stage>,
}

impl Stages {
    pub fn new(start: f64, stages: Vec<Stage>) -> Self {
        Self { start, stages }
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    /// Walk the segments as `(from, to, segment start, segment duration)`.
    fn segments(&self) -> impl Iterator<Item = (f64, f64, f64, f64)> + '_ {
        let mut from = self.start;
        let mut offset = 0.0;
        self.stages.iter().map(move |stage| {
            let segment = (from, stage.target, offset, stage.duration.as_secs_f64());
            from = stage.target;
            offset += stage.duration.as_secs_f64();
            segment
        })
    }

    fn last_value(&self) -> f64 {
        self.stages.last().map(|s| s.target).unwrap_or(self.start)
    }

    /// The interpolated value at `elapsed`.
    pub fn value_at(&self, elapsed: Duration) -> f64 {
        let t = elapsed.as_secs_f64();
        for (from, to, offset, duration) in self.segments() {
            if t < offset + duration {
                return from + (to - from) * ((t - offset) / duration);
            }
        }
        self.last_value()
    }

    /// Whether the profile is rising, falling or flat at `elapsed`.
    pub fn direction_at(&self, elapsed: Duration) -> Ordering {
        let t = elapsed.as_secs_f64();
        self.segments()
            .find(|(_, _, offset, duration)| t < offset + duration)
            .map(|(from, to, _, _)| to.partial_cmp(&from).unwrap_or(Ordering::Equal))
            .unwrap_or(Ordering::Equal)
    }

    /// The integral of the profile from zero to `elapsed`, in value-seconds. Stops growing at the
    /// end of the last stage.
    pub fn cumulative_at(&self, elapsed: Duration) -> f64 {
        let t = elapsed.as_secs_f64();
        let mut total = 0.0;
        for (from, to, offset, duration) in self.segments() {
            if t <= offset {
                break;
            }
            if duration <= 0.0 {
                continue;
            }
            let s = (t - offset).min(duration);
            let slope = (to - from) / duration;
            total += from * s + slope * s * s / 2.0;
        }
        total
    }

    /// The earliest time at which [Stages::cumulative_at] reaches `target`, or `None` if the
    /// profile never gets there.
    pub fn elapsed_for_cumulative(&self, target: f64) -> Option<Duration> {
        if target <= 0.0 {
            return Some(Duration::ZERO);
        }

        let mut total = 0.0;
        for (from, to, offset, duration) in self.segments().filter(|seg| seg.3 > 0.0) {
            let area = (from + to) / 2.0 * duration;
            if total + area < target {
                total += area;
                continue;
            }

            // Solve `from * s + k * s^2 = remaining` for s within this segment
            let remaining = target - total;
            let k = (to - from) / (2.0 * duration);
            let s = if k.abs() < f64::EPSILON {
                remaining / from
            } else {
                (-from + (from * from + 4.0 * k * remaining).max(0.0).sqrt()) / (2.0 * k)
            };

            if !s.is_finite() {
                continue;
            }
            return Some(Duration::from_secs_f64(offset + s.clamp(0.0, duration)));
        }

        None
    }
}
