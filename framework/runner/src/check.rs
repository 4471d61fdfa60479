/// A named yes or no question about a value, such as "status is 200".
///
/// Implemented for every `Fn(&T) -> bool`, so closures can be used directly.
pub trait Predicate<T: ?Sized> {
    fn test(&self, value: &T) -> bool;
}

impl<T: ?Sized, F> Predicate<T> for F
where
    F: Fn(&T) -> bool,
{
    fn test(&self, value: &T) -> bool {
        self(value)
    }
}

/// A list of named predicates to run against one value with
/// [VuContext::check](crate::context::VuContext::check).
pub struct Checks<'a, T: ?Sized> {
    checks: Vec<(&'a str, Box<dyn Predicate<T> + 'a>)>,
}

impl<T: ?Sized> Default for Checks<'_, T> {
    fn default() -> Self {
        Self { checks: Vec::new() }
    }
}

impl<'a, T: ?Sized> Checks<'a, T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &'a str, predicate: impl Predicate<T> + 'a) -> Self {
        self.checks.push((name, Box::new(predicate)));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Run every check, in order, and report each result. Checks don't short circuit.
    pub(crate) fn run<'v>(&'v self, value: &'v T) -> impl Iterator<Item = (&'a str, bool)> + 'v {
        self.checks
            .iter()
            .map(move |(name, predicate)| (*name, predicate.test(value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_checks_run() {
        let checks = Checks::new()
            .with("positive", |v: &i32| *v > 0)
            .with("even", |v: &i32| v % 2 == 0)
            .with("small", |v: &i32| *v < 10);

        let results = checks.run(&3).collect::<Vec<_>>();
        assert_eq!(
            vec![("positive", true), ("even", false), ("small", true)],
            results
        );
    }
}
