use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::aggregation::Aggregation;
use crate::threshold::ThresholdError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
}

impl Comparator {
    pub fn holds(&self, observed: f64, literal: f64) -> bool {
        match self {
            Comparator::Lt => observed < literal,
            Comparator::Le => observed <= literal,
            Comparator::Gt => observed > literal,
            Comparator::Ge => observed >= literal,
            Comparator::Eq => observed == literal,
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
            Comparator::Eq => "==",
        }
    }
}

/// A single `<aggregation><comparator><literal>` check, such as `p(95)<500` or `rate<0.01`.
///
/// Literals may carry a `ms` or `s` suffix. Both are converted to milliseconds, which is the unit
/// every builtin duration metric is recorded in.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdExpression {
    pub aggregation: Aggregation,
    pub comparator: Comparator,
    pub literal: f64,
    source: String,
}

impl ThresholdExpression {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn holds(&self, observed: f64) -> bool {
        self.comparator.holds(observed, self.literal)
    }
}

impl FromStr for ThresholdExpression {
    type Err = ThresholdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let source = s.trim();
        let err = |reason: String| ThresholdError::Parse {
            expression: source.to_string(),
            reason,
        };

        let at = source
            .find(['<', '>', '='])
            .ok_or_else(|| err("missing comparator".to_string()))?;
        let (lhs, rest) = source.split_at(at);

        let (comparator, literal) = if let Some(r) = rest.strip_prefix("<=") {
            (Comparator::Le, r)
        } else if let Some(r) = rest.strip_prefix(">=") {
            (Comparator::Ge, r)
        } else if let Some(r) = rest.strip_prefix("==") {
            (Comparator::Eq, r)
        } else if let Some(r) = rest.strip_prefix('<') {
            (Comparator::Lt, r)
        } else if let Some(r) = rest.strip_prefix('>') {
            (Comparator::Gt, r)
        } else {
            return Err(err("use `==` to compare for equality".to_string()));
        };

        let aggregation = lhs
            .parse::<Aggregation>()
            .map_err(|e| err(e.to_string()))?;
        let literal = parse_literal(literal).ok_or_else(|| err("literal is not a number".to_string()))?;

        Ok(Self {
            aggregation,
            comparator,
            literal,
            source: source.to_string(),
        })
    }
}

fn parse_literal(literal: &str) -> Option<f64> {
    let literal = literal.trim();
    let (number, scale) = if let Some(n) = literal.strip_suffix("ms") {
        (n, 1.0)
    } else if let Some(n) = literal.strip_suffix('s') {
        (n, 1000.0)
    } else {
        (literal, 1.0)
    };

    let value = number.trim().parse::<f64>().ok()?;
    value.is_finite().then_some(value * scale)
}

impl Display for ThresholdExpression {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.aggregation,
            self.comparator.symbol(),
            self.literal
        )
    }
}
