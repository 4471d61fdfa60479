use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use crate::metrics::MetricsError;

/// Tags attached to a sample. Ordered so that anything derived from them is deterministic.
pub type Tags = BTreeMap<String, String>;

/// Selects the samples of a metric whose tags contain every one of the selector's pairs.
///
/// Written as `{name:home_page,method:GET}` after a metric name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TagSelector(BTreeMap<String, String>);

impl TagSelector {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, tags: &Tags) -> bool {
        self.0
            .iter()
            .all(|(k, v)| tags.get(k).map(|t| t == v).unwrap_or(false))
    }
}

impl Display for TagSelector {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return Ok(());
        }
        write!(f, "{{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{k}:{v}")?;
        }
        write!(f, "}}")
    }
}

/// A metric name with an optional tag selector, e.g. `http_req_duration{name:home_page}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricRef {
    pub name: String,
    pub selector: TagSelector,
}

impl MetricRef {
    pub fn parse(reference: &str) -> Result<Self, MetricsError> {
        let reference = reference.trim();
        let invalid = |reason: &str| MetricsError::InvalidReference {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        let (name, selector) = match reference.find('{') {
            None => (reference, None),
            Some(open) => {
                let rest = &reference[open + 1..];
                let inner = rest
                    .strip_suffix('}')
                    .ok_or_else(|| invalid("tag selector must end with `}`"))?;
                (&reference[..open], Some(inner))
            }
        };

        let name = name.trim();
        validate_metric_name(name)?;

        let mut pairs = BTreeMap::new();
        if let Some(inner) = selector {
            for pair in inner.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                let (k, v) = pair
                    .split_once(':')
                    .ok_or_else(|| invalid("tag selector entries must be `key:value`"))?;
                let (k, v) = (k.trim(), v.trim());
                if k.is_empty() {
                    return Err(invalid("tag selector key must not be empty"));
                }
                pairs.insert(k.to_string(), v.to_string());
            }
            if pairs.is_empty() {
                return Err(invalid("tag selector must not be empty"));
            }
        }

        Ok(Self {
            name: name.to_string(),
            selector: TagSelector(pairs),
        })
    }

    pub fn is_submetric(&self) -> bool {
        !self.selector.is_empty()
    }
}

impl Display for MetricRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.name, self.selector)
    }
}

pub(crate) fn validate_metric_name(name: &str) -> Result<(), MetricsError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(MetricsError::InvalidName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_reference() {
        let r = MetricRef::parse("http_req_duration").unwrap();
        assert_eq!("http_req_duration", r.name);
        assert!(!r.is_submetric());
        assert_eq!("http_req_duration", r.to_string());
    }

    #[test]
    fn parse_selector_is_canonical() {
        let r = MetricRef::parse("http_req_duration{ name: home , method:GET }").unwrap();
        assert_eq!("http_req_duration", r.name);
        assert_eq!("http_req_duration{method:GET,name:home}", r.to_string());
    }

    #[test]
    fn reject_bad_references() {
        assert!(MetricRef::parse("").is_err());
        assert!(MetricRef::parse("a b").is_err());
        assert!(MetricRef::parse("x{name:a").is_err());
        assert!(MetricRef::parse("x{}").is_err());
        assert!(MetricRef::parse("x{name}").is_err());
    }

    #[test]
    fn selector_matches_subset() {
        let r = MetricRef::parse("x{name:home}").unwrap();
        let tags = Tags::from([
            ("name".to_string(), "home".to_string()),
            ("method".to_string(), "GET".to_string()),
        ]);
        assert!(r.selector.matches(&tags));
        assert!(!r.selector.matches(&Tags::new()));
    }
}
