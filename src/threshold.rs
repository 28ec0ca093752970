//! Pass/fail criteria over aggregated series.
//!
//! A threshold pairs a metric selector with a predicate string:
//!
//! ```
//! use surge::Threshold;
//!
//! let t = Threshold::parse("http_req_duration{expected_response:true}", "p(95)<1000").unwrap();
//! assert_eq!(t.to_string(), "http_req_duration{expected_response:true}: p(95)<1000");
//! ```
//!
//! Supported aggregations: `p(N)`, `rate`, `avg`, `min`, `max`, `count`,
//! `sum`; operators `<`, `<=`, `>`, `>=`. A selector matches every series
//! with the same name whose tags are a superset of the selector's tags; the
//! matches are merged before evaluation. A selector that matches no samples
//! passes and is reported with no observed value, so an absent metric never
//! silently hides a failing criterion; it shows up in the summary as
//! data-free.
//!
//! Evaluation is a pure function of the snapshot: re-evaluating against an
//! unchanged snapshot always yields the same verdict.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::error::ThresholdParseError;
use crate::metrics::{MetricKey, MetricsSnapshot, SeriesSnapshot};

/// Selects the series a threshold applies to: a metric name and an optional
/// set of required tags, written `name{tag:value,...}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricSelector {
    pub name: String,
    pub tags: BTreeMap<String, String>,
}

impl MetricSelector {
    pub fn parse(input: &str) -> Result<Self, ThresholdParseError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ThresholdParseError::InvalidSelector(input.to_string()));
        }

        let Some(brace) = input.find('{') else {
            return Ok(Self {
                name: input.to_string(),
                tags: BTreeMap::new(),
            });
        };

        let name = input[..brace].trim();
        let rest = &input[brace + 1..];
        let Some(body) = rest.strip_suffix('}') else {
            return Err(ThresholdParseError::InvalidSelector(input.to_string()));
        };
        if name.is_empty() {
            return Err(ThresholdParseError::InvalidSelector(input.to_string()));
        }

        let mut tags = BTreeMap::new();
        for pair in body.split(',') {
            let (key, value) = pair
                .split_once(':')
                .ok_or_else(|| ThresholdParseError::InvalidSelector(input.to_string()))?;
            tags.insert(key.trim().to_string(), value.trim().to_string());
        }

        Ok(Self {
            name: name.to_string(),
            tags,
        })
    }

    /// A series matches when its name is equal and its tags contain every
    /// selector tag with the same value.
    pub fn matches(&self, key: &MetricKey) -> bool {
        key.name == self.name
            && self
                .tags
                .iter()
                .all(|(k, v)| key.tags.get(k).is_some_and(|kv| kv == v))
    }
}

impl fmt::Display for MetricSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.tags.is_empty() {
            write!(f, "{{")?;
            for (i, (k, v)) in self.tags.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{k}:{v}")?;
            }
            write!(f, "}}")?;
        }
        Ok(())
    }
}

/// The aggregated value a predicate compares against.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Aggregation {
    Percentile(f64),
    Rate,
    Avg,
    Min,
    Max,
    Count,
    Sum,
}

impl Aggregation {
    fn apply(&self, series: &SeriesSnapshot) -> Option<f64> {
        match self {
            Aggregation::Percentile(p) => series.percentile(*p),
            Aggregation::Rate => series.rate(),
            Aggregation::Avg => series.avg(),
            Aggregation::Min => series.min,
            Aggregation::Max => series.max,
            Aggregation::Count => Some(series.count as f64),
            Aggregation::Sum => Some(series.sum),
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Percentile(p) => write!(f, "p({p})"),
            Aggregation::Rate => write!(f, "rate"),
            Aggregation::Avg => write!(f, "avg"),
            Aggregation::Min => write!(f, "min"),
            Aggregation::Max => write!(f, "max"),
            Aggregation::Count => write!(f, "count"),
            Aggregation::Sum => write!(f, "sum"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Lt,
    Le,
    Gt,
    Ge,
}

impl Op {
    fn holds(&self, observed: f64, bound: f64) -> bool {
        match self {
            Op::Lt => observed < bound,
            Op::Le => observed <= bound,
            Op::Gt => observed > bound,
            Op::Ge => observed >= bound,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Lt => write!(f, "<"),
            Op::Le => write!(f, "<="),
            Op::Gt => write!(f, ">"),
            Op::Ge => write!(f, ">="),
        }
    }
}

/// Parsed predicate, e.g. `p(95)<1000`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Predicate {
    pub aggregation: Aggregation,
    pub op: Op,
    pub bound: f64,
}

impl Predicate {
    pub fn parse(expr: &str) -> Result<Self, ThresholdParseError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(ThresholdParseError::Empty);
        }

        // Two-character operators first so `<=` is not read as `<` + `=...`.
        let (op, op_at, op_len) = ["<=", ">=", "<", ">"]
            .iter()
            .find_map(|symbol| expr.find(symbol).map(|at| (*symbol, at, symbol.len())))
            .ok_or_else(|| ThresholdParseError::MissingOperator(expr.to_string()))?;

        let op = match op {
            "<=" => Op::Le,
            ">=" => Op::Ge,
            "<" => Op::Lt,
            _ => Op::Gt,
        };

        let aggregation = parse_aggregation(expr[..op_at].trim())?;
        let bound_text = expr[op_at + op_len..].trim();
        let bound = bound_text
            .parse::<f64>()
            .map_err(|_| ThresholdParseError::InvalidBound(bound_text.to_string()))?;

        Ok(Self {
            aggregation,
            op,
            bound,
        })
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.aggregation, self.op, self.bound)
    }
}

fn parse_aggregation(text: &str) -> Result<Aggregation, ThresholdParseError> {
    match text {
        "rate" => return Ok(Aggregation::Rate),
        "avg" => return Ok(Aggregation::Avg),
        "min" => return Ok(Aggregation::Min),
        "max" => return Ok(Aggregation::Max),
        "count" => return Ok(Aggregation::Count),
        "sum" => return Ok(Aggregation::Sum),
        _ => {}
    }

    let percentile = text
        .strip_prefix("p(")
        .and_then(|rest| rest.strip_suffix(')'))
        .and_then(|p| p.trim().parse::<f64>().ok())
        .filter(|p| (0.0..=100.0).contains(p));
    percentile
        .map(Aggregation::Percentile)
        .ok_or_else(|| ThresholdParseError::UnknownAggregation(text.to_string()))
}

/// A pass/fail criterion over one metric selector.
#[derive(Clone, Debug)]
pub struct Threshold {
    pub selector: MetricSelector,
    pub predicate: Predicate,
}

impl Threshold {
    /// Parse a selector and predicate pair, e.g.
    /// `Threshold::parse("http_req_failed", "rate<0.10")`.
    pub fn parse(selector: &str, predicate: &str) -> Result<Self, ThresholdParseError> {
        Ok(Self {
            selector: MetricSelector::parse(selector)?,
            predicate: Predicate::parse(predicate)?,
        })
    }

    /// Evaluate against a snapshot. A selector with no matching samples
    /// passes, with `observed` left empty.
    pub fn evaluate(&self, snapshot: &MetricsSnapshot) -> ThresholdResult {
        let merged = snapshot.merged(|key| self.selector.matches(key));
        let observed = merged.as_ref().and_then(|s| self.predicate.aggregation.apply(s));
        let passed = match observed {
            Some(value) => self.predicate.op.holds(value, self.predicate.bound),
            None => true,
        };

        ThresholdResult {
            selector: self.selector.to_string(),
            predicate: self.predicate.to_string(),
            observed,
            passed,
        }
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.selector, self.predicate)
    }
}

/// Verdict for one threshold, as reported on the final summary.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ThresholdResult {
    pub selector: String,
    pub predicate: String,
    pub observed: Option<f64>,
    pub passed: bool,
}

/// Evaluate every threshold against one snapshot.
pub fn evaluate_all(thresholds: &[Threshold], snapshot: &MetricsSnapshot) -> Vec<ThresholdResult> {
    thresholds.iter().map(|t| t.evaluate(snapshot)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricRegistry;

    #[test]
    fn parses_percentile_rate_and_friends() {
        let p = Predicate::parse("p(95)<1000").unwrap();
        assert_eq!(p.aggregation, Aggregation::Percentile(95.0));
        assert_eq!(p.op, Op::Lt);
        assert_eq!(p.bound, 1000.0);

        let p = Predicate::parse(" rate <= 0.10 ").unwrap();
        assert_eq!(p.aggregation, Aggregation::Rate);
        assert_eq!(p.op, Op::Le);

        let p = Predicate::parse("count>=100").unwrap();
        assert_eq!(p.aggregation, Aggregation::Count);
        assert_eq!(p.op, Op::Ge);

        assert_eq!(
            Predicate::parse("p95<1000"),
            Err(ThresholdParseError::UnknownAggregation("p95".to_string()))
        );
        assert_eq!(
            Predicate::parse("rate 0.1"),
            Err(ThresholdParseError::MissingOperator("rate 0.1".to_string()))
        );
        assert_eq!(
            Predicate::parse("rate<ten"),
            Err(ThresholdParseError::InvalidBound("ten".to_string()))
        );
    }

    #[test]
    fn parses_selectors_with_tags() {
        let s = MetricSelector::parse("http_req_duration{expected_response:true}").unwrap();
        assert_eq!(s.name, "http_req_duration");
        assert_eq!(s.tags.get("expected_response").map(String::as_str), Some("true"));

        let bare = MetricSelector::parse("errors").unwrap();
        assert!(bare.tags.is_empty());

        assert!(MetricSelector::parse("dangling{a:b").is_err());
        assert!(MetricSelector::parse("{a:b}").is_err());
    }

    #[test]
    fn selector_requires_tag_superset() {
        let selector = MetricSelector::parse("http_req_duration{expected_response:true}").unwrap();

        let registry = MetricRegistry::new();
        registry.add_tagged(
            "http_req_duration",
            100.0,
            &[("expected_response", "true"), ("status", "200")],
        );
        registry.add_tagged(
            "http_req_duration",
            9000.0,
            &[("expected_response", "false"), ("status", "500")],
        );
        let snapshot = registry.snapshot();

        let matched = snapshot.merged(|k| selector.matches(k)).unwrap();
        assert_eq!(matched.count, 1);
        assert_eq!(matched.max, Some(100.0));
    }

    #[test]
    fn error_rate_threshold_cutoff() {
        let threshold = Threshold::parse("errors", "rate<0.10").unwrap();

        let registry = MetricRegistry::new();
        for i in 0..100 {
            registry.add("errors", if i < 5 { 1.0 } else { 0.0 });
        }
        assert!(threshold.evaluate(&registry.snapshot()).passed);

        let registry = MetricRegistry::new();
        for i in 0..100 {
            registry.add("errors", if i < 15 { 1.0 } else { 0.0 });
        }
        let result = threshold.evaluate(&registry.snapshot());
        assert!(!result.passed);
        assert_eq!(result.observed, Some(0.15));
    }

    #[test]
    fn evaluation_is_idempotent_over_a_snapshot() {
        let registry = MetricRegistry::new();
        for i in 0..200 {
            registry.add("http_req_duration", (i * 7 % 500) as f64);
        }
        let snapshot = registry.snapshot();

        let thresholds = vec![
            Threshold::parse("http_req_duration", "p(95)<450").unwrap(),
            Threshold::parse("http_req_duration", "avg>10").unwrap(),
        ];

        let first = evaluate_all(&thresholds, &snapshot);
        let second = evaluate_all(&thresholds, &snapshot);
        assert_eq!(first, second);
    }

    #[test]
    fn absent_metric_passes_with_no_observation() {
        let threshold = Threshold::parse("never_recorded", "p(99)<5").unwrap();
        let result = threshold.evaluate(&MetricRegistry::new().snapshot());
        assert!(result.passed);
        assert_eq!(result.observed, None);
    }
}
