//! Streaming aggregation over cursor scans.
//!
//! A query declares any number of rules; the engine walks the matched
//! records once and feeds every rule from the same pass, maintaining
//! running state (sum and count for averages, current extremes for min
//! and max) instead of re-deriving anything per record.

use std::collections::HashMap;

use serde_json::Value;

use super::key::{lookup_path, KeyRange, KeyValue};

/// A reduction to apply to one record field.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateOp {
    Sum,
    Avg,
    Min,
    Max,
    /// Count records where the field is present; with `equals`, only
    /// those whose field matches the given value.
    Count { equals: Option<Value> },
    /// Histogram of occurrences per distinct field value.
    Group,
}

/// A named aggregation rule over a (possibly dotted) field path.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRule {
    pub name: String,
    pub field: String,
    pub op: AggregateOp,
}

impl AggregateRule {
    #[must_use]
    pub fn new(name: &str, field: &str, op: AggregateOp) -> Self {
        Self {
            name: name.to_string(),
            field: field.to_string(),
            op,
        }
    }
}

/// An aggregation request: which records to visit and which rules to run.
#[derive(Debug, Clone)]
pub struct AggregateQuery {
    /// Optional index filter; `None` scans the whole store in primary-key
    /// order.
    pub index: Option<(String, KeyRange)>,
    pub rules: Vec<AggregateRule>,
}

impl AggregateQuery {
    /// Aggregates over every record in the store.
    #[must_use]
    pub fn over_store(rules: Vec<AggregateRule>) -> Self {
        Self { index: None, rules }
    }

    /// Aggregates over the records matched by an index range.
    #[must_use]
    pub fn over_index(index: &str, range: KeyRange, rules: Vec<AggregateRule>) -> Self {
        Self {
            index: Some((index.to_string(), range)),
            rules,
        }
    }
}

/// One computed aggregate.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateValue {
    Number(f64),
    Count(u64),
    Groups(HashMap<String, u64>),
}

/// The outcome of an aggregation pass.
#[derive(Debug, Clone, Default)]
pub struct AggregateResult {
    /// How many records the pass visited (each exactly once).
    pub records_visited: u64,
    values: HashMap<String, AggregateValue>,
}

impl AggregateResult {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&AggregateValue> {
        self.values.get(name)
    }

    /// The numeric result of a sum/avg/min/max rule.
    #[must_use]
    pub fn number(&self, name: &str) -> Option<f64> {
        match self.values.get(name) {
            Some(AggregateValue::Number(n)) => Some(*n),
            _ => None,
        }
    }

    /// The result of a count rule.
    #[must_use]
    pub fn count(&self, name: &str) -> Option<u64> {
        match self.values.get(name) {
            Some(AggregateValue::Count(n)) => Some(*n),
            _ => None,
        }
    }

    /// The histogram of a group rule.
    #[must_use]
    pub fn groups(&self, name: &str) -> Option<&HashMap<String, u64>> {
        match self.values.get(name) {
            Some(AggregateValue::Groups(buckets)) => Some(buckets),
            _ => None,
        }
    }
}

enum AccumulatorState {
    Sum { total: f64 },
    Avg { total: f64, count: u64 },
    Min { value: Option<f64> },
    Max { value: Option<f64> },
    Count { equals: Option<Value>, count: u64 },
    Group { buckets: HashMap<String, u64> },
}

struct Accumulator {
    name: String,
    field: String,
    state: AccumulatorState,
}

impl Accumulator {
    fn from_rule(rule: AggregateRule) -> Self {
        let state = match rule.op {
            AggregateOp::Sum => AccumulatorState::Sum { total: 0.0 },
            AggregateOp::Avg => AccumulatorState::Avg {
                total: 0.0,
                count: 0,
            },
            AggregateOp::Min => AccumulatorState::Min { value: None },
            AggregateOp::Max => AccumulatorState::Max { value: None },
            AggregateOp::Count { equals } => AccumulatorState::Count { equals, count: 0 },
            AggregateOp::Group => AccumulatorState::Group {
                buckets: HashMap::new(),
            },
        };
        Self {
            name: rule.name,
            field: rule.field,
            state,
        }
    }

    fn observe(&mut self, record: &Value) {
        let field = lookup_path(record, &self.field);
        match &mut self.state {
            AccumulatorState::Sum { total } => {
                if let Some(n) = field.and_then(Value::as_f64) {
                    *total += n;
                }
            }
            AccumulatorState::Avg { total, count } => {
                if let Some(n) = field.and_then(Value::as_f64) {
                    *total += n;
                    *count += 1;
                }
            }
            AccumulatorState::Min { value } => {
                if let Some(n) = field.and_then(Value::as_f64) {
                    *value = Some(value.map_or(n, |current| current.min(n)));
                }
            }
            AccumulatorState::Max { value } => {
                if let Some(n) = field.and_then(Value::as_f64) {
                    *value = Some(value.map_or(n, |current| current.max(n)));
                }
            }
            AccumulatorState::Count { equals, count } => {
                let Some(value) = field else { return };
                if value.is_null() {
                    return;
                }
                let matches = match equals {
                    Some(expected) => values_equal(value, expected),
                    None => true,
                };
                if matches {
                    *count += 1;
                }
            }
            AccumulatorState::Group { buckets } => {
                if let Some(bucket) = field.and_then(group_key) {
                    *buckets.entry(bucket).or_insert(0) += 1;
                }
            }
        }
    }

    fn finish(self) -> Option<(String, AggregateValue)> {
        let value = match self.state {
            AccumulatorState::Sum { total } => AggregateValue::Number(total),
            AccumulatorState::Avg { total, count } => {
                if count == 0 {
                    return None;
                }
                AggregateValue::Number(total / count as f64)
            }
            AccumulatorState::Min { value } => AggregateValue::Number(value?),
            AccumulatorState::Max { value } => AggregateValue::Number(value?),
            AccumulatorState::Count { count, .. } => AggregateValue::Count(count),
            AccumulatorState::Group { buckets } => AggregateValue::Groups(buckets),
        };
        Some((self.name, value))
    }
}

/// Drives every accumulator of a query from one record stream.
pub(crate) struct AggregateRun {
    accumulators: Vec<Accumulator>,
    visited: u64,
}

impl AggregateRun {
    pub(crate) fn new(rules: Vec<AggregateRule>) -> Self {
        Self {
            accumulators: rules.into_iter().map(Accumulator::from_rule).collect(),
            visited: 0,
        }
    }

    pub(crate) fn observe(&mut self, record: &Value) {
        self.visited += 1;
        for accumulator in &mut self.accumulators {
            accumulator.observe(record);
        }
    }

    pub(crate) fn finish(self) -> AggregateResult {
        AggregateResult {
            records_visited: self.visited,
            values: self
                .accumulators
                .into_iter()
                .filter_map(Accumulator::finish)
                .collect(),
        }
    }
}

/// Compares a record field with an expected value, treating numerically
/// equal forms (`5` and `5.0`) as the same.
fn values_equal(actual: &Value, expected: &Value) -> bool {
    match (KeyValue::from_value(actual), KeyValue::from_value(expected)) {
        (Some(a), Some(b)) => a == b,
        _ => actual == expected,
    }
}

/// Stringifies a field value into a histogram bucket label.
fn group_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
