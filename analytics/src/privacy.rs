//! Field-level anonymization for event payloads.
//!
//! Payloads pass through the anonymizer exactly once, on their way into
//! the queue and before anything is persisted. Rules are keyed by field
//! name and apply at any nesting depth, inside objects and arrays alike;
//! fields without a matching rule are copied through untouched.
//!
//! # Default rules
//!
//! - **`ipAddress`**: last octet zeroed (`203.0.113.42` becomes
//!   `203.0.113.0`)
//! - **`userAgent`**: version numbers replaced with `x`
//!   (`Chrome/120.0.0.0` becomes `Chrome/x`)
//! - **`playerId`**, **`sessionId`**: replaced with a deterministic
//!   one-way hash (UUIDv5 over a fixed namespace)
//! - **`timestamp`**: rounded down to a five-minute boundary
//! - **`position`**: `x`/`y` coordinates snapped to a 50-unit grid
//!
//! A rule that cannot transform its value logs a warning and leaves the
//! field unchanged; anonymization never fails an event. `Null` fields
//! stay `Null` without invoking the rule.
//!
//! # Example
//!
//! ```
//! use popmetrics_analytics::privacy::Anonymizer;
//! use serde_json::json;
//!
//! let anonymizer = Anonymizer::default();
//! let payload = anonymizer.anonymize(json!({
//!     "ipAddress": "203.0.113.42",
//!     "scoreGained": 150,
//! }));
//!
//! assert_eq!(payload["ipAddress"], json!("203.0.113.0"));
//! assert_eq!(payload["scoreGained"], json!(150)); // untouched
//! ```

use std::collections::HashMap;
use std::net::Ipv4Addr;

use serde_json::Value;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Interval payload timestamps are rounded down to (five minutes).
pub const TIMESTAMP_ROUND_MILLIS: i64 = 5 * 60 * 1000;

/// Grid cell size that 2-D positions snap to.
pub const POSITION_GRID_SIZE: f64 = 50.0;

/// Replacement text used by [`AnonymizeRule::Redact`].
pub const REDACTED: &str = "[redacted]";

/// Fixed namespace for one-way identifier hashing. Changing it changes
/// every derived pseudonym, so it is part of the stored-data contract.
const ID_HASH_NAMESPACE: Uuid = Uuid::from_u128(0xb5c1_09fc_9b2e_4d8a_a7f3_31e2_6d04_c1a7);

/// Why a single anonymization rule could not transform a value.
///
/// Rule failures are never fatal; the caller logs them and keeps the
/// original value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    /// The rule needs a string and the field held something else.
    #[error("expected a string value")]
    NotAString,

    /// The rule needs a number and the field held something else.
    #[error("expected a numeric value")]
    NotANumber,

    /// The value is not a dotted IPv4 address.
    #[error("not an IPv4 address")]
    NotAnIpv4,

    /// The value is not an object with numeric `x` and `y` fields.
    #[error("not a 2-D position")]
    NotAPosition,
}

/// A named transform applied to every field with a matching name.
#[derive(Debug, Clone, PartialEq)]
pub enum AnonymizeRule {
    /// Zeroes the last octet of an IPv4 address string.
    ZeroLastOctet,
    /// Replaces `/<version>` number runs in a string with `/x`.
    StripVersions,
    /// Replaces a string identifier with a deterministic one-way hash.
    HashIdentifier,
    /// Rounds a millisecond timestamp down to a multiple of the interval.
    RoundTimestamp { interval_millis: i64 },
    /// Snaps the `x`/`y` fields of a position object to a grid.
    SnapToGrid { cell_size: f64 },
    /// Replaces the value with [`REDACTED`] regardless of its type.
    Redact,
}

impl AnonymizeRule {
    /// Applies the transform to a single value.
    ///
    /// # Errors
    ///
    /// Returns a [`RuleError`] when the value has the wrong shape for
    /// the rule; callers treat that as "leave the field unchanged".
    pub fn apply(&self, value: &Value) -> Result<Value, RuleError> {
        match self {
            AnonymizeRule::ZeroLastOctet => {
                let text = value.as_str().ok_or(RuleError::NotAString)?;
                let addr: Ipv4Addr = text.parse().map_err(|_| RuleError::NotAnIpv4)?;
                let [a, b, c, _] = addr.octets();
                Ok(Value::String(Ipv4Addr::new(a, b, c, 0).to_string()))
            }
            AnonymizeRule::StripVersions => {
                let text = value.as_str().ok_or(RuleError::NotAString)?;
                Ok(Value::String(strip_version_numbers(text)))
            }
            AnonymizeRule::HashIdentifier => {
                let text = value.as_str().ok_or(RuleError::NotAString)?;
                let hashed = Uuid::new_v5(&ID_HASH_NAMESPACE, text.as_bytes());
                Ok(Value::String(hashed.to_string()))
            }
            AnonymizeRule::RoundTimestamp { interval_millis } => {
                round_timestamp(value, *interval_millis)
            }
            AnonymizeRule::SnapToGrid { cell_size } => snap_to_grid(value, *cell_size),
            AnonymizeRule::Redact => Ok(Value::String(REDACTED.to_string())),
        }
    }
}

/// Recursive field-level anonymizer.
///
/// Cheap to clone; the collector hands one to the queue at startup and
/// the rule set stays fixed from then on.
#[derive(Debug, Clone)]
pub struct Anonymizer {
    enabled: bool,
    rules: HashMap<String, AnonymizeRule>,
}

impl Anonymizer {
    /// Creates an anonymizer with the default rule set.
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            rules: default_rules(),
        }
    }

    /// Creates an anonymizer with a caller-supplied rule set.
    #[must_use]
    pub fn with_rules(enabled: bool, rules: HashMap<String, AnonymizeRule>) -> Self {
        Self { enabled, rules }
    }

    /// Registers or replaces the rule for a field name.
    pub fn set_rule(&mut self, field: impl Into<String>, rule: AnonymizeRule) {
        self.rules.insert(field.into(), rule);
    }

    /// Removes the rule for a field name, returning it if present.
    pub fn remove_rule(&mut self, field: &str) -> Option<AnonymizeRule> {
        self.rules.remove(field)
    }

    /// Whether payloads are transformed at all.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Anonymizes one payload.
    ///
    /// Walks objects and arrays recursively; a field whose name matches
    /// a registered rule has its value replaced by the rule's output and
    /// is not descended into further. `Null` fields stay `Null`. A rule
    /// failure logs a warning and keeps the original value.
    #[must_use]
    pub fn anonymize(&self, payload: Value) -> Value {
        if !self.enabled {
            return payload;
        }
        self.walk(payload)
    }

    fn walk(&self, value: Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (field, value) in map {
                    let value = match self.rules.get(&field) {
                        Some(_) if value.is_null() => value,
                        Some(rule) => match rule.apply(&value) {
                            Ok(replaced) => replaced,
                            Err(error) => {
                                warn!(
                                    field = %field,
                                    %error,
                                    "Anonymization rule failed, keeping original value"
                                );
                                value
                            }
                        },
                        None => self.walk(value),
                    };
                    out.insert(field, value);
                }
                Value::Object(out)
            }
            Value::Array(items) => {
                Value::Array(items.into_iter().map(|item| self.walk(item)).collect())
            }
            other => other,
        }
    }
}

impl Default for Anonymizer {
    /// An enabled anonymizer with the default rule set.
    fn default() -> Self {
        Self::new(true)
    }
}

/// The rule set applied when no custom rules are supplied.
#[must_use]
pub fn default_rules() -> HashMap<String, AnonymizeRule> {
    HashMap::from([
        ("ipAddress".to_string(), AnonymizeRule::ZeroLastOctet),
        ("userAgent".to_string(), AnonymizeRule::StripVersions),
        ("playerId".to_string(), AnonymizeRule::HashIdentifier),
        ("sessionId".to_string(), AnonymizeRule::HashIdentifier),
        (
            "timestamp".to_string(),
            AnonymizeRule::RoundTimestamp {
                interval_millis: TIMESTAMP_ROUND_MILLIS,
            },
        ),
        (
            "position".to_string(),
            AnonymizeRule::SnapToGrid {
                cell_size: POSITION_GRID_SIZE,
            },
        ),
    ])
}

/// Replaces each `/<digits-and-dots>` run with `/x`.
fn strip_version_numbers(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        out.push(c);
        if c != '/' {
            continue;
        }
        let mut saw_digit = false;
        while let Some(&next) = chars.peek() {
            if next.is_ascii_digit() || (saw_digit && next == '.') {
                saw_digit = true;
                chars.next();
            } else {
                break;
            }
        }
        if saw_digit {
            out.push('x');
        }
    }
    out
}

fn round_timestamp(value: &Value, interval_millis: i64) -> Result<Value, RuleError> {
    if let Some(millis) = value.as_i64() {
        return Ok(Value::from(
            millis.div_euclid(interval_millis) * interval_millis,
        ));
    }
    let millis = value.as_f64().ok_or(RuleError::NotANumber)?;
    let interval = interval_millis as f64;
    Ok(number_value((millis / interval).floor() * interval))
}

fn snap_to_grid(value: &Value, cell_size: f64) -> Result<Value, RuleError> {
    let map = value.as_object().ok_or(RuleError::NotAPosition)?;
    let x = map
        .get("x")
        .and_then(Value::as_f64)
        .ok_or(RuleError::NotAPosition)?;
    let y = map
        .get("y")
        .and_then(Value::as_f64)
        .ok_or(RuleError::NotAPosition)?;

    // Fields other than the coordinates ride along unchanged.
    let mut snapped = map.clone();
    snapped.insert(
        "x".to_string(),
        number_value((x / cell_size).round() * cell_size),
    );
    snapped.insert(
        "y".to_string(),
        number_value((y / cell_size).round() * cell_size),
    );
    Ok(Value::Object(snapped))
}

/// Emits whole results as integers so integer inputs stay integers.
fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Value::from(n)
    }
}
