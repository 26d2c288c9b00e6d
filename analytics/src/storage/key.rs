//! Key values, key ordering, and key ranges for the storage engine.
//!
//! Records are JSON objects; any bool, number, string, or array of those
//! can serve as a primary or index key. Keys of different kinds compare by
//! a fixed type rank (bool < number < string < array) so every index has
//! one total order, mirroring how the engine's ordered scans expect to
//! walk entries.

use std::cmp::Ordering;

use serde_json::Value;

/// A key extracted from a record field.
///
/// Numbers compare by total order on `f64`, arrays compare element-wise.
#[derive(Debug, Clone)]
pub enum KeyValue {
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<KeyValue>),
}

impl KeyValue {
    /// Converts a JSON value into a key, if the value is key-able.
    ///
    /// `null` and objects are not valid keys and yield `None`.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(KeyValue::Bool(*b)),
            Value::Number(n) => n.as_f64().map(KeyValue::Number),
            Value::String(s) => Some(KeyValue::String(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(KeyValue::from_value)
                .collect::<Option<Vec<_>>>()
                .map(KeyValue::Array),
            Value::Null | Value::Object(_) => None,
        }
    }

    /// Converts the key back into a JSON value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            KeyValue::Bool(b) => Value::Bool(*b),
            KeyValue::Number(n) => Value::from(*n),
            KeyValue::String(s) => Value::String(s.clone()),
            KeyValue::Array(items) => Value::Array(items.iter().map(KeyValue::to_value).collect()),
        }
    }

    /// The smallest possible key, used as a scan floor.
    #[must_use]
    pub(crate) fn min() -> Self {
        KeyValue::Bool(false)
    }

    fn type_rank(&self) -> u8 {
        match self {
            KeyValue::Bool(_) => 0,
            KeyValue::Number(_) => 1,
            KeyValue::String(_) => 2,
            KeyValue::Array(_) => 3,
        }
    }
}

impl Ord for KeyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (KeyValue::Bool(a), KeyValue::Bool(b)) => a.cmp(b),
            (KeyValue::Number(a), KeyValue::Number(b)) => a.total_cmp(b),
            (KeyValue::String(a), KeyValue::String(b)) => a.cmp(b),
            (KeyValue::Array(a), KeyValue::Array(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl PartialOrd for KeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for KeyValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for KeyValue {}

impl From<&str> for KeyValue {
    fn from(value: &str) -> Self {
        KeyValue::String(value.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(value: String) -> Self {
        KeyValue::String(value)
    }
}

impl From<f64> for KeyValue {
    fn from(value: f64) -> Self {
        KeyValue::Number(value)
    }
}

impl From<i64> for KeyValue {
    fn from(value: i64) -> Self {
        KeyValue::Number(value as f64)
    }
}

impl From<bool> for KeyValue {
    fn from(value: bool) -> Self {
        KeyValue::Bool(value)
    }
}

/// A bounded or unbounded range of keys, with independently open ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub lower: Option<KeyValue>,
    pub upper: Option<KeyValue>,
    pub lower_open: bool,
    pub upper_open: bool,
}

impl KeyRange {
    /// The unbounded range matching every key.
    #[must_use]
    pub fn all() -> Self {
        Self {
            lower: None,
            upper: None,
            lower_open: false,
            upper_open: false,
        }
    }

    /// The range matching exactly one key.
    #[must_use]
    pub fn only(key: impl Into<KeyValue>) -> Self {
        let key = key.into();
        Self {
            lower: Some(key.clone()),
            upper: Some(key),
            lower_open: false,
            upper_open: false,
        }
    }

    /// Keys greater than or equal to `lower`.
    #[must_use]
    pub fn at_least(lower: impl Into<KeyValue>) -> Self {
        Self {
            lower: Some(lower.into()),
            upper: None,
            lower_open: false,
            upper_open: false,
        }
    }

    /// Keys less than or equal to `upper`.
    #[must_use]
    pub fn at_most(upper: impl Into<KeyValue>) -> Self {
        Self {
            lower: None,
            upper: Some(upper.into()),
            lower_open: false,
            upper_open: false,
        }
    }

    /// Keys strictly less than `upper`.
    #[must_use]
    pub fn below(upper: impl Into<KeyValue>) -> Self {
        Self {
            lower: None,
            upper: Some(upper.into()),
            lower_open: false,
            upper_open: true,
        }
    }

    /// Keys in `[lower, upper]`, both ends inclusive.
    #[must_use]
    pub fn between(lower: impl Into<KeyValue>, upper: impl Into<KeyValue>) -> Self {
        Self {
            lower: Some(lower.into()),
            upper: Some(upper.into()),
            lower_open: false,
            upper_open: false,
        }
    }

    /// Returns true if `key` falls below the lower bound.
    pub(crate) fn is_below(&self, key: &KeyValue) -> bool {
        match &self.lower {
            Some(lower) => {
                if self.lower_open {
                    key <= lower
                } else {
                    key < lower
                }
            }
            None => false,
        }
    }

    /// Returns true if `key` falls above the upper bound.
    pub(crate) fn is_above(&self, key: &KeyValue) -> bool {
        match &self.upper {
            Some(upper) => {
                if self.upper_open {
                    key >= upper
                } else {
                    key > upper
                }
            }
            None => false,
        }
    }

    /// Returns true if `key` falls within the range.
    #[must_use]
    pub fn contains(&self, key: &KeyValue) -> bool {
        !self.is_below(key) && !self.is_above(key)
    }
}

impl Default for KeyRange {
    fn default() -> Self {
        Self::all()
    }
}

/// Resolves a dotted field path (`"memoryUsage.used"`) against a record.
#[must_use]
pub fn lookup_path<'v>(record: &'v Value, path: &str) -> Option<&'v Value> {
    let mut current = record;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_value_accepts_keyable_values() {
        assert_eq!(
            KeyValue::from_value(&json!("abc")),
            Some(KeyValue::String("abc".to_string()))
        );
        assert_eq!(
            KeyValue::from_value(&json!(42)),
            Some(KeyValue::Number(42.0))
        );
        assert_eq!(KeyValue::from_value(&json!(true)), Some(KeyValue::Bool(true)));
        assert_eq!(
            KeyValue::from_value(&json!(["daily", 1000])),
            Some(KeyValue::Array(vec![
                KeyValue::String("daily".to_string()),
                KeyValue::Number(1000.0),
            ]))
        );
    }

    #[test]
    fn from_value_rejects_null_and_objects() {
        assert_eq!(KeyValue::from_value(&json!(null)), None);
        assert_eq!(KeyValue::from_value(&json!({"a": 1})), None);
        assert_eq!(KeyValue::from_value(&json!([1, {"a": 1}])), None);
    }

    #[test]
    fn keys_order_within_one_type() {
        assert!(KeyValue::Number(1.0) < KeyValue::Number(2.0));
        assert!(KeyValue::String("a".into()) < KeyValue::String("b".into()));
        assert!(KeyValue::Bool(false) < KeyValue::Bool(true));
        assert!(
            KeyValue::Array(vec![KeyValue::Number(1.0)])
                < KeyValue::Array(vec![KeyValue::Number(1.0), KeyValue::Number(0.0)])
        );
    }

    #[test]
    fn keys_order_across_types_by_rank() {
        assert!(KeyValue::Bool(true) < KeyValue::Number(0.0));
        assert!(KeyValue::Number(1e12) < KeyValue::String(String::new()));
        assert!(KeyValue::String("zzz".into()) < KeyValue::Array(vec![]));
    }

    #[test]
    fn integer_and_float_forms_are_the_same_key() {
        let from_int = KeyValue::from_value(&json!(5)).unwrap();
        let from_float = KeyValue::from_value(&json!(5.0)).unwrap();
        assert_eq!(from_int, from_float);
    }

    #[test]
    fn to_value_round_trips() {
        for value in [json!(7), json!("x"), json!(true), json!(["a", 1])] {
            let key = KeyValue::from_value(&value).unwrap();
            assert_eq!(KeyValue::from_value(&key.to_value()), Some(key));
        }
    }

    #[test]
    fn range_only_matches_single_key() {
        let range = KeyRange::only("session-1");
        assert!(range.contains(&KeyValue::from("session-1")));
        assert!(!range.contains(&KeyValue::from("session-2")));
    }

    #[test]
    fn range_below_is_exclusive() {
        let range = KeyRange::below(100.0);
        assert!(range.contains(&KeyValue::Number(99.9)));
        assert!(!range.contains(&KeyValue::Number(100.0)));
    }

    #[test]
    fn range_between_is_inclusive_on_both_ends() {
        let range = KeyRange::between(10.0, 20.0);
        assert!(range.contains(&KeyValue::Number(10.0)));
        assert!(range.contains(&KeyValue::Number(20.0)));
        assert!(!range.contains(&KeyValue::Number(9.9)));
        assert!(!range.contains(&KeyValue::Number(20.1)));
    }

    #[test]
    fn range_all_matches_everything() {
        let range = KeyRange::all();
        assert!(range.contains(&KeyValue::Bool(false)));
        assert!(range.contains(&KeyValue::Number(f64::MAX)));
        assert!(range.contains(&KeyValue::Array(vec![])));
    }

    #[test]
    fn lookup_path_resolves_flat_and_nested_fields() {
        let record = json!({
            "fps": 58.5,
            "memoryUsage": { "used": 500, "total": 1000 }
        });

        assert_eq!(lookup_path(&record, "fps"), Some(&json!(58.5)));
        assert_eq!(lookup_path(&record, "memoryUsage.used"), Some(&json!(500)));
        assert_eq!(lookup_path(&record, "missing"), None);
        assert_eq!(lookup_path(&record, "fps.deeper"), None);
    }
}
