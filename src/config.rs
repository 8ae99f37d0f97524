//! Shared helpers for reading configuration dictionaries.
//!
//! Both transports accept the same JSON shapes: nested objects
//! (`{"timeout": {"idle": 500}}`) or dotted flat keys (`{"timeout.idle": 500}`),
//! freely mixed. [`normalize`] folds the dotted form into the nested one before
//! serde sees it.

use std::time::Duration;

use serde_json::{Map, Value};

use crate::error::{MbapError, Result};

/// Expand dotted keys into nested objects.
pub(crate) fn normalize(value: &Value) -> Result<Value> {
    let object = value
        .as_object()
        .ok_or_else(|| MbapError::Configuration("expected a JSON object".to_string()))?;

    let mut out = Map::new();
    for (key, value) in object {
        let value = if value.is_object() {
            normalize(value)?
        } else {
            value.clone()
        };
        let path: Vec<&str> = key.split('.').collect();
        insert_path(&mut out, key, &path, value)?;
    }
    Ok(Value::Object(out))
}

fn insert_path(
    target: &mut Map<String, Value>,
    full_key: &str,
    path: &[&str],
    value: Value,
) -> Result<()> {
    let Some((head, rest)) = path.split_first() else {
        return Ok(());
    };
    if rest.is_empty() {
        if !target.contains_key(*head) {
            target.insert(head.to_string(), value);
            return Ok(());
        }
        // Both spellings of the same section: merge them.
        return match (target.get_mut(*head), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                for (k, v) in incoming {
                    insert_path(existing, full_key, &[k.as_str()], v)?;
                }
                Ok(())
            }
            _ => Err(duplicate(full_key)),
        };
    }

    let child = target
        .entry(head.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    match child {
        Value::Object(child) => insert_path(child, full_key, rest, value),
        _ => Err(duplicate(full_key)),
    }
}

fn duplicate(key: &str) -> MbapError {
    MbapError::Configuration(format!("{}: conflicting definitions", key))
}

/// Convert a positive millisecond value.
pub(crate) fn millis(key: &str, value: u64) -> Result<Duration> {
    if value == 0 {
        return Err(MbapError::Configuration(format!("{} must be positive", key)));
    }
    Ok(Duration::from_millis(value))
}

/// Check that `value` lies in `min..=max`.
pub(crate) fn in_range(key: &str, value: u64, min: u64, max: u64) -> Result<u64> {
    if value < min || value > max {
        return Err(MbapError::Configuration(format!(
            "{} must be in {}..={}, got {}",
            key, min, max, value
        )));
    }
    Ok(value)
}
