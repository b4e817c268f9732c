//! The dynamic value type planning operates over, and deferral marking.
//!
//! Provider configs, prior/desired/planned object states, and placeholder
//! values are all instances of [`Value`]. The planner never interprets the
//! shape of a value beyond the null-ness checked by the invariants in
//! `object.rs` — schema-aware validation belongs to the provider and the
//! evaluator, both external collaborators.

use serde::{Deserialize, Serialize};

/// A value that may be partially or fully unknown, optionally marked as
/// deferred.
///
/// Deferral is not an error: it marks a value whose true shape cannot be
/// determined this round (an upstream dependency is itself deferred, or
/// dynamic expansion hasn't resolved). Any value derived from a deferred
/// value is transitively marked, so downstream planners can test one value
/// to decide whether they too must defer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Value {
    /// The underlying JSON-shaped data. `Value::Null` at the top level means
    /// "wholly unknown" when `deferred` is set, or a genuine null otherwise.
    pub data: serde_json::Value,
    /// Whether this value (or something it was derived from) was deferred.
    #[serde(default)]
    pub deferred: bool,
}

impl Value {
    /// Wraps a concrete, fully-known value.
    #[must_use]
    pub fn known(data: serde_json::Value) -> Self {
        Self {
            data,
            deferred: false,
        }
    }

    /// The JSON `null` value, fully known.
    #[must_use]
    pub fn null() -> Self {
        Self::known(serde_json::Value::Null)
    }

    /// An unknown placeholder, marked as deferred.
    #[must_use]
    pub fn deferred_unknown() -> Self {
        Self {
            data: serde_json::Value::Null,
            deferred: true,
        }
    }

    /// True if this is the JSON null value (deferred or not).
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.data.is_null()
    }

    /// Derives a new value from `self` and `other`, propagating deferral if
    /// either input was deferred. Used wherever a planner combines a prior
    /// value with evaluated configuration to produce a proposed new value.
    #[must_use]
    pub fn combine(self, other: &Self) -> Self {
        Self {
            deferred: self.deferred || other.deferred,
            ..self
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(data: serde_json::Value) -> Self {
        Self::known(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deferral_propagates_through_combine() {
        let deferred = Value::deferred_unknown();
        let known = Value::known(serde_json::json!({"a": 1}));

        let combined = known.clone().combine(&deferred);
        assert!(combined.deferred);

        let combined_other_order = deferred.combine(&known);
        assert!(combined_other_order.deferred);
    }

    #[test]
    fn known_values_are_not_deferred() {
        let v = Value::known(serde_json::json!("after"));
        assert!(!v.deferred);
        assert!(!v.is_null());
    }
}
