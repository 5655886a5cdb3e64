//! Input events, raw and validated.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DataError;
use crate::types::EntityId;

/// An input record exactly as received from an event source.
///
/// Every field is kept as loosely typed JSON so that a malformed record
/// fails its own entity in [`Event::from_raw`] rather than the whole input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// String or integer entity identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<Value>,
    /// RFC3339 string or epoch-millis integer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
    /// Numeric measure. Numeric strings are accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Opaque string map, passed through unaggregated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Value>,
}

impl RawEvent {
    /// Returns the entity this record claims to belong to, if it names one.
    pub fn entity_id(&self) -> Option<EntityId> {
        match self.entity_id.as_ref()? {
            Value::String(s) => EntityId::new(s.as_str()).ok(),
            Value::Number(n) if n.is_i64() || n.is_u64() => EntityId::new(n.to_string()).ok(),
            _ => None,
        }
    }
}

impl From<&Event> for RawEvent {
    fn from(event: &Event) -> Self {
        Self {
            entity_id: Some(Value::String(event.entity_id.to_string())),
            timestamp: Some(Value::String(event.timestamp.to_rfc3339())),
            value: event.value.and_then(serde_json::Number::from_f64).map(Value::Number),
            attributes: if event.attributes.is_empty() {
                None
            } else {
                Some(Value::Object(
                    event
                        .attributes
                        .iter()
                        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                        .collect(),
                ))
            },
        }
    }
}

/// A validated event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub entity_id: EntityId,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl Event {
    /// Creates a count-only event.
    pub fn new(entity_id: EntityId, timestamp: DateTime<Utc>) -> Self {
        Self {
            entity_id,
            timestamp,
            value: None,
            attributes: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Validates a raw record at position `index` of its entity's input.
    pub fn from_raw(raw: RawEvent, index: usize) -> Result<Self, DataError> {
        let entity_id = raw
            .entity_id()
            .ok_or(DataError::MissingEntityId { index })?;
        let timestamp = parse_timestamp(raw.timestamp.as_ref(), index)?;
        let value = parse_value(raw.value.as_ref(), index)?;
        let attributes = parse_attributes(raw.attributes);

        Ok(Self {
            entity_id,
            timestamp,
            value,
            attributes,
        })
    }
}

/// The view of an event needed for sessionization and aggregation.
///
/// This trait allows the sessionizer to work with different event
/// representations (e.g., [`Event`], or test fixtures).
pub trait SessionEvent {
    /// Returns the entity the event belongs to.
    fn entity_id(&self) -> &EntityId;

    /// Returns the event's timestamp.
    fn timestamp(&self) -> DateTime<Utc>;

    /// Returns the event's numeric measure, if any.
    fn value(&self) -> Option<f64>;
}

impl SessionEvent for Event {
    fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn value(&self) -> Option<f64> {
        self.value
    }
}

impl<E: SessionEvent> SessionEvent for &E {
    fn entity_id(&self) -> &EntityId {
        (*self).entity_id()
    }

    fn timestamp(&self) -> DateTime<Utc> {
        (*self).timestamp()
    }

    fn value(&self) -> Option<f64> {
        (*self).value()
    }
}

fn parse_timestamp(value: Option<&Value>, index: usize) -> Result<DateTime<Utc>, DataError> {
    let invalid = |v: &Value| DataError::InvalidTimestamp {
        index,
        value: v.to_string(),
    };

    match value {
        None | Some(Value::Null) => Err(DataError::MissingTimestamp { index }),
        Some(v @ Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| invalid(v)),
        Some(v @ Value::Number(n)) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| invalid(v)),
        Some(v) => Err(invalid(v)),
    }
}

fn parse_value(value: Option<&Value>, index: usize) -> Result<Option<f64>, DataError> {
    let number = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(_) => None,
    };

    match number {
        Some(n) if n.is_finite() => Ok(Some(n)),
        Some(_) => Err(DataError::NonFiniteValue { index }),
        None => Err(DataError::InvalidValue {
            index,
            value: value.map(Value::to_string).unwrap_or_default(),
        }),
    }
}

/// Non-string attribute values are kept in their JSON rendering.
fn parse_attributes(value: Option<Value>) -> BTreeMap<String, String> {
    match value {
        Some(Value::Object(map)) => map
            .into_iter()
            .map(|(k, v)| match v {
                Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect(),
        _ => BTreeMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> RawEvent {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn parses_rfc3339_record() {
        let event = Event::from_raw(
            raw(json!({
                "entity_id": "A",
                "timestamp": "2025-01-15T09:00:00Z",
                "value": 12.5,
                "attributes": {"channel": "web"}
            })),
            0,
        )
        .unwrap();

        assert_eq!(event.entity_id.as_str(), "A");
        assert_eq!(
            event.timestamp,
            Utc.with_ymd_and_hms(2025, 1, 15, 9, 0, 0).unwrap()
        );
        assert_eq!(event.value, Some(12.5));
        assert_eq!(event.attributes.get("channel").map(String::as_str), Some("web"));
    }

    #[test]
    fn parses_epoch_millis_and_integer_entity() {
        let event = Event::from_raw(
            raw(json!({"entity_id": 42, "timestamp": 1_736_931_600_000_i64})),
            0,
        )
        .unwrap();

        assert_eq!(event.entity_id.as_str(), "42");
        assert_eq!(event.timestamp.timestamp_millis(), 1_736_931_600_000);
        assert_eq!(event.value, None);
    }

    #[test]
    fn null_timestamp_is_missing() {
        let err = Event::from_raw(raw(json!({"entity_id": "E", "timestamp": null})), 2)
            .unwrap_err();
        assert_eq!(err, DataError::MissingTimestamp { index: 2 });
    }

    #[test]
    fn garbage_timestamp_is_invalid() {
        let err = Event::from_raw(
            raw(json!({"entity_id": "E", "timestamp": "yesterday"})),
            0,
        )
        .unwrap_err();
        assert!(matches!(err, DataError::InvalidTimestamp { index: 0, .. }));

        let err = Event::from_raw(raw(json!({"entity_id": "E", "timestamp": 1.5})), 0)
            .unwrap_err();
        assert!(matches!(err, DataError::InvalidTimestamp { .. }));
    }

    #[test]
    fn missing_or_empty_entity_id() {
        let err = Event::from_raw(raw(json!({"timestamp": 0})), 1).unwrap_err();
        assert_eq!(err, DataError::MissingEntityId { index: 1 });

        let err = Event::from_raw(raw(json!({"entity_id": "", "timestamp": 0})), 0)
            .unwrap_err();
        assert_eq!(err, DataError::MissingEntityId { index: 0 });
    }

    #[test]
    fn non_finite_value_is_rejected() {
        let err = Event::from_raw(
            raw(json!({"entity_id": "E", "timestamp": 0, "value": "NaN"})),
            0,
        )
        .unwrap_err();
        assert_eq!(err, DataError::NonFiniteValue { index: 0 });

        let err = Event::from_raw(
            raw(json!({"entity_id": "E", "timestamp": 0, "value": "inf"})),
            0,
        )
        .unwrap_err();
        assert_eq!(err, DataError::NonFiniteValue { index: 0 });
    }

    #[test]
    fn numeric_string_value_is_accepted() {
        let event = Event::from_raw(
            raw(json!({"entity_id": "E", "timestamp": 0, "value": " 19.99 "})),
            0,
        )
        .unwrap();
        assert_eq!(event.value, Some(19.99));

        let err = Event::from_raw(
            raw(json!({"entity_id": "E", "timestamp": 0, "value": [1]})),
            0,
        )
        .unwrap_err();
        assert!(matches!(err, DataError::InvalidValue { .. }));
    }

    #[test]
    fn non_string_attributes_are_rendered() {
        let event = Event::from_raw(
            raw(json!({"entity_id": "E", "timestamp": 0, "attributes": {"n": 3, "ok": true}})),
            0,
        )
        .unwrap();
        assert_eq!(event.attributes.get("n").map(String::as_str), Some("3"));
        assert_eq!(event.attributes.get("ok").map(String::as_str), Some("true"));
    }

    #[test]
    fn raw_from_event_revalidates() {
        let event = Event::new(
            EntityId::new("A").unwrap(),
            Utc.with_ymd_and_hms(2025, 1, 15, 9, 0, 0).unwrap(),
        )
        .with_value(3.0)
        .with_attribute("k", "v");

        let parsed = Event::from_raw(RawEvent::from(&event), 0).unwrap();
        assert_eq!(parsed, event);
    }
}
