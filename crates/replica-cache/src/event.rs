//! Change events and their wire form.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::record::ID_FIELD;
use crate::{Record, RecordId, SyncError};

/// A mutation observed upstream.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    /// A record was created.
    Insert { collection: String, record: Record },
    /// A record was replaced. `old_record` is whatever the source reported,
    /// often only the primary key.
    Update {
        collection: String,
        record: Record,
        old_record: Option<Value>,
    },
    /// A record was removed. Only the id of the old row is meaningful;
    /// `old_record` keeps whatever else the source reported.
    Delete {
        collection: String,
        id: RecordId,
        old_record: Option<Value>,
    },
}

impl ChangeEvent {
    pub fn insert(collection: impl Into<String>, record: Record) -> Self {
        ChangeEvent::Insert {
            collection: collection.into(),
            record,
        }
    }

    pub fn update(collection: impl Into<String>, record: Record) -> Self {
        ChangeEvent::Update {
            collection: collection.into(),
            record,
            old_record: None,
        }
    }

    pub fn delete(collection: impl Into<String>, id: impl Into<RecordId>) -> Self {
        ChangeEvent::Delete {
            collection: collection.into(),
            id: id.into(),
            old_record: None,
        }
    }

    pub fn collection(&self) -> &str {
        match self {
            ChangeEvent::Insert { collection, .. }
            | ChangeEvent::Update { collection, .. }
            | ChangeEvent::Delete { collection, .. } => collection,
        }
    }

    /// Id of the record this event touches.
    pub fn record_id(&self) -> &RecordId {
        match self {
            ChangeEvent::Insert { record, .. } | ChangeEvent::Update { record, .. } => record.id(),
            ChangeEvent::Delete { id, .. } => id,
        }
    }

    /// Decode a JSON wire event.
    pub fn from_json(text: &str) -> Result<Self, SyncError> {
        let wire: WireEvent = serde_json::from_str(text)?;
        Self::try_from(wire)
    }
}

/// JSON shape of a change event as sent by a change feed.
///
/// ```json
/// {"type": "UPDATE", "collection": "tasks", "record": {"id": 1}, "old_record": {"id": 1}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    /// Operation tag: `INSERT`, `UPDATE` or `DELETE`.
    #[serde(rename = "type")]
    pub kind: String,
    pub collection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_record: Option<Value>,
}

impl TryFrom<WireEvent> for ChangeEvent {
    type Error = SyncError;

    fn try_from(wire: WireEvent) -> Result<Self, Self::Error> {
        let WireEvent {
            kind,
            collection,
            record,
            old_record,
        } = wire;

        let new_record = |record: Option<Value>| {
            record
                .ok_or_else(|| {
                    SyncError::MalformedEvent(format!("{} event without a record", kind))
                })
                .and_then(|value| {
                    Record::try_from(value)
                        .map_err(|e| SyncError::MalformedEvent(format!("{} record: {}", kind, e)))
                })
        };

        match kind.as_str() {
            "INSERT" => Ok(ChangeEvent::Insert {
                record: new_record(record)?,
                collection,
            }),
            "UPDATE" => Ok(ChangeEvent::Update {
                record: new_record(record)?,
                collection,
                old_record,
            }),
            "DELETE" => {
                let id = old_record
                    .as_ref()
                    .and_then(|old| old.get(ID_FIELD))
                    .and_then(RecordId::from_value)
                    .ok_or_else(|| {
                        SyncError::MalformedEvent("DELETE event without an old record id".to_string())
                    })?;
                Ok(ChangeEvent::Delete {
                    collection,
                    id,
                    old_record,
                })
            }
            other => Err(SyncError::MalformedEvent(format!(
                "unrecognized operation {:?} on {}",
                other, collection
            ))),
        }
    }
}

impl From<&ChangeEvent> for WireEvent {
    fn from(event: &ChangeEvent) -> Self {
        match event {
            ChangeEvent::Insert { collection, record } => WireEvent {
                kind: "INSERT".to_string(),
                collection: collection.clone(),
                record: Some(record.clone().into_value()),
                old_record: None,
            },
            ChangeEvent::Update {
                collection,
                record,
                old_record,
            } => WireEvent {
                kind: "UPDATE".to_string(),
                collection: collection.clone(),
                record: Some(record.clone().into_value()),
                old_record: old_record.clone(),
            },
            ChangeEvent::Delete {
                collection,
                id,
                old_record,
            } => WireEvent {
                kind: "DELETE".to_string(),
                collection: collection.clone(),
                record: None,
                old_record: Some(
                    old_record
                        .clone()
                        .unwrap_or_else(|| json!({ "id": id.to_value() })),
                ),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_insert() {
        let event = ChangeEvent::from_json(
            r#"{"type": "INSERT", "collection": "tasks", "record": {"id": 1, "score": 5}}"#,
        )
        .unwrap();
        assert_eq!(event.collection(), "tasks");
        assert_eq!(event.record_id(), &RecordId::Int(1));
        assert!(matches!(event, ChangeEvent::Insert { .. }));
    }

    #[test]
    fn test_parse_update_keeps_old_record() {
        let event = ChangeEvent::from_json(
            r#"{"type": "UPDATE", "collection": "tasks", "record": {"id": 1, "score": 9}, "old_record": {"id": 1}}"#,
        )
        .unwrap();
        match event {
            ChangeEvent::Update { old_record, record, .. } => {
                assert_eq!(old_record, Some(json!({"id": 1})));
                assert_eq!(record.get("score"), Some(&json!(9)));
            }
            other => panic!("expected Update, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_delete_uses_old_id() {
        let event = ChangeEvent::from_json(
            r#"{"type": "DELETE", "collection": "tasks", "old_record": {"id": "abc", "title": "gone"}}"#,
        )
        .unwrap();
        match event {
            ChangeEvent::Delete {
                collection,
                id,
                old_record,
            } => {
                assert_eq!(collection, "tasks");
                assert_eq!(id, RecordId::from("abc"));
                // The rest of the old row is kept as reported
                assert_eq!(old_record, Some(json!({"id": "abc", "title": "gone"})));
            }
            other => panic!("expected Delete, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_operation_is_malformed() {
        let result = ChangeEvent::from_json(r#"{"type": "TRUNCATE", "collection": "tasks"}"#);
        assert!(matches!(result, Err(SyncError::MalformedEvent(_))));
    }

    #[test]
    fn test_missing_payloads_are_malformed() {
        assert!(matches!(
            ChangeEvent::from_json(r#"{"type": "INSERT", "collection": "tasks"}"#),
            Err(SyncError::MalformedEvent(_))
        ));
        assert!(matches!(
            ChangeEvent::from_json(r#"{"type": "DELETE", "collection": "tasks", "old_record": {}}"#),
            Err(SyncError::MalformedEvent(_))
        ));
        assert!(matches!(
            ChangeEvent::from_json(r#"{"type": "UPDATE", "collection": "tasks", "record": {"x": 1}}"#),
            Err(SyncError::MalformedEvent(_))
        ));
    }

    #[test]
    fn test_invalid_json_is_json_error() {
        assert!(matches!(
            ChangeEvent::from_json("not json"),
            Err(SyncError::Json(_))
        ));
    }

    #[test]
    fn test_wire_form_of_delete() {
        let wire = WireEvent::from(&ChangeEvent::delete("tasks", 4));
        assert_eq!(wire.kind, "DELETE");
        assert_eq!(wire.old_record, Some(json!({"id": 4})));

        let event = ChangeEvent::try_from(wire.clone()).unwrap();
        assert_eq!(event.record_id(), &RecordId::Int(4));
        // A decoded delete re-encodes to the same wire form
        assert_eq!(WireEvent::from(&event), wire);
    }
}
