use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Keys accepted for the record identifier, in lookup order.
const ID_KEYS: &[&str] = &["id", "Id", "ID", "_id"];

/// Keys accepted for the phone number, in lookup order.
const PHONE_KEYS: &[&str] = &["phone", "Phone", "phone_number", "phoneNumber", "mobile"];

/// A phone record as submitted by an import pipeline.
///
/// Records are never mutated once they enter the detection engine: they are only moved
/// or cloned into the duplicate or new partition of a result.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Record {
    pub id: String,
    #[serde(default)]
    pub phone: String,
    /// Everything the caller sent, kept as-is so it can be rendered or exported later.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl Record {
    pub fn new(id: impl Into<String>, phone: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            phone: phone.into(),
            payload: Value::Null,
        }
    }

    /// Normalize an arbitrary JSON object into a `Record`.
    ///
    /// Spreadsheet imports produce rows with inconsistent column names, so this is the one
    /// place that knows about those variants. A row without a usable identifier still yields
    /// a record, with an empty id.
    pub fn from_json(value: Value) -> Result<Self, RecordShapeError> {
        let object = match value {
            Value::Object(object) => object,
            other => return Err(RecordShapeError::NotAnObject(json_type_name(&other))),
        };

        let id = first_scalar(&object, ID_KEYS).unwrap_or_default();
        let phone = first_scalar(&object, PHONE_KEYS).unwrap_or_default();

        Ok(Self {
            id,
            phone,
            payload: Value::Object(object),
        })
    }

    /// Normalize every row of an import, failing on the first row that is not an object.
    pub fn from_json_rows(rows: Vec<Value>) -> Result<Vec<Self>, RecordShapeError> {
        rows.into_iter()
            .enumerate()
            .map(|(index, row)| {
                Self::from_json(row).map_err(|error| RecordShapeError::Row {
                    index,
                    error: Box::new(error),
                })
            })
            .collect()
    }
}

/// A row as persisted in the record store.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, sqlx::FromRow)]
pub struct RecordDetail {
    pub id: String,
    pub phone: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RecordShapeError {
    #[error("expected a JSON object but got {0}")]
    NotAnObject(&'static str),
    #[error("row {index} is malformed: {error}")]
    Row {
        index: usize,
        error: Box<RecordShapeError>,
    },
}

fn first_scalar(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| object.get(*key))
        .find_map(|value| match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_reads_field_variants() {
        let record = Record::from_json(json!({"Id": "A1", "phone_number": "555-0100"})).unwrap();
        assert_eq!(record.id, "A1");
        assert_eq!(record.phone, "555-0100");

        let record = Record::from_json(json!({"ID": 42, "mobile": 5550100})).unwrap();
        assert_eq!(record.id, "42");
        assert_eq!(record.phone, "5550100");
    }

    #[test]
    fn test_from_json_prefers_lowercase_id() {
        let record = Record::from_json(json!({"id": "lower", "Id": "upper"})).unwrap();
        assert_eq!(record.id, "lower");
    }

    #[test]
    fn test_from_json_keeps_payload() {
        let row = json!({"id": "A1", "phone": "123", "company": "Acme"});
        let record = Record::from_json(row.clone()).unwrap();
        assert_eq!(record.payload, row);
    }

    #[test]
    fn test_from_json_missing_id_is_empty() {
        let record = Record::from_json(json!({"phone": "123"})).unwrap();
        assert_eq!(record.id, "");
        assert_eq!(record.phone, "123");
    }

    #[test]
    fn test_from_json_rejects_non_objects() {
        assert_eq!(
            Record::from_json(json!(["A1"])),
            Err(RecordShapeError::NotAnObject("an array"))
        );

        let err = Record::from_json_rows(vec![json!({"id": "A1"}), json!("A2")]).unwrap_err();
        assert_eq!(
            err,
            RecordShapeError::Row {
                index: 1,
                error: Box::new(RecordShapeError::NotAnObject("a string")),
            }
        );
    }
}
