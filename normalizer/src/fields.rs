// Read-only accessors over a raw JSON object returned by the remote API.
use crate::error::{EntityKind, SchemaViolation};
use serde_json::{Map, Value};

/// Converts a JSON scalar into its string form. Strings are taken as-is,
/// numbers and booleans are rendered, and null or structured values yield None.
pub fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Returns the array stored under `field` if it is present and has at least
/// one element. Absent, null, non-array and empty values all yield None.
pub(crate) fn non_empty_array<'a>(object: &'a Map<String, Value>, field: &str) -> Option<&'a [Value]> {
    match object.get(field) {
        Some(Value::Array(items)) if !items.is_empty() => Some(items.as_slice()),
        _ => None,
    }
}

/// A raw entity viewed as an object, tagged with its kind so that
/// violations can name what was being flattened.
pub(crate) struct Fields<'a> {
    kind: EntityKind,
    object: &'a Map<String, Value>,
}

impl<'a> Fields<'a> {
    pub fn new(kind: EntityKind, raw: &'a Value) -> Result<Self, SchemaViolation> {
        match raw {
            Value::Object(object) => Ok(Fields { kind, object }),
            _ => Err(SchemaViolation::NotAnObject { kind }),
        }
    }

    pub fn object(&self) -> &'a Map<String, Value> {
        self.object
    }

    fn id(&self) -> Option<String> {
        self.kind
            .id_field()
            .and_then(|field| self.object.get(field))
            .and_then(scalar_string)
    }

    fn missing(&self, field: &'static str) -> SchemaViolation {
        SchemaViolation::MissingField {
            kind: self.kind,
            id: self.id(),
            field,
        }
    }

    pub fn required_str(&self, field: &'static str) -> Result<String, SchemaViolation> {
        self.optional_str(field).ok_or_else(|| self.missing(field))
    }

    /// Checks that every field in `fields` holds a scalar.
    pub fn require_all(&self, fields: &[&'static str]) -> Result<(), SchemaViolation> {
        for field in fields {
            self.required_str(field)?;
        }
        Ok(())
    }

    pub fn required_array(&self, field: &'static str) -> Result<&'a [Value], SchemaViolation> {
        match self.object.get(field) {
            Some(Value::Array(items)) => Ok(items.as_slice()),
            _ => Err(self.missing(field)),
        }
    }

    pub fn optional_str(&self, field: &str) -> Option<String> {
        self.object.get(field).and_then(scalar_string)
    }

    /// Any present, non-null value, kept verbatim.
    pub fn optional_value(&self, field: &str) -> Option<Value> {
        self.object.get(field).filter(|v| !v.is_null()).cloned()
    }

    /// A list of identifiers, empty when the field is absent.
    pub fn string_list(&self, field: &str) -> Vec<String> {
        match self.object.get(field) {
            Some(Value::Array(items)) => items.iter().filter_map(scalar_string).collect(),
            _ => Vec::new(),
        }
    }

    pub fn non_empty_array(&self, field: &str) -> Option<&'a [Value]> {
        non_empty_array(self.object, field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalar_string() {
        assert_eq!(scalar_string(&json!("a")), Some("a".to_string()));
        assert_eq!(scalar_string(&json!(12)), Some("12".to_string()));
        assert_eq!(scalar_string(&json!(false)), Some("false".to_string()));
        assert_eq!(scalar_string(&json!(null)), None);
        assert_eq!(scalar_string(&json!({"a": 1})), None);
    }

    #[test]
    fn test_required_field_reports_entity_id() {
        let raw = json!({"tagId": "7"});
        let fields = Fields::new(EntityKind::Tag, &raw).unwrap();
        assert_eq!(
            fields.required_str("name"),
            Err(SchemaViolation::MissingField {
                kind: EntityKind::Tag,
                id: Some("7".into()),
                field: "name",
            })
        );
    }

    #[test]
    fn test_not_an_object() {
        let raw = json!(["tag"]);
        assert!(matches!(
            Fields::new(EntityKind::Tag, &raw),
            Err(SchemaViolation::NotAnObject {
                kind: EntityKind::Tag
            })
        ));
    }

    #[test]
    fn test_string_list_defaults_to_empty() {
        let raw = json!({"firingTriggerId": ["1", 2]});
        let fields = Fields::new(EntityKind::Tag, &raw).unwrap();
        assert_eq!(fields.string_list("firingTriggerId"), vec!["1", "2"]);
        assert!(fields.string_list("blockingTriggerId").is_empty());
    }
}
