use crate::fields::scalar_string;
use serde::Serialize;
use serde_json::Value;

/// A parameter with every field present.
///
/// `list` and `map` hold sub-parameters and are normalized recursively, so a
/// nested structure keeps its depth and branching while missing leaf fields
/// get their defaults. Unknown `type` values pass through untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Parameter {
    pub r#type: Option<String>,
    pub key: Option<String>,
    pub value: Option<String>,
    pub list: Vec<Parameter>,
    pub map: Vec<Parameter>,
}

impl Parameter {
    /// The all-null parameter substituted for an absent parameter list.
    pub fn sentinel() -> Self {
        Parameter::default()
    }

    /// Normalizes one raw parameter. A missing or non-object input yields the
    /// sentinel; this never fails.
    pub fn normalize(raw: Option<&Value>) -> Self {
        let Some(Value::Object(object)) = raw else {
            return Parameter::sentinel();
        };

        let scalar = |field: &str| object.get(field).and_then(scalar_string);
        let nested = |field: &str| match object.get(field) {
            Some(Value::Array(items)) => normalize_parameters(items),
            _ => Vec::new(),
        };

        Parameter {
            r#type: scalar("type"),
            key: scalar("key"),
            value: scalar("value"),
            list: nested("list"),
            map: nested("map"),
        }
    }
}

/// Element-wise [`Parameter::normalize`].
pub fn normalize_parameters(raw: &[Value]) -> Vec<Parameter> {
    raw.iter().map(|p| Parameter::normalize(Some(p))).collect()
}

/// The narrower sentinel used when a trigger has no parameters at all. Unlike
/// [`Parameter::sentinel`] it has no `list` or `map` columns.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BareParameter {
    pub r#type: Option<String>,
    pub key: Option<String>,
    pub value: Option<String>,
}
