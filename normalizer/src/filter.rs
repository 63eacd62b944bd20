use crate::fields::{non_empty_array, scalar_string};
use crate::parameter::{Parameter, normalize_parameters};
use serde::Serialize;
use serde_json::Value;

/// A trigger condition: a type plus the parameters it compares.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Filter {
    pub r#type: Option<String>,
    pub parameter: Vec<Parameter>,
}

impl Filter {
    /// Stand-in for an absent filter list. Its single parameter is the
    /// all-null [`Parameter::sentinel`], so the array column is never empty.
    pub fn sentinel() -> Self {
        Filter {
            r#type: None,
            parameter: vec![Parameter::sentinel()],
        }
    }

    pub fn normalize(raw: &Value) -> Self {
        let Value::Object(object) = raw else {
            return Filter::sentinel();
        };

        let parameter = match non_empty_array(object, "parameter") {
            Some(params) => normalize_parameters(params),
            None => vec![Parameter::sentinel()],
        };

        Filter {
            r#type: object.get("type").and_then(scalar_string),
            parameter,
        }
    }
}

/// Normalizes a `filter` or `customEventFilter` list.
///
/// Absent and empty lists are treated alike: both become a single
/// [`Filter::sentinel`]. The result is never empty.
pub fn normalize_filters(raw: Option<&Value>) -> Vec<Filter> {
    match raw {
        Some(Value::Array(items)) if !items.is_empty() => items.iter().map(Filter::normalize).collect(),
        _ => vec![Filter::sentinel()],
    }
}
