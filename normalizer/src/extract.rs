use serde_json::Value;

/// Raw entities of every kind, concatenated across container versions.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExtractedEntities {
    pub tags: Vec<Value>,
    pub variables: Vec<Value>,
    pub built_in_variables: Vec<Value>,
    pub triggers: Vec<Value>,
}

impl ExtractedEntities {
    pub fn len(&self) -> usize {
        self.tags.len() + self.variables.len() + self.built_in_variables.len() + self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pulls the tags, variables, built-in variables and triggers out of a list of
/// container versions. A version without some kind contributes nothing to
/// that list.
pub fn extract(versions: &[Value]) -> ExtractedEntities {
    ExtractedEntities {
        tags: collect(versions, "tag", 1),
        variables: collect(versions, "variable", 1),
        // The API nests built-in variables one level deeper than the rest.
        built_in_variables: collect(versions, "builtInVariable", 2),
        triggers: collect(versions, "trigger", 1),
    }
}

fn collect(versions: &[Value], field: &str, depth: usize) -> Vec<Value> {
    let mut out = Vec::new();
    for value in versions.iter().filter_map(|version| version.get(field)) {
        flatten_into(value, depth, &mut out);
    }
    out
}

// Expands arrays up to `depth` levels. Nulls are dropped at every level.
fn flatten_into(value: &Value, depth: usize, out: &mut Vec<Value>) {
    match value {
        Value::Null => {}
        Value::Array(items) if depth > 0 => {
            for item in items {
                flatten_into(item, depth - 1, out);
            }
        }
        other => out.push(other.clone()),
    }
}
