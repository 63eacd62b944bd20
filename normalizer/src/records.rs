use crate::error::{EntityKind, SchemaViolation};
use crate::extract::ExtractedEntities;
use crate::fields::{Fields, scalar_string};
use crate::filter::{Filter, normalize_filters};
use crate::parameter::{BareParameter, Parameter, normalize_parameters};
use serde::Serialize;
use serde_json::{Map, Value};

/// Flattens one raw entity into its warehouse record.
pub trait FromRaw: Sized {
    const KIND: EntityKind;

    fn from_raw(raw: &Value) -> Result<Self, SchemaViolation>;
}

/// Flattens every entity of one kind, stopping at the first violation.
pub fn flatten_all<T: FromRaw>(raws: &[Value]) -> Result<Vec<T>, SchemaViolation> {
    raws.iter().map(T::from_raw).collect()
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TagRecord {
    pub account_id: String,
    pub container_id: String,
    pub tag_id: String,
    pub name: String,
    pub r#type: String,
    pub parameter: Vec<Parameter>,
    pub fingerprint: Option<String>,
    pub firing_trigger_id: Vec<String>,
    pub blocking_trigger_id: Vec<String>,
    pub tag_firing_option: Option<Value>,
    pub monitoring_metadata: Option<Value>,
}

impl FromRaw for TagRecord {
    const KIND: EntityKind = EntityKind::Tag;

    fn from_raw(raw: &Value) -> Result<Self, SchemaViolation> {
        let fields = Fields::new(Self::KIND, raw)?;

        Ok(TagRecord {
            account_id: fields.required_str("accountId")?,
            container_id: fields.required_str("containerId")?,
            tag_id: fields.required_str("tagId")?,
            name: fields.required_str("name")?,
            r#type: fields.required_str("type")?,
            // The API always sends parameters for tags; an absent list is a
            // broken payload rather than something to default.
            parameter: normalize_parameters(fields.required_array("parameter")?),
            fingerprint: fields.optional_str("fingerprint"),
            firing_trigger_id: fields.string_list("firingTriggerId"),
            blocking_trigger_id: fields.string_list("blockingTriggerId"),
            tag_firing_option: fields.optional_value("tagFiringOption"),
            monitoring_metadata: fields.optional_value("monitoringMetadata"),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableRecord {
    pub account_id: String,
    pub container_id: String,
    pub variable_id: String,
    pub name: String,
    pub r#type: String,
    pub parameter: Vec<Parameter>,
    pub fingerprint: Option<String>,
    pub parent_folder_id: Option<String>,
}

impl FromRaw for VariableRecord {
    const KIND: EntityKind = EntityKind::Variable;

    fn from_raw(raw: &Value) -> Result<Self, SchemaViolation> {
        let fields = Fields::new(Self::KIND, raw)?;

        let parameter = match fields.non_empty_array("parameter") {
            Some(params) => normalize_parameters(params),
            None => vec![Parameter::sentinel()],
        };

        Ok(VariableRecord {
            account_id: fields.required_str("accountId")?,
            container_id: fields.required_str("containerId")?,
            variable_id: fields.required_str("variableId")?,
            name: fields.required_str("name")?,
            r#type: fields.required_str("type")?,
            parameter,
            fingerprint: fields.optional_str("fingerprint"),
            parent_folder_id: fields.optional_str("parentFolderId"),
        })
    }
}

/// Trigger parameters serialize either as full parameters or, when the
/// trigger has none, as a single [`BareParameter`] without `list`/`map`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TriggerParameters {
    Normalized(Vec<Parameter>),
    Absent([BareParameter; 1]),
}

impl TriggerParameters {
    fn from_raw(raw: Option<&[Value]>) -> Self {
        match raw {
            Some(params) => TriggerParameters::Normalized(normalize_parameters(params)),
            None => TriggerParameters::Absent([BareParameter::default()]),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRecord {
    pub account_id: String,
    pub container_id: String,
    pub trigger_id: String,
    pub name: String,
    pub r#type: String,
    pub filter: Vec<Filter>,
    pub custom_event_filter: Vec<Filter>,
    pub wait_for_tags: Option<Value>,
    pub check_validation: Option<Value>,
    pub wait_for_tags_timeout: Option<Value>,
    pub unique_trigger_id: Option<Value>,
    pub fingerprint: Option<String>,
    pub parent_folder_id: Option<String>,
    pub parameter: TriggerParameters,
}

impl FromRaw for TriggerRecord {
    const KIND: EntityKind = EntityKind::Trigger;

    fn from_raw(raw: &Value) -> Result<Self, SchemaViolation> {
        let fields = Fields::new(Self::KIND, raw)?;
        let object = fields.object();

        Ok(TriggerRecord {
            account_id: fields.required_str("accountId")?,
            container_id: fields.required_str("containerId")?,
            trigger_id: fields.required_str("triggerId")?,
            name: fields.required_str("name")?,
            r#type: fields.required_str("type")?,
            filter: normalize_filters(object.get("filter")),
            custom_event_filter: normalize_filters(object.get("customEventFilter")),
            wait_for_tags: fields.optional_value("waitForTags"),
            check_validation: fields.optional_value("checkValidation"),
            wait_for_tags_timeout: fields.optional_value("waitForTagsTimeout"),
            unique_trigger_id: fields.optional_value("uniqueTriggerId"),
            fingerprint: fields.optional_str("fingerprint"),
            parent_folder_id: fields.optional_str("parentFolderId"),
            parameter: TriggerParameters::from_raw(fields.non_empty_array("parameter")),
        })
    }
}

// Records whose remote shape already matches the table. Only the identifying
// fields are checked; everything else is copied as-is.
macro_rules! pass_through_record {
    ($(#[$meta:meta])* $name:ident, $kind:expr, [$($field:literal),+ $(,)?]) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Serialize)]
        #[serde(transparent)]
        pub struct $name(pub Map<String, Value>);

        impl $name {
            /// A scalar field of the underlying object in string form.
            pub fn get_string(&self, field: &str) -> Option<String> {
                self.0.get(field).and_then(scalar_string)
            }
        }

        impl FromRaw for $name {
            const KIND: EntityKind = $kind;

            fn from_raw(raw: &Value) -> Result<Self, SchemaViolation> {
                let fields = Fields::new(Self::KIND, raw)?;
                fields.require_all(&[$($field),+])?;
                Ok($name(fields.object().clone()))
            }
        }
    };
}

pass_through_record!(
    /// A tag-manager account, as listed by the remote API.
    AccountRecord,
    EntityKind::Account,
    ["accountId", "name"]
);

pass_through_record!(
    ContainerRecord,
    EntityKind::Container,
    ["accountId", "containerId", "name"]
);

pass_through_record!(
    BuiltInVariableRecord,
    EntityKind::BuiltInVariable,
    ["accountId", "containerId", "name", "type"]
);

/// The four version-level record lists of one run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NormalizedEntities {
    pub tags: Vec<TagRecord>,
    pub variables: Vec<VariableRecord>,
    pub built_in_variables: Vec<BuiltInVariableRecord>,
    pub triggers: Vec<TriggerRecord>,
}

impl NormalizedEntities {
    pub fn from_extracted(extracted: &ExtractedEntities) -> Result<Self, SchemaViolation> {
        Ok(NormalizedEntities {
            tags: flatten_all(&extracted.tags)?,
            variables: flatten_all(&extracted.variables)?,
            built_in_variables: flatten_all(&extracted.built_in_variables)?,
            triggers: flatten_all(&extracted.triggers)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tag_defaults() {
        let raw = json!({
            "accountId": "1",
            "containerId": "2",
            "tagId": "3",
            "name": "t",
            "type": "html",
            "parameter": [{"type": "template", "value": "x"}],
            "fingerprint": "f"
        });

        let record = TagRecord::from_raw(&raw).unwrap();
        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            json!({
                "accountId": "1",
                "containerId": "2",
                "tagId": "3",
                "name": "t",
                "type": "html",
                "parameter": [{"type": "template", "key": null, "value": "x", "list": [], "map": []}],
                "fingerprint": "f",
                "firingTriggerId": [],
                "blockingTriggerId": [],
                "tagFiringOption": null,
                "monitoringMetadata": null
            })
        );
    }

    #[test]
    fn test_tag_keeps_optional_fields_verbatim() {
        let raw = json!({
            "accountId": "1",
            "containerId": "2",
            "tagId": "3",
            "name": "t",
            "type": "gaawe",
            "parameter": [],
            "firingTriggerId": ["10", "11"],
            "blockingTriggerId": ["12"],
            "tagFiringOption": "oncePerEvent",
            "monitoringMetadata": {"type": "map"}
        });

        let record = TagRecord::from_raw(&raw).unwrap();
        assert!(record.parameter.is_empty());
        assert_eq!(record.firing_trigger_id, vec!["10", "11"]);
        assert_eq!(record.blocking_trigger_id, vec!["12"]);
        assert_eq!(record.tag_firing_option, Some(json!("oncePerEvent")));
        assert_eq!(record.monitoring_metadata, Some(json!({"type": "map"})));
        assert_eq!(record.fingerprint, None);
    }

    #[test]
    fn test_tag_without_parameter_is_violation() {
        let raw = json!({
            "accountId": "1",
            "containerId": "2",
            "tagId": "3",
            "name": "t",
            "type": "html"
        });
        assert_eq!(
            TagRecord::from_raw(&raw),
            Err(SchemaViolation::MissingField {
                kind: EntityKind::Tag,
                id: Some("3".into()),
                field: "parameter",
            })
        );
    }

    #[test]
    fn test_variable_sentinel_parameter() {
        let raw = json!({
            "accountId": "1",
            "containerId": "2",
            "variableId": "5",
            "name": "v",
            "type": "jsm"
        });

        let record = VariableRecord::from_raw(&raw).unwrap();
        assert_eq!(record.parameter, vec![Parameter::sentinel()]);
        assert_eq!(record.parent_folder_id, None);

        let serialized = serde_json::to_value(&record).unwrap();
        assert_eq!(serialized["parentFolderId"], json!(null));
        assert_eq!(
            serialized["parameter"],
            json!([{"type": null, "key": null, "value": null, "list": [], "map": []}])
        );
    }

    #[test]
    fn test_variable_parameters_normalized() {
        let raw = json!({
            "accountId": "1",
            "containerId": "2",
            "variableId": "5",
            "name": "v",
            "type": "c",
            "parameter": [{"type": "template", "key": "value", "value": "UA-1"}],
            "parentFolderId": "9"
        });

        let record = VariableRecord::from_raw(&raw).unwrap();
        assert_eq!(record.parameter.len(), 1);
        assert_eq!(record.parameter[0].key.as_deref(), Some("value"));
        assert_eq!(record.parent_folder_id.as_deref(), Some("9"));
    }

    #[test]
    fn test_trigger_without_filter_or_parameter() {
        let raw = json!({
            "accountId": "1",
            "containerId": "2",
            "triggerId": "8",
            "name": "All Pages",
            "type": "pageview"
        });

        let record = TriggerRecord::from_raw(&raw).unwrap();
        assert_eq!(record.filter, vec![Filter::sentinel()]);
        assert_eq!(record.custom_event_filter, vec![Filter::sentinel()]);
        assert_eq!(record.filter[0].parameter.len(), 1);

        let serialized = serde_json::to_value(&record).unwrap();
        assert_eq!(
            serialized["parameter"],
            json!([{"type": null, "key": null, "value": null}])
        );
        for field in [
            "waitForTags",
            "checkValidation",
            "waitForTagsTimeout",
            "uniqueTriggerId",
            "fingerprint",
            "parentFolderId",
        ] {
            assert_eq!(serialized[field], json!(null), "{field}");
        }
    }

    #[test]
    fn test_trigger_with_filters_and_parameters() {
        let raw = json!({
            "accountId": "1",
            "containerId": "2",
            "triggerId": "8",
            "name": "purchase",
            "type": "customEvent",
            "customEventFilter": [{
                "type": "equals",
                "parameter": [
                    {"type": "template", "key": "arg0", "value": "{{_event}}"},
                    {"type": "template", "key": "arg1", "value": "purchase"}
                ]
            }],
            "waitForTags": {"type": "boolean", "value": "false"},
            "parameter": [{"type": "boolean", "key": "useOnScreenDuration", "value": "false"}]
        });

        let record = TriggerRecord::from_raw(&raw).unwrap();
        assert_eq!(record.filter, vec![Filter::sentinel()]);
        assert_eq!(record.custom_event_filter.len(), 1);
        assert_eq!(record.custom_event_filter[0].parameter.len(), 2);
        assert_eq!(record.wait_for_tags, Some(json!({"type": "boolean", "value": "false"})));

        let TriggerParameters::Normalized(params) = &record.parameter else {
            panic!("expected normalized parameters");
        };
        assert_eq!(params[0].key.as_deref(), Some("useOnScreenDuration"));
        assert!(params[0].map.is_empty());
    }

    #[test]
    fn test_trigger_empty_parameter_list_uses_bare_sentinel() {
        let raw = json!({
            "accountId": "1",
            "containerId": "2",
            "triggerId": "8",
            "name": "n",
            "type": "click",
            "parameter": []
        });
        let record = TriggerRecord::from_raw(&raw).unwrap();
        assert_eq!(
            record.parameter,
            TriggerParameters::Absent([BareParameter::default()])
        );
    }

    #[test]
    fn test_missing_identifier_is_violation() {
        let raw = json!({"accountId": "1", "containerId": "2", "name": "n", "type": "click"});
        assert_eq!(
            TriggerRecord::from_raw(&raw),
            Err(SchemaViolation::MissingField {
                kind: EntityKind::Trigger,
                id: None,
                field: "triggerId",
            })
        );
    }

    #[test]
    fn test_built_in_variable_passes_through() {
        let raw = json!({
            "accountId": "1",
            "containerId": "2",
            "type": "pageUrl",
            "name": "Page URL",
            "path": "accounts/1/containers/2/workspaces/3/built_in_variables"
        });
        let record = BuiltInVariableRecord::from_raw(&raw).unwrap();
        assert_eq!(serde_json::to_value(&record).unwrap(), raw);

        let err = BuiltInVariableRecord::from_raw(&json!({"accountId": "1"})).unwrap_err();
        assert!(matches!(
            err,
            SchemaViolation::MissingField {
                kind: EntityKind::BuiltInVariable,
                field: "containerId",
                ..
            }
        ));
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let raw = json!({
            "accountId": "1",
            "containerId": "2",
            "triggerId": "8",
            "name": "n",
            "type": "linkClick",
            "filter": [{"type": "contains", "parameter": [{"type": "template", "value": "a"}]}]
        });
        assert_eq!(
            TriggerRecord::from_raw(&raw).unwrap(),
            TriggerRecord::from_raw(&raw).unwrap()
        );
    }

    #[test]
    fn test_flatten_all_stops_at_first_violation() {
        let raws = vec![
            json!({"accountId": "1", "name": "first"}),
            json!({"name": "second"}),
        ];
        let err = flatten_all::<AccountRecord>(&raws).unwrap_err();
        assert!(matches!(
            err,
            SchemaViolation::MissingField {
                kind: EntityKind::Account,
                field: "accountId",
                ..
            }
        ));
    }
}
