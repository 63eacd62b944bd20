use std::fmt;

/// The entity kinds that end up in their own warehouse table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Account,
    Container,
    Tag,
    Variable,
    Trigger,
    BuiltInVariable,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Account,
        EntityKind::Container,
        EntityKind::Tag,
        EntityKind::Variable,
        EntityKind::BuiltInVariable,
        EntityKind::Trigger,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Account => "account",
            EntityKind::Container => "container",
            EntityKind::Tag => "tag",
            EntityKind::Variable => "variable",
            EntityKind::Trigger => "trigger",
            EntityKind::BuiltInVariable => "built_in_variable",
        }
    }

    /// Name of the field carrying the entity's own identifier, if it has one.
    /// Built-in variables are identified by their `type` alone.
    pub const fn id_field(&self) -> Option<&'static str> {
        match self {
            EntityKind::Account => Some("accountId"),
            EntityKind::Container => Some("containerId"),
            EntityKind::Tag => Some("tagId"),
            EntityKind::Variable => Some("variableId"),
            EntityKind::Trigger => Some("triggerId"),
            EntityKind::BuiltInVariable => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw entity lacks something the flattener will not default.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaViolation {
    #[error("{kind} {} is missing required field `{field}`", .id.as_deref().unwrap_or("<unknown>"))]
    MissingField {
        kind: EntityKind,
        id: Option<String>,
        field: &'static str,
    },

    #[error("{kind} entry is not a JSON object")]
    NotAnObject { kind: EntityKind },
}
