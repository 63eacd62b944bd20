//! Record normalization for tag-manager configuration entities.
//!
//! The remote API returns deeply nested objects where almost every field is
//! optional. The warehouse schema on the other side expects every column of a
//! row to be present. This crate sits between the two:
//!
//! - [`Parameter`] and [`Filter`] turn loose parameter and condition objects
//!   into fully populated records.
//! - [`TagRecord`], [`VariableRecord`], [`TriggerRecord`] and the pass-through
//!   records flatten one raw entity each, failing with a [`SchemaViolation`]
//!   when an identifying field is missing.
//! - [`extract`] collects the raw entities of every kind out of a list of
//!   container versions.
//!
//! Everything in here is pure; no function performs I/O or keeps state.

mod error;
mod extract;
mod fields;
mod filter;
mod parameter;
mod records;

pub use error::{EntityKind, SchemaViolation};
pub use fields::scalar_string;
pub use extract::{ExtractedEntities, extract};
pub use filter::{Filter, normalize_filters};
pub use parameter::{BareParameter, Parameter, normalize_parameters};
pub use records::{
    AccountRecord, BuiltInVariableRecord, ContainerRecord, FromRaw, NormalizedEntities,
    TagRecord, TriggerParameters, TriggerRecord, VariableRecord, flatten_all,
};
