//! Foundation types for thread-affine object graphs.
//!
//! This crate holds the plain data that flows through the affinity core:
//! object identifiers, attribute values, and the entity schemas from which
//! accessor tables are generated. Nothing here knows about threads; every
//! other affinity crate depends on `affinity-types`.
//!
//! # Key Types
//!
//! - [`ObjectId`]: UUID v7 identifier for an entity instance
//! - [`EntityKind`]: name of an entity type (e.g. `"Widget"`)
//! - [`AttributeValue`]: raw value stored in an attribute slot
//! - [`ValueKind`]: declared kind of an attribute
//! - [`EntitySchema`]: ordered attribute definitions for one entity kind

pub mod error;
pub mod object;
pub mod schema;
pub mod value;

pub use error::TypeError;
pub use object::{EntityKind, ObjectId};
pub use schema::{AttributeDef, EntitySchema};
pub use value::{AttributeValue, Attributes, ValueKind};
