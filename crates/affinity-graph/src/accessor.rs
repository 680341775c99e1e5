//! Schema-driven accessor tables.
//!
//! Each registered entity kind gets one table mapping attribute name to a
//! getter/setter pair. Tables are generated once from the schema; custom
//! and derived accessors replace or extend entries at registration time.
//! Every entry is invoked only through an [`OwnerScope`], so the ownership
//! check wraps the whole table.

use std::collections::BTreeMap;
use std::sync::Arc;

use affinity_types::{AttributeValue, EntityKind, EntitySchema, ObjectId, TypeError};

use crate::error::{GraphError, GraphResult};
use crate::scope::OwnerScope;

/// Reads one attribute of an object on the owning thread.
pub type Getter = Arc<dyn Fn(&OwnerScope<'_>, ObjectId) -> GraphResult<AttributeValue> + Send + Sync>;

/// Writes one attribute of an object on the owning thread.
pub type Setter =
    Arc<dyn Fn(&OwnerScope<'_>, ObjectId, AttributeValue) -> GraphResult<()> + Send + Sync>;

/// Wrap a closure as a [`Getter`].
pub(crate) fn getter<F>(f: F) -> Getter
where
    F: Fn(&OwnerScope<'_>, ObjectId) -> GraphResult<AttributeValue> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap a closure as a [`Setter`].
pub(crate) fn setter<F>(f: F) -> Setter
where
    F: Fn(&OwnerScope<'_>, ObjectId, AttributeValue) -> GraphResult<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Getter/setter pair for one attribute.
#[derive(Clone)]
pub struct Accessor {
    getter: Getter,
    setter: Option<Setter>,
    /// Backed by a schema slot (as opposed to derived).
    stored: bool,
}

impl Accessor {
    /// Plain slot access for a schema attribute.
    fn stored(name: &str) -> Self {
        let get_name = name.to_string();
        let set_name = name.to_string();
        Self {
            getter: getter(move |scope, id| scope.raw_get(id, &get_name)),
            setter: Some(setter(move |scope, id, value| scope.raw_set(id, &set_name, value))),
            stored: true,
        }
    }

    /// Whether this attribute is backed by a storage slot.
    pub fn is_stored(&self) -> bool {
        self.stored
    }

    /// Whether this attribute can be written.
    pub fn is_writable(&self) -> bool {
        self.setter.is_some()
    }
}

impl std::fmt::Debug for Accessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accessor")
            .field("stored", &self.stored)
            .field("writable", &self.is_writable())
            .finish()
    }
}

/// Attribute name to [`Accessor`] map for one entity kind.
#[derive(Clone, Debug)]
pub struct AccessorTable {
    schema: EntitySchema,
    entries: BTreeMap<String, Accessor>,
}

impl AccessorTable {
    /// Generate plain slot accessors for every attribute in `schema`.
    pub fn generate(schema: &EntitySchema) -> Self {
        let entries = schema
            .attribute_names()
            .map(|name| (name.to_string(), Accessor::stored(name)))
            .collect();
        Self {
            schema: schema.clone(),
            entries,
        }
    }

    /// The entity kind this table serves.
    pub fn kind(&self) -> &EntityKind {
        &self.schema.kind
    }

    /// Attribute names in the table, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Look up the accessor for `attribute`.
    pub fn entry(&self, attribute: &str) -> GraphResult<&Accessor> {
        self.entries.get(attribute).ok_or_else(|| {
            TypeError::UnknownAttribute {
                kind: self.schema.kind.to_string(),
                attribute: attribute.to_string(),
            }
            .into()
        })
    }

    /// Read through the table.
    pub fn read(&self, scope: &OwnerScope<'_>, id: ObjectId, attribute: &str) -> GraphResult<AttributeValue> {
        (self.entry(attribute)?.getter)(scope, id)
    }

    /// Write through the table. Stored attributes are kind-checked against
    /// the schema before the setter runs.
    pub fn write(
        &self,
        scope: &OwnerScope<'_>,
        id: ObjectId,
        attribute: &str,
        value: AttributeValue,
    ) -> GraphResult<()> {
        let accessor = self.entry(attribute)?;
        let setter = accessor.setter.as_ref().ok_or_else(|| GraphError::ReadOnlyAttribute {
            kind: self.schema.kind.clone(),
            attribute: attribute.to_string(),
        })?;
        if accessor.stored {
            self.schema.check_value(attribute, &value)?;
        }
        setter(scope, id, value)
    }

    pub(crate) fn replace_getter(&mut self, attribute: &str, getter: Getter) -> GraphResult<()> {
        self.entry(attribute)?;
        if let Some(accessor) = self.entries.get_mut(attribute) {
            accessor.getter = getter;
        }
        Ok(())
    }

    pub(crate) fn replace_setter(&mut self, attribute: &str, setter: Setter) -> GraphResult<()> {
        self.entry(attribute)?;
        if let Some(accessor) = self.entries.get_mut(attribute) {
            accessor.setter = Some(setter);
        }
        Ok(())
    }

    /// Add a computed attribute. It is read-only until a setter is attached.
    pub(crate) fn add_derived(&mut self, attribute: &str, getter: Getter) -> GraphResult<()> {
        if self.entries.contains_key(attribute) {
            return Err(TypeError::DuplicateAttribute {
                attribute: attribute.to_string(),
            }
            .into());
        }
        self.entries.insert(
            attribute.to_string(),
            Accessor {
                getter,
                setter: None,
                stored: false,
            },
        );
        Ok(())
    }
}
