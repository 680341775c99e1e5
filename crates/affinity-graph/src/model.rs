//! Entity registration.
//!
//! A [`Model`] is built once and shared by every context that uses it. Each
//! entity kind contributes a schema; registering it generates the kind's
//! [`AccessorTable`], which custom and derived accessors then amend.

use std::collections::HashMap;
use std::sync::Arc;

use affinity_types::{AttributeValue, EntityKind, EntitySchema, ObjectId};
use tracing::debug;

use crate::accessor::{self, AccessorTable};
use crate::error::{GraphError, GraphResult};
use crate::scope::OwnerScope;

/// Schema plus generated accessors for one entity kind.
#[derive(Debug)]
pub struct EntityDescriptor {
    schema: EntitySchema,
    accessors: AccessorTable,
}

impl EntityDescriptor {
    pub fn kind(&self) -> &EntityKind {
        &self.schema.kind
    }

    pub fn schema(&self) -> &EntitySchema {
        &self.schema
    }

    pub fn accessors(&self) -> &AccessorTable {
        &self.accessors
    }
}

/// Registered entity kinds.
#[derive(Debug, Default)]
pub struct Model {
    entities: HashMap<EntityKind, Arc<EntityDescriptor>>,
}

impl Model {
    pub fn builder() -> ModelBuilder {
        ModelBuilder::default()
    }

    /// Look up the descriptor for `kind`.
    pub fn descriptor(&self, kind: &EntityKind) -> GraphResult<Arc<EntityDescriptor>> {
        self.entities
            .get(kind)
            .cloned()
            .ok_or_else(|| GraphError::UnknownEntity(kind.clone()))
    }

    /// Registered kinds, sorted by name.
    pub fn kinds(&self) -> Vec<EntityKind> {
        let mut kinds: Vec<_> = self.entities.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

/// Builder for [`Model`].
///
/// Registration errors are collected and reported by [`ModelBuilder::build`]
/// so the chain stays fluent.
#[derive(Default)]
pub struct ModelBuilder {
    tables: HashMap<EntityKind, (EntitySchema, AccessorTable)>,
    error: Option<GraphError>,
}

impl ModelBuilder {
    /// Register an entity kind and generate its accessor table.
    pub fn entity(mut self, schema: EntitySchema) -> Self {
        if self.error.is_some() {
            return self;
        }
        if let Err(err) = schema.validate() {
            self.error = Some(err.into());
            return self;
        }
        if self.tables.contains_key(&schema.kind) {
            self.error = Some(GraphError::DuplicateEntity(schema.kind.clone()));
            return self;
        }
        let table = AccessorTable::generate(&schema);
        debug!(kind = %schema.kind, attributes = schema.attributes.len(), "registered entity");
        self.tables.insert(schema.kind.clone(), (schema, table));
        self
    }

    /// Replace the getter of a schema attribute.
    pub fn custom_getter<F>(self, kind: impl Into<EntityKind>, attribute: &str, f: F) -> Self
    where
        F: Fn(&OwnerScope<'_>, ObjectId) -> GraphResult<AttributeValue> + Send + Sync + 'static,
    {
        let getter = accessor::getter(f);
        self.amend(kind.into(), |table| table.replace_getter(attribute, getter))
    }

    /// Replace the setter of a schema attribute. Values are kind-checked
    /// before the custom setter runs.
    pub fn custom_setter<F>(self, kind: impl Into<EntityKind>, attribute: &str, f: F) -> Self
    where
        F: Fn(&OwnerScope<'_>, ObjectId, AttributeValue) -> GraphResult<()> + Send + Sync + 'static,
    {
        let setter = accessor::setter(f);
        self.amend(kind.into(), |table| table.replace_setter(attribute, setter))
    }

    /// Add a read-only computed attribute.
    pub fn derived<F>(self, kind: impl Into<EntityKind>, attribute: &str, f: F) -> Self
    where
        F: Fn(&OwnerScope<'_>, ObjectId) -> GraphResult<AttributeValue> + Send + Sync + 'static,
    {
        let getter = accessor::getter(f);
        self.amend(kind.into(), |table| table.add_derived(attribute, getter))
    }

    fn amend(
        mut self,
        kind: EntityKind,
        change: impl FnOnce(&mut AccessorTable) -> GraphResult<()>,
    ) -> Self {
        if self.error.is_some() {
            return self;
        }
        let outcome = match self.tables.get_mut(&kind) {
            Some((_, table)) => change(table),
            None => Err(GraphError::UnknownEntity(kind)),
        };
        if let Err(err) = outcome {
            self.error = Some(err);
        }
        self
    }

    /// Finish registration.
    pub fn build(self) -> GraphResult<Model> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let entities = self
            .tables
            .into_iter()
            .map(|(kind, (schema, accessors))| {
                (kind, Arc::new(EntityDescriptor { schema, accessors }))
            })
            .collect();
        Ok(Model { entities })
    }
}
