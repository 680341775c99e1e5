use std::sync::{Arc, RwLock, Weak};

use affinity_runtime::AffinityToken;
use affinity_types::{AttributeValue, Attributes, EntityKind, ObjectId};

use crate::context::{ContextInner, ThreadAffineContext};
use crate::error::{GraphError, GraphResult};
use crate::model::EntityDescriptor;
use crate::scope::OwnerScope;

/// Registry entry shared by every handle to one object.
pub(crate) struct ObjectCell {
    id: ObjectId,
    descriptor: Arc<EntityDescriptor>,
    /// Token of the owning context, as of the last stamp.
    stamp: RwLock<AffinityToken>,
}

impl ObjectCell {
    pub(crate) fn new(id: ObjectId, descriptor: Arc<EntityDescriptor>, owner: AffinityToken) -> Self {
        Self {
            id,
            descriptor,
            stamp: RwLock::new(owner),
        }
    }

    pub(crate) fn id(&self) -> ObjectId {
        self.id
    }

    pub(crate) fn stamp(&self) -> AffinityToken {
        self.stamp.read().expect("lock poisoned").clone()
    }

    pub(crate) fn restamp(&self, owner: &AffinityToken) {
        *self.stamp.write().expect("lock poisoned") = owner.clone();
    }
}

/// Handle to one entity instance in a [`ThreadAffineContext`].
///
/// Handles are cheap to clone and may be sent to any thread. Every attribute
/// access checks whether the caller owns the context; if not, the access is
/// marshalled onto the owner and the caller blocks until it completes.
#[derive(Clone)]
pub struct ThreadAffineObject {
    cell: Arc<ObjectCell>,
    context: Weak<ContextInner>,
}

impl ThreadAffineObject {
    pub(crate) fn new(cell: Arc<ObjectCell>, context: &Arc<ContextInner>) -> Self {
        Self {
            cell,
            context: Arc::downgrade(context),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.cell.id
    }

    pub fn kind(&self) -> &EntityKind {
        self.cell.descriptor.kind()
    }

    /// The token this object was last stamped with.
    pub fn affinity_token(&self) -> AffinityToken {
        self.cell.stamp()
    }

    /// The owning context.
    pub fn context(&self) -> GraphResult<ThreadAffineContext> {
        self.upgrade().map(ThreadAffineContext::from_inner)
    }

    /// Read an attribute.
    pub fn get(&self, attribute: &str) -> GraphResult<AttributeValue> {
        let object = self.clone();
        let attribute = attribute.to_string();
        self.upgrade()?
            .dispatch(move |scope| object.read_on_owner(scope, &attribute))
    }

    /// Write an attribute. Returns once the write has been applied.
    pub fn set(&self, attribute: &str, value: impl Into<AttributeValue>) -> GraphResult<()> {
        let object = self.clone();
        let attribute = attribute.to_string();
        let value = value.into();
        self.upgrade()?
            .dispatch(move |scope| object.write_on_owner(scope, &attribute, value))
    }

    /// Read every schema attribute in one unit of work.
    pub fn snapshot(&self) -> GraphResult<Attributes> {
        let object = self.clone();
        self.upgrade()?.dispatch(move |scope| {
            object.check_member(scope)?;
            let descriptor = &object.cell.descriptor;
            descriptor
                .schema()
                .attribute_names()
                .map(|name| -> GraphResult<(String, AttributeValue)> {
                    let value = descriptor.accessors().read(scope, object.id(), name)?;
                    Ok((name.to_string(), value))
                })
                .collect::<GraphResult<Attributes>>()
        })
    }

    /// Run `f` on the owning thread with raw access to this object.
    ///
    /// This is the check-and-marshal primitive for attribute logic that does
    /// not fit the accessor table.
    pub fn with_owner<R, F>(&self, f: F) -> GraphResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&OwnerScope<'_>, ObjectId) -> GraphResult<R> + Send + 'static,
    {
        let object = self.clone();
        self.upgrade()?.dispatch(move |scope| {
            object.check_member(scope)?;
            f(scope, object.id())
        })
    }

    pub(crate) fn read_on_owner(&self, scope: &OwnerScope<'_>, attribute: &str) -> GraphResult<AttributeValue> {
        self.check_member(scope)?;
        self.cell.descriptor.accessors().read(scope, self.id(), attribute)
    }

    pub(crate) fn write_on_owner(
        &self,
        scope: &OwnerScope<'_>,
        attribute: &str,
        value: AttributeValue,
    ) -> GraphResult<()> {
        self.check_member(scope)?;
        self.cell
            .descriptor
            .accessors()
            .write(scope, self.id(), attribute, value)
    }

    pub(crate) fn cell(&self) -> &Arc<ObjectCell> {
        &self.cell
    }

    pub(crate) fn belongs_to(&self, context: &Arc<ContextInner>) -> bool {
        std::ptr::eq(self.context.as_ptr(), Arc::as_ptr(context))
    }

    fn upgrade(&self) -> GraphResult<Arc<ContextInner>> {
        self.context.upgrade().ok_or(GraphError::ContextReleased)
    }

    /// The object must be registered with the scope's context and stamped
    /// with its owner.
    fn check_member(&self, scope: &OwnerScope<'_>) -> GraphResult<()> {
        let context = scope.context();
        if !self.belongs_to(context) || !context.is_registered(&self.cell) {
            return Err(GraphError::ObjectNotRegistered(self.id()));
        }
        let stamp = self.cell.stamp();
        if stamp != *scope.owner() {
            return Err(context.invariant_fault(format!(
                "object {} is stamped {} but {} owns {}",
                self.id().short_id(),
                stamp,
                scope.owner(),
                context.id(),
            )));
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn tamper_stamp(&self, token: &AffinityToken) {
        self.cell.restamp(token);
    }
}

impl std::fmt::Debug for ThreadAffineObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadAffineObject")
            .field("id", &self.cell.id)
            .field("kind", self.kind())
            .field("stamp", &self.affinity_token())
            .finish()
    }
}
