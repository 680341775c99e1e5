use std::marker::PhantomData;
use std::sync::Arc;

use affinity_runtime::AffinityToken;
use affinity_types::{AttributeValue, ObjectId};

use crate::context::{ContextId, ContextInner};
use crate::error::GraphResult;
use crate::model::EntityDescriptor;
use crate::object::ThreadAffineObject;
use crate::traits::AttributeStore;

/// Proof that the current code runs on a context's owning thread.
///
/// The core hands an `OwnerScope` to work it executes after the ownership
/// check (inline on the owner, or marshalled there). It cannot be built
/// outside this crate, so storage slots and accessor-table callbacks are
/// unreachable from any other thread.
///
/// A scope is neither `Send` nor `Sync`, so it cannot leave the owning
/// thread even inside work that spawns scoped threads:
///
/// ```compile_fail
/// fn requires_sync<T: Sync>() {}
/// requires_sync::<affinity_graph::OwnerScope<'static>>();
/// ```
///
/// ```compile_fail
/// fn requires_send<T: Send>() {}
/// requires_send::<affinity_graph::OwnerScope<'static>>();
/// ```
pub struct OwnerScope<'a> {
    context: &'a Arc<ContextInner>,
    owner: AffinityToken,
    _not_send: PhantomData<*const ()>,
}

impl<'a> OwnerScope<'a> {
    pub(crate) fn new(context: &'a Arc<ContextInner>, owner: AffinityToken) -> Self {
        Self {
            context,
            owner,
            _not_send: PhantomData,
        }
    }

    /// The owning thread's token.
    pub fn owner(&self) -> &AffinityToken {
        &self.owner
    }

    /// The context this scope grants access to.
    pub fn context_id(&self) -> ContextId {
        self.context.id()
    }

    /// Read a slot directly, bypassing the accessor table.
    pub fn raw_get(&self, id: ObjectId, attribute: &str) -> GraphResult<AttributeValue> {
        self.check_thread(id)?;
        Ok(self.context.store().raw_get(self, id, attribute)?)
    }

    /// Write a slot directly, bypassing the accessor table and schema checks.
    pub fn raw_set(&self, id: ObjectId, attribute: &str, value: AttributeValue) -> GraphResult<()> {
        self.check_thread(id)?;
        Ok(self.context.store().raw_set(self, id, attribute, value)?)
    }

    /// Read an attribute of `object` through its accessor table.
    pub fn get(&self, object: &ThreadAffineObject, attribute: &str) -> GraphResult<AttributeValue> {
        object.read_on_owner(self, attribute)
    }

    /// Write an attribute of `object` through its accessor table.
    pub fn set(
        &self,
        object: &ThreadAffineObject,
        attribute: &str,
        value: AttributeValue,
    ) -> GraphResult<()> {
        object.write_on_owner(self, attribute, value)
    }

    pub(crate) fn context(&self) -> &'a Arc<ContextInner> {
        self.context
    }

    pub(crate) fn store(&self) -> &dyn AttributeStore {
        self.context.store()
    }

    pub(crate) fn register(&self, id: ObjectId, descriptor: Arc<EntityDescriptor>) -> ThreadAffineObject {
        self.context.register(id, descriptor, self.owner.clone())
    }

    fn check_thread(&self, id: ObjectId) -> GraphResult<()> {
        let here = AffinityToken::capture();
        if here == self.owner {
            return Ok(());
        }
        Err(self.context.invariant_fault(format!(
            "slot of {} touched on {here} under a scope owned by {}",
            id.short_id(),
            self.owner
        )))
    }
}

impl std::fmt::Debug for OwnerScope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnerScope")
            .field("context", &self.context.id())
            .field("owner", &self.owner)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use affinity_runtime::HomeThread;
    use affinity_types::{AttributeDef, Attributes, EntitySchema, ValueKind};

    use crate::{InMemoryAttributeStore, Model, ThreadAffineContext};

    fn context() -> ThreadAffineContext {
        let model = Model::builder()
            .entity(EntitySchema::new("Note").with_attribute(AttributeDef::required("text", ValueKind::Text)))
            .build()
            .unwrap();
        ThreadAffineContext::new(Arc::new(model), Arc::new(InMemoryAttributeStore::new()))
    }

    fn note(ctx: &ThreadAffineContext) -> ObjectId {
        let mut attrs = Attributes::new();
        attrs.insert("text".to_string(), "hello".into());
        ctx.create("Note", attrs).unwrap().id()
    }

    #[test]
    fn scope_on_its_owner_reaches_slots() {
        let ctx = context();
        let id = note(&ctx);
        let scope = OwnerScope::new(ctx.inner(), AffinityToken::capture());
        scope.raw_set(id, "text", "edited".into()).unwrap();
        assert_eq!(scope.raw_get(id, "text").unwrap(), AttributeValue::from("edited"));
        assert_eq!(ctx.diagnostics().invariant_faults, 0);
    }

    #[test]
    fn scope_used_off_its_owner_is_refused() {
        let ctx = context();
        let id = note(&ctx);
        let elsewhere = HomeThread::spawn("elsewhere").unwrap();
        let scope = OwnerScope::new(ctx.inner(), elsewhere.token().clone());

        let err = scope.raw_set(id, "text", "foreign".into()).unwrap_err();
        assert!(err.to_string().contains("touched on"));
        assert!(scope.raw_get(id, "text").is_err());

        let diagnostics = ctx.diagnostics();
        assert_eq!(diagnostics.invariant_faults, 2);
        drop(scope);
        assert_eq!(ctx.perform(move |scope| scope.raw_get(id, "text")).unwrap(), AttributeValue::from("hello"));
    }
}
