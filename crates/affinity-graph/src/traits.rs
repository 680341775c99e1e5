use affinity_types::{AttributeValue, Attributes, EntityKind, ObjectId};

use crate::error::StoreResult;
use crate::scope::OwnerScope;

/// Raw attribute storage supplied by the persistence collaborator.
///
/// Every method takes an [`OwnerScope`], which only the affinity core can
/// construct once it has established that the call runs on the context's
/// owning thread. Implementations therefore never see calls from any other
/// thread and need no synchronization of their own beyond what `Sync`
/// requires.
///
/// - Slots hold raw values; the core performs schema checks before writing.
/// - A missing attribute on an existing record reads as `Null`.
/// - Errors are propagated to the caller of the originating operation.
pub trait AttributeStore: Send + Sync {
    /// Create the record for a newly created object.
    fn insert_record(
        &self,
        scope: &OwnerScope<'_>,
        id: ObjectId,
        kind: &EntityKind,
        attributes: Attributes,
    ) -> StoreResult<()>;

    /// Read one attribute slot.
    fn raw_get(&self, scope: &OwnerScope<'_>, id: ObjectId, attribute: &str)
        -> StoreResult<AttributeValue>;

    /// Write one attribute slot.
    fn raw_set(
        &self,
        scope: &OwnerScope<'_>,
        id: ObjectId,
        attribute: &str,
        value: AttributeValue,
    ) -> StoreResult<()>;

    /// Release a record. Returns `true` if it existed.
    fn remove_record(&self, scope: &OwnerScope<'_>, id: ObjectId) -> StoreResult<bool>;

    /// The entity kind of a stored record, if it exists.
    fn record_kind(&self, scope: &OwnerScope<'_>, id: ObjectId) -> StoreResult<Option<EntityKind>>;

    /// IDs of every stored record of `kind`, in ID order.
    fn records_of_kind(&self, scope: &OwnerScope<'_>, kind: &EntityKind) -> StoreResult<Vec<ObjectId>>;

    /// Persist pending changes. Returns the number of records written.
    ///
    /// Default implementation has nothing to flush.
    fn save(&self, _scope: &OwnerScope<'_>) -> StoreResult<usize> {
        Ok(0)
    }
}
