use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use affinity_types::{AttributeValue, Attributes, EntityKind, ObjectId};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::scope::OwnerScope;
use crate::traits::AttributeStore;

#[derive(Clone, Debug)]
struct Record {
    kind: EntityKind,
    attributes: Attributes,
    dirty: bool,
}

#[derive(Debug, Default)]
struct StoreState {
    /// Working copy seen by the owning context.
    records: HashMap<ObjectId, Record>,
    /// Last saved copy.
    committed: HashMap<ObjectId, (EntityKind, Attributes)>,
    /// Records released since the last save.
    deleted: BTreeSet<ObjectId>,
}

/// In-memory, HashMap-based attribute store.
///
/// Intended for tests and embedding. Records live behind a `RwLock`; writes
/// mark a record dirty and [`AttributeStore::save`] copies dirty records
/// into a committed set, so saving has an observable effect.
pub struct InMemoryAttributeStore {
    state: RwLock<StoreState>,
}

impl InMemoryAttributeStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
        }
    }

    /// Preload a committed record, as a storage layer does on open.
    pub fn seed(&self, kind: impl Into<EntityKind>, attributes: Attributes) -> ObjectId {
        let id = ObjectId::new();
        let kind = kind.into();
        let mut state = self.state.write().expect("lock poisoned");
        state
            .committed
            .insert(id, (kind.clone(), attributes.clone()));
        state.records.insert(
            id,
            Record {
                kind,
                attributes,
                dirty: false,
            },
        );
        id
    }

    /// The last saved attributes of a record.
    pub fn committed(&self, id: ObjectId) -> Option<Attributes> {
        let state = self.state.read().expect("lock poisoned");
        state.committed.get(&id).map(|(_, attrs)| attrs.clone())
    }

    /// Number of records in the working copy.
    pub fn len(&self) -> usize {
        self.state.read().expect("lock poisoned").records.len()
    }

    /// Returns `true` if the working copy is empty.
    pub fn is_empty(&self) -> bool {
        self.state.read().expect("lock poisoned").records.is_empty()
    }

    /// Number of records with unsaved changes.
    pub fn dirty_count(&self) -> usize {
        let state = self.state.read().expect("lock poisoned");
        state.records.values().filter(|r| r.dirty).count() + state.deleted.len()
    }
}

impl Default for InMemoryAttributeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AttributeStore for InMemoryAttributeStore {
    fn insert_record(
        &self,
        _scope: &OwnerScope<'_>,
        id: ObjectId,
        kind: &EntityKind,
        attributes: Attributes,
    ) -> StoreResult<()> {
        let mut state = self.state.write().expect("lock poisoned");
        if state.records.contains_key(&id) {
            return Err(StoreError::DuplicateRecord(id));
        }
        state.deleted.remove(&id);
        state.records.insert(
            id,
            Record {
                kind: kind.clone(),
                attributes,
                dirty: true,
            },
        );
        Ok(())
    }

    fn raw_get(
        &self,
        _scope: &OwnerScope<'_>,
        id: ObjectId,
        attribute: &str,
    ) -> StoreResult<AttributeValue> {
        let state = self.state.read().expect("lock poisoned");
        let record = state.records.get(&id).ok_or(StoreError::RecordNotFound(id))?;
        Ok(record.attributes.get(attribute).cloned().unwrap_or_default())
    }

    fn raw_set(
        &self,
        _scope: &OwnerScope<'_>,
        id: ObjectId,
        attribute: &str,
        value: AttributeValue,
    ) -> StoreResult<()> {
        let mut state = self.state.write().expect("lock poisoned");
        let record = state
            .records
            .get_mut(&id)
            .ok_or(StoreError::RecordNotFound(id))?;
        record.attributes.insert(attribute.to_string(), value);
        record.dirty = true;
        Ok(())
    }

    fn remove_record(&self, _scope: &OwnerScope<'_>, id: ObjectId) -> StoreResult<bool> {
        let mut state = self.state.write().expect("lock poisoned");
        let existed = state.records.remove(&id).is_some();
        if existed {
            state.deleted.insert(id);
        }
        Ok(existed)
    }

    fn record_kind(&self, _scope: &OwnerScope<'_>, id: ObjectId) -> StoreResult<Option<EntityKind>> {
        let state = self.state.read().expect("lock poisoned");
        Ok(state.records.get(&id).map(|r| r.kind.clone()))
    }

    fn records_of_kind(
        &self,
        _scope: &OwnerScope<'_>,
        kind: &EntityKind,
    ) -> StoreResult<Vec<ObjectId>> {
        let state = self.state.read().expect("lock poisoned");
        let mut ids: Vec<ObjectId> = state
            .records
            .iter()
            .filter(|(_, r)| &r.kind == kind)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn save(&self, _scope: &OwnerScope<'_>) -> StoreResult<usize> {
        let mut guard = self.state.write().expect("lock poisoned");
        let state = &mut *guard;
        let mut written = 0;
        for (id, record) in state.records.iter_mut().filter(|(_, r)| r.dirty) {
            state
                .committed
                .insert(*id, (record.kind.clone(), record.attributes.clone()));
            record.dirty = false;
            written += 1;
        }
        for id in std::mem::take(&mut state.deleted) {
            if state.committed.remove(&id).is_some() {
                written += 1;
            }
        }
        debug!(written, "saved in-memory store");
        Ok(written)
    }
}
