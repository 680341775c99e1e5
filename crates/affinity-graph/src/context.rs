use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use affinity_runtime::{
    marshal, AffinityConfig, AffinityError, AffinityToken, HandOffClaim, MarshalCounters,
    MarshalStats, MigrationGate,
};
use affinity_types::{Attributes, EntityKind, ObjectId};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{GraphError, GraphResult, StoreError};
use crate::model::{EntityDescriptor, Model};
use crate::object::{ObjectCell, ThreadAffineObject};
use crate::scope::OwnerScope;
use crate::traits::AttributeStore;

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// (context, identity) pairs the calling thread is currently inside,
    /// either running as owner or blocked as a caller holding a gate pass.
    static ENGAGED: RefCell<Vec<(ContextId, u64)>> = const { RefCell::new(Vec::new()) };
}

struct Engaged;

impl Engaged {
    fn enter(context: ContextId, identity: &AffinityToken) -> Self {
        ENGAGED.with(|stack| stack.borrow_mut().push((context, identity.serial())));
        Engaged
    }

    fn contains(context: ContextId, identity: &AffinityToken) -> bool {
        let key = (context, identity.serial());
        ENGAGED.with(|stack| stack.borrow().contains(&key))
    }
}

impl Drop for Engaged {
    fn drop(&mut self) {
        ENGAGED.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Process-unique identifier of a context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ContextId(u64);

impl ContextId {
    fn next() -> Self {
        Self(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Fault and migration history of one context.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ContextDiagnostics {
    /// Ownership invariant violations detected so far.
    pub invariant_faults: u64,
    /// Description of the most recent violation.
    pub last_fault: Option<String>,
    /// Completed ownership migrations.
    pub migrations: u64,
}

pub(crate) struct ContextInner {
    id: ContextId,
    owner: RwLock<AffinityToken>,
    gate: MigrationGate,
    registry: RwLock<HashMap<ObjectId, Arc<ObjectCell>>>,
    model: Arc<Model>,
    store: Arc<dyn AttributeStore>,
    config: AffinityConfig,
    stats: MarshalStats,
    faults: AtomicU64,
    last_fault: Mutex<Option<String>>,
    migrations: AtomicU64,
}

impl ContextInner {
    pub(crate) fn id(&self) -> ContextId {
        self.id
    }

    pub(crate) fn store(&self) -> &dyn AttributeStore {
        self.store.as_ref()
    }

    pub(crate) fn current_owner(&self) -> AffinityToken {
        self.owner.read().expect("lock poisoned").clone()
    }

    /// Register `id`, stamped with `owner`. An already registered object
    /// keeps its cell, so every handle to it stays valid.
    pub(crate) fn register(
        self: &Arc<Self>,
        id: ObjectId,
        descriptor: Arc<EntityDescriptor>,
        owner: AffinityToken,
    ) -> ThreadAffineObject {
        let cell = {
            let mut registry = self.registry.write().expect("lock poisoned");
            Arc::clone(
                registry
                    .entry(id)
                    .or_insert_with(|| Arc::new(ObjectCell::new(id, descriptor, owner))),
            )
        };
        ThreadAffineObject::new(cell, self)
    }

    pub(crate) fn is_registered(&self, cell: &Arc<ObjectCell>) -> bool {
        let registry = self.registry.read().expect("lock poisoned");
        registry
            .get(&cell.id())
            .is_some_and(|existing| Arc::ptr_eq(existing, cell))
    }

    fn unregister(&self, cell: &Arc<ObjectCell>) -> bool {
        let mut registry = self.registry.write().expect("lock poisoned");
        let id = cell.id();
        match registry.get(&id) {
            Some(existing) if Arc::ptr_eq(existing, cell) => {
                registry.remove(&id);
                true
            }
            _ => false,
        }
    }

    fn handles(self: &Arc<Self>) -> Vec<ThreadAffineObject> {
        let registry = self.registry.read().expect("lock poisoned");
        let mut objects: Vec<_> = registry
            .values()
            .map(|cell| ThreadAffineObject::new(Arc::clone(cell), self))
            .collect();
        objects.sort_by_key(ThreadAffineObject::id);
        objects
    }

    /// Record an ownership invariant violation and build the error for it.
    pub(crate) fn invariant_fault(&self, detail: String) -> GraphError {
        error!(context = %self.id, %detail, "ownership invariant violated");
        self.faults.fetch_add(1, Ordering::Relaxed);
        *self.last_fault.lock().expect("lock poisoned") = Some(detail.clone());
        AffinityError::OwnershipInvariantViolation { detail }.into()
    }

    /// Run `work` on the owning thread and return its result.
    ///
    /// The owner runs it inline. Any other caller first passes the migration
    /// gate, so the owner cannot change while the work is queued, then
    /// marshals it and blocks.
    pub(crate) fn dispatch<R, F>(self: &Arc<Self>, work: F) -> GraphResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&OwnerScope<'_>) -> GraphResult<R> + Send + 'static,
    {
        let caller = AffinityToken::capture();
        let owner = self.current_owner();
        if owner == caller {
            self.stats.record_inline();
            return self.run_as_owner(&owner, work);
        }

        let timeout = self.config.marshal_timeout();
        let deadline = timeout.map(|t| Instant::now() + t);
        // A caller already holding a pass for this context is waiting on the
        // owner; a second pass would deadlock against a pending migration.
        let _pass = if Engaged::contains(self.id, &caller) {
            None
        } else {
            Some(self.gate.enter(timeout).map_err(|err| self.note_failure(err.into()))?)
        };
        let _engaged = Engaged::enter(self.id, &caller);

        let owner = self.current_owner();
        if owner == caller {
            self.stats.record_inline();
            return self.run_as_owner(&owner, work);
        }

        self.stats.record_marshalled();
        debug!(context = %self.id, owner = %owner, caller = %caller, "marshalling to owner");
        let inner = Arc::clone(self);
        let expected = owner.clone();
        // The gate wait and the call share one deadline.
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        marshal(&owner, remaining, move || inner.run_as_owner(&expected, work))
            .map_err(|err| self.note_failure(err))
    }

    fn run_as_owner<R>(
        self: &Arc<Self>,
        expected: &AffinityToken,
        work: impl FnOnce(&OwnerScope<'_>) -> GraphResult<R>,
    ) -> GraphResult<R> {
        let here = AffinityToken::capture();
        let current = self.current_owner();
        if current != *expected || current != here {
            return Err(self.invariant_fault(format!(
                "{} expected owner {expected}, found {current}, running on {here}",
                self.id
            )));
        }
        let _engaged = Engaged::enter(self.id, &current);
        let scope = OwnerScope::new(self, current);
        work(&scope)
    }

    fn note_failure(&self, err: GraphError) -> GraphError {
        if err.is_timeout() {
            self.stats.record_timeout();
        } else if err.is_stale_owner() {
            self.stats.record_stale_owner();
        }
        err
    }

    /// Replace the owner and re-stamp every registered object, unless the
    /// migrator has already given up on `claim`.
    fn hand_over(&self, new_owner: &AffinityToken, claim: &HandOffClaim) -> usize {
        let mut owner = self.owner.write().expect("lock poisoned");
        if !claim.try_commit() {
            debug!(context = %self.id, "hand-over abandoned by its migrator");
            return 0;
        }
        *owner = new_owner.clone();
        let registry = self.registry.read().expect("lock poisoned");
        for cell in registry.values() {
            cell.restamp(new_owner);
        }
        registry.len()
    }

    fn registered_count(&self) -> usize {
        self.registry.read().expect("lock poisoned").len()
    }
}

/// Builder for [`ThreadAffineContext`].
pub struct ContextBuilder {
    model: Arc<Model>,
    store: Arc<dyn AttributeStore>,
    config: AffinityConfig,
    owner: Option<AffinityToken>,
}

impl ContextBuilder {
    pub fn config(mut self, config: AffinityConfig) -> Self {
        self.config = config;
        self
    }

    /// Owning thread. Defaults to the thread calling [`ContextBuilder::build`].
    pub fn owner(mut self, owner: AffinityToken) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn build(self) -> ThreadAffineContext {
        let owner = self.owner.unwrap_or_else(AffinityToken::capture);
        let inner = ContextInner {
            id: ContextId::next(),
            owner: RwLock::new(owner),
            gate: MigrationGate::new(),
            registry: RwLock::new(HashMap::new()),
            model: self.model,
            store: self.store,
            config: self.config,
            stats: MarshalStats::new(),
            faults: AtomicU64::new(0),
            last_fault: Mutex::new(None),
            migrations: AtomicU64::new(0),
        };
        debug!(context = %inner.id, owner = %inner.current_owner(), "context created");
        ThreadAffineContext {
            inner: Arc::new(inner),
        }
    }
}

/// An object graph bound to one owning thread.
///
/// The handle is cheap to clone and may be used from any thread. Operations
/// from the owner run inline; operations from any other thread are
/// marshalled onto the owner and block until they complete.
#[derive(Clone)]
pub struct ThreadAffineContext {
    inner: Arc<ContextInner>,
}

impl ThreadAffineContext {
    /// A context owned by the calling thread, with default configuration.
    pub fn new(model: Arc<Model>, store: Arc<dyn AttributeStore>) -> Self {
        Self::builder(model, store).build()
    }

    pub fn builder(model: Arc<Model>, store: Arc<dyn AttributeStore>) -> ContextBuilder {
        ContextBuilder {
            model,
            store,
            config: AffinityConfig::default(),
            owner: None,
        }
    }

    pub(crate) fn from_inner(inner: Arc<ContextInner>) -> Self {
        Self { inner }
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<ContextInner> {
        &self.inner
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.inner.model
    }

    pub fn config(&self) -> &AffinityConfig {
        &self.inner.config
    }

    /// The owning thread's token. Safe to call from any thread.
    pub fn current_affinity_token(&self) -> AffinityToken {
        self.inner.current_owner()
    }

    pub fn is_owned_by_current_thread(&self) -> bool {
        self.inner.current_owner() == AffinityToken::capture()
    }

    pub fn stats(&self) -> MarshalCounters {
        self.inner.stats.snapshot()
    }

    pub fn diagnostics(&self) -> ContextDiagnostics {
        ContextDiagnostics {
            invariant_faults: self.inner.faults.load(Ordering::Relaxed),
            last_fault: self.inner.last_fault.lock().expect("lock poisoned").clone(),
            migrations: self.inner.migrations.load(Ordering::Relaxed),
        }
    }

    /// Create, stamp and register a new object of `kind`.
    ///
    /// Initial attributes are checked against the schema: unknown names and
    /// kind mismatches are rejected, omitted attributes take their defaults.
    pub fn create(
        &self,
        kind: impl Into<EntityKind>,
        attributes: Attributes,
    ) -> GraphResult<ThreadAffineObject> {
        let descriptor = self.inner.model.descriptor(&kind.into())?;
        self.inner.dispatch(move |scope| {
            let resolved = descriptor.schema().resolve_initial(attributes)?;
            let id = ObjectId::new();
            scope
                .store()
                .insert_record(scope, id, descriptor.kind(), resolved)?;
            debug!(context = %scope.context_id(), object = %id.short_id(), kind = %descriptor.kind(), "object created");
            Ok(scope.register(id, descriptor))
        })
    }

    /// Stamp and register a record the store instantiated or loaded.
    pub fn notify_object_created(
        &self,
        kind: impl Into<EntityKind>,
        id: ObjectId,
    ) -> GraphResult<ThreadAffineObject> {
        let descriptor = self.inner.model.descriptor(&kind.into())?;
        self.inner.dispatch(move |scope| {
            match scope.store().record_kind(scope, id)? {
                Some(stored) if &stored == descriptor.kind() => Ok(scope.register(id, descriptor)),
                _ => Err(StoreError::RecordNotFound(id).into()),
            }
        })
    }

    /// Register and return every stored record of `kind`.
    pub fn fetch(&self, kind: impl Into<EntityKind>) -> GraphResult<Vec<ThreadAffineObject>> {
        let descriptor = self.inner.model.descriptor(&kind.into())?;
        self.inner.dispatch(move |scope| {
            let ids = scope.store().records_of_kind(scope, descriptor.kind())?;
            Ok(ids
                .into_iter()
                .map(|id| scope.register(id, Arc::clone(&descriptor)))
                .collect())
        })
    }

    /// Look up a registered object.
    pub fn object(&self, id: ObjectId) -> GraphResult<Option<ThreadAffineObject>> {
        self.inner.dispatch(move |scope| {
            let context = scope.context();
            let cell = context
                .registry
                .read()
                .expect("lock poisoned")
                .get(&id)
                .cloned();
            Ok(cell.map(|cell| ThreadAffineObject::new(cell, context)))
        })
    }

    /// Every registered object, in ID order.
    pub fn objects(&self) -> GraphResult<Vec<ThreadAffineObject>> {
        self.inner.dispatch(|scope| Ok(scope.context().handles()))
    }

    /// Unregister `object` and release its record. Returns `false` if it was
    /// not registered here.
    pub fn delete(&self, object: &ThreadAffineObject) -> GraphResult<bool> {
        let object = object.clone();
        self.inner.dispatch(move |scope| {
            let context = scope.context();
            if !object.belongs_to(context) || !context.unregister(object.cell()) {
                return Ok(false);
            }
            scope.store().remove_record(scope, object.id())?;
            debug!(context = %context.id(), object = %object.id().short_id(), "object deleted");
            Ok(true)
        })
    }

    /// Commit pending changes through the store.
    pub fn save(&self) -> GraphResult<usize> {
        self.inner.dispatch(|scope| Ok(scope.store().save(scope)?))
    }

    /// Run a bulk operation on the owning thread.
    pub fn perform<R, F>(&self, work: F) -> GraphResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&OwnerScope<'_>) -> GraphResult<R> + Send + 'static,
    {
        self.inner.dispatch(work)
    }

    /// Make the calling thread the owner of this context.
    ///
    /// Waits for in-flight marshalled work to drain, then replaces the token
    /// and re-stamps every object on the old owner thread, behind anything
    /// already queued there. When the old owner thread has gone away the
    /// caller adopts the context directly.
    ///
    /// # Errors
    ///
    /// - [`AffinityError::MigrationInProgress`] if another migration holds
    ///   the gate.
    /// - [`AffinityError::ReentrantMigration`] if the caller is inside an
    ///   operation on this context.
    /// - [`AffinityError::Timeout`] if the drain or the hand-over misses the
    ///   marshal deadline. The context keeps its old owner.
    pub fn migrate_ownership_to_calling_thread(&self) -> GraphResult<AffinityToken> {
        let inner = &self.inner;
        let caller = AffinityToken::capture();
        if inner.current_owner() == caller {
            return Ok(caller);
        }
        if Engaged::contains(inner.id, &caller) {
            return Err(AffinityError::ReentrantMigration.into());
        }

        let timeout = inner.config.marshal_timeout();
        let _permit = inner.gate.begin_migration(timeout)?;
        let previous = inner.current_owner();
        if previous == caller {
            return Ok(caller);
        }

        let claim = Arc::new(HandOffClaim::new());
        let outcome: GraphResult<usize> = if previous.is_alive() {
            let task_inner = Arc::clone(inner);
            let task_claim = Arc::clone(&claim);
            let expected = previous.clone();
            let new_owner = caller.clone();
            marshal(&previous, timeout, move || {
                let here = AffinityToken::capture();
                if here != expected {
                    return Err(task_inner.invariant_fault(format!(
                        "{} hand-over ran on {here}, expected {expected}",
                        task_inner.id
                    )));
                }
                if Engaged::contains(task_inner.id, &here) {
                    return Err(AffinityError::ReentrantMigration.into());
                }
                Ok(task_inner.hand_over(&new_owner, &task_claim))
            })
        } else {
            Err(AffinityError::StaleOwner {
                owner: previous.to_string(),
            }
            .into())
        };

        let restamped = match outcome {
            Ok(count) => count,
            Err(err) if err.is_stale_owner() && !previous.is_alive() => {
                warn!(context = %inner.id, previous = %previous, "owner thread is gone; adopting context");
                inner.hand_over(&caller, &claim)
            }
            Err(err) if err.is_timeout() => {
                if claim.try_abort() {
                    return Err(err);
                }
                // The hand-over committed just as the deadline passed.
                inner.registered_count()
            }
            Err(err) => return Err(err),
        };

        inner.migrations.fetch_add(1, Ordering::Relaxed);
        info!(
            context = %inner.id,
            from = %previous,
            to = %caller,
            restamped,
            "ownership migrated"
        );
        Ok(caller)
    }
}

impl fmt::Debug for ThreadAffineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadAffineContext")
            .field("id", &self.inner.id)
            .field("owner", &self.inner.current_owner())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use affinity_runtime::{HomeThread, RunLoop};
    use affinity_types::{AttributeDef, AttributeValue, EntitySchema, TypeError, ValueKind};

    use crate::InMemoryAttributeStore;

    fn widget_model() -> Arc<Model> {
        let model = Model::builder()
            .entity(
                EntitySchema::new("Widget")
                    .with_attribute(AttributeDef::required("name", ValueKind::Text))
                    .with_attribute(
                        AttributeDef::optional("count", ValueKind::Integer).with_default(0i64),
                    )
                    .with_attribute(AttributeDef::optional("shout", ValueKind::Text)),
            )
            .derived("Widget", "label", |scope, id| {
                let name = scope.raw_get(id, "name")?;
                Ok(format!("widget:{}", name.as_text().unwrap_or("?")).into())
            })
            .custom_setter("Widget", "shout", |scope, id, value| {
                let upper = match value.as_text() {
                    Some(text) => AttributeValue::from(text.to_uppercase()),
                    None => value.clone(),
                };
                scope.raw_set(id, "shout", upper)
            })
            .build()
            .unwrap();
        Arc::new(model)
    }

    fn named(name: &str) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("name".to_string(), name.into());
        attrs
    }

    fn context_on(home: &HomeThread, config: AffinityConfig) -> ThreadAffineContext {
        ThreadAffineContext::builder(widget_model(), Arc::new(InMemoryAttributeStore::new()))
            .config(config)
            .owner(home.token().clone())
            .build()
    }

    fn local_context() -> ThreadAffineContext {
        ThreadAffineContext::new(widget_model(), Arc::new(InMemoryAttributeStore::new()))
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Queue a unit of work on `home` that blocks until the returned sender
    /// is used or dropped.
    fn stall(home: &HomeThread) -> (mpsc::Sender<()>, thread::JoinHandle<()>) {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let token = home.token().clone();
        let handle = thread::spawn(move || {
            marshal::<_, AffinityError, _>(&token, None, move || {
                let _ = started_tx.send(());
                let _ = release_rx.recv();
                Ok(())
            })
            .unwrap();
        });
        started_rx.recv().unwrap();
        (release_tx, handle)
    }

    // -----------------------------------------------------------------------
    // Cross-thread access
    // -----------------------------------------------------------------------

    #[test]
    fn scenario_across_owner_and_worker() {
        let home = HomeThread::spawn("owner-a").unwrap();
        let ctx = home
            .invoke(|| {
                Ok::<_, GraphError>(ThreadAffineContext::new(
                    widget_model(),
                    Arc::new(InMemoryAttributeStore::new()),
                ))
            })
            .unwrap();
        assert_eq!(ctx.current_affinity_token(), *home.token());

        let object = ctx.create("Widget", named("x")).unwrap();
        assert_eq!(object.affinity_token(), *home.token());

        let worker_object = object.clone();
        let seen = thread::spawn(move || {
            worker_object.set("name", "y").unwrap();
            worker_object.get("name").unwrap()
        })
        .join()
        .unwrap();
        assert_eq!(seen, AttributeValue::from("y"));

        let on_owner = object.clone();
        let seen = home.invoke(move || on_owner.get("name")).unwrap();
        assert_eq!(seen, AttributeValue::from("y"));
    }

    #[test]
    fn read_after_write_from_many_threads() {
        let home = HomeThread::spawn("raw-owner").unwrap();
        let ctx = context_on(&home, AffinityConfig::default());

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let ctx = ctx.clone();
                thread::spawn(move || {
                    let object = ctx.create("Widget", named(&format!("w{i}"))).unwrap();
                    for n in 0..25i64 {
                        object.set("count", n).unwrap();
                        assert_eq!(object.get("count").unwrap(), AttributeValue::Integer(n));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(ctx.objects().unwrap().len(), 4);
        let stats = ctx.stats();
        assert_eq!(stats.inline, 0);
        assert!(stats.marshalled >= 4 * 51);
    }

    #[test]
    fn owner_calls_bypass_the_queue() {
        let ctx = local_context();
        let own = AffinityToken::capture();
        let queued_before = own.queued_total();

        let object = ctx.create("Widget", named("x")).unwrap();
        object.set("name", "z").unwrap();
        assert_eq!(object.get("name").unwrap(), AttributeValue::from("z"));

        assert!(ctx.is_owned_by_current_thread());
        assert_eq!(own.queued_total(), queued_before);
        let stats = ctx.stats();
        assert_eq!(stats.marshalled, 0);
        assert_eq!(stats.inline, 3);
    }

    #[test]
    fn marshalled_work_is_fifo() {
        let home = HomeThread::spawn("fifo-owner").unwrap();
        let ctx = context_on(&home, AffinityConfig::default());
        let object = ctx.create("Widget", named("x")).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let base = home.token().queued_total();
        let (release, staller) = stall(&home);

        let mut workers = Vec::new();
        for (n, label) in ["b", "c"].into_iter().enumerate() {
            let object = object.clone();
            let order = Arc::clone(&order);
            workers.push(thread::spawn(move || {
                object
                    .with_owner(move |_, _| {
                        order.lock().unwrap().push(label);
                        Ok(())
                    })
                    .unwrap();
            }));
            let token = home.token().clone();
            wait_until(|| token.queued_total() >= base + 2 + n as u64);
        }

        release.send(()).unwrap();
        staller.join().unwrap();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["b", "c"]);
    }

    #[test]
    fn contexts_marshalling_into_each_other_do_not_deadlock() {
        let home_a = Arc::new(HomeThread::spawn("mutual-a").unwrap());
        let home_b = Arc::new(HomeThread::spawn("mutual-b").unwrap());
        let ctx_a = context_on(&home_a, AffinityConfig::default());
        let ctx_b = context_on(&home_b, AffinityConfig::default());
        let obj_a = ctx_a.create("Widget", named("a")).unwrap();
        let obj_b = ctx_b.create("Widget", named("b")).unwrap();

        let barrier = Arc::new(std::sync::Barrier::new(2));
        let spawn_cross = |home: Arc<HomeThread>, other: ThreadAffineObject| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                home.invoke(move || {
                    barrier.wait();
                    other.get("name")
                })
                .unwrap()
            })
        };
        let a_reads_b = spawn_cross(Arc::clone(&home_a), obj_b);
        let b_reads_a = spawn_cross(Arc::clone(&home_b), obj_a);

        assert_eq!(a_reads_b.join().unwrap(), AttributeValue::from("b"));
        assert_eq!(b_reads_a.join().unwrap(), AttributeValue::from("a"));
    }

    #[test]
    fn simulated_identity_owns_a_context() {
        let sim = RunLoop::detached("sim-owner");
        let ctx = ThreadAffineContext::builder(widget_model(), Arc::new(InMemoryAttributeStore::new()))
            .owner(sim.token().clone())
            .build();
        assert!(!ctx.is_owned_by_current_thread());

        let worker_ctx = ctx.clone();
        let worker = thread::spawn(move || {
            let object = worker_ctx.create("Widget", named("sim")).unwrap();
            object.set("count", 7i64).unwrap();
            (object.get("count").unwrap(), object.affinity_token())
        });
        while !worker.is_finished() {
            sim.run_for(Duration::from_millis(5));
        }
        let (count, stamp) = worker.join().unwrap();
        assert_eq!(count, AttributeValue::Integer(7));
        assert_eq!(stamp, *sim.token());
        assert_eq!(ctx.stats().marshalled, 3);
    }

    // -----------------------------------------------------------------------
    // Timeouts and stale owners
    // -----------------------------------------------------------------------

    #[test]
    fn marshal_timeout_abandons_queued_work() {
        let home = HomeThread::spawn("slow-owner").unwrap();
        let ctx = context_on(&home, AffinityConfig::with_marshal_timeout(Duration::from_millis(10)));
        let object = ctx.create("Widget", named("x")).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        let (release, staller) = stall(&home);
        let started = Instant::now();
        let counter = Arc::clone(&ran);
        let err = object
            .with_owner(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_millis(90));

        thread::sleep(Duration::from_millis(100));
        release.send(()).unwrap();
        staller.join().unwrap();

        // The owner is free again; the abandoned unit must not have run.
        assert_eq!(object.get("name").unwrap(), AttributeValue::from("x"));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(ctx.stats().timeouts, 1);
    }

    #[test]
    fn timed_out_call_already_running_completes_and_its_reply_is_dropped() {
        let home = HomeThread::spawn("busy-owner").unwrap();
        let ctx = context_on(&home, AffinityConfig::with_marshal_timeout(Duration::from_millis(10)));
        let object = ctx.create("Widget", named("x")).unwrap();
        let finished = Arc::new(AtomicUsize::new(0));

        let started = Instant::now();
        let counter = Arc::clone(&finished);
        let err = object
            .with_owner(move |scope, id| {
                thread::sleep(Duration::from_millis(100));
                scope.raw_set(id, "count", 7i64.into())?;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(AttributeValue::from("late"))
            })
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_millis(90));

        // The unit was already running, so it finishes on the owner.
        wait_until(|| finished.load(Ordering::SeqCst) == 1);

        // The next call gets its own reply, not the discarded "late" one.
        assert_eq!(object.get("name").unwrap(), AttributeValue::from("x"));
        assert_eq!(object.get("count").unwrap(), AttributeValue::from(7i64));
        let fresh = object.with_owner(|_, _| Ok(AttributeValue::from("fresh"))).unwrap();
        assert_eq!(fresh, AttributeValue::from("fresh"));
        assert_eq!(ctx.stats().timeouts, 1);
    }

    #[test]
    fn gate_wait_counts_against_the_call_deadline() {
        let home = HomeThread::spawn("gated-owner").unwrap();
        let ctx = context_on(&home, AffinityConfig::with_marshal_timeout(Duration::from_millis(100)));
        let object = ctx.create("Widget", named("x")).unwrap();

        let permit = ctx.inner.gate.begin_migration(None).unwrap();
        let (release, staller) = stall(&home);
        let caller = thread::spawn(move || {
            let started = Instant::now();
            let result = object.get("name");
            (result, started.elapsed())
        });

        thread::sleep(Duration::from_millis(80));
        drop(permit);
        let (result, elapsed) = caller.join().unwrap();
        assert!(result.unwrap_err().is_timeout());
        assert!(elapsed >= Duration::from_millis(90));
        assert!(elapsed < Duration::from_millis(160), "waited {elapsed:?}");

        release.send(()).unwrap();
        staller.join().unwrap();
        assert_eq!(ctx.stats().timeouts, 1);
    }

    #[test]
    fn stale_owner_then_adoption() {
        let home = HomeThread::spawn("doomed-owner").unwrap();
        let ctx = context_on(&home, AffinityConfig::default());
        let object = ctx.create("Widget", named("orphan")).unwrap();
        home.shutdown();

        let err = object.get("name").unwrap_err();
        assert!(err.is_stale_owner());
        assert_eq!(ctx.stats().stale_owners, 1);

        let me = ctx.migrate_ownership_to_calling_thread().unwrap();
        assert_eq!(me, AffinityToken::capture());
        assert_eq!(object.affinity_token(), me);
        assert_eq!(object.get("name").unwrap(), AttributeValue::from("orphan"));
        assert_eq!(ctx.diagnostics().migrations, 1);
    }

    // -----------------------------------------------------------------------
    // Migration
    // -----------------------------------------------------------------------

    #[test]
    fn migration_restamps_every_object() {
        let home = HomeThread::spawn("first-owner").unwrap();
        let ctx = context_on(&home, AffinityConfig::default());
        let objects: Vec<_> = (0..3)
            .map(|i| ctx.create("Widget", named(&format!("m{i}"))).unwrap())
            .collect();

        let me = ctx.migrate_ownership_to_calling_thread().unwrap();
        assert!(ctx.is_owned_by_current_thread());
        for object in &objects {
            assert_eq!(object.affinity_token(), me);
        }
        let inline_before = ctx.stats().inline;
        assert_eq!(objects[0].get("name").unwrap(), AttributeValue::from("m0"));
        assert_eq!(ctx.stats().inline, inline_before + 1);

        // Migrating to the owner again changes nothing.
        assert_eq!(ctx.migrate_ownership_to_calling_thread().unwrap(), me);
        assert_eq!(ctx.diagnostics().migrations, 1);

        // The home thread reaches back through this thread's run loop.
        let back = objects[1].clone();
        let seen = home.invoke(move || back.get("name")).unwrap();
        assert_eq!(seen, AttributeValue::from("m1"));

        // And can take ownership back.
        let ctx_home = ctx.clone();
        let home_token = home
            .invoke(move || ctx_home.migrate_ownership_to_calling_thread())
            .unwrap();
        assert_eq!(home_token, *home.token());
        for object in &objects {
            assert_eq!(object.affinity_token(), home_token);
        }
        assert_eq!(ctx.diagnostics().migrations, 2);
    }

    #[test]
    fn concurrent_migration_is_rejected() {
        let home = HomeThread::spawn("busy-owner").unwrap();
        let ctx = context_on(&home, AffinityConfig::default());
        let object = ctx.create("Widget", named("x")).unwrap();

        let base = home.token().queued_total();
        let (release, staller) = stall(&home);

        let migrator_ctx = ctx.clone();
        let migrator = thread::spawn(move || {
            let token = migrator_ctx.migrate_ownership_to_calling_thread().unwrap();
            (token.clone(), token == migrator_ctx.current_affinity_token())
        });
        let token = home.token().clone();
        wait_until(|| token.queued_total() >= base + 2);

        let err = ctx.migrate_ownership_to_calling_thread().unwrap_err();
        assert!(matches!(
            err,
            GraphError::Affinity(AffinityError::MigrationInProgress)
        ));

        release.send(()).unwrap();
        staller.join().unwrap();
        let (new_owner, owned) = migrator.join().unwrap();
        assert!(owned);
        assert_eq!(object.affinity_token(), new_owner);
    }

    #[test]
    fn migrating_from_inside_a_pending_call_is_reentrant() {
        let home = HomeThread::spawn("reentry-owner").unwrap();
        let ctx = context_on(&home, AffinityConfig::default());
        let object = ctx.create("Widget", named("x")).unwrap();
        let me = AffinityToken::capture();

        let inner_ctx = ctx.clone();
        let rejected = object
            .with_owner(move |_, _| {
                // Runs on the owner; bounce a migration back to the waiting
                // caller, which is inside this very operation.
                marshal::<_, GraphError, _>(&me, None, move || {
                    Ok(matches!(
                        inner_ctx.migrate_ownership_to_calling_thread(),
                        Err(GraphError::Affinity(AffinityError::ReentrantMigration))
                    ))
                })
            })
            .unwrap();
        assert!(rejected);
        assert_eq!(ctx.current_affinity_token(), *home.token());
    }

    // -----------------------------------------------------------------------
    // Invariant faults
    // -----------------------------------------------------------------------

    #[test]
    fn diverged_stamp_is_a_recorded_fault() {
        let home = HomeThread::spawn("strict-owner").unwrap();
        let ctx = context_on(&home, AffinityConfig::default());
        let object = ctx.create("Widget", named("x")).unwrap();

        object.tamper_stamp(&AffinityToken::capture());
        let err = object.get("name").unwrap_err();
        assert!(matches!(
            err,
            GraphError::Affinity(AffinityError::OwnershipInvariantViolation { .. })
        ));

        let diagnostics = ctx.diagnostics();
        assert_eq!(diagnostics.invariant_faults, 1);
        assert!(diagnostics.last_fault.unwrap().contains("stamped"));
    }

    // -----------------------------------------------------------------------
    // Accessor table
    // -----------------------------------------------------------------------

    #[test]
    fn schema_errors_surface_to_caller() {
        let home = HomeThread::spawn("schema-owner").unwrap();
        let ctx = context_on(&home, AffinityConfig::default());
        let object = ctx.create("Widget", named("x")).unwrap();

        let err = object.get("colour").unwrap_err();
        assert!(matches!(err, GraphError::Type(TypeError::UnknownAttribute { .. })));

        let err = object.set("name", 5i64).unwrap_err();
        assert!(matches!(err, GraphError::Type(TypeError::KindMismatch { .. })));

        let err = object.set("label", "nope").unwrap_err();
        assert!(matches!(err, GraphError::ReadOnlyAttribute { .. }));

        let err = ctx.create("Widget", Attributes::new()).unwrap_err();
        assert!(matches!(err, GraphError::Type(TypeError::MissingRequired { .. })));

        let err = ctx.create("Gadget", named("g")).unwrap_err();
        assert!(matches!(err, GraphError::UnknownEntity(_)));
    }

    #[test]
    fn custom_and_derived_accessors() {
        let home = HomeThread::spawn("custom-owner").unwrap();
        let ctx = context_on(&home, AffinityConfig::default());
        let object = ctx.create("Widget", named("knob")).unwrap();

        assert_eq!(object.get("label").unwrap(), AttributeValue::from("widget:knob"));
        object.set("shout", "quiet").unwrap();
        assert_eq!(object.get("shout").unwrap(), AttributeValue::from("QUIET"));
        assert_eq!(object.get("count").unwrap(), AttributeValue::Integer(0));

        let snapshot = object.snapshot().unwrap();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot["shout"], AttributeValue::from("QUIET"));
        assert!(!snapshot.contains_key("label"));
    }

    // -----------------------------------------------------------------------
    // Registry and store
    // -----------------------------------------------------------------------

    #[test]
    fn deleted_objects_are_unregistered() {
        let ctx = local_context();
        let object = ctx.create("Widget", named("gone")).unwrap();
        let id = object.id();
        assert!(ctx.object(id).unwrap().is_some());

        assert!(ctx.delete(&object).unwrap());
        assert!(ctx.object(id).unwrap().is_none());
        assert!(matches!(
            object.get("name").unwrap_err(),
            GraphError::ObjectNotRegistered(missing) if missing == id
        ));
        assert!(!ctx.delete(&object).unwrap());
    }

    #[test]
    fn objects_outlive_their_context_safely() {
        let ctx = local_context();
        let object = ctx.create("Widget", named("x")).unwrap();
        assert_eq!(object.context().unwrap().id(), ctx.id());

        drop(ctx);
        assert!(matches!(object.get("name").unwrap_err(), GraphError::ContextReleased));
        assert!(matches!(object.context().unwrap_err(), GraphError::ContextReleased));
    }

    #[test]
    fn foreign_objects_are_not_members() {
        let ctx_a = local_context();
        let ctx_b = local_context();
        let object = ctx_a.create("Widget", named("a")).unwrap();

        assert!(!ctx_b.delete(&object).unwrap());
        let err = ctx_b
            .perform(move |scope| scope.get(&object, "name"))
            .unwrap_err();
        assert!(matches!(err, GraphError::ObjectNotRegistered(_)));
    }

    #[test]
    fn fetch_and_save_through_the_owner() {
        let store = Arc::new(InMemoryAttributeStore::new());
        let first = store.seed("Widget", named("seeded-1"));
        let second = store.seed("Widget", named("seeded-2"));
        let home = HomeThread::spawn("store-owner").unwrap();
        let ctx = ThreadAffineContext::builder(widget_model(), Arc::clone(&store) as Arc<dyn AttributeStore>)
            .owner(home.token().clone())
            .build();

        let fetched = ctx.fetch("Widget").unwrap();
        assert_eq!(fetched.len(), 2);
        assert!(fetched.iter().all(|o| o.affinity_token() == *home.token()));

        let notified = ctx.notify_object_created("Widget", first).unwrap();
        let by_id = fetched.iter().find(|o| o.id() == first).unwrap();
        notified.set("count", 3i64).unwrap();
        assert_eq!(by_id.get("count").unwrap(), AttributeValue::Integer(3));

        let err = ctx.notify_object_created("Widget", ObjectId::new()).unwrap_err();
        assert!(matches!(err, GraphError::Store(StoreError::RecordNotFound(_))));

        assert_eq!(ctx.save().unwrap(), 1);
        assert_eq!(store.committed(first).unwrap()["count"], AttributeValue::Integer(3));
        assert!(!store.committed(second).unwrap().contains_key("count"));
        assert_eq!(ctx.objects().unwrap().len(), 2);
    }

    #[test]
    fn diagnostics_serialize() {
        let ctx = local_context();
        let json = serde_json::to_value(ctx.diagnostics()).unwrap();
        assert_eq!(json["invariant_faults"], 0);
        assert_eq!(json["migrations"], 0);
        assert!(ctx.id().to_string().starts_with("ctx-"));
    }
}
