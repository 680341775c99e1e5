//! Thread-affine object graphs.
//!
//! A [`ThreadAffineContext`] owns a graph of [`ThreadAffineObject`]s and is
//! bound to exactly one owning thread. Any thread may read and write the
//! graph; accesses from non-owners are marshalled onto the owner and the
//! caller blocks until they complete, so every caller observes its own
//! writes in order.
//!
//! # Components
//!
//! - [`ThreadAffineContext`]: the registry, its owner token, bulk
//!   operations, and ownership migration
//! - [`ThreadAffineObject`]: per-entity attribute access through the
//!   accessor table
//! - [`Model`]: entity schemas plus the accessor tables generated from
//!   them at registration time
//! - [`AttributeStore`]: the storage collaborator's raw slot contract
//! - [`OwnerScope`]: proof that code runs on the owning thread
//!
//! # Integration Rules
//!
//! 1. Raw slot access requires an [`OwnerScope`]; only the core creates one,
//!    after the ownership check has passed or the call has been marshalled.
//! 2. Custom attribute logic either registers into the accessor table
//!    ([`ModelBuilder::custom_setter`], [`ModelBuilder::derived`]) or enters
//!    through [`ThreadAffineObject::with_owner`].
//! 3. [`ThreadAffineContext::migrate_ownership_to_calling_thread`] is the only
//!    way to change the owner.
//! 4. The owning thread must service its run loop (see
//!    [`affinity_runtime::HomeThread`]) for marshalled work to make progress.

pub mod accessor;
pub mod context;
pub mod error;
pub mod memory;
pub mod model;
pub mod object;
pub mod scope;
pub mod traits;

pub use accessor::{Accessor, AccessorTable, Getter, Setter};
pub use context::{ContextBuilder, ContextDiagnostics, ContextId, ThreadAffineContext};
pub use error::{GraphError, GraphResult, StoreError, StoreResult};
pub use memory::InMemoryAttributeStore;
pub use model::{EntityDescriptor, Model, ModelBuilder};
pub use object::ThreadAffineObject;
pub use scope::OwnerScope;
pub use traits::AttributeStore;
