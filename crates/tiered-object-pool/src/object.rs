//! Contracts between the pools and the objects they manage

use tracing::warn;

use crate::error::BoxError;

/// Which tier of a [`TieredObjectPool`](crate::TieredObjectPool) an object belongs to.
///
/// Fixed at construction: objects built by
/// [`ObjectFactory::make_primary_object`] are `Primary`, everything else is
/// `Secondary`. Returns are routed by this tag alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
   Primary,
   Secondary,
}

/// Capabilities the pools need from anything they manage.
pub trait PooledObject: Send + 'static {
   /// Key type used by keyed borrows.
   type Key: ?Sized;

   fn tier(&self) -> Tier;

   fn is_primary(&self) -> bool {
      self.tier() == Tier::Primary
   }

   /// Scratch mark owned by the pool.
   ///
   /// An eviction sweep sets it on idle objects it lets survive; a later sweep
   /// finding the mark still set revalidates the object. Borrowing clears it.
   fn tag(&self) -> bool;

   fn set_tag(&mut self, tag: bool);

   /// Whether this object is a preferred match for a keyed borrow.
   fn matches(&self, key: &Self::Key) -> bool;
}

/// Snapshot of the objects a factory currently has alive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FactoryGauge {
   /// Live objects not sitting passivated in a pool
   pub num_active: usize,
   /// Live objects passivated and waiting in a pool
   pub num_idle: usize,
}

impl FactoryGauge {
   pub fn total(&self) -> usize {
      self.num_active + self.num_idle
   }
}

/// Builds, recycles and tears down pooled objects.
///
/// `activate_object` and `passivate_object` are infallible: a factory that
/// cannot prepare or reset an object should report it through
/// `validate_object` instead, which makes the pool destroy and replace it.
pub trait ObjectFactory<T>: Send + Sync + 'static {
   fn make_object(&self) -> Result<T, BoxError>;

   fn make_primary_object(&self) -> Result<T, BoxError>;

   /// Prepares an object pulled from idle for use.
   fn activate_object(&self, obj: &mut T);

   /// Resets an object before it goes back to idle.
   fn passivate_object(&self, obj: &mut T);

   fn destroy_object(&self, obj: T) -> Result<(), BoxError>;

   fn validate_object(&self, obj: &T) -> bool;

   fn gauge(&self) -> FactoryGauge;
}

/// Destroys an object, logging rather than propagating any failure.
pub(crate) fn destroy_quietly<T, F: ObjectFactory<T>>(factory: &F, obj: T) {
   if let Err(e) = factory.destroy_object(obj) {
      warn!(error = %e, "Failed to destroy pooled object");
   }
}

/// Borrow/return contract shared by every pool tier.
pub trait ObjectPool<T: PooledObject> {
   fn borrow_object(&self) -> crate::Result<T>;

   /// Borrows an object, preferring one that [`matches`](PooledObject::matches) `key`.
   fn borrow_object_for(&self, key: &T::Key) -> crate::Result<T>;

   fn return_object(&self, obj: T);

   /// Destroys idle objects and fails pending and future borrows.
   fn close(&self);
}
