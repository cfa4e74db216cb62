//! Reference-counted hold on one pooled object

use std::mem::ManuallyDrop;
use std::num::NonZeroUsize;
use std::sync::Arc;

use tiered_object_pool::{ObjectFactory, PooledObject, TieredObjectPool};
use tracing::{trace, warn};

use crate::{Error, Result};

enum Retention<T> {
   Vacant,
   Held { object: T, count: NonZeroUsize },
}

/// Holds at most one object borrowed from a [`TieredObjectPool`].
///
/// The first [`retain`](Self::retain) borrows; nested retains reuse the held
/// object whatever tier or key they ask for. The object goes back to the pool
/// when the matching last [`release`](Self::release) runs, or when the session
/// is dropped.
pub struct Session<T, F>
where
   T: PooledObject,
   F: ObjectFactory<T>,
{
   pool: Arc<TieredObjectPool<T, F>>,
   retention: Retention<T>,
}

impl<T, F> Session<T, F>
where
   T: PooledObject,
   F: ObjectFactory<T>,
{
   pub fn new(pool: Arc<TieredObjectPool<T, F>>) -> Self {
      Self {
         pool,
         retention: Retention::Vacant,
      }
   }

   pub fn pool(&self) -> &Arc<TieredObjectPool<T, F>> {
      &self.pool
   }

   pub fn has_object(&self) -> bool {
      matches!(self.retention, Retention::Held { .. })
   }

   pub fn retain_count(&self) -> usize {
      match &self.retention {
         Retention::Vacant => 0,
         Retention::Held { count, .. } => count.get(),
      }
   }

   /// Borrows an object on first retain, otherwise bumps the count.
   ///
   /// A first retain with `primary` set waits for the primary object; with a
   /// `key` it prefers a matching secondary object; with neither it takes
   /// whatever the pool offers first.
   pub fn retain(&mut self, primary: bool, key: Option<&T::Key>) -> Result<&mut T> {
      let (object, count) = match std::mem::replace(&mut self.retention, Retention::Vacant) {
         Retention::Held { object, count } => (object, count.saturating_add(1)),
         Retention::Vacant => (self.borrow(primary, key)?, NonZeroUsize::MIN),
      };
      trace!(retained = count.get(), "Retained pooled object");
      self.retention = Retention::Held { object, count };
      match &mut self.retention {
         Retention::Held { object, .. } => Ok(object),
         Retention::Vacant => unreachable!("object was just retained"),
      }
   }

   /// Drops one retain, returning the object to the pool on the last.
   pub fn release(&mut self) -> Result<()> {
      match std::mem::replace(&mut self.retention, Retention::Vacant) {
         Retention::Vacant => Err(Error::ReleaseWithoutRetain),
         Retention::Held { object, count } => {
            match NonZeroUsize::new(count.get() - 1) {
               Some(count) => self.retention = Retention::Held { object, count },
               None => self.pool.return_object(object),
            }
            Ok(())
         }
      }
   }

   /// The held object, if any, without touching the count.
   pub fn object_mut(&mut self) -> Option<&mut T> {
      match &mut self.retention {
         Retention::Held { object, .. } => Some(object),
         Retention::Vacant => None,
      }
   }

   /// Runs `block` on a retained object and releases it again, on success,
   /// on error and when `block` panics.
   pub fn execute<R>(
      &mut self,
      primary: bool,
      key: Option<&T::Key>,
      block: impl FnOnce(&mut T) -> Result<R>,
   ) -> Result<R> {
      self.retain(primary, key)?;
      let mut retained = Retained { session: self };
      let result = block(retained.object());
      let released = retained.release();
      let value = result?;
      released?;
      Ok(value)
   }

   fn borrow(&self, primary: bool, key: Option<&T::Key>) -> Result<T> {
      let object = if primary {
         self.pool.borrow_primary_object()?
      } else if let Some(key) = key {
         self.pool.borrow_object_for(key)?
      } else {
         self.pool.borrow_object()?
      };
      Ok(object)
   }
}

/// One retain taken by [`Session::execute`], released when dropped so a
/// panicking block cannot strand the object.
struct Retained<'a, T, F>
where
   T: PooledObject,
   F: ObjectFactory<T>,
{
   session: &'a mut Session<T, F>,
}

impl<T, F> Retained<'_, T, F>
where
   T: PooledObject,
   F: ObjectFactory<T>,
{
   fn object(&mut self) -> &mut T {
      match &mut self.session.retention {
         Retention::Held { object, .. } => object,
         Retention::Vacant => unreachable!("retained session holds an object"),
      }
   }

   fn release(self) -> Result<()> {
      let mut this = ManuallyDrop::new(self);
      this.session.release()
   }
}

impl<T, F> Drop for Retained<'_, T, F>
where
   T: PooledObject,
   F: ObjectFactory<T>,
{
   fn drop(&mut self) {
      warn!("Releasing pooled object after a panic");
      if let Err(e) = self.session.release() {
         warn!(error = %e, "Release during unwind failed");
      }
   }
}

impl<T, F> Drop for Session<T, F>
where
   T: PooledObject,
   F: ObjectFactory<T>,
{
   fn drop(&mut self) {
      if let Retention::Held { object, count } = std::mem::replace(&mut self.retention, Retention::Vacant) {
         warn!(retained = count.get(), "Session dropped while holding a pooled object");
         self.pool.return_object(object);
      }
   }
}
