//! Primary tier: a pool holding at most one object

use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::eviction::Evict;
use crate::object::{ObjectFactory, PooledObject, destroy_quietly};
use crate::{Error, ObjectPool, Result};

/// State of the one slot.
///
/// `Busy` covers both "checked out" and "being constructed", so a borrower
/// that reserves an empty slot can build the object without holding the lock.
enum Slot<T> {
   Empty,
   Idle { object: T, since: Instant },
   Busy,
}

struct State<T> {
   slot: Slot<T>,
   closed: bool,
}

/// Pool owning exactly one object, built lazily with
/// [`ObjectFactory::make_primary_object`].
///
/// A borrow while the object is checked out blocks until it is returned
/// (or the borrow timeout elapses), so cross-thread misuse serializes
/// instead of sharing the object.
pub struct SingleObjectPool<T, F> {
   factory: Arc<F>,
   state: Mutex<State<T>>,
   returned: Condvar,
   eviction_delay: Duration,
   borrow_timeout: Option<Duration>,
}

impl<T, F> SingleObjectPool<T, F>
where
   T: PooledObject,
   F: ObjectFactory<T>,
{
   pub fn new(factory: Arc<F>, eviction_delay: Duration, borrow_timeout: Option<Duration>) -> Self {
      Self {
         factory,
         state: Mutex::new(State {
            slot: Slot::Empty,
            closed: false,
         }),
         returned: Condvar::new(),
         eviction_delay,
         borrow_timeout,
      }
   }

   /// Borrows the object, blocking while another caller has it checked out.
   pub fn borrow_object(&self) -> Result<T> {
      self.borrow(true)?.ok_or(Error::Closed)
   }

   /// Borrows the object only if nobody else has it checked out.
   pub fn try_borrow_object(&self) -> Result<Option<T>> {
      self.borrow(false)
   }

   /// True while the object is checked out or under construction.
   pub fn is_busy(&self) -> bool {
      matches!(self.state.lock().slot, Slot::Busy)
   }

   /// True while an idle object sits in the slot.
   pub fn has_idle(&self) -> bool {
      matches!(self.state.lock().slot, Slot::Idle { .. })
   }

   pub fn return_object(&self, mut object: T) {
      self.factory.passivate_object(&mut object);
      let mut state = self.state.lock();
      debug_assert!(
         matches!(state.slot, Slot::Busy),
         "returned an object to a primary slot that was not checked out"
      );
      if state.closed {
         state.slot = Slot::Empty;
         drop(state);
         debug!("Primary object returned after close, destroying");
         destroy_quietly(&*self.factory, object);
         return;
      }
      state.slot = Slot::Idle {
         object,
         since: Instant::now(),
      };
      drop(state);
      self.returned.notify_one();
   }

   pub fn close(&self) {
      let mut state = self.state.lock();
      state.closed = true;
      let idle = match mem::replace(&mut state.slot, Slot::Empty) {
         Slot::Idle { object, .. } => Some(object),
         Slot::Busy => {
            state.slot = Slot::Busy;
            None
         }
         Slot::Empty => None,
      };
      drop(state);
      self.returned.notify_all();
      if let Some(object) = idle {
         destroy_quietly(&*self.factory, object);
      }
   }

   pub fn is_closed(&self) -> bool {
      self.state.lock().closed
   }

   /// Destroys the idle object once it has been idle for the eviction delay.
   ///
   /// A younger idle object is marked; if the next sweep finds the mark still
   /// set it revalidates the object and drops it when validation fails.
   /// Returns the number of objects destroyed.
   pub fn evict(&self) -> usize {
      let mut state = self.state.lock();
      let expired = match &mut state.slot {
         Slot::Idle { object, since } => {
            if since.elapsed() >= self.eviction_delay {
               true
            } else if object.tag() {
               !self.factory.validate_object(object)
            } else {
               object.set_tag(true);
               false
            }
         }
         _ => false,
      };
      if !expired {
         return 0;
      }
      let Slot::Idle { object, .. } = mem::replace(&mut state.slot, Slot::Empty) else {
         return 0;
      };
      drop(state);
      trace!("Evicting idle primary object");
      destroy_quietly(&*self.factory, object);
      1
   }

   fn borrow(&self, block: bool) -> Result<Option<T>> {
      let deadline = self.borrow_timeout.map(|timeout| Instant::now() + timeout);
      let mut state = self.state.lock();
      loop {
         if state.closed {
            return Err(Error::Closed);
         }
         match mem::replace(&mut state.slot, Slot::Busy) {
            Slot::Empty => {
               drop(state);
               return self.construct().map(Some);
            }
            Slot::Idle { object, .. } => {
               drop(state);
               return self.activate(object).map(Some);
            }
            Slot::Busy => {
               if !block {
                  return Ok(None);
               }
               match deadline {
                  Some(deadline) => {
                     if self.returned.wait_until(&mut state, deadline).timed_out()
                        && matches!(state.slot, Slot::Busy)
                        && !state.closed
                     {
                        return Err(Error::Exhausted {
                           waited: self.borrow_timeout.unwrap_or_default(),
                        });
                     }
                  }
                  None => self.returned.wait(&mut state),
               }
            }
         }
      }
   }

   /// Builds the object into a slot already reserved as `Busy`.
   fn construct(&self) -> Result<T> {
      match self.factory.make_primary_object() {
         Ok(object) => {
            debug!("Constructed primary object");
            Ok(object)
         }
         Err(e) => {
            self.state.lock().slot = Slot::Empty;
            self.returned.notify_one();
            Err(Error::Factory(e))
         }
      }
   }

   fn activate(&self, mut object: T) -> Result<T> {
      object.set_tag(false);
      if !self.factory.validate_object(&object) {
         warn!("Idle primary object failed validation, replacing it");
         destroy_quietly(&*self.factory, object);
         return self.construct();
      }
      self.factory.activate_object(&mut object);
      Ok(object)
   }
}

impl<T, F> ObjectPool<T> for SingleObjectPool<T, F>
where
   T: PooledObject,
   F: ObjectFactory<T>,
{
   fn borrow_object(&self) -> Result<T> {
      SingleObjectPool::borrow_object(self)
   }

   fn borrow_object_for(&self, _key: &T::Key) -> Result<T> {
      SingleObjectPool::borrow_object(self)
   }

   fn return_object(&self, obj: T) {
      SingleObjectPool::return_object(self, obj)
   }

   fn close(&self) {
      SingleObjectPool::close(self)
   }
}

impl<T, F> Evict for SingleObjectPool<T, F>
where
   T: PooledObject,
   F: ObjectFactory<T>,
{
   fn evict(&self) -> usize {
      SingleObjectPool::evict(self)
   }

   fn is_closed(&self) -> bool {
      SingleObjectPool::is_closed(self)
   }
}
