//! # Handle Arenas
//!
//! Handle → object tables. The API layer only ever hands out [`Handle`]s;
//! objects are owned here and shared out as `Arc`s.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::RwLock;

use crate::error::{Error, Result};
use crate::types::Handle;

// =============================================================================
// HANDLE TABLE
// =============================================================================

/// Arena mapping typed handles to shared objects
pub struct HandleTable<M, T> {
    /// Live objects
    objects: RwLock<BTreeMap<u64, Arc<T>>>,
    /// Next handle ID (0 is the null handle)
    next_id: AtomicU64,
    _marker: core::marker::PhantomData<fn() -> M>,
}

impl<M, T> HandleTable<M, T> {
    /// Create an empty table
    pub const fn new() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            _marker: core::marker::PhantomData,
        }
    }

    /// Register an object and return its handle
    pub fn insert(&self, object: Arc<T>) -> Handle<M> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.objects.write().insert(id, object);
        Handle::new(id)
    }

    /// Build an object that knows its own handle, then register it
    ///
    /// Nothing is registered when `build` fails; the handle value is burnt.
    pub fn insert_with<F>(&self, build: F) -> Result<Arc<T>>
    where
        F: FnOnce(Handle<M>) -> Result<T>,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let object = Arc::new(build(Handle::new(id))?);
        self.objects.write().insert(id, object.clone());
        Ok(object)
    }

    /// Resolve a handle
    pub fn get(&self, handle: Handle<M>) -> Result<Arc<T>> {
        if handle.is_null() {
            return Err(Error::InvalidArgument);
        }
        self.objects
            .read()
            .get(&handle.id())
            .cloned()
            .ok_or(Error::NotFound)
    }

    /// Remove and return an object
    pub fn remove(&self, handle: Handle<M>) -> Result<Arc<T>> {
        self.objects
            .write()
            .remove(&handle.id())
            .ok_or(Error::NotFound)
    }

    /// Number of live objects
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Snapshot of all live objects
    pub fn values(&self) -> Vec<Arc<T>> {
        self.objects.read().values().cloned().collect()
    }
}

impl<M, T> Default for HandleTable<M, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M, T> fmt::Debug for HandleTable<M, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleTable")
            .field("type", &core::any::type_name::<T>())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventMarker;

    #[test]
    fn test_insert_get_remove() {
        let table: HandleTable<EventMarker, u32> = HandleTable::new();
        let a = table.insert(Arc::new(7));
        let b = table.insert(Arc::new(9));

        assert_ne!(a, b);
        assert_eq!(*table.get(a).unwrap(), 7);
        assert_eq!(table.len(), 2);

        assert_eq!(*table.remove(a).unwrap(), 7);
        assert_eq!(table.get(a).unwrap_err(), Error::NotFound);
        assert_eq!(table.remove(a).unwrap_err(), Error::NotFound);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_insert_with_sees_own_handle() {
        let table: HandleTable<EventMarker, u64> = HandleTable::new();
        let object = table.insert_with(|h| Ok(h.id() * 10)).unwrap();
        assert_eq!(*table.get(Handle::new(*object / 10)).unwrap(), *object);

        assert_eq!(
            table.insert_with(|_| Err(Error::OutOfHostMemory)).unwrap_err(),
            Error::OutOfHostMemory
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_null_handle_rejected() {
        let table: HandleTable<EventMarker, u32> = HandleTable::new();
        assert_eq!(table.get(Handle::null()).unwrap_err(), Error::InvalidArgument);
    }
}
