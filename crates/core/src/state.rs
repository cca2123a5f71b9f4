//! Typed key/value registry used to inject host objects into capability
//! modules.
//!
//! Values are stored as shared `Arc<T>` handles, so a later mutation through
//! interior mutability is observed by every reader. The key's type parameter
//! is checked at compile time on both ends; a runtime tag remains only to
//! catch two keys that share a name but disagree on the type.

use std::any::{type_name, Any};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::StateError;
use crate::http::{HttpRequest, ResponseWriter};
use crate::transaction::TransactionSource;

/// Shared connection pool handing out one transaction per root context.
pub const DATABASE_POOL: StateKey<dyn TransactionSource> = StateKey::new("database-pool");

/// The inbound request of a routed script.
pub const HTTP_REQUEST: StateKey<HttpRequest> = StateKey::new("http-request");

/// The response sink of a routed script.
pub const HTTP_RESPONSE_WRITER: StateKey<ResponseWriter> = StateKey::new("http-response-writer");

/// A named, typed slot in the [`StateStore`].
pub struct StateKey<T: ?Sized + 'static> {
    name: &'static str,
    _marker: PhantomData<fn() -> Arc<T>>,
}

impl<T: ?Sized + 'static> StateKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T: ?Sized + 'static> Clone for StateKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized + 'static> Copy for StateKey<T> {}

impl<T: ?Sized + 'static> fmt::Debug for StateKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateKey")
            .field("name", &self.name)
            .field("type", &type_name::<T>())
            .finish()
    }
}

struct Entry {
    value: Box<dyn Any>,
    type_name: &'static str,
    /// Lineage depth of the loader that inserted the entry (0 = root).
    owner_depth: usize,
}

/// Registry shared by reference across a whole loader chain.
#[derive(Default)]
pub struct StateStore {
    entries: RefCell<HashMap<&'static str, Entry>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `key` on behalf of a loader at `depth`.
    ///
    /// An entry may only be replaced by a loader at the same or a shallower
    /// depth than the one that inserted it.
    pub(crate) fn set_at<T: ?Sized + 'static>(
        &self,
        depth: usize,
        key: &StateKey<T>,
        value: Arc<T>,
    ) -> Result<(), StateError> {
        let mut entries = self.entries.borrow_mut();
        if let Some(existing) = entries.get(key.name) {
            if existing.owner_depth < depth {
                return Err(StateError::NotOwner(key.name.to_string()));
            }
        }
        entries.insert(
            key.name,
            Entry {
                value: Box::new(value),
                type_name: type_name::<T>(),
                owner_depth: depth,
            },
        );
        Ok(())
    }

    /// Fetch the shared handle stored under `key`.
    pub fn get<T: ?Sized + 'static>(&self, key: &StateKey<T>) -> Result<Arc<T>, StateError> {
        let entries = self.entries.borrow();
        let entry = entries
            .get(key.name)
            .ok_or_else(|| StateError::NotFound(key.name.to_string()))?;

        entry
            .value
            .downcast_ref::<Arc<T>>()
            .map(Arc::clone)
            .ok_or_else(|| StateError::TypeMismatch {
                name: key.name.to_string(),
                stored: entry.type_name,
                requested: type_name::<T>(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.borrow().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for StateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.borrow();
        let mut names: Vec<_> = entries.keys().collect();
        names.sort();
        f.debug_struct("StateStore").field("entries", &names).finish()
    }
}
