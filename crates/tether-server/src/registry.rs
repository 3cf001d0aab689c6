//! Opaque handle tables.
//!
//! Scripts never hold references to server-side objects. They hold integer
//! [`Handle`]s, and every lookup goes through a [`HandleRegistry`]. This keeps
//! the engine's garbage collector and the server's connection lifetimes
//! independent: a script can keep a stale handle around forever, and the
//! worst it gets is `HandleNotFound`.
//!
//! Registries are single-threaded. They live inside the execution
//! coordinator's state and are only touched from coordinator tasks, so they
//! need no lock.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tether_common::{Result, TetherError};

use crate::session::Session;

/// Opaque integer id for a registered value. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u32);

impl Handle {
    /// Rebuilds a handle from the integer a script handed back.
    ///
    /// Returns `None` for zero, which is never issued.
    pub fn from_raw(id: u32) -> Option<Self> {
        if id == 0 {
            None
        } else {
            Some(Self(id))
        }
    }

    pub fn id(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Entry<T> {
    value: T,
    refs: u32,
}

/// Maps handles to retained values with reference-counted release.
///
/// `register` creates an entry with one reference, `retain` adds one and
/// `release` drops one; the value is removed when the count reaches zero.
/// Releasing or resolving a handle that is no longer registered yields
/// `TetherError::HandleNotFound`, which callers treat as non-fatal.
///
/// # Example
///
/// ```
/// use tether_server::HandleRegistry;
///
/// let mut registry = HandleRegistry::new();
/// let handle = registry.register("callback");
/// assert_eq!(*registry.resolve(handle).unwrap(), "callback");
///
/// assert_eq!(registry.release(handle).unwrap(), Some("callback"));
/// assert!(registry.release(handle).is_err());
/// ```
pub struct HandleRegistry<T> {
    entries: HashMap<Handle, Entry<T>>,
    next: u32,
}

impl<T> HandleRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next: 0,
        }
    }

    /// Registers a value and returns its handle.
    ///
    /// Ids increase monotonically, skip zero on wrap-around and never collide
    /// with a live entry.
    pub fn register(&mut self, value: T) -> Handle {
        let handle = loop {
            self.next = self.next.wrapping_add(1);
            if let Some(handle) = Handle::from_raw(self.next) {
                if !self.entries.contains_key(&handle) {
                    break handle;
                }
            }
        };

        self.entries.insert(handle, Entry { value, refs: 1 });
        handle
    }

    pub fn resolve(&self, handle: Handle) -> Result<&T> {
        self.entries
            .get(&handle)
            .map(|entry| &entry.value)
            .ok_or(TetherError::HandleNotFound(handle.id()))
    }

    /// Adds a reference to a live handle.
    pub fn retain(&mut self, handle: Handle) -> Result<()> {
        let entry = self
            .entries
            .get_mut(&handle)
            .ok_or(TetherError::HandleNotFound(handle.id()))?;
        entry.refs += 1;
        Ok(())
    }

    /// Drops a reference.
    ///
    /// # Returns
    ///
    /// `Some(value)` when this was the last reference and the entry was
    /// removed, `None` while other references remain.
    pub fn release(&mut self, handle: Handle) -> Result<Option<T>> {
        let entry = self
            .entries
            .get_mut(&handle)
            .ok_or(TetherError::HandleNotFound(handle.id()))?;

        entry.refs -= 1;
        if entry.refs > 0 {
            return Ok(None);
        }

        Ok(self.entries.remove(&handle).map(|entry| entry.value))
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.entries.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every entry regardless of its reference count.
    pub fn drain(&mut self) -> Vec<T> {
        self.entries.drain().map(|(_, entry)| entry.value).collect()
    }
}

impl<T> Default for HandleRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry of live sessions, reachable from both the event dispatcher and
/// native script bindings.
///
/// Borrows are scoped to a single method call, so a script callback that
/// re-enters the table (for example `net.send` inside a data event) never
/// observes an outstanding borrow.
#[derive(Default)]
pub struct SessionTable {
    inner: RefCell<HandleRegistry<Arc<Session>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: Arc<Session>) -> Handle {
        self.inner.borrow_mut().register(session)
    }

    pub fn resolve(&self, handle: Handle) -> Result<Arc<Session>> {
        self.inner.borrow().resolve(handle).cloned()
    }

    pub fn release(&self, handle: Handle) -> Result<Option<Arc<Session>>> {
        self.inner.borrow_mut().release(handle)
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().is_empty()
    }
}
