//! # Reference Registry
//!
//! Distributed reference counting for objects crossing the connection.
//!
//! ## Philosophy
//!
//! - **Exposer Counts, Importer Shadows**: The side that owns an object counts how many
//!   references it has sent. The importing side counts how many it has received and hands
//!   that number back in one `ReferenceRelease` when its proxy dies.
//! - **One Proxy Per Handle**: While a proxy is alive, importing the same handle again yields
//!   the same proxy.
//! - **Throttled**: An import whose shadow count passes the high-water mark flushes all but
//!   one reference early, so neither counter can overflow.
//!
//! ## Invariants
//!
//! - An exposed entry lives until its count drops to zero or the registry closes.
//! - For every live handle: exposer count == references sent - references released.
//! - After `close`, every table is empty and further exposures fail.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::Weak;

use crate::error::Fault;
use crate::error::Result;
use crate::object::Callable;
use crate::object::Exposed;
use crate::shape::Capability;

/// Distinguishes handles owned by this side from handles owned by the peer.
pub const OWNER_BIT: u32 = 1 << 31;

const MAX_INDEX: u32 = OWNER_BIT - 1;

/// A handle as this side stores it.
///
/// Exposed handles have the owner bit clear, imported handles have it set.
/// On the wire the sender writes its own view; the receiver flips the bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u32);

impl HandleId {
    pub fn exposed(index: u32) -> Self {
        Self(index & !OWNER_BIT)
    }

    pub fn imported(index: u32) -> Self {
        Self(index | OWNER_BIT)
    }

    pub fn is_imported(self) -> bool {
        self.0 & OWNER_BIT != 0
    }

    pub fn index(self) -> u32 {
        self.0 & !OWNER_BIT
    }

    /// The same handle as the other side of the connection stores it.
    pub fn across(self) -> Self {
        Self(self.0 ^ OWNER_BIT)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = if self.is_imported() { "imp" } else { "exp" };
        write!(f, "{}#{}", side, self.index())
    }
}

/// A local thing the peer can hold a reference to.
#[derive(Clone)]
pub enum Target {
    Object(Arc<dyn Exposed>),
    Callable(Callable),
}

impl Target {
    fn identity(&self) -> usize {
        match self {
            Target::Object(o) => Arc::as_ptr(o) as *const () as usize,
            Target::Callable(c) => c.identity(),
        }
    }

    fn capability(&self) -> Capability {
        match self {
            Target::Object(o) => Capability::Object(o.type_info()),
            Target::Callable(c) => Capability::Callable(c.signature().clone()),
        }
    }
}

/// References the importing side gives back in one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Release {
    /// The handle as the exposer stores it.
    pub handle: HandleId,
    pub count: u32,
}

struct ExposedEntry {
    target: Target,
    capability: Capability,
    refcount: i64,
}

struct ImportedEntry<P> {
    proxy: Weak<P>,
    shadow: u32,
}

struct Tables<P> {
    exposed: HashMap<HandleId, ExposedEntry>,
    identity: HashMap<usize, HandleId>,
    imported: HashMap<HandleId, ImportedEntry<P>>,
    next_index: u32,
    closed: bool,
}

/// Exposed and imported handles of one session.
///
/// Generic over the proxy type so the counting logic stands on its own.
pub struct Registry<P> {
    tables: Mutex<Tables<P>>,
    high_water: u32,
}

impl<P> Registry<P> {
    pub fn new(high_water: u32) -> Self {
        Self {
            tables: Mutex::new(Tables {
                exposed: HashMap::new(),
                identity: HashMap::new(),
                imported: HashMap::new(),
                next_index: 1,
                closed: false,
            }),
            high_water: high_water.max(2),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tables<P>> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ========================================================================
    //  Exposer side
    // ========================================================================

    /// Counts one more reference to `target`, assigning a handle on first exposure.
    pub fn expose(&self, target: &Target) -> Result<(HandleId, Capability)> {
        let key = target.identity();
        {
            let mut tables = self.lock();
            if tables.closed {
                return Err(Fault::ConnectionClosed);
            }
            if let Some(&id) = tables.identity.get(&key) {
                if let Some(entry) = tables.exposed.get_mut(&id) {
                    entry.refcount += 1;
                    return Ok((id, entry.capability.clone()));
                }
            }
        }

        // Type info comes from application code; read it without the lock held.
        let capability = target.capability();

        let mut tables = self.lock();
        if tables.closed {
            return Err(Fault::ConnectionClosed);
        }
        if let Some(&id) = tables.identity.get(&key) {
            if let Some(entry) = tables.exposed.get_mut(&id) {
                entry.refcount += 1;
                return Ok((id, entry.capability.clone()));
            }
        }
        let id = Self::allocate(&mut tables)?;
        tables.identity.insert(key, id);
        tables.exposed.insert(id, ExposedEntry { target: target.clone(), capability: capability.clone(), refcount: 1 });
        Ok((id, capability))
    }

    fn allocate(tables: &mut Tables<P>) -> Result<HandleId> {
        for _ in 0..MAX_INDEX {
            let id = HandleId::exposed(tables.next_index);
            tables.next_index = if tables.next_index >= MAX_INDEX { 1 } else { tables.next_index + 1 };
            if !tables.exposed.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(Fault::Unmarshalable("handle space exhausted".into()))
    }

    /// Looks up an exposed handle.
    pub fn resolve(&self, id: HandleId) -> Option<(Target, Capability)> {
        let tables = self.lock();
        tables.exposed.get(&id).map(|e| (e.target.clone(), e.capability.clone()))
    }

    /// Subtracts `count` references. Returns `true` when the entry was removed.
    ///
    /// Unknown handles are ignored: the release may race with `close`.
    pub fn release(&self, id: HandleId, count: u32) -> bool {
        let removed = {
            let mut tables = self.lock();
            let Some(entry) = tables.exposed.get_mut(&id) else {
                return false;
            };
            entry.refcount -= count as i64;
            if entry.refcount > 0 {
                return false;
            }
            let removed = tables.exposed.remove(&id);
            if let Some(entry) = &removed {
                let key = entry.target.identity();
                tables.identity.remove(&key);
            }
            removed
        };
        // The target may run arbitrary drop code; let it go outside the lock.
        drop(removed);
        true
    }

    pub fn refcount(&self, id: HandleId) -> Option<i64> {
        self.lock().exposed.get(&id).map(|e| e.refcount)
    }

    pub fn exposed_len(&self) -> usize {
        self.lock().exposed.len()
    }

    // ========================================================================
    //  Importer side
    // ========================================================================

    /// Records one received reference to `id`, reusing the live proxy if there is one.
    ///
    /// Returns the proxy and, when the throttle fires or a dead proxy is replaced,
    /// the release the caller must send.
    pub fn import(&self, id: HandleId, make: impl FnOnce() -> Arc<P>) -> Result<(Arc<P>, Option<Release>)> {
        let mut tables = self.lock();
        if tables.closed {
            return Err(Fault::ConnectionClosed);
        }

        if let Some(entry) = tables.imported.get_mut(&id) {
            if let Some(proxy) = entry.proxy.upgrade() {
                entry.shadow += 1;
                let mut release = None;
                if entry.shadow > self.high_water {
                    release = Some(Release { handle: id.across(), count: entry.shadow - 1 });
                    entry.shadow = 1;
                }
                return Ok((proxy, release));
            }
        }

        // The previous proxy, if any, is dying; its finalizer will find the entry replaced.
        let stale = tables.imported.remove(&id).map(|old| Release { handle: id.across(), count: old.shadow });
        let proxy = make();
        tables.imported.insert(id, ImportedEntry { proxy: Arc::downgrade(&proxy), shadow: 1 });
        Ok((proxy, stale))
    }

    /// Returns the live proxy for `id` without counting a reference.
    pub fn lookup(&self, id: HandleId) -> Option<Arc<P>> {
        self.lock().imported.get(&id).and_then(|e| e.proxy.upgrade())
    }

    /// Called when a proxy dies. Returns the release to send, unless the entry
    /// already belongs to a newer proxy.
    pub fn finalize(&self, id: HandleId, proxy: *const P) -> Option<Release> {
        let mut tables = self.lock();
        let current = tables.imported.get(&id)?;
        if !std::ptr::eq(current.proxy.as_ptr(), proxy) {
            return None;
        }
        let entry = tables.imported.remove(&id)?;
        Some(Release { handle: id.across(), count: entry.shadow })
    }

    pub fn shadow(&self, id: HandleId) -> Option<u32> {
        self.lock().imported.get(&id).map(|e| e.shadow)
    }

    pub fn imported_len(&self) -> usize {
        self.lock().imported.len()
    }

    // ========================================================================
    //  Lifecycle
    // ========================================================================

    /// Forgets every handle. Idempotent.
    pub fn close(&self) {
        let (exposed, imported) = {
            let mut tables = self.lock();
            tables.closed = true;
            tables.identity.clear();
            (std::mem::take(&mut tables.exposed), std::mem::take(&mut tables.imported))
        };
        drop(exposed);
        drop(imported);
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
