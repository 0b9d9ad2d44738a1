//! Per-call context handed to exposed objects.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use crate::error::Result;
use crate::proxy::Proxy;
use crate::session::Session;
use crate::session::SessionInner;
use crate::value::IntoValue;
use crate::value::Value;

/// The inbound call an exposed object is currently serving.
///
/// Calls made through the context carry this call's id as their linked id, so
/// a peer that is blocked waiting for this call's reply serves them on the
/// blocked task instead of queueing them behind it.
///
/// The context also carries key/value slots scoped to the call. Slots are
/// cleared when the call finishes.
#[derive(Clone)]
pub struct CallContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    session: Arc<SessionInner>,
    call_id: u32,
    slots: Mutex<HashMap<String, Value>>,
    finished: AtomicBool,
}

impl CallContext {
    pub(crate) fn new(session: Arc<SessionInner>, call_id: u32) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                session,
                call_id,
                slots: Mutex::new(HashMap::new()),
                finished: AtomicBool::new(false),
            }),
        }
    }

    /// Correlation id of the inbound call.
    pub fn call_id(&self) -> u32 {
        self.inner.call_id
    }

    pub fn session(&self) -> Session {
        Session::from_inner(self.inner.session.clone())
    }

    /// Whether the inbound call has already been answered.
    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire)
    }

    pub fn set(&self, key: impl Into<String>, value: impl IntoValue) {
        if let Ok(mut slots) = self.inner.slots.lock() {
            slots.insert(key.into(), value.into_value());
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.slots.lock().ok()?.get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.inner.slots.lock().ok()?.remove(key)
    }

    /// The linked id for outbound calls, while the inbound call is still running.
    pub(crate) fn link(&self) -> Option<u32> {
        if self.inner.call_id == 0 || self.is_finished() {
            None
        } else {
            Some(self.inner.call_id)
        }
    }

    pub(crate) fn finish(&self) {
        self.inner.finished.store(true, Ordering::Release);
        if let Ok(mut slots) = self.inner.slots.lock() {
            slots.clear();
        }
    }

    /// Invokes a method on a peer object as part of this call.
    pub async fn invoke(&self, proxy: &Proxy, method: &str, args: Vec<Value>) -> Result<Value> {
        let mut args = args;
        proxy.invoke_linked(self.link(), method, &mut args, proxy.default_timeout()).await
    }

    /// Like `invoke`, copying out and ref parameters back into `args`.
    pub async fn invoke_mut(&self, proxy: &Proxy, method: &str, args: &mut [Value]) -> Result<Value> {
        proxy.invoke_linked(self.link(), method, args, proxy.default_timeout()).await
    }

    /// Calls a peer callable as part of this call.
    pub async fn call(&self, callable: &Proxy, args: Vec<Value>) -> Result<Value> {
        callable.call_linked(self.link(), args, callable.default_timeout()).await
    }

    /// Reads a peer property as part of this call, bypassing the snapshot.
    pub async fn get_property(&self, proxy: &Proxy, name: &str) -> Result<Value> {
        proxy.property_linked(self.link(), name, None).await
    }

    /// Writes a peer property as part of this call.
    pub async fn set_property(&self, proxy: &Proxy, name: &str, value: impl IntoValue) -> Result<()> {
        proxy.property_linked(self.link(), name, Some(value.into_value())).await.map(|_| ())
    }
}
