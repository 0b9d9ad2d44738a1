//! # Proxies
//!
//! Local stand-ins for objects and callables living in the peer.
//!
//! ## Philosophy
//!
//! - **One Per Handle**: While any clone is alive, every import of the same handle yields
//!   the same proxy. Clones are cheap and share identity.
//! - **Snapshot First**: Property reads are answered from the snapshot shipped with the
//!   reference when it has the property; `fetch` always asks the peer.
//! - **Release on Drop**: When the last clone is dropped the proxy hands every reference it
//!   received back to the exposer in a single notification.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::Fault;
use crate::error::Result;
use crate::frame::ReplyValue;
use crate::frame::Request;
use crate::registry::HandleId;
use crate::session::Session;
use crate::session::SessionInner;
use crate::shape::Capability;
use crate::shape::Shape;
use crate::shape::Signature;
use crate::shape::TypeInfo;
use crate::value::IntoValue;
use crate::value::ObjectRef;
use crate::value::Value;

/// Method name answered locally with the proxy's type.
pub const GET_TYPE: &str = "GetType";

/// A reference to an object or callable owned by the peer.
#[derive(Clone)]
pub struct Proxy {
    pub(crate) inner: Arc<ProxyInner>,
}

pub(crate) struct ProxyInner {
    handle: HandleId,
    capability: Capability,
    snapshot: Mutex<Vec<(String, Slot)>>,
    pub(crate) session: Arc<SessionInner>,
}

enum Slot {
    Value(Value),
    /// The property refers to the proxy itself. Not stored, so the proxy does not keep itself alive.
    Itself,
}

impl ProxyInner {
    pub(crate) fn new(handle: HandleId, capability: Capability, session: Arc<SessionInner>) -> Self {
        Self { handle, capability, snapshot: Mutex::new(Vec::new()), session }
    }

    pub(crate) fn attach_snapshot(&self, fields: Vec<(String, Value)>) {
        let slots: Vec<(String, Slot)> = fields
            .into_iter()
            .map(|(name, value)| match &value {
                Value::Object(ObjectRef::Remote(p)) if std::ptr::eq(Arc::as_ptr(&p.inner), self) => {
                    (name, Slot::Itself)
                }
                _ => (name, Slot::Value(value)),
            })
            .collect();
        let old = match self.snapshot.lock() {
            Ok(mut snapshot) => std::mem::replace(&mut *snapshot, slots),
            Err(_) => return,
        };
        drop(old);
    }
}

impl Drop for ProxyInner {
    fn drop(&mut self) {
        if let Some(release) = self.session.registry.finalize(self.handle, self as *const ProxyInner) {
            self.session.send_release(release);
        }
    }
}

impl Proxy {
    pub(crate) fn from_inner(inner: Arc<ProxyInner>) -> Self {
        Self { inner }
    }

    /// The handle as this side stores it.
    pub fn handle(&self) -> HandleId {
        self.inner.handle
    }

    pub fn session(&self) -> Session {
        Session::from_inner(self.inner.session.clone())
    }

    pub fn capability(&self) -> &Capability {
        &self.inner.capability
    }

    /// The qualified type name, known without a round trip.
    pub fn type_name(&self) -> &str {
        self.inner.capability.type_name()
    }

    pub fn type_info(&self) -> Option<&TypeInfo> {
        match &self.inner.capability {
            Capability::Object(info) => Some(info),
            Capability::Callable(_) => None,
        }
    }

    pub fn signature(&self) -> Option<&Signature> {
        match &self.inner.capability {
            Capability::Callable(sig) => Some(sig),
            Capability::Object(_) => None,
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(self.inner.capability, Capability::Callable(_))
    }

    pub fn ptr_eq(a: &Proxy, b: &Proxy) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// A property value from the snapshot shipped with the reference.
    pub fn snapshot(&self, name: &str) -> Option<Value> {
        let snapshot = self.inner.snapshot.lock().ok()?;
        let (_, slot) = snapshot.iter().find(|(n, _)| n == name)?;
        Some(match slot {
            Slot::Value(v) => v.clone(),
            Slot::Itself => Value::proxy(self.clone()),
        })
    }

    pub(crate) fn default_timeout(&self) -> Option<Duration> {
        self.inner.session.config.call_timeout
    }

    fn object_info(&self) -> Result<&TypeInfo> {
        self.type_info().ok_or_else(|| Fault::MemberNotFound("callable has no members".to_string()))
    }

    // ========================================================================
    //  Methods
    // ========================================================================

    /// Invokes a method on the peer object and waits for the result.
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let mut args = args;
        self.invoke_linked(None, method, &mut args, self.default_timeout()).await
    }

    /// Like `invoke`, copying out and ref parameters back into `args`.
    pub async fn invoke_mut(&self, method: &str, args: &mut [Value]) -> Result<Value> {
        self.invoke_linked(None, method, args, self.default_timeout()).await
    }

    /// Like `invoke` with an explicit deadline instead of the session default.
    pub async fn invoke_within(&self, method: &str, args: Vec<Value>, timeout: Duration) -> Result<Value> {
        let mut args = args;
        self.invoke_linked(None, method, &mut args, Some(timeout)).await
    }

    /// Invokes a method without waiting; `done` runs once with the result, on the blocking pool.
    pub fn invoke_with<F>(&self, method: &str, args: Vec<Value>, done: F) -> Result<()>
    where
        F: FnOnce(Result<Value>) + Send + 'static,
    {
        if method == GET_TYPE && args.is_empty() {
            done(Ok(Value::Type(self.type_name().to_string())));
            return Ok(());
        }
        let signature = self.method_signature(method, args.len())?;
        let ret = signature.ret.clone();
        let session = self.inner.session.clone();
        let request = Request::MethodCall {
            target: self.handle().raw(),
            method: method.to_string(),
            signature,
            args,
        };
        self.inner.session.call_with(
            request,
            None,
            Box::new(move |outcome| done(outcome.and_then(|reply| ret.fix(reply.value, &session.schemas)))),
        )
    }

    fn method_signature(&self, method: &str, arity: usize) -> Result<Signature> {
        let info = self.object_info()?;
        Ok(info
            .find_method(method, arity)
            .map(|m| m.signature.clone())
            .unwrap_or_else(|| Signature::dynamic(arity)))
    }

    pub(crate) async fn invoke_linked(
        &self,
        link: Option<u32>,
        method: &str,
        args: &mut [Value],
        timeout: Option<Duration>,
    ) -> Result<Value> {
        if method == GET_TYPE && args.is_empty() {
            return Ok(Value::Type(self.type_name().to_string()));
        }
        let signature = self.method_signature(method, args.len())?;
        let request = Request::MethodCall {
            target: self.handle().raw(),
            method: method.to_string(),
            signature: signature.clone(),
            args: args.to_vec(),
        };
        let reply = self.inner.session.call(request, link, timeout).await?;
        self.finish_reply(&signature, args, reply)
    }

    fn finish_reply(&self, signature: &Signature, args: &mut [Value], reply: ReplyValue) -> Result<Value> {
        let schemas = &self.inner.session.schemas;
        signature.apply_outs(args, reply.outs, schemas)?;
        signature.ret.fix(reply.value, schemas)
    }

    // ========================================================================
    //  Callables
    // ========================================================================

    /// Calls the peer callable and waits for the result.
    pub async fn call(&self, args: Vec<Value>) -> Result<Value> {
        self.call_linked(None, args, self.default_timeout()).await
    }

    /// Calls the peer callable without waiting; `done` runs once with the result.
    pub fn call_with<F>(&self, args: Vec<Value>, done: F) -> Result<()>
    where
        F: FnOnce(Result<Value>) + Send + 'static,
    {
        let signature = self.callable_signature()?.clone();
        let ret = signature.ret.clone();
        let session = self.inner.session.clone();
        let request = Request::DelegateCall { target: self.handle().raw(), signature, args };
        self.inner.session.call_with(
            request,
            None,
            Box::new(move |outcome| done(outcome.and_then(|reply| ret.fix(reply.value, &session.schemas)))),
        )
    }

    fn callable_signature(&self) -> Result<&Signature> {
        self.signature()
            .ok_or_else(|| Fault::MemberNotFound(format!("{} is not callable", self.type_name())))
    }

    pub(crate) async fn call_linked(
        &self,
        link: Option<u32>,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let signature = self.callable_signature()?.clone();
        let request = Request::DelegateCall { target: self.handle().raw(), signature: signature.clone(), args };
        let reply = self.inner.session.call(request, link, timeout).await?;
        signature.ret.fix(reply.value, &self.inner.session.schemas)
    }

    // ========================================================================
    //  Properties
    // ========================================================================

    /// Reads a property, from the snapshot when it has one.
    pub async fn get(&self, name: &str) -> Result<Value> {
        match self.snapshot(name) {
            Some(value) => Ok(value),
            None => self.fetch(name).await,
        }
    }

    /// Reads a property from the peer.
    pub async fn fetch(&self, name: &str) -> Result<Value> {
        self.property_linked(None, name, None).await
    }

    /// Writes a property on the peer.
    pub async fn set(&self, name: &str, value: impl IntoValue) -> Result<()> {
        self.property_linked(None, name, Some(value.into_value())).await.map(|_| ())
    }

    pub(crate) async fn property_linked(&self, link: Option<u32>, name: &str, value: Option<Value>) -> Result<Value> {
        let info = self.object_info()?;
        let shape = info.find_property(name).map(|p| p.shape.clone()).unwrap_or(Shape::Any);
        let written = value.clone();
        let request = Request::PropertyAccess {
            target: self.handle().raw(),
            name: name.to_string(),
            shape: shape.clone(),
            value,
        };
        let reply = self.inner.session.call(request, link, self.default_timeout()).await?;
        match written {
            Some(value) => {
                self.refresh_snapshot(name, value);
                Ok(Value::Null)
            }
            None => shape.fix(reply.value, &self.inner.session.schemas),
        }
    }

    fn refresh_snapshot(&self, name: &str, value: Value) {
        let Ok(mut snapshot) = self.inner.snapshot.lock() else {
            return;
        };
        if let Some((_, slot)) = snapshot.iter_mut().find(|(n, _)| n == name) {
            *slot = match &value {
                Value::Object(ObjectRef::Remote(p)) if Proxy::ptr_eq(p, self) => Slot::Itself,
                _ => Slot::Value(value),
            };
        }
    }

    // ========================================================================
    //  Types
    // ========================================================================

    /// Whether the peer object can be treated as `interface`.
    ///
    /// Answered locally when the shipped type info already says yes.
    pub async fn can_cast_to(&self, interface: &str) -> Result<bool> {
        if self.type_info().is_some_and(|info| info.is_a(interface)) {
            return Ok(true);
        }
        let request = Request::CanCastTo { target: self.handle().raw(), interface: interface.to_string() };
        let reply = self.inner.session.call(request, None, self.default_timeout()).await?;
        match reply.value {
            Value::Bool(b) => Ok(b),
            other => Err(Fault::mismatch("bool", other.kind_name())),
        }
    }
}

impl PartialEq for Proxy {
    fn eq(&self, other: &Self) -> bool {
        Proxy::ptr_eq(self, other)
    }
}

impl Eq for Proxy {}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Proxy({} {})", self.type_name(), self.handle())
    }
}
