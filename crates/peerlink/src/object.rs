//! # Exposed Objects
//!
//! What application code implements so the peer can call into it.
//!
//! An `Exposed` object is passed by reference: the peer receives a proxy and
//! every method call, property read or property write travels back here.
//! A `Callable` is the same idea for a single function.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::context::CallContext;
use crate::error::Fault;
use crate::error::Result;
use crate::shape::Signature;
use crate::shape::TypeInfo;
use crate::value::Value;

/// An object the peer may call into.
///
/// `type_info` is read once, when the object is first exposed. `snapshot` is
/// read every time the object is sent and lets the peer answer property reads
/// without a round trip.
#[async_trait::async_trait]
pub trait Exposed: Send + Sync + 'static {
    fn type_info(&self) -> TypeInfo;

    /// Property values shipped along with the reference.
    fn snapshot(&self) -> Vec<(String, Value)> {
        Vec::new()
    }

    /// Invokes `method`. Arguments are already fixed to the declared parameter shapes;
    /// out and ref parameters are written back through `args`.
    async fn call_method(&self, ctx: &CallContext, method: &str, args: &mut [Value]) -> Result<Value>;

    async fn get_property(&self, ctx: &CallContext, name: &str) -> Result<Value> {
        let _ = ctx;
        Err(Fault::MemberNotFound(name.to_string()))
    }

    async fn set_property(&self, ctx: &CallContext, name: &str, value: Value) -> Result<()> {
        let _ = (ctx, value);
        Err(Fault::MemberNotFound(name.to_string()))
    }
}

type CallableFn = dyn Fn(CallContext, Vec<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync;

/// A function the peer may call.
///
/// Clones share identity: sending two clones yields the same handle.
#[derive(Clone)]
pub struct Callable {
    signature: Signature,
    func: Arc<CallableFn>,
}

impl Callable {
    pub fn new<F, Fut>(signature: Signature, func: F) -> Self
    where
        F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            signature,
            func: Arc::new(move |ctx, args| Box::pin(func(ctx, args))),
        }
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub(crate) fn invoke(&self, ctx: CallContext, args: Vec<Value>) -> BoxFuture<'static, Result<Value>> {
        (self.func)(ctx, args)
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.func) as *const () as usize
    }
}

impl PartialEq for Callable {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.func), Arc::as_ptr(&other.func))
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable").field("signature", &self.signature).finish()
    }
}
