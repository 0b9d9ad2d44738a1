//! # Call Dispatcher
//!
//! Bookkeeping for calls this side has sent and not yet seen answered.
//!
//! ## Philosophy
//!
//! - **Waiters, Not Threads**: A blocked caller owns a private mailbox. Replies and nested
//!   inbound calls linked to its call both arrive there, so a blocked caller keeps serving
//!   its peer until its own reply shows up.
//! - **Exactly Once**: Every registered call is resolved once: by its reply, by a timeout,
//!   or by `close`.
//! - **Continuations Run Elsewhere**: A continuation runs on the blocking pool, never on
//!   the thread that matched its reply. A panicking continuation is logged and forgotten.
//!
//! ## Invariants
//!
//! - Correlation id 0 is never allocated; it marks notifications.
//! - An id is never reused while its call is pending or recently abandoned.

use std::any::Any;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use tokio::sync::mpsc;

use crate::context::CallContext;
use crate::error::Fault;
use crate::error::Result;
use crate::frame::ReplyValue;
use crate::object::Callable;
use crate::object::Exposed;
use crate::schema::SchemaRegistry;
use crate::shape::Shape;
use crate::shape::Signature;
use crate::shape::TypeInfo;
use crate::value::Value;

/// Abandoned ids kept around so late replies can be told apart from bogus ones.
const ABANDONED_CAPACITY: usize = 4096;

/// Called once with the outcome of a non-blocking call.
pub type Continuation = Box<dyn FnOnce(Result<ReplyValue>) + Send>;

/// Runs `done` on the blocking pool, or in place when there is no runtime.
fn resume(done: Continuation, outcome: Result<ReplyValue>) {
    let run = move || {
        if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(move || done(outcome))) {
            tracing::warn!(panic = %panic_message(panic.as_ref()), "continuation panicked");
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(run);
        }
        Err(_) => run(),
    }
}

/// The text a panic was raised with, if it carried any.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "no message".to_string()
    }
}

/// An inbound call, with its target already resolved.
pub(crate) struct InboundCall {
    pub id: u32,
    pub linked: Option<u32>,
    pub action: Action,
}

pub(crate) enum Action {
    GetRoot,
    Method { object: Arc<dyn Exposed>, info: TypeInfo, method: String, signature: Signature, args: Vec<Value> },
    Property { object: Arc<dyn Exposed>, info: TypeInfo, name: String, shape: Shape, value: Option<Value> },
    Delegate { callable: Callable, signature: Signature, args: Vec<Value> },
    CanCastTo { info: Option<TypeInfo>, interface: String },
    Echo(Value),
    /// The request named a member the target does not have.
    Reject(Fault),
}

impl Action {
    /// Runs the call against its target and shapes the result for the caller.
    pub(crate) async fn perform(self, ctx: &CallContext, root: &Value, schemas: &SchemaRegistry) -> Result<ReplyValue> {
        match self {
            Action::GetRoot => Ok(ReplyValue::of(root.clone())),
            Action::Method { object, info, method, signature, mut args } => {
                // Objects may serve methods their type info does not list.
                let declared = info
                    .find_method(&method, args.len())
                    .map(|m| m.signature.clone())
                    .unwrap_or_else(|| signature.clone());
                declared.fix_args(&mut args, schemas)?;
                let value = object.call_method(ctx, &method, &mut args).await?;
                let value = declared.ret.fix(value, schemas)?;
                let value = signature.ret.fix(value, schemas)?;
                Ok(ReplyValue { value, outs: declared.collect_outs(&args) })
            }
            Action::Property { object, info, name, shape, value: None } => {
                let value = object.get_property(ctx, &name).await?;
                let value = match info.find_property(&name) {
                    Some(prop) => prop.shape.fix(value, schemas)?,
                    None => value,
                };
                Ok(ReplyValue::of(shape.fix(value, schemas)?))
            }
            Action::Property { object, info, name, value: Some(value), .. } => {
                let declared = info.find_property(&name);
                if declared.is_some_and(|prop| !prop.writable) {
                    return Err(Fault::MemberNotFound(format!("{}.{} is read-only", info.name, name)));
                }
                let value = match declared {
                    Some(prop) => prop.shape.fix(value, schemas)?,
                    None => value,
                };
                object.set_property(ctx, &name, value).await?;
                Ok(ReplyValue::of(Value::Null))
            }
            Action::Delegate { callable, signature, mut args } => {
                let declared = callable.signature().clone();
                declared.fix_args(&mut args, schemas)?;
                let value = callable.invoke(ctx.clone(), args).await?;
                let value = declared.ret.fix(value, schemas)?;
                Ok(ReplyValue::of(signature.ret.fix(value, schemas)?))
            }
            Action::CanCastTo { info, interface } => {
                Ok(ReplyValue::of(Value::Bool(info.is_some_and(|info| info.is_a(&interface)))))
            }
            Action::Echo(value) => Ok(ReplyValue::of(value)),
            Action::Reject(fault) => Err(fault),
        }
    }
}

/// What a blocked caller is woken with.
pub(crate) enum Wake {
    Completed(Result<ReplyValue>),
    Nested(InboundCall),
}

enum Waiter {
    Blocking(mpsc::UnboundedSender<Wake>),
    Continuation(Continuation),
}

/// Result of matching a reply against the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Completion {
    Delivered,
    /// The caller gave up on this id already.
    Late,
    /// This side never issued the id.
    Unknown,
}

struct Table {
    calls: HashMap<u32, Waiter>,
    abandoned: HashSet<u32>,
    abandoned_order: VecDeque<u32>,
    next_id: u32,
    closed: bool,
}

pub(crate) struct PendingCalls {
    table: Mutex<Table>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table {
                calls: HashMap::new(),
                abandoned: HashSet::new(),
                abandoned_order: VecDeque::new(),
                next_id: 1,
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn allocate(table: &mut Table) -> u32 {
        loop {
            let id = table.next_id;
            table.next_id = table.next_id.wrapping_add(1);
            if id != 0 && !table.calls.contains_key(&id) && !table.abandoned.contains(&id) {
                return id;
            }
        }
    }

    /// Registers a call whose caller will wait on the returned mailbox.
    pub fn register_blocking(&self) -> Result<(u32, mpsc::UnboundedReceiver<Wake>)> {
        let mut table = self.lock();
        if table.closed {
            return Err(Fault::ConnectionClosed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Self::allocate(&mut table);
        table.calls.insert(id, Waiter::Blocking(tx));
        Ok((id, rx))
    }

    /// Registers a call resolved through `done`. Hands `done` back if the table is closed.
    pub fn register_continuation(&self, done: Continuation) -> std::result::Result<u32, Continuation> {
        let mut table = self.lock();
        if table.closed {
            return Err(done);
        }
        let id = Self::allocate(&mut table);
        table.calls.insert(id, Waiter::Continuation(done));
        Ok(id)
    }

    /// Removes a call whose request never left; hands back its continuation if it had one.
    pub fn withdraw(&self, id: u32) -> Option<Continuation> {
        match self.lock().calls.remove(&id) {
            Some(Waiter::Continuation(done)) => Some(done),
            _ => None,
        }
    }

    /// Delivers a reply to whoever waits for `id`.
    pub fn complete(&self, id: u32, outcome: Result<ReplyValue>) -> Completion {
        let waiter = {
            let mut table = self.lock();
            match table.calls.remove(&id) {
                Some(waiter) => waiter,
                None if table.abandoned.remove(&id) => {
                    table.abandoned_order.retain(|&a| a != id);
                    return Completion::Late;
                }
                None => return Completion::Unknown,
            }
        };
        match waiter {
            Waiter::Blocking(tx) => {
                // A dropped receiver means the caller's task went away; nothing to do.
                let _ = tx.send(Wake::Completed(outcome));
            }
            Waiter::Continuation(done) => resume(done, outcome),
        }
        Completion::Delivered
    }

    /// Hands an inbound call to the blocked caller of `linked`.
    ///
    /// Returns the call back when nobody is blocked on `linked`.
    pub fn route_nested(&self, linked: u32, call: InboundCall) -> Option<InboundCall> {
        let table = self.lock();
        match table.calls.get(&linked) {
            Some(Waiter::Blocking(tx)) => match tx.send(Wake::Nested(call)) {
                Ok(()) => None,
                Err(mpsc::error::SendError(Wake::Nested(call))) => Some(call),
                Err(_) => None,
            },
            _ => Some(call),
        }
    }

    /// Gives up on `id`; a reply arriving later is discarded.
    pub fn abandon(&self, id: u32) {
        let mut table = self.lock();
        if table.calls.remove(&id).is_none() {
            return;
        }
        table.abandoned.insert(id);
        table.abandoned_order.push_back(id);
        while table.abandoned_order.len() > ABANDONED_CAPACITY {
            if let Some(oldest) = table.abandoned_order.pop_front() {
                table.abandoned.remove(&oldest);
            }
        }
    }

    /// Fails every pending call with `ConnectionClosed` and refuses new ones. Idempotent.
    ///
    /// Returns how many calls were failed.
    pub fn close(&self) -> usize {
        let drained: Vec<Waiter> = {
            let mut table = self.lock();
            table.closed = true;
            table.abandoned.clear();
            table.abandoned_order.clear();
            table.calls.drain().map(|(_, w)| w).collect()
        };
        let count = drained.len();
        for waiter in drained {
            match waiter {
                Waiter::Blocking(tx) => {
                    let _ = tx.send(Wake::Completed(Err(Fault::ConnectionClosed)));
                }
                Waiter::Continuation(done) => resume(done, Err(Fault::ConnectionClosed)),
            }
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().calls.len()
    }
}
