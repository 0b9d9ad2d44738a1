//! # Session
//!
//! One end of a connection: a receive pump, a writer, and the tables that tie
//! them together.
//!
//! ## Philosophy
//!
//! - **Single Pump**: One task reads the transport. It resolves replies, reference releases
//!   and stream traffic itself and hands every inbound call to a task.
//! - **Single Writer**: Every frame goes through one outbox, so frames leave in the order
//!   they were produced and encoding never waits on the transport.
//! - **Fail Loudly, Once**: Transport loss and protocol violations close the session. Closing
//!   fails every pending call, forgets every handle and closes every stream exactly once.
//!
//! ## Handles on the wire
//!
//! Every handle in a frame is written in the sender's view and flipped with
//! `HandleId::across` by the receiver.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::builder::SessionBuilder;
use crate::codec::Codec;
use crate::codec::InboundRef;
use crate::codec::OutboundRef;
use crate::codec::References;
use crate::config::SessionConfig;
use crate::context::CallContext;
use crate::dispatch::Action;
use crate::dispatch::Completion;
use crate::dispatch::Continuation;
use crate::dispatch::InboundCall;
use crate::dispatch::PendingCalls;
use crate::dispatch::Wake;
use crate::dispatch::panic_message;
use crate::error::Fault;
use crate::error::Result;
use crate::frame::Body;
use crate::frame::CallEnvelope;
use crate::frame::Frame;
use crate::frame::ReplyValue;
use crate::frame::Request;
use crate::proxy::Proxy;
use crate::proxy::ProxyInner;
use crate::registry::HandleId;
use crate::registry::Registry;
use crate::registry::Release;
use crate::registry::Target;
use crate::schema::RecordSchema;
use crate::schema::SchemaRegistry;
use crate::shape::Capability;
use crate::stream::DuplexStream;
use crate::stream::Multiplexer;
use crate::stream::StreamDescriptor;
use crate::transport::Transport;
use crate::value::ObjectRef;
use crate::value::Value;

pub(crate) struct SessionInner {
    pub(crate) config: SessionConfig,
    transport: Arc<dyn Transport>,
    outbox: mpsc::UnboundedSender<Vec<u8>>,
    pub(crate) registry: Registry<ProxyInner>,
    pub(crate) calls: PendingCalls,
    pub(crate) streams: Multiplexer,
    pub(crate) schemas: SchemaRegistry,
    root: Mutex<Value>,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Reference bookkeeping of one session, as seen by the codec.
struct SessionRefs<'a> {
    session: &'a Arc<SessionInner>,
}

impl SessionRefs<'_> {
    /// Type info and snapshots come from application code. A panic there fails only this value.
    fn expose(&self, target: Target, snapshot: impl FnOnce() -> Vec<(String, Value)>) -> Result<OutboundRef> {
        let (id, capability) = describing(|| self.session.registry.expose(&target))??;
        Ok(match capability {
            Capability::Object(info) => match describing(snapshot) {
                Ok(snapshot) => OutboundRef::Object { id: id.raw(), info, snapshot },
                Err(fault) => {
                    self.session.registry.release(id, 1);
                    return Err(fault);
                }
            },
            Capability::Callable(signature) => OutboundRef::Callable { id: id.raw(), signature },
        })
    }

    fn import(&self, raw: u32, capability: Capability) -> Result<ObjectRef> {
        let id = HandleId(raw).across();
        if !id.is_imported() {
            return Err(Fault::Protocol(format!("peer described {} as its own", id)));
        }
        let session = self.session.clone();
        let (inner, release) = self
            .session
            .registry
            .import(id, move || Arc::new(ProxyInner::new(id, capability, session)))?;
        if let Some(release) = release {
            self.session.send_release(release);
        }
        Ok(ObjectRef::Remote(Proxy::from_inner(inner)))
    }
}

fn describing<T>(f: impl FnOnce() -> T) -> Result<T> {
    std::panic::catch_unwind(AssertUnwindSafe(f)).map_err(|panic| {
        Fault::Application(format!("object panicked while being sent: {}", panic_message(panic.as_ref())))
    })
}

impl References for SessionRefs<'_> {
    fn outbound(&self, object: &ObjectRef) -> Result<OutboundRef> {
        match object {
            ObjectRef::Remote(proxy) => {
                if !Arc::ptr_eq(&proxy.inner.session, self.session) {
                    return Err(Fault::Unmarshalable(format!("{:?} belongs to another session", proxy)));
                }
                Ok(OutboundRef::Handle(proxy.handle().raw()))
            }
            ObjectRef::Local(object) => self.expose(Target::Object(object.clone()), || object.snapshot()),
            ObjectRef::Callable(callable) => self.expose(Target::Callable(callable.clone()), Vec::new),
        }
    }

    fn inbound(&self, reference: InboundRef) -> Result<ObjectRef> {
        match reference {
            InboundRef::Handle(raw) => {
                let id = HandleId(raw).across();
                if id.is_imported() {
                    let inner = self.session.registry.lookup(id).ok_or(Fault::UnknownHandle(raw))?;
                    return Ok(ObjectRef::Remote(Proxy::from_inner(inner)));
                }
                match self.session.registry.resolve(id) {
                    Some((Target::Object(object), _)) => Ok(ObjectRef::Local(object)),
                    Some((Target::Callable(callable), _)) => Ok(ObjectRef::Callable(callable)),
                    None => Err(Fault::UnknownHandle(raw)),
                }
            }
            InboundRef::Callable { id, signature } => self.import(id, Capability::Callable(signature)),
            InboundRef::Object { id, info } => self.import(id, Capability::Object(info)),
        }
    }

    fn attach_snapshot(&self, object: &ObjectRef, snapshot: Vec<(String, Value)>) {
        if let ObjectRef::Remote(proxy) = object {
            proxy.inner.attach_snapshot(snapshot);
        }
    }

    fn rollback(&self, exposed: &[u32]) {
        for &id in exposed {
            self.session.registry.release(HandleId(id), 1);
        }
    }
}

impl SessionInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn root(&self) -> Value {
        self.root.lock().map(|root| root.clone()).unwrap_or_default()
    }

    /// Encodes `frame` and queues it for the writer.
    pub(crate) fn send_frame(self: &Arc<Self>, frame: &Frame) -> Result<()> {
        if self.is_closed() {
            return Err(Fault::ConnectionClosed);
        }
        let refs = SessionRefs { session: self };
        let codec = Codec::new(&self.schemas, &refs);
        let packet = frame.encode(&codec)?;
        self.outbox.send(packet).map_err(|_| Fault::ConnectionClosed)
    }

    /// Tells the exposer that references were dropped. Best effort.
    pub(crate) fn send_release(self: &Arc<Self>, release: Release) {
        if self.is_closed() {
            return;
        }
        let request = Request::ReferenceRelease { handle: release.handle.across().raw(), count: release.count };
        match self.send_frame(&Frame::request(0, None, request)) {
            Ok(()) => tracing::trace!(session = %self.config.name, handle = %release.handle, count = release.count, "release sent"),
            Err(fault) => tracing::debug!(session = %self.config.name, handle = %release.handle, %fault, "release not sent"),
        }
    }

    // ========================================================================
    //  Outbound calls
    // ========================================================================

    /// Sends `request` and waits for its reply, serving linked calls meanwhile.
    pub(crate) async fn call(
        self: &Arc<Self>,
        request: Request,
        link: Option<u32>,
        timeout: Option<Duration>,
    ) -> Result<ReplyValue> {
        let (id, mut mailbox) = self.calls.register_blocking()?;
        let kind = request.kind();
        if let Err(fault) = self.send_frame(&Frame::request(id, link, request)) {
            self.calls.withdraw(id);
            return Err(fault);
        }
        tracing::trace!(session = %self.config.name, id, ?link, kind, "call sent");

        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let wake = match deadline {
                Some(deadline) => {
                    let waited = tokio::time::timeout_at(deadline, mailbox.recv()).await;
                    match waited {
                        Ok(wake) => wake,
                        Err(_) => return self.give_up(id, mailbox),
                    }
                }
                None => mailbox.recv().await,
            };
            match wake {
                Some(Wake::Completed(outcome)) => return outcome,
                Some(Wake::Nested(call)) => Box::pin(self.clone().serve(call)).await,
                None => return Err(Fault::ConnectionClosed),
            }
        }
    }

    /// Abandons a timed out call. Linked calls already queued for it still run.
    fn give_up(self: &Arc<Self>, id: u32, mut mailbox: mpsc::UnboundedReceiver<Wake>) -> Result<ReplyValue> {
        self.calls.abandon(id);
        mailbox.close();
        let mut outcome = Err(Fault::Timeout);
        while let Ok(wake) = mailbox.try_recv() {
            match wake {
                Wake::Completed(completed) => outcome = completed,
                Wake::Nested(call) => {
                    tokio::spawn(self.clone().serve(call));
                }
            }
        }
        if matches!(outcome, Err(Fault::Timeout)) {
            tracing::debug!(session = %self.config.name, id, "call timed out");
        }
        outcome
    }

    /// Sends `request`; `done` runs once with the outcome.
    ///
    /// An error means the request was not sent and `done` will not run.
    pub(crate) fn call_with(self: &Arc<Self>, request: Request, link: Option<u32>, done: Continuation) -> Result<()> {
        let id = self.calls.register_continuation(done).map_err(|_| Fault::ConnectionClosed)?;
        if let Err(fault) = self.send_frame(&Frame::request(id, link, request)) {
            // Without a continuation to withdraw, `close` already ran it.
            if self.calls.withdraw(id).is_some() {
                return Err(fault);
            }
        }
        Ok(())
    }

    // ========================================================================
    //  Inbound traffic
    // ========================================================================

    async fn receive_loop(self: Arc<Self>) {
        let fault = loop {
            match self.transport.recv().await {
                Ok(Some(packet)) => {
                    if let Err(fault) = self.on_packet(&packet) {
                        break fault;
                    }
                }
                Ok(None) => break Fault::ConnectionClosed,
                Err(e) => break Fault::Transport(e),
            }
        };
        self.shutdown(Some(fault));
    }

    async fn writer_loop(self: Arc<Self>, mut outbox: mpsc::UnboundedReceiver<Vec<u8>>) {
        while let Some(packet) = outbox.recv().await {
            if let Err(e) = self.transport.send(&packet).await {
                self.shutdown(Some(Fault::Transport(e)));
                return;
            }
        }
    }

    fn on_packet(self: &Arc<Self>, packet: &[u8]) -> Result<()> {
        let refs = SessionRefs { session: self };
        let codec = Codec::new(&self.schemas, &refs);
        match Frame::decode(packet, &codec)? {
            Frame::Data { channel, bytes } => self.streams.deliver(channel, bytes),
            Frame::Close { channel } => self.streams.remote_close(channel),
            Frame::Control(CallEnvelope { correlation_id, body: Body::Reply(reply), .. }) => {
                match self.calls.complete(correlation_id, reply.map_err(Fault::Remote)) {
                    Completion::Delivered => {}
                    Completion::Late => {
                        tracing::debug!(session = %self.config.name, id = correlation_id, "late reply discarded")
                    }
                    Completion::Unknown => {
                        return Err(Fault::Protocol(format!("reply for unknown call {}", correlation_id)));
                    }
                }
            }
            Frame::Control(CallEnvelope { correlation_id, linked_call_id, body: Body::Request(request) }) => {
                self.on_request(correlation_id, linked_call_id, request)?;
            }
        }
        Ok(())
    }

    fn on_request(self: &Arc<Self>, id: u32, linked: Option<u32>, request: Request) -> Result<()> {
        let action = match request {
            Request::ReferenceRelease { handle, count } => {
                let handle = HandleId(handle).across();
                if self.registry.release(handle, count) {
                    tracing::trace!(session = %self.config.name, %handle, "exposed handle dropped");
                }
                return Ok(());
            }
            Request::CreateStream { channel } => {
                let outcome = self.streams.accept(self, channel).map(|()| ReplyValue::of(Value::Null));
                if id != 0 {
                    self.reply(id, outcome);
                }
                return Ok(());
            }
            Request::GetRoot => Action::GetRoot,
            Request::Echo(value) => Action::Echo(value),
            Request::MethodCall { target, method, signature, args } => match self.resolve(target)? {
                (Target::Object(object), Capability::Object(info)) => {
                    Action::Method { object, info, method, signature, args }
                }
                (_, capability) => Action::Reject(Fault::MemberNotFound(format!(
                    "{} has no method {}",
                    capability.type_name(),
                    method
                ))),
            },
            Request::PropertyAccess { target, name, shape, value } => match self.resolve(target)? {
                (Target::Object(object), Capability::Object(info)) => {
                    Action::Property { object, info, name, shape, value }
                }
                (_, capability) => Action::Reject(Fault::MemberNotFound(format!(
                    "{} has no property {}",
                    capability.type_name(),
                    name
                ))),
            },
            Request::DelegateCall { target, signature, args } => match self.resolve(target)? {
                (Target::Callable(callable), _) => Action::Delegate { callable, signature, args },
                (_, capability) => {
                    Action::Reject(Fault::MemberNotFound(format!("{} is not callable", capability.type_name())))
                }
            },
            Request::CanCastTo { target, interface } => {
                let info = match self.resolve(target)? {
                    (_, Capability::Object(info)) => Some(info),
                    (_, Capability::Callable(_)) => None,
                };
                Action::CanCastTo { info, interface }
            }
        };

        let call = InboundCall { id, linked, action };
        let call = match linked {
            Some(linked) => match self.calls.route_nested(linked, call) {
                None => {
                    tracing::trace!(session = %self.config.name, id, linked, "call routed to blocked caller");
                    return Ok(());
                }
                Some(call) => call,
            },
            None => call,
        };
        tokio::spawn(self.clone().serve(call));
        Ok(())
    }

    /// Looks up the exposed target of an inbound call. Unknown handles are fatal.
    fn resolve(&self, raw: u32) -> Result<(Target, Capability)> {
        let id = HandleId(raw).across();
        if id.is_imported() {
            return Err(Fault::UnknownHandle(raw));
        }
        self.registry.resolve(id).ok_or(Fault::UnknownHandle(raw))
    }

    async fn serve(self: Arc<Self>, call: InboundCall) {
        let InboundCall { id, action, .. } = call;
        let ctx = CallContext::new(self.clone(), id);
        let root = self.root();
        let outcome = AssertUnwindSafe(action.perform(&ctx, &root, &self.schemas)).catch_unwind().await;
        ctx.finish();
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(panic) => Err(Fault::Application(format!("handler panicked: {}", panic_message(panic.as_ref())))),
        };
        if id != 0 {
            self.reply(id, outcome);
        }
    }

    fn reply(self: &Arc<Self>, id: u32, outcome: Result<ReplyValue>) {
        let Err(fault) = self.send_frame(&Frame::reply(id, outcome.map_err(|fault| fault.to_remote()))) else {
            return;
        };
        if self.is_closed() {
            return;
        }
        // The result itself could not be encoded; the caller gets the fault instead.
        tracing::debug!(session = %self.config.name, id, %fault, "reply not encodable");
        if let Err(fault) = self.send_frame(&Frame::reply(id, Err(fault.to_remote()))) {
            tracing::warn!(session = %self.config.name, id, %fault, "reply lost");
        }
    }

    // ========================================================================
    //  Lifecycle
    // ========================================================================

    /// Closes the session. Idempotent.
    fn shutdown(&self, reason: Option<Fault>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        match &reason {
            Some(Fault::ConnectionClosed) | None => {
                tracing::debug!(session = %self.config.name, "session closed")
            }
            Some(fault) => tracing::warn!(session = %self.config.name, %fault, "session closed"),
        }

        let failed = self.calls.close();
        if failed > 0 {
            tracing::debug!(session = %self.config.name, count = failed, "pending calls failed");
        }
        self.registry.close();
        self.streams.close_all();
        let root = self.root.lock().map(|mut root| std::mem::take(&mut *root)).unwrap_or_default();
        drop(root);
        self.transport.shutdown();
        self.closed_tx.send_replace(true);

        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            task.abort();
        }
    }
}

/// One end of a peerlink connection.
///
/// Cheap to clone. The session runs until `close` is called, the peer hangs
/// up, or the peer violates the protocol.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn builder(transport: impl Transport) -> SessionBuilder {
        SessionBuilder::new(transport)
    }

    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn start(
        transport: Arc<dyn Transport>,
        root: Value,
        config: SessionConfig,
        schemas: Vec<RecordSchema>,
    ) -> Self {
        let registry = SchemaRegistry::new();
        registry.register(StreamDescriptor::schema());
        for schema in schemas {
            registry.register(schema);
        }

        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);
        let inner = Arc::new(SessionInner {
            registry: Registry::new(config.release_high_water),
            config,
            transport,
            outbox,
            calls: PendingCalls::new(),
            streams: Multiplexer::new(),
            schemas: registry,
            root: Mutex::new(root),
            closed: AtomicBool::new(false),
            closed_tx,
            tasks: Mutex::new(Vec::new()),
        });

        let reader = tokio::spawn(inner.clone().receive_loop());
        let writer = tokio::spawn(inner.clone().writer_loop(outbox_rx));
        if let Ok(mut tasks) = inner.tasks.lock() {
            tasks.push(reader);
            tasks.push(writer);
        }
        // The pump may have failed before its handle was stored.
        if inner.is_closed() {
            if let Ok(mut tasks) = inner.tasks.lock() {
                tasks.drain(..).for_each(|task| task.abort());
            }
        }

        tracing::debug!(session = %inner.config.name, "session opened");
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.inner.schemas
    }

    fn check_owner(&self, proxy: &Proxy) -> Result<()> {
        if Arc::ptr_eq(&proxy.inner.session, &self.inner) {
            Ok(())
        } else {
            Err(Fault::Unmarshalable(format!("{:?} belongs to another session", proxy)))
        }
    }

    // ========================================================================
    //  Calls
    // ========================================================================

    /// Fetches the peer's root value.
    pub async fn remote_root(&self) -> Result<Value> {
        let reply = self.inner.call(Request::GetRoot, None, self.inner.config.call_timeout).await?;
        Ok(reply.value)
    }

    /// Invokes a method on a peer object and waits for the result.
    pub async fn invoke_remote(&self, target: &Proxy, method: &str, args: Vec<Value>) -> Result<Value> {
        self.check_owner(target)?;
        target.invoke(method, args).await
    }

    /// Invokes a method on a peer object without waiting.
    pub fn invoke_remote_with<F>(&self, target: &Proxy, method: &str, args: Vec<Value>, done: F) -> Result<()>
    where
        F: FnOnce(Result<Value>) + Send + 'static,
    {
        self.check_owner(target)?;
        target.invoke_with(method, args, done)
    }

    /// Calls a peer callable and waits for the result.
    pub async fn call_remote(&self, callable: &Proxy, args: Vec<Value>) -> Result<Value> {
        self.check_owner(callable)?;
        callable.call(args).await
    }

    /// Calls a peer callable without waiting.
    pub fn call_remote_with<F>(&self, callable: &Proxy, args: Vec<Value>, done: F) -> Result<()>
    where
        F: FnOnce(Result<Value>) + Send + 'static,
    {
        self.check_owner(callable)?;
        callable.call_with(args, done)
    }

    /// Sends `value` to the peer and returns what comes back.
    pub async fn echo(&self, value: Value) -> Result<Value> {
        let reply = self.inner.call(Request::Echo(value), None, self.inner.config.call_timeout).await?;
        Ok(reply.value)
    }

    // ========================================================================
    //  Streams
    // ========================================================================

    /// Opens a duplex byte stream.
    ///
    /// Returns the local end and the descriptor the peer claims the other end with.
    pub async fn open_duplex_pair(&self) -> Result<(DuplexStream, StreamDescriptor)> {
        let stream = self.inner.streams.open_local(&self.inner)?;
        let descriptor = StreamDescriptor { channel: stream.id() };
        let request = Request::CreateStream { channel: stream.id() };
        self.inner.call(request, None, self.inner.config.call_timeout).await?;
        tracing::debug!(session = %self.inner.config.name, channel = stream.id(), "stream opened");
        Ok((stream, descriptor))
    }

    /// Takes the local end of a stream the peer opened. Each end can be claimed once.
    pub fn claim_stream(&self, descriptor: &StreamDescriptor) -> Option<DuplexStream> {
        self.inner.streams.claim(*descriptor)
    }

    // ========================================================================
    //  Lifecycle
    // ========================================================================

    /// Closes the session. Pending calls fail with `ConnectionClosed`. Idempotent.
    pub fn close(&self) {
        self.inner.shutdown(None);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Resolves once the session is closed, for whatever reason.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    // ========================================================================
    //  Diagnostics
    // ========================================================================

    /// Objects and callables the peer currently holds references to.
    pub fn exposed_count(&self) -> usize {
        self.inner.registry.exposed_len()
    }

    /// Peer objects this side currently holds proxies for.
    pub fn imported_count(&self) -> usize {
        self.inner.registry.imported_len()
    }

    /// Outgoing calls still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.calls.len()
    }

    /// Open stream channels.
    pub fn stream_count(&self) -> usize {
        self.inner.streams.len()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.inner.config.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Opens a session with default settings. Must be called within a tokio runtime.
pub fn open_session(transport: impl Transport, root: Value) -> Session {
    Session::builder(transport).root(root).open()
}
