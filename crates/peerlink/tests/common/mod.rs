#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tokio::time::Instant;

use peerlink::CallContext;
use peerlink::Callable;
use peerlink::ChannelTransport;
use peerlink::Exposed;
use peerlink::Fault;
use peerlink::FromValue;
use peerlink::RecordSchema;
use peerlink::RecordValue;
use peerlink::Schema;
use peerlink::Session;
use peerlink::SessionBuilder;
use peerlink::Shape;
use peerlink::Signature;
use peerlink::StreamDescriptor;
use peerlink::TypeInfo;
use peerlink::Value;
use peerlink::schema::field;
use peerlink::stream::STREAM_SCHEMA;
use peerlink::value::Array;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Two sessions talking over an in-memory transport.
pub fn pair(left_root: Value, right_root: Value) -> (Session, Session) {
    pair_with(|b| b.root(left_root), |b| b.root(right_root))
}

pub fn pair_with(
    left: impl FnOnce(SessionBuilder) -> SessionBuilder,
    right: impl FnOnce(SessionBuilder) -> SessionBuilder,
) -> (Session, Session) {
    init_tracing();
    let (a, b) = ChannelTransport::pair();
    let left = left(Session::builder(a).name("left")).open();
    let right = right(Session::builder(b).name("right")).open();
    (left, right)
}

/// Polls `check` until it holds, failing the test after a few seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn proxy_arg(args: &[Value], index: usize) -> peerlink::Result<peerlink::Proxy> {
    args.get(index)
        .and_then(Value::as_proxy)
        .cloned()
        .ok_or_else(|| Fault::Application(format!("argument {} is not a proxy", index)))
}

fn int_arg(args: &[Value], index: usize) -> i64 {
    args[index].as_i64().unwrap()
}

// --- Calculator ---

pub struct Calculator {
    counter: AtomicI32,
}

impl Calculator {
    pub fn new() -> Self {
        Self { counter: AtomicI32::new(0) }
    }
}

#[async_trait::async_trait]
impl Exposed for Calculator {
    fn type_info(&self) -> TypeInfo {
        TypeInfo::new("demo.Calculator")
            .implements("demo.IMath")
            .method("Add", Signature::new(Shape::Int64).param("a", Shape::Int64).param("b", Shape::Int64))
            .method("Divide", {
                Signature::new(Shape::Int32)
                    .param("a", Shape::Int32)
                    .param("b", Shape::Int32)
                    .out_param("remainder", Shape::Int32)
            })
            .method("Range", Signature::new(Shape::sequence(Shape::Int32)).param("n", Shape::Int32))
            .method("Pair", Signature::new(Shape::array(Shape::Int32)))
            .method("Fail", Signature::new(Shape::Void))
            .method("Panic", Signature::new(Shape::Void))
            .method("Sleep", Signature::new(Shape::Void).param("ms", Shape::UInt64))
            .method("Fragile", Signature::new(Shape::Object))
            .property("Name", Shape::String, false)
            .property("Counter", Shape::Int32, true)
    }

    fn snapshot(&self) -> Vec<(String, Value)> {
        vec![("Name".to_string(), Value::String("calc".into()))]
    }

    async fn call_method(&self, _ctx: &CallContext, method: &str, args: &mut [Value]) -> peerlink::Result<Value> {
        match method {
            "Add" => Ok(Value::Int64(int_arg(args, 0) + int_arg(args, 1))),
            "Divide" => {
                let (a, b) = (int_arg(args, 0) as i32, int_arg(args, 1) as i32);
                if b == 0 {
                    return Err(Fault::Application("division by zero".into()));
                }
                args[2] = Value::Int32(a % b);
                Ok(Value::Int32(a / b))
            }
            // Answers with a fixed-size array; callers declared a sequence.
            "Range" => {
                let items = (0..int_arg(args, 0) as i32).map(Value::Int32).collect();
                Ok(Value::Array(Array::new(Shape::Int32, items)))
            }
            // Answers with a list; callers declared a fixed-size array.
            "Pair" => Ok(Value::List(vec![Value::Int32(1), Value::Int32(2)])),
            "Fail" => Err(Fault::Application("requested failure".into())),
            "Panic" => panic!("calculator exploded"),
            "Fragile" => Ok(Value::object(Fragile)),
            "Sleep" => {
                tokio::time::sleep(Duration::from_millis(int_arg(args, 0) as u64)).await;
                Ok(Value::Null)
            }
            other => Err(Fault::MemberNotFound(other.to_string())),
        }
    }

    async fn get_property(&self, _ctx: &CallContext, name: &str) -> peerlink::Result<Value> {
        match name {
            "Name" => Ok(Value::String("calc".into())),
            "Counter" => Ok(Value::Int32(self.counter.load(Ordering::SeqCst))),
            other => Err(Fault::MemberNotFound(other.to_string())),
        }
    }

    async fn set_property(&self, _ctx: &CallContext, name: &str, value: Value) -> peerlink::Result<()> {
        match name {
            "Counter" => {
                self.counter.store(i32::from_value(value)?, Ordering::SeqCst);
                Ok(())
            }
            other => Err(Fault::MemberNotFound(other.to_string())),
        }
    }
}

/// Cannot describe itself without panicking.
pub struct Fragile;

#[async_trait::async_trait]
impl Exposed for Fragile {
    fn type_info(&self) -> TypeInfo {
        TypeInfo::new("demo.Fragile").property("State", Shape::String, false)
    }

    fn snapshot(&self) -> Vec<(String, Value)> {
        panic!("snapshot exploded")
    }

    async fn call_method(&self, _ctx: &CallContext, method: &str, _args: &mut [Value]) -> peerlink::Result<Value> {
        Err(Fault::MemberNotFound(method.to_string()))
    }
}

// --- References ---

pub struct Widget;

#[async_trait::async_trait]
impl Exposed for Widget {
    fn type_info(&self) -> TypeInfo {
        TypeInfo::new("demo.Widget").method("Poke", Signature::new(Shape::Int32)).property("Label", Shape::String, false)
    }

    fn snapshot(&self) -> Vec<(String, Value)> {
        vec![("Label".to_string(), Value::String("widget".into()))]
    }

    async fn call_method(&self, _ctx: &CallContext, method: &str, _args: &mut [Value]) -> peerlink::Result<Value> {
        match method {
            "Poke" => Ok(Value::Int32(1)),
            other => Err(Fault::MemberNotFound(other.to_string())),
        }
    }
}

/// Hands out the same shared object on every call.
pub struct Holder {
    pub item: Arc<dyn Exposed>,
}

#[async_trait::async_trait]
impl Exposed for Holder {
    fn type_info(&self) -> TypeInfo {
        TypeInfo::new("demo.Holder").method("Item", Signature::new(Shape::Object))
    }

    async fn call_method(&self, _ctx: &CallContext, method: &str, _args: &mut [Value]) -> peerlink::Result<Value> {
        match method {
            "Item" => Ok(Value::shared(self.item.clone())),
            other => Err(Fault::MemberNotFound(other.to_string())),
        }
    }
}

// --- Reentrancy ---

pub type Log = Arc<Mutex<Vec<String>>>;

pub fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn record(log: &Log, entry: &str) {
    log.lock().unwrap().push(entry.to_string());
}

/// Lives on the calling side and is called back while its caller waits.
pub struct Client {
    pub log: Log,
}

#[async_trait::async_trait]
impl Exposed for Client {
    fn type_info(&self) -> TypeInfo {
        TypeInfo::new("demo.Client")
            .method("g", Signature::new(Shape::Int32))
            .method("g2", Signature::new(Shape::Int32).param("server", Shape::Object))
    }

    async fn call_method(&self, ctx: &CallContext, method: &str, args: &mut [Value]) -> peerlink::Result<Value> {
        match method {
            "g" => {
                record(&self.log, "g");
                Ok(Value::Int32(7))
            }
            "g2" => {
                let server = proxy_arg(args, 0)?;
                let inner = ctx.invoke(&server, "h", vec![]).await?;
                record(&self.log, "g2");
                Ok(inner)
            }
            other => Err(Fault::MemberNotFound(other.to_string())),
        }
    }
}

pub struct Server {
    pub log: Log,
}

#[async_trait::async_trait]
impl Exposed for Server {
    fn type_info(&self) -> TypeInfo {
        TypeInfo::new("demo.Server")
            .method("f", Signature::new(Shape::Int32).param("client", Shape::Object))
            .method("f2", {
                Signature::new(Shape::Int32).param("client", Shape::Object).param("server", Shape::Object)
            })
            .method("h", Signature::new(Shape::Int32))
            .method("Apply", {
                Signature::new(Shape::Int32).param("callback", Shape::Callable).param("x", Shape::Int32)
            })
            .method("MakeCounter", Signature::new(Shape::Callable))
    }

    async fn call_method(&self, ctx: &CallContext, method: &str, args: &mut [Value]) -> peerlink::Result<Value> {
        match method {
            "f" => {
                let client = proxy_arg(args, 0)?;
                let seen = ctx.invoke(&client, "g", vec![]).await?;
                record(&self.log, &format!("f saw {}", seen.as_i64().unwrap_or(-1)));
                Ok(Value::Int32(42))
            }
            "f2" => {
                let client = proxy_arg(args, 0)?;
                let server = args[1].clone();
                let seen = ctx.invoke(&client, "g2", vec![server]).await?;
                record(&self.log, "f2");
                Ok(seen)
            }
            "h" => {
                record(&self.log, "h");
                Ok(Value::Int32(99))
            }
            "Apply" => {
                let callback = proxy_arg(args, 0)?;
                ctx.call(&callback, vec![args[1].clone()]).await
            }
            "MakeCounter" => {
                let next = Arc::new(AtomicI32::new(0));
                let counter = Callable::new(Signature::new(Shape::Int32), move |_, _| {
                    let n = next.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(Value::Int32(n)) }
                });
                Ok(Value::callable(counter))
            }
            other => Err(Fault::MemberNotFound(other.to_string())),
        }
    }
}

// --- Streams ---

/// Claims streams handed to it.
pub struct Sink {
    /// Receives everything `Attach` read before the stream ended.
    pub done: Mutex<Option<oneshot::Sender<Vec<u8>>>>,
}

impl Sink {
    pub fn new() -> (Self, oneshot::Receiver<Vec<u8>>) {
        let (tx, rx) = oneshot::channel();
        (Self { done: Mutex::new(Some(tx)) }, rx)
    }
}

#[async_trait::async_trait]
impl Exposed for Sink {
    fn type_info(&self) -> TypeInfo {
        TypeInfo::new("demo.Sink")
            .method("Attach", Signature::new(Shape::Void).param("stream", Shape::record(STREAM_SCHEMA)))
            .method("Hangup", Signature::new(Shape::Void).param("stream", Shape::record(STREAM_SCHEMA)))
    }

    async fn call_method(&self, ctx: &CallContext, method: &str, args: &mut [Value]) -> peerlink::Result<Value> {
        let descriptor = StreamDescriptor::from_value(args[0].clone())?;
        let mut stream = ctx
            .session()
            .claim_stream(&descriptor)
            .ok_or_else(|| Fault::Application("no such stream".into()))?;
        match method {
            // Echoes everything back until the peer closes.
            "Attach" => {
                let done = self.done.lock().unwrap().take();
                tokio::spawn(async move {
                    let mut seen = Vec::new();
                    let mut buf = [0u8; 64];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                seen.extend_from_slice(&buf[..n]);
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    if let Some(done) = done {
                        let _ = done.send(seen);
                    }
                });
                Ok(Value::Null)
            }
            // Closes straight away.
            "Hangup" => {
                stream.close();
                Ok(Value::Null)
            }
            other => Err(Fault::MemberNotFound(other.to_string())),
        }
    }
}

// --- Records ---

#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Schema for Point {
    fn schema() -> RecordSchema {
        RecordSchema::new("demo.Point").field("x", Shape::Int32).field("y", Shape::Int32)
    }

    fn to_record(&self) -> RecordValue {
        RecordValue::new("demo.Point").with("x", self.x).with("y", self.y)
    }

    fn from_record(mut record: RecordValue) -> peerlink::Result<Self> {
        Ok(Self { x: field(&mut record, "x")?, y: field(&mut record, "y")? })
    }
}
