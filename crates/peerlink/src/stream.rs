//! # Stream Multiplexer
//!
//! Byte streams sharing the connection with control traffic.
//!
//! ## Philosophy
//!
//! - **Channel Per Stream**: Each stream owns a channel number. Channel 0 is control.
//! - **Parity by Owner**: The side that allocates a channel stores it with the high bit clear;
//!   the other side stores it with the high bit set. Both sides can open streams without
//!   coordinating.
//! - **Hand-off by Descriptor**: The opener gets its end immediately and passes a
//!   `StreamDescriptor` to the peer in any call; the peer claims its end with it.
//!
//! ## Invariants
//!
//! - Bytes written on one end arrive on the other end in order.
//! - Closing either end closes the pair. Data the closed end had not read yet is discarded.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;

use dashmap::DashMap;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::ReadBuf;
use tokio::sync::mpsc;

use crate::error::Fault;
use crate::error::Result;
use crate::frame::Frame;
use crate::schema::RecordSchema;
use crate::session::SessionInner;
use crate::shape::Shape;
use crate::value::FromValue;
use crate::value::IntoValue;
use crate::value::RecordValue;
use crate::value::Value;

/// Distinguishes channels allocated by the peer from channels allocated here.
pub const PEER_BIT: u16 = 0x8000;

const MAX_CHANNEL: u16 = PEER_BIT - 1;

/// Schema name of a descriptor travelling as a value.
pub const STREAM_SCHEMA: &str = "peerlink.Stream";

/// Identifies one duplex stream to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamDescriptor {
    /// The channel as the opening side stores it.
    pub channel: u16,
}

impl StreamDescriptor {
    pub fn schema() -> RecordSchema {
        RecordSchema::new(STREAM_SCHEMA).field("channel", Shape::UInt16)
    }
}

impl IntoValue for StreamDescriptor {
    fn into_value(self) -> Value {
        Value::Record(RecordValue::new(STREAM_SCHEMA).with("channel", self.channel))
    }
}

impl FromValue for StreamDescriptor {
    fn from_value(value: Value) -> Result<Self> {
        let Value::Record(mut record) = value else {
            return Err(Fault::mismatch(STREAM_SCHEMA, value.kind_name()));
        };
        let channel = crate::schema::field::<u16>(&mut record, "channel")?;
        Ok(Self { channel })
    }
}

struct ChannelState {
    closed: AtomicBool,
}

struct Channel {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    state: Arc<ChannelState>,
}

/// Channel table of one session.
pub(crate) struct Multiplexer {
    channels: DashMap<u16, Channel>,
    /// Streams the peer opened that nobody has claimed yet.
    unclaimed: DashMap<u16, DuplexStream>,
    next: Mutex<u16>,
}

impl Multiplexer {
    pub fn new() -> Self {
        Self { channels: DashMap::new(), unclaimed: DashMap::new(), next: Mutex::new(1) }
    }

    fn allocate(&self) -> Result<u16> {
        let mut next = self.next.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for _ in 0..MAX_CHANNEL {
            let id = *next;
            *next = if id >= MAX_CHANNEL { 1 } else { id + 1 };
            if !self.channels.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(Fault::Application("no free stream channel".into()))
    }

    fn register(&self, session: &Arc<SessionInner>, key: u16) -> DuplexStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(ChannelState { closed: AtomicBool::new(false) });
        self.channels.insert(key, Channel { tx, state: state.clone() });
        DuplexStream {
            id: key,
            session: session.clone(),
            rx,
            state,
            pending: Vec::new(),
            offset: 0,
        }
    }

    /// Allocates a channel for a stream this side opens.
    pub fn open_local(&self, session: &Arc<SessionInner>) -> Result<DuplexStream> {
        let id = self.allocate()?;
        Ok(self.register(session, id))
    }

    /// Accepts a channel the peer allocated. `channel` is the peer's view.
    pub fn accept(&self, session: &Arc<SessionInner>, channel: u16) -> Result<()> {
        if channel == 0 || channel & PEER_BIT != 0 {
            return Err(Fault::Protocol(format!("invalid stream channel {:#06x}", channel)));
        }
        let key = channel | PEER_BIT;
        if self.channels.contains_key(&key) {
            return Err(Fault::Application(format!("stream channel {} already open", channel)));
        }
        let stream = self.register(session, key);
        self.unclaimed.insert(key, stream);
        Ok(())
    }

    /// Takes the local end of a stream the peer opened.
    pub fn claim(&self, descriptor: StreamDescriptor) -> Option<DuplexStream> {
        self.unclaimed.remove(&(descriptor.channel | PEER_BIT)).map(|(_, stream)| stream)
    }

    /// Routes inbound bytes. `channel` is the sender's view.
    pub fn deliver(&self, channel: u16, bytes: Vec<u8>) {
        let key = channel ^ PEER_BIT;
        match self.channels.get(&key) {
            Some(entry) => {
                let _ = entry.tx.send(bytes);
            }
            None => tracing::debug!(channel = key, "data for closed stream dropped"),
        }
    }

    /// The peer closed its end. `channel` is the sender's view.
    pub fn remote_close(&self, channel: u16) {
        let key = channel ^ PEER_BIT;
        if let Some((_, entry)) = self.channels.remove(&key) {
            entry.state.closed.store(true, Ordering::Release);
            tracing::debug!(channel = key, "stream closed by peer");
        }
        // An unclaimed stream the peer already gave up on is useless.
        let unclaimed = self.unclaimed.remove(&key);
        drop(unclaimed);
    }

    fn local_close(&self, key: u16) -> bool {
        self.channels.remove(&key).is_some()
    }

    /// Closes every stream. Pending readers see end of stream.
    pub fn close_all(&self) {
        let keys: Vec<u16> = self.channels.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, entry)) = self.channels.remove(&key) {
                entry.state.closed.store(true, Ordering::Release);
            }
        }
        let keys: Vec<u16> = self.unclaimed.iter().map(|e| *e.key()).collect();
        let streams: Vec<DuplexStream> = keys
            .into_iter()
            .filter_map(|key| self.unclaimed.remove(&key).map(|(_, s)| s))
            .collect();
        drop(streams);
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }
}

/// One end of a duplex byte stream.
///
/// Implements tokio's `AsyncRead` and `AsyncWrite`. Writes never block: each
/// write becomes one data frame. Dropping the stream closes it.
pub struct DuplexStream {
    id: u16,
    session: Arc<SessionInner>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    state: Arc<ChannelState>,
    pending: Vec<u8>,
    offset: usize,
}

impl DuplexStream {
    /// The channel as this side stores it.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// The channel as the peer stores it.
    pub fn peer_id(&self) -> u16 {
        self.id ^ PEER_BIT
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Sends one chunk of bytes.
    pub fn send(&self, bytes: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Fault::ConnectionClosed);
        }
        self.session.send_frame(&Frame::Data { channel: self.id, bytes: bytes.to_vec() })
    }

    /// Receives the next chunk, or `None` once the stream is closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        if self.is_closed() {
            return None;
        }
        if self.offset < self.pending.len() {
            let rest = self.pending.split_off(self.offset);
            self.pending.clear();
            self.offset = 0;
            return Some(rest);
        }
        let chunk = self.rx.recv().await?;
        if self.is_closed() {
            return None;
        }
        Some(chunk)
    }

    /// Closes both ends. Idempotent.
    pub fn close(&mut self) {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pending.clear();
        self.offset = 0;
        if self.session.streams.local_close(self.id) && !self.session.is_closed() {
            if let Err(fault) = self.session.send_frame(&Frame::Close { channel: self.id }) {
                tracing::debug!(channel = self.id, %fault, "stream close not delivered");
            }
        }
    }
}

impl std::fmt::Debug for DuplexStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexStream").field("id", &self.id).field("closed", &self.is_closed()).finish()
    }
}

impl Drop for DuplexStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl AsyncRead for DuplexStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.is_closed() {
                return Poll::Ready(Ok(()));
            }
            if this.offset < this.pending.len() {
                let n = buf.remaining().min(this.pending.len() - this.offset);
                buf.put_slice(&this.pending[this.offset..this.offset + n]);
                this.offset += n;
                return Poll::Ready(Ok(()));
            }
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    this.pending = chunk;
                    this.offset = 0;
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for DuplexStream {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.send(buf) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(fault) => Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, fault))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().close();
        Poll::Ready(Ok(()))
    }
}
