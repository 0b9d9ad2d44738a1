//! # Peerlink
//!
//! Two processes sharing a live object graph over one packet transport.
//!
//! ## Architecture
//!
//! Each side runs a `Session`. A session exposes local objects and callables
//! to the peer by handle, hands out `Proxy` values for whatever the peer
//! exposes, and tunnels extra duplex byte streams next to the calls.
//!
//! - `codec` and `frame` turn values and requests into `peerpack` bytes.
//! - `registry` counts references across the connection.
//! - `dispatch` matches replies to calls and routes linked (reentrant) calls to the
//!   caller that is blocked on them.
//! - `proxy` turns local method calls into requests.
//! - `stream` multiplexes byte streams.
//!
//! ## Example
//!
//! ```no_run
//! use peerlink::ChannelTransport;
//! use peerlink::Value;
//! use peerlink::open_session;
//!
//! # async fn demo() -> peerlink::Result<()> {
//! let (a, b) = ChannelTransport::pair();
//! let left = open_session(a, Value::Null);
//! let right = open_session(b, Value::String("hello".into()));
//! assert_eq!(left.remote_root().await?, Value::String("hello".into()));
//! # let _ = right;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod codec;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod object;
pub mod proxy;
pub mod registry;
pub mod schema;
pub mod session;
pub mod shape;
pub mod stream;
pub mod transport;
pub mod value;

#[cfg(test)]
mod tests;

pub use builder::SessionBuilder;
pub use codec::Codec;
pub use codec::NoReferences;
pub use config::SessionConfig;
pub use context::CallContext;
pub use error::Fault;
pub use error::RemoteFault;
pub use error::Result;
pub use frame::Frame;
pub use frame::Request;
pub use object::Callable;
pub use object::Exposed;
pub use proxy::Proxy;
pub use registry::HandleId;
pub use schema::RecordSchema;
pub use schema::Schema;
pub use schema::SchemaRegistry;
pub use session::Session;
pub use session::open_session;
pub use shape::Shape;
pub use shape::Signature;
pub use shape::TypeInfo;
pub use stream::DuplexStream;
pub use stream::StreamDescriptor;
pub use transport::ChannelTransport;
pub use transport::Transport;
pub use value::IntoValue;
pub use value::FromValue;
pub use value::ObjectRef;
pub use value::RecordValue;
pub use value::Value;
