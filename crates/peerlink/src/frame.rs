//! # Protocol Frames
//!
//! Defines the structure of everything one peer sends the other.
//!
//! Control traffic (calls and replies) and stream traffic (data and close)
//! share the connection. Control frames implicitly use channel 0; stream
//! frames name their channel explicitly.
//!
//! ## Invariants
//! - **Panic Safety**: All decoding paths return `Result`, never panicking on unknown data.
//! - **Forward Compatibility**: Unknown header fields are safely skipped.
//! - **Notifications**: A call with correlation id 0 expects no reply.

use peerpack::Decoder;
use peerpack::Encoder;

use crate::codec::Codec;
use crate::codec::Decoding;
use crate::codec::Encoding;
use crate::codec::encode_shape;
use crate::codec::encode_signature;
use crate::error::Fault;
use crate::error::RemoteFault;
use crate::error::Result;
use crate::shape::Shape;
use crate::shape::Signature;
use crate::value::Value;

/// One packet on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A call or a reply.
    Control(CallEnvelope),
    /// Bytes written to a stream channel.
    Data { channel: u16, bytes: Vec<u8> },
    /// The sender closed a stream channel.
    Close { channel: u16 },
}

/// Header shared by calls and replies.
#[derive(Debug, Clone, PartialEq)]
pub struct CallEnvelope {
    /// Matches a reply to its call. 0 marks a notification.
    pub correlation_id: u32,
    /// The in-progress inbound call on the receiver that this call belongs to.
    pub linked_call_id: Option<u32>,
    pub body: Body,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Request(Request),
    Reply(Reply),
}

/// The outcome of a call as carried in a reply.
pub type Reply = std::result::Result<ReplyValue, RemoteFault>;

/// A successful reply: the return value plus any out/ref parameter values by index.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReplyValue {
    pub value: Value,
    pub outs: Vec<(u32, Value)>,
}

impl ReplyValue {
    pub fn of(value: Value) -> Self {
        Self { value, outs: Vec::new() }
    }
}

/// What a call asks the receiver to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Fetch the receiver's root object.
    GetRoot,
    MethodCall { target: u32, method: String, signature: Signature, args: Vec<Value> },
    /// Read (`value: None`) or write (`value: Some`) a property.
    PropertyAccess { target: u32, name: String, shape: Shape, value: Option<Value> },
    DelegateCall { target: u32, signature: Signature, args: Vec<Value> },
    CanCastTo { target: u32, interface: String },
    /// The sender allocated `channel` and wants the receiver to accept it.
    CreateStream { channel: u16 },
    /// The sender dropped `count` references to `handle`.
    ReferenceRelease { handle: u32, count: u32 },
    /// Return the value unchanged.
    Echo(Value),
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::GetRoot => "GetRoot",
            Request::MethodCall { .. } => "MethodCall",
            Request::PropertyAccess { .. } => "PropertyAccess",
            Request::DelegateCall { .. } => "DelegateCall",
            Request::CanCastTo { .. } => "CanCastTo",
            Request::CreateStream { .. } => "CreateStream",
            Request::ReferenceRelease { .. } => "ReferenceRelease",
            Request::Echo(_) => "Echo",
        }
    }
}

impl Frame {
    pub fn request(correlation_id: u32, linked_call_id: Option<u32>, request: Request) -> Self {
        Frame::Control(CallEnvelope { correlation_id, linked_call_id, body: Body::Request(request) })
    }

    pub fn reply(correlation_id: u32, reply: Reply) -> Self {
        Frame::Control(CallEnvelope { correlation_id, linked_call_id: None, body: Body::Reply(reply) })
    }

    /// Encodes the frame. Exposures made along the way are kept only on success.
    pub fn encode(&self, codec: &Codec) -> Result<Vec<u8>> {
        let mut enc = Encoder::new();
        let mut encoding = codec.begin_encode();
        self.encode_into(&mut enc, &mut encoding)?;
        let bytes = enc.into_bytes()?;
        encoding.commit();
        Ok(bytes)
    }

    /// Decodes a frame and attaches any snapshots it carried.
    pub fn decode(bytes: &[u8], codec: &Codec) -> Result<Frame> {
        let mut dec = Decoder::new(bytes);
        let mut decoding = codec.begin_decode();
        let (kind, mut body) = dec.variant()?;
        let frame = match kind {
            "Call" => decode_call(&mut body, codec, &mut decoding)?,
            "Reply" => decode_reply(&mut body, &mut decoding)?,
            "Data" => {
                let mut map = body.map()?;
                let mut channel = None;
                let mut bytes = None;
                while let Some((key, mut val)) = map.next()? {
                    match key {
                        "channel" => channel = Some(val.u16()?),
                        "bytes" => bytes = Some(val.bytes()?.to_vec()),
                        _ => val.skip()?,
                    }
                }
                Frame::Data { channel: required(channel, "channel")?, bytes: required(bytes, "bytes")? }
            }
            "Close" => {
                let mut map = body.map()?;
                let mut channel = None;
                while let Some((key, mut val)) = map.next()? {
                    match key {
                        "channel" => channel = Some(val.u16()?),
                        _ => val.skip()?,
                    }
                }
                Frame::Close { channel: required(channel, "channel")? }
            }
            other => return Err(Fault::Protocol(format!("unknown frame kind {:?}", other))),
        };
        decoding.finish();
        Ok(frame)
    }

    fn encode_into(&self, enc: &mut Encoder, encoding: &mut Encoding) -> Result<()> {
        match self {
            Frame::Control(CallEnvelope { correlation_id, linked_call_id, body: Body::Request(request) }) => {
                enc.variant_begin("Call")?;
                enc.map_begin()?;
                write_map_u32(enc, "id", *correlation_id)?;
                enc.variant_begin("linked")?;
                match linked_call_id {
                    Some(linked) => {
                        enc.option_some_begin()?;
                        enc.u32(*linked)?;
                        enc.option_some_end()?;
                    }
                    None => enc.option_none()?,
                }
                enc.variant_end()?;
                enc.variant_begin("request")?;
                encode_request(enc, encoding, request)?;
                enc.variant_end()?;
                enc.map_end()?;
                enc.variant_end()?;
            }
            Frame::Control(CallEnvelope { correlation_id, body: Body::Reply(reply), .. }) => {
                enc.variant_begin("Reply")?;
                enc.map_begin()?;
                write_map_u32(enc, "id", *correlation_id)?;
                enc.variant_begin("result")?;
                match reply {
                    Ok(ok) => {
                        enc.result_ok_begin()?;
                        enc.map_begin()?;
                        enc.variant_begin("value")?;
                        encoding.value(enc, &ok.value)?;
                        enc.variant_end()?;
                        enc.variant_begin("outs")?;
                        enc.list_begin()?;
                        for (index, value) in &ok.outs {
                            enc.list_begin()?;
                            enc.u32(*index)?;
                            encoding.value(enc, value)?;
                            enc.list_end()?;
                        }
                        enc.list_end()?;
                        enc.variant_end()?;
                        enc.map_end()?;
                        enc.result_ok_end()?;
                    }
                    Err(fault) => {
                        enc.result_err_begin()?;
                        enc.map_begin()?;
                        write_map_str(enc, "kind", &fault.kind)?;
                        write_map_str(enc, "message", &fault.message)?;
                        enc.map_end()?;
                        enc.result_err_end()?;
                    }
                }
                enc.variant_end()?;
                enc.map_end()?;
                enc.variant_end()?;
            }
            Frame::Data { channel, bytes } => {
                enc.variant_begin("Data")?;
                enc.map_begin()?;
                write_map_u16(enc, "channel", *channel)?;
                enc.variant_begin("bytes")?;
                enc.bytes(bytes)?;
                enc.variant_end()?;
                enc.map_end()?;
                enc.variant_end()?;
            }
            Frame::Close { channel } => {
                enc.variant_begin("Close")?;
                enc.map_begin()?;
                write_map_u16(enc, "channel", *channel)?;
                enc.map_end()?;
                enc.variant_end()?;
            }
        }
        Ok(())
    }
}

fn encode_request(enc: &mut Encoder, encoding: &mut Encoding, request: &Request) -> Result<()> {
    enc.variant_begin(request.kind())?;
    enc.map_begin()?;
    match request {
        Request::GetRoot => {}
        Request::MethodCall { target, method, signature, args } => {
            write_map_u32(enc, "target", *target)?;
            write_map_str(enc, "method", method)?;
            write_map_signature(enc, signature)?;
            write_map_args(enc, encoding, args)?;
        }
        Request::PropertyAccess { target, name, shape, value } => {
            write_map_u32(enc, "target", *target)?;
            write_map_str(enc, "name", name)?;
            enc.variant_begin("shape")?;
            encode_shape(enc, shape)?;
            enc.variant_end()?;
            if let Some(value) = value {
                enc.variant_begin("value")?;
                encoding.value(enc, value)?;
                enc.variant_end()?;
            }
        }
        Request::DelegateCall { target, signature, args } => {
            write_map_u32(enc, "target", *target)?;
            write_map_signature(enc, signature)?;
            write_map_args(enc, encoding, args)?;
        }
        Request::CanCastTo { target, interface } => {
            write_map_u32(enc, "target", *target)?;
            enc.variant_begin("interface")?;
            enc.type_name(interface)?;
            enc.variant_end()?;
        }
        Request::CreateStream { channel } => write_map_u16(enc, "channel", *channel)?,
        Request::ReferenceRelease { handle, count } => {
            write_map_u32(enc, "handle", *handle)?;
            write_map_u32(enc, "count", *count)?;
        }
        Request::Echo(value) => {
            enc.variant_begin("value")?;
            encoding.value(enc, value)?;
            enc.variant_end()?;
        }
    }
    enc.map_end()?;
    enc.variant_end()?;
    Ok(())
}

fn decode_call(dec: &mut Decoder, codec: &Codec, decoding: &mut Decoding) -> Result<Frame> {
    let mut map = dec.map()?;
    let mut id = None;
    let mut linked = None;
    let mut request = None;

    while let Some((key, mut val)) = map.next()? {
        match key {
            "id" => id = Some(val.u32()?),
            "linked" => {
                linked = match val.option()? {
                    Some(mut inner) => Some(inner.u32()?),
                    None => None,
                }
            }
            "request" => request = Some(decode_request(&mut val, codec, decoding)?),
            _ => val.skip()?,
        }
    }

    Ok(Frame::request(required(id, "id")?, linked, required(request, "request")?))
}

fn decode_request(dec: &mut Decoder, codec: &Codec, decoding: &mut Decoding) -> Result<Request> {
    let (kind, mut body) = dec.variant()?;
    let mut map = body.map()?;

    let mut target = None;
    let mut method = None;
    let mut name = None;
    let mut signature = None;
    let mut shape = None;
    let mut args = None;
    let mut value = None;
    let mut interface = None;
    let mut channel = None;
    let mut handle = None;
    let mut count = None;

    while let Some((key, mut val)) = map.next()? {
        match key {
            "target" => target = Some(val.u32()?),
            "method" => method = Some(val.str()?.to_string()),
            "name" => name = Some(val.str()?.to_string()),
            "signature" => signature = Some(codec.decode_signature(&mut val)?),
            "shape" => shape = Some(codec.decode_shape(&mut val)?),
            "args" => {
                let mut items = val.list()?;
                let mut decoded = Vec::new();
                while let Some(mut item) = items.next()? {
                    decoded.push(decoding.value(&mut item)?);
                }
                args = Some(decoded);
            }
            "value" => value = Some(decoding.value(&mut val)?),
            "interface" => interface = Some(val.type_name()?.to_string()),
            "channel" => channel = Some(val.u16()?),
            "handle" => handle = Some(val.u32()?),
            "count" => count = Some(val.u32()?),
            _ => val.skip()?,
        }
    }

    let request = match kind {
        "GetRoot" => Request::GetRoot,
        "MethodCall" => Request::MethodCall {
            target: required(target, "target")?,
            method: required(method, "method")?,
            signature: required(signature, "signature")?,
            args: required(args, "args")?,
        },
        "PropertyAccess" => Request::PropertyAccess {
            target: required(target, "target")?,
            name: required(name, "name")?,
            shape: required(shape, "shape")?,
            value,
        },
        "DelegateCall" => Request::DelegateCall {
            target: required(target, "target")?,
            signature: required(signature, "signature")?,
            args: required(args, "args")?,
        },
        "CanCastTo" => Request::CanCastTo {
            target: required(target, "target")?,
            interface: required(interface, "interface")?,
        },
        "CreateStream" => Request::CreateStream { channel: required(channel, "channel")? },
        "ReferenceRelease" => Request::ReferenceRelease {
            handle: required(handle, "handle")?,
            count: required(count, "count")?,
        },
        "Echo" => Request::Echo(required(value, "value")?),
        other => return Err(Fault::Protocol(format!("unknown request kind {:?}", other))),
    };
    Ok(request)
}

fn decode_reply(dec: &mut Decoder, decoding: &mut Decoding) -> Result<Frame> {
    let mut map = dec.map()?;
    let mut id = None;
    let mut result = None;

    while let Some((key, mut val)) = map.next()? {
        match key {
            "id" => id = Some(val.u32()?),
            "result" => {
                result = Some(match val.result()? {
                    Ok(mut ok) => Ok(decode_reply_value(&mut ok, decoding)?),
                    Err(mut err) => Err(decode_remote_fault(&mut err)?),
                })
            }
            _ => val.skip()?,
        }
    }

    Ok(Frame::reply(required(id, "id")?, required(result, "result")?))
}

fn decode_reply_value(dec: &mut Decoder, decoding: &mut Decoding) -> Result<ReplyValue> {
    let mut map = dec.map()?;
    let mut reply = ReplyValue::default();
    let mut saw_value = false;

    while let Some((key, mut val)) = map.next()? {
        match key {
            "value" => {
                reply.value = decoding.value(&mut val)?;
                saw_value = true;
            }
            "outs" => {
                let mut items = val.list()?;
                while let Some(mut item) = items.next()? {
                    let mut pair = item.list()?;
                    let index = pair.next()?.ok_or_else(|| missing("out index"))?.u32()?;
                    let mut value = pair.next()?.ok_or_else(|| missing("out value"))?;
                    reply.outs.push((index, decoding.value(&mut value)?));
                }
            }
            _ => val.skip()?,
        }
    }

    if !saw_value {
        return Err(missing("value"));
    }
    Ok(reply)
}

fn decode_remote_fault(dec: &mut Decoder) -> Result<RemoteFault> {
    let mut map = dec.map()?;
    let mut kind = None;
    let mut message = None;

    while let Some((key, mut val)) = map.next()? {
        match key {
            "kind" => kind = Some(val.str()?.to_string()),
            "message" => message = Some(val.str()?.to_string()),
            _ => val.skip()?,
        }
    }

    Ok(RemoteFault { kind: required(kind, "kind")?, message: message.unwrap_or_default() })
}

fn required<T>(field: Option<T>, name: &str) -> Result<T> {
    field.ok_or_else(|| missing(name))
}

fn missing(name: &str) -> Fault {
    Fault::Protocol(format!("missing {}", name))
}

// ============================================================================
//  Helpers
// ============================================================================

fn write_map_u32(enc: &mut Encoder, key: &str, v: u32) -> Result<()> {
    enc.variant_begin(key)?;
    enc.u32(v)?;
    enc.variant_end()?;
    Ok(())
}

fn write_map_u16(enc: &mut Encoder, key: &str, v: u16) -> Result<()> {
    enc.variant_begin(key)?;
    enc.u16(v)?;
    enc.variant_end()?;
    Ok(())
}

fn write_map_str(enc: &mut Encoder, key: &str, v: &str) -> Result<()> {
    enc.variant_begin(key)?;
    enc.str(v)?;
    enc.variant_end()?;
    Ok(())
}

fn write_map_signature(enc: &mut Encoder, sig: &Signature) -> Result<()> {
    enc.variant_begin("signature")?;
    encode_signature(enc, sig)?;
    enc.variant_end()?;
    Ok(())
}

fn write_map_args(enc: &mut Encoder, encoding: &mut Encoding, args: &[Value]) -> Result<()> {
    enc.variant_begin("args")?;
    enc.list_begin()?;
    for arg in args {
        encoding.value(enc, arg)?;
    }
    enc.list_end()?;
    enc.variant_end()?;
    Ok(())
}
