//! # Codec
//!
//! The translation layer between `Value` and the `peerpack` wire format.
//!
//! ## Invariants
//! - **Recursion Safety**: All recursive operations are bounded by `MAX_RECURSION_DEPTH`.
//! - **All or Nothing**: An `Encoding` that is dropped without `commit` rolls back every
//!   exposure it made, so a half-written frame never leaks a reference count.
//! - **Late Snapshots**: Object snapshots are attached only after the whole top-level value
//!   has been decoded, so a snapshot may refer to the object it describes.
//! - **Forward Compatible**: Unknown shapes decode as `Shape::Any`; records with an unknown
//!   or unsatisfied schema decode as generic records.
//!
//! ## Object references
//!
//! The codec does not own any reference bookkeeping. It asks a `References`
//! implementation (the session) to turn objects into handles on the way out
//! and handles into objects on the way in.

use peerpack::Decoder;
use peerpack::Encoder;
use peerpack::Tag;

use crate::error::Fault;
use crate::error::Result;
use crate::schema::SchemaRegistry;
use crate::shape::Param;
use crate::shape::ParamMode;
use crate::shape::Shape;
use crate::shape::Signature;
use crate::shape::TypeInfo;
use crate::value::Array;
use crate::value::Decimal;
use crate::value::ObjectRef;
use crate::value::RecordValue;
use crate::value::Timestamp;
use crate::value::Value;

/// The maximum nesting depth for values before failing.
const MAX_RECURSION_DEPTH: usize = 64;

/// How an object leaves this side.
#[derive(Debug, Clone)]
pub enum OutboundRef {
    /// A handle the receiver already knows; no descriptor.
    Handle(u32),
    /// A freshly counted callable.
    Callable { id: u32, signature: Signature },
    /// A freshly counted object with its description and property snapshot.
    Object { id: u32, info: TypeInfo, snapshot: Vec<(String, Value)> },
}

/// A reference as it arrives, before it is resolved.
#[derive(Debug, Clone)]
pub enum InboundRef {
    Handle(u32),
    Callable { id: u32, signature: Signature },
    Object { id: u32, info: TypeInfo },
}

/// Reference bookkeeping the codec delegates to.
pub trait References {
    /// Turns an object into a handle, counting a new reference when needed.
    fn outbound(&self, object: &ObjectRef) -> Result<OutboundRef>;

    /// Resolves or imports an inbound handle.
    fn inbound(&self, reference: InboundRef) -> Result<ObjectRef>;

    /// Hands a decoded property snapshot to an imported object.
    fn attach_snapshot(&self, object: &ObjectRef, snapshot: Vec<(String, Value)>) {
        let _ = (object, snapshot);
    }

    /// Undoes the exposures of an abandoned encoding.
    fn rollback(&self, exposed: &[u32]) {
        let _ = exposed;
    }
}

/// Rejects every object reference. Used for frames that can only carry plain data.
pub struct NoReferences;

impl References for NoReferences {
    fn outbound(&self, _: &ObjectRef) -> Result<OutboundRef> {
        Err(Fault::Unmarshalable("object references need a session".into()))
    }

    fn inbound(&self, _: InboundRef) -> Result<ObjectRef> {
        Err(Fault::Protocol("object reference outside a session".into()))
    }
}

/// Value encoder/decoder bound to a schema set and a reference strategy.
#[derive(Clone, Copy)]
pub struct Codec<'a> {
    schemas: &'a SchemaRegistry,
    refs: &'a dyn References,
}

impl<'a> Codec<'a> {
    pub fn new(schemas: &'a SchemaRegistry, refs: &'a dyn References) -> Self {
        Self { schemas, refs }
    }

    pub fn schemas(&self) -> &'a SchemaRegistry {
        self.schemas
    }

    /// Starts an encoding whose exposures are rolled back unless committed.
    pub fn begin_encode(&self) -> Encoding<'a> {
        Encoding { codec: *self, exposed: Vec::new(), committed: false }
    }

    /// Starts a decoding whose snapshot attachments run at `finish`.
    pub fn begin_decode(&self) -> Decoding<'a> {
        Decoding { codec: *self, deferred: Vec::new() }
    }

    /// Encodes one value as a standalone buffer.
    pub fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        let mut enc = Encoder::new();
        let mut encoding = self.begin_encode();
        encoding.value(&mut enc, value)?;
        let bytes = enc.into_bytes()?;
        encoding.commit();
        Ok(bytes)
    }

    /// Decodes one value from a standalone buffer.
    pub fn decode(&self, bytes: &[u8]) -> Result<Value> {
        let mut dec = Decoder::new(bytes);
        let mut decoding = self.begin_decode();
        let value = decoding.value(&mut dec)?;
        if dec.remaining() != 0 {
            return Err(Fault::Protocol(format!("{} trailing bytes after value", dec.remaining())));
        }
        decoding.finish();
        Ok(value)
    }

    // ========================================================================
    //  Descriptors
    // ========================================================================

    pub(crate) fn decode_shape(&self, dec: &mut Decoder) -> Result<Shape> {
        match dec.peek_tag()? {
            Tag::String => Ok(Shape::from_wire_name(dec.str()?).unwrap_or(Shape::Any)),
            Tag::Variant => {
                let (name, mut body) = dec.variant()?;
                match name {
                    "array" => Ok(Shape::array(self.decode_shape(&mut body)?)),
                    "sequence" => Ok(Shape::sequence(self.decode_shape(&mut body)?)),
                    "record" => {
                        let schema = body.str()?;
                        if self.schemas.contains(schema) {
                            Ok(Shape::record(schema))
                        } else {
                            Ok(Shape::Any)
                        }
                    }
                    _ => Ok(Shape::Any),
                }
            }
            tag => Err(Fault::Protocol(format!("expected shape, found {:?}", tag))),
        }
    }

    pub(crate) fn decode_signature(&self, dec: &mut Decoder) -> Result<Signature> {
        let mut items = dec.list()?;
        let mut ret = items.next()?.ok_or_else(|| missing("signature return"))?;
        let mut sig = Signature::new(self.decode_shape(&mut ret)?);
        let mut params = items.next()?.ok_or_else(|| missing("signature params"))?.list()?;
        while let Some(mut param) = params.next()? {
            let (name, mut body) = param.variant()?;
            let mut parts = body.list()?;
            let mut shape = parts.next()?.ok_or_else(|| missing("param shape"))?;
            let shape = self.decode_shape(&mut shape)?;
            let mode = parts.next()?.ok_or_else(|| missing("param mode"))?.u8()?;
            let mode = ParamMode::from_u8(mode)
                .ok_or_else(|| Fault::Protocol(format!("unknown parameter mode {}", mode)))?;
            sig.params.push(Param { name: name.to_string(), shape, mode });
        }
        Ok(sig)
    }

    pub(crate) fn decode_type_info(&self, dec: &mut Decoder) -> Result<TypeInfo> {
        let mut info = TypeInfo::default();
        let mut map = dec.map()?;
        while let Some((key, mut val)) = map.next()? {
            match key {
                "name" => info.name = val.type_name()?.to_string(),
                "interfaces" => {
                    let mut list = val.list()?;
                    while let Some(mut item) = list.next()? {
                        info.interfaces.push(item.type_name()?.to_string());
                    }
                }
                "methods" => {
                    let mut list = val.list()?;
                    while let Some(mut item) = list.next()? {
                        let (name, mut body) = item.variant()?;
                        let signature = self.decode_signature(&mut body)?;
                        info = info.method(name, signature);
                    }
                }
                "properties" => {
                    let mut list = val.list()?;
                    while let Some(mut item) = list.next()? {
                        let (name, mut body) = item.variant()?;
                        let mut parts = body.list()?;
                        let mut shape = parts.next()?.ok_or_else(|| missing("property shape"))?;
                        let shape = self.decode_shape(&mut shape)?;
                        let writable = parts.next()?.ok_or_else(|| missing("property access"))?.bool()?;
                        info = info.property(name, shape, writable);
                    }
                }
                _ => {} // Forward compatibility: ignore unknown keys
            }
        }
        Ok(info)
    }
}

pub(crate) fn encode_shape(enc: &mut Encoder, shape: &Shape) -> Result<()> {
    match shape {
        Shape::Array(elem) => {
            enc.variant_begin("array")?;
            encode_shape(enc, elem)?;
            enc.variant_end()?;
        }
        Shape::Sequence(elem) => {
            enc.variant_begin("sequence")?;
            encode_shape(enc, elem)?;
            enc.variant_end()?;
        }
        Shape::Record(name) => {
            enc.variant_begin("record")?;
            enc.str(name)?;
            enc.variant_end()?;
        }
        unit => enc.str(unit.wire_name().unwrap_or("any"))?,
    }
    Ok(())
}

pub(crate) fn encode_signature(enc: &mut Encoder, sig: &Signature) -> Result<()> {
    enc.list_begin()?;
    encode_shape(enc, &sig.ret)?;
    enc.list_begin()?;
    for param in &sig.params {
        enc.variant_begin(&param.name)?;
        enc.list_begin()?;
        encode_shape(enc, &param.shape)?;
        enc.u8(param.mode.to_u8())?;
        enc.list_end()?;
        enc.variant_end()?;
    }
    enc.list_end()?;
    enc.list_end()?;
    Ok(())
}

pub(crate) fn encode_type_info(enc: &mut Encoder, info: &TypeInfo) -> Result<()> {
    enc.map_begin()?;

    enc.variant_begin("name")?;
    enc.type_name(&info.name)?;
    enc.variant_end()?;

    enc.variant_begin("interfaces")?;
    enc.list_begin()?;
    for interface in &info.interfaces {
        enc.type_name(interface)?;
    }
    enc.list_end()?;
    enc.variant_end()?;

    enc.variant_begin("methods")?;
    enc.list_begin()?;
    for method in &info.methods {
        enc.variant_begin(&method.name)?;
        encode_signature(enc, &method.signature)?;
        enc.variant_end()?;
    }
    enc.list_end()?;
    enc.variant_end()?;

    enc.variant_begin("properties")?;
    enc.list_begin()?;
    for prop in &info.properties {
        enc.variant_begin(&prop.name)?;
        enc.list_begin()?;
        encode_shape(enc, &prop.shape)?;
        enc.bool(prop.writable)?;
        enc.list_end()?;
        enc.variant_end()?;
    }
    enc.list_end()?;
    enc.variant_end()?;

    enc.map_end()?;
    Ok(())
}

fn missing(what: &str) -> Fault {
    Fault::Protocol(format!("missing {}", what))
}

// ============================================================================
//  Encoding
// ============================================================================

/// One outbound message worth of values.
pub struct Encoding<'a> {
    codec: Codec<'a>,
    exposed: Vec<u32>,
    committed: bool,
}

impl Encoding<'_> {
    /// Encodes a value into the encoder stream.
    ///
    /// # Errors
    /// Returns `Fault::Unmarshalable` for values that cannot cross the wire, including
    /// values nested deeper than the recursion limit.
    pub fn value(&mut self, enc: &mut Encoder, value: &Value) -> Result<()> {
        self.encode_value(enc, value, 0)
    }

    /// Keeps every exposure made by this encoding.
    pub fn commit(mut self) {
        self.committed = true;
    }

    fn encode_value(&mut self, enc: &mut Encoder, value: &Value, depth: usize) -> Result<()> {
        if depth > MAX_RECURSION_DEPTH {
            return Err(Fault::Unmarshalable(format!("nesting exceeds {} levels", MAX_RECURSION_DEPTH)));
        }

        match value {
            Value::Null => enc.null()?,
            Value::Bool(v) => enc.bool(*v)?,
            Value::Byte(v) => enc.u8(*v)?,
            Value::Char(v) => enc.char(*v)?,
            Value::Decimal(d) => {
                if d.scale > Decimal::MAX_SCALE {
                    return Err(Fault::Unmarshalable(format!("decimal scale {} out of range", d.scale)));
                }
                enc.decimal(d.mantissa, d.scale)?
            }
            Value::Double(v) => enc.f64(*v)?,
            Value::Int16(v) => enc.s16(*v)?,
            Value::Int32(v) => enc.s32(*v)?,
            Value::Int64(v) => enc.s64(*v)?,
            Value::Single(v) => enc.f32(*v)?,
            Value::String(v) => enc.str(v)?,
            Value::UInt16(v) => enc.u16(*v)?,
            Value::UInt32(v) => enc.u32(*v)?,
            Value::UInt64(v) => enc.u64(*v)?,
            Value::Timestamp(t) => enc.timestamp(t.secs, t.nanos)?,
            Value::Type(name) => enc.type_name(name)?,
            Value::Record(record) => {
                self.check_record(record)?;
                enc.record_begin(record.schema.as_deref().unwrap_or(""))?;
                self.encode_fields(enc, &record.fields, depth)?;
                enc.record_end()?;
            }
            Value::Array(array) => {
                if let Some(stray) = array.items.iter().find(|v| !array.elem.admits(v)) {
                    return Err(Fault::Unmarshalable(format!(
                        "heterogeneous array: {} in {}[]",
                        stray.kind_name(),
                        array.elem
                    )));
                }
                enc.array_begin()?;
                encode_shape(enc, &array.elem)?;
                for item in &array.items {
                    self.encode_value(enc, item, depth + 1)?;
                }
                enc.array_end()?;
            }
            Value::List(items) => {
                enc.list_begin()?;
                for item in items {
                    self.encode_value(enc, item, depth + 1)?;
                }
                enc.list_end()?;
            }
            Value::Object(object) => match self.codec.refs.outbound(object)? {
                OutboundRef::Handle(id) => enc.handle(id)?,
                OutboundRef::Callable { id, signature } => {
                    self.exposed.push(id);
                    enc.handle_sig_begin(id)?;
                    encode_signature(enc, &signature)?;
                    enc.handle_end()?;
                }
                OutboundRef::Object { id, info, snapshot } => {
                    self.exposed.push(id);
                    enc.handle_snap_begin(id)?;
                    encode_type_info(enc, &info)?;
                    self.encode_fields(enc, &snapshot, depth)?;
                    enc.handle_end()?;
                }
            },
        }
        Ok(())
    }

    fn encode_fields(&mut self, enc: &mut Encoder, fields: &[(String, Value)], depth: usize) -> Result<()> {
        enc.map_begin()?;
        for (name, value) in fields {
            enc.variant_begin(name)?;
            self.encode_value(enc, value, depth + 1)?;
            enc.variant_end()?;
        }
        enc.map_end()?;
        Ok(())
    }

    /// A record naming a registered schema must satisfy it.
    fn check_record(&self, record: &RecordValue) -> Result<()> {
        let Some(name) = &record.schema else {
            return Ok(());
        };
        let Some(schema) = self.codec.schemas.get(name) else {
            return Ok(());
        };
        for (field, shape) in &schema.fields {
            let Some(value) = record.get(field) else {
                return Err(Fault::Unmarshalable(format!("{} is missing field {}", name, field)));
            };
            if !shape.admits(value) && shape.fix(value.clone(), self.codec.schemas).is_err() {
                return Err(Fault::Unmarshalable(format!(
                    "{}.{} expects {}, found {}",
                    name,
                    field,
                    shape,
                    value.kind_name()
                )));
            }
        }
        Ok(())
    }
}

impl Drop for Encoding<'_> {
    fn drop(&mut self) {
        if !self.committed && !self.exposed.is_empty() {
            self.codec.refs.rollback(&self.exposed);
        }
    }
}

// ============================================================================
//  Decoding
// ============================================================================

/// One inbound message worth of values.
pub struct Decoding<'a> {
    codec: Codec<'a>,
    deferred: Vec<(ObjectRef, Vec<(String, Value)>)>,
}

impl Decoding<'_> {
    /// Decodes the next value from the decoder stream.
    pub fn value(&mut self, dec: &mut Decoder) -> Result<Value> {
        self.decode_value(dec, 0)
    }

    /// Attaches every snapshot collected while decoding.
    pub fn finish(self) {
        for (object, snapshot) in self.deferred {
            self.codec.refs.attach_snapshot(&object, snapshot);
        }
    }

    fn decode_value(&mut self, dec: &mut Decoder, depth: usize) -> Result<Value> {
        if depth > MAX_RECURSION_DEPTH {
            return Err(Fault::Protocol(format!("nesting exceeds {} levels", MAX_RECURSION_DEPTH)));
        }

        let value = match dec.peek_tag()? {
            Tag::Null => {
                dec.null()?;
                Value::Null
            }
            Tag::BoolTrue | Tag::BoolFalse => Value::Bool(dec.bool()?),
            Tag::U8 => Value::Byte(dec.u8()?),
            Tag::Char => Value::Char(dec.char()?),
            Tag::Decimal => {
                let (mantissa, scale) = dec.decimal()?;
                if scale > Decimal::MAX_SCALE {
                    return Err(Fault::Protocol(format!("decimal scale {} out of range", scale)));
                }
                Value::Decimal(Decimal::new(mantissa, scale))
            }
            Tag::F64 => Value::Double(dec.f64()?),
            Tag::S16 => Value::Int16(dec.s16()?),
            Tag::S32 => Value::Int32(dec.s32()?),
            Tag::S64 => Value::Int64(dec.s64()?),
            Tag::F32 => Value::Single(dec.f32()?),
            Tag::String => Value::String(dec.str()?.to_string()),
            Tag::U16 => Value::UInt16(dec.u16()?),
            Tag::U32 => Value::UInt32(dec.u32()?),
            Tag::U64 => Value::UInt64(dec.u64()?),
            Tag::Timestamp => {
                let (secs, nanos) = dec.timestamp()?;
                Value::Timestamp(Timestamp::new(secs, nanos))
            }
            Tag::TypeName => Value::Type(dec.type_name()?.to_string()),
            Tag::Record => {
                let (schema, mut body) = dec.record()?;
                let fields = self.decode_fields(&mut body, depth)?;
                let generic = RecordValue { schema: None, fields };
                if self.codec.schemas.contains(schema) {
                    // A record that does not satisfy its schema still arrives, as a generic mapping.
                    let record = RecordValue { schema: Some(schema.to_string()), fields: generic.fields.clone() };
                    Shape::record(schema)
                        .fix(Value::Record(record), self.codec.schemas)
                        .unwrap_or(Value::Record(generic))
                } else {
                    Value::Record(generic)
                }
            }
            Tag::Array => {
                let mut items = dec.array()?;
                let mut first = items.next()?.ok_or_else(|| missing("array element shape"))?;
                let elem = self.codec.decode_shape(&mut first)?;
                let mut values = Vec::new();
                while let Some(mut item) = items.next()? {
                    values.push(self.decode_value(&mut item, depth + 1)?);
                }
                Value::Array(Array::new(elem, values))
            }
            Tag::List => {
                let mut items = dec.list()?;
                let mut values = Vec::new();
                while let Some(mut item) = items.next()? {
                    values.push(self.decode_value(&mut item, depth + 1)?);
                }
                Value::List(values)
            }
            Tag::Handle => {
                let id = dec.handle()?;
                Value::Object(self.codec.refs.inbound(InboundRef::Handle(id))?)
            }
            Tag::HandleSig => {
                let (id, mut body) = dec.handle_with()?;
                let signature = self.codec.decode_signature(&mut body)?;
                Value::Object(self.codec.refs.inbound(InboundRef::Callable { id, signature })?)
            }
            Tag::HandleSnap => {
                let (id, mut body) = dec.handle_with()?;
                let info = self.codec.decode_type_info(&mut body)?;
                let object = self.codec.refs.inbound(InboundRef::Object { id, info })?;
                // The snapshot may mention the object itself, so it is read after import.
                if body.remaining() > 0 {
                    let snapshot = self.decode_fields(&mut body, depth)?;
                    self.deferred.push((object.clone(), snapshot));
                }
                Value::Object(object)
            }
            tag => return Err(Fault::Protocol(format!("unexpected {:?} in value position", tag))),
        };
        Ok(value)
    }

    fn decode_fields(&mut self, dec: &mut Decoder, depth: usize) -> Result<Vec<(String, Value)>> {
        let mut fields = Vec::new();
        let mut map = dec.map()?;
        while let Some((name, mut value)) = map.next()? {
            fields.push((name.to_string(), self.decode_value(&mut value, depth + 1)?));
        }
        Ok(fields)
    }
}
