//! # Shapes
//!
//! Declared types for parameters, returns, properties and array elements.
//!
//! Values are dynamically typed on the wire; shapes are what each side
//! *expects*. The receiver of a value adapts ("fixes") it to the shape it
//! declared before handing it to application code.
//!
//! ## Fixing rules
//!
//! - An exact match passes through.
//! - Integral and floating values widen losslessly (`Int16` -> `Int32`, `Single` -> `Double`, ...).
//!   Narrowing is never performed.
//! - `Array` and `List` convert into each other when the target is a sequence shape;
//!   every item is fixed to the element shape.
//! - Records are checked against the registered schema and their fields fixed in schema order.
//! - `Null` is accepted wherever a reference-like shape is expected.

use std::fmt;

use crate::error::Fault;
use crate::error::Result;
use crate::schema::SchemaRegistry;
use crate::value::Array;
use crate::value::ObjectRef;
use crate::value::RecordValue;
use crate::value::Value;

/// A declared type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Shape {
    /// Accepts anything, performs no adaptation.
    Any,
    /// No value; the return shape of procedures.
    Void,
    Bool,
    Byte,
    Char,
    Decimal,
    Double,
    Int16,
    Int32,
    Int64,
    Single,
    String,
    UInt16,
    UInt32,
    UInt64,
    Timestamp,
    Type,
    /// Any by-reference object.
    Object,
    /// A by-reference function.
    Callable,
    /// Homogeneous array with the given element shape.
    Array(Box<Shape>),
    /// Any sequence with the given element shape; fixes to a `List`.
    Sequence(Box<Shape>),
    /// A record with the named schema.
    Record(String),
}

impl Shape {
    pub fn array(elem: Shape) -> Self {
        Shape::Array(Box::new(elem))
    }

    pub fn sequence(elem: Shape) -> Self {
        Shape::Sequence(Box::new(elem))
    }

    pub fn record(name: impl Into<String>) -> Self {
        Shape::Record(name.into())
    }

    fn nullable(&self) -> bool {
        matches!(
            self,
            Shape::Any
                | Shape::Void
                | Shape::String
                | Shape::Type
                | Shape::Object
                | Shape::Callable
                | Shape::Array(_)
                | Shape::Sequence(_)
                | Shape::Record(_)
        )
    }

    /// Whether `value` already has this shape, without any adaptation.
    pub fn admits(&self, value: &Value) -> bool {
        match (self, value) {
            (Shape::Any, _) => true,
            (_, Value::Null) => self.nullable(),
            (Shape::Bool, Value::Bool(_))
            | (Shape::Byte, Value::Byte(_))
            | (Shape::Char, Value::Char(_))
            | (Shape::Decimal, Value::Decimal(_))
            | (Shape::Double, Value::Double(_))
            | (Shape::Int16, Value::Int16(_))
            | (Shape::Int32, Value::Int32(_))
            | (Shape::Int64, Value::Int64(_))
            | (Shape::Single, Value::Single(_))
            | (Shape::String, Value::String(_))
            | (Shape::UInt16, Value::UInt16(_))
            | (Shape::UInt32, Value::UInt32(_))
            | (Shape::UInt64, Value::UInt64(_))
            | (Shape::Timestamp, Value::Timestamp(_))
            | (Shape::Type, Value::Type(_)) => true,
            (Shape::Object, Value::Object(_)) => true,
            (Shape::Callable, Value::Object(o)) => match o {
                ObjectRef::Callable(_) => true,
                ObjectRef::Remote(p) => p.is_callable(),
                ObjectRef::Local(_) => false,
            },
            (Shape::Array(elem), Value::Array(a)) => {
                a.elem == **elem && a.items.iter().all(|v| elem.admits(v))
            }
            (Shape::Sequence(elem), Value::List(items)) => items.iter().all(|v| elem.admits(v)),
            (Shape::Record(name), Value::Record(r)) => r.schema.as_deref() == Some(name.as_str()),
            _ => false,
        }
    }

    /// Adapts `value` to this shape.
    pub fn fix(&self, value: Value, schemas: &SchemaRegistry) -> Result<Value> {
        match (self, value) {
            (Shape::Any, v) => Ok(v),
            (Shape::Void, _) => Ok(Value::Null),
            (shape, Value::Null) if shape.nullable() => Ok(Value::Null),
            (Shape::Array(elem), v @ (Value::Array(_) | Value::List(_))) => {
                let items = fix_items(elem, v, schemas)?;
                Ok(Value::Array(Array::new((**elem).clone(), items)))
            }
            (Shape::Sequence(elem), v @ (Value::Array(_) | Value::List(_))) => {
                Ok(Value::List(fix_items(elem, v, schemas)?))
            }
            (Shape::Record(name), Value::Record(r)) => fix_record(name, r, schemas),
            (shape, v) if shape.admits(&v) => Ok(v),
            (shape, v) => widen(shape, v),
        }
    }
}

fn fix_items(elem: &Shape, value: Value, schemas: &SchemaRegistry) -> Result<Vec<Value>> {
    let items = match value {
        Value::Array(a) => a.items,
        Value::List(l) => l,
        other => return Err(Fault::mismatch(format!("sequence of {}", elem), other.kind_name())),
    };
    items.into_iter().map(|v| elem.fix(v, schemas)).collect()
}

fn fix_record(name: &str, mut record: RecordValue, schemas: &SchemaRegistry) -> Result<Value> {
    if let Some(declared) = &record.schema {
        if declared != name {
            return Err(Fault::mismatch(name, declared));
        }
    }
    let Some(schema) = schemas.get(name) else {
        record.schema = Some(name.to_string());
        return Ok(Value::Record(record));
    };
    let mut fields = Vec::with_capacity(schema.fields.len());
    for (field, shape) in &schema.fields {
        let Some(value) = record.take(field) else {
            return Err(Fault::mismatch(format!("{}.{}", name, field), "missing field"));
        };
        fields.push((field.clone(), shape.fix(value, schemas)?));
    }
    Ok(Value::Record(RecordValue { schema: Some(name.to_string()), fields }))
}

/// Lossless numeric widening.
fn widen(shape: &Shape, value: Value) -> Result<Value> {
    use crate::value::Decimal;

    let widened = match (shape, &value) {
        (Shape::Int16, Value::Byte(v)) => Some(Value::Int16(*v as i16)),
        (Shape::Int32, Value::Byte(v)) => Some(Value::Int32(*v as i32)),
        (Shape::Int32, Value::Int16(v)) => Some(Value::Int32(*v as i32)),
        (Shape::Int32, Value::UInt16(v)) => Some(Value::Int32(*v as i32)),
        (Shape::Int64, v) => match v {
            Value::Byte(_) | Value::Int16(_) | Value::Int32(_) | Value::UInt16(_) | Value::UInt32(_) => {
                v.as_i64().map(Value::Int64)
            }
            _ => None,
        },
        (Shape::UInt16, Value::Byte(v)) => Some(Value::UInt16(*v as u16)),
        (Shape::UInt32, Value::Byte(v)) => Some(Value::UInt32(*v as u32)),
        (Shape::UInt32, Value::UInt16(v)) => Some(Value::UInt32(*v as u32)),
        (Shape::UInt64, Value::Byte(v)) => Some(Value::UInt64(*v as u64)),
        (Shape::UInt64, Value::UInt16(v)) => Some(Value::UInt64(*v as u64)),
        (Shape::UInt64, Value::UInt32(v)) => Some(Value::UInt64(*v as u64)),
        (Shape::Single, Value::Byte(v)) => Some(Value::Single(*v as f32)),
        (Shape::Single, Value::Int16(v)) => Some(Value::Single(*v as f32)),
        (Shape::Single, Value::UInt16(v)) => Some(Value::Single(*v as f32)),
        (Shape::Double, v) => match v {
            Value::Byte(_) | Value::Int16(_) | Value::Int32(_) | Value::UInt16(_) | Value::UInt32(_) => {
                v.as_i64().map(|i| Value::Double(i as f64))
            }
            Value::Single(f) => Some(Value::Double(*f as f64)),
            _ => None,
        },
        (Shape::Decimal, Value::UInt64(v)) => Some(Value::Decimal(Decimal::from(*v))),
        (Shape::Decimal, v) => v.as_i64().map(|i| Value::Decimal(Decimal::from(i))),
        _ => None,
    };
    widened.ok_or_else(|| Fault::mismatch(shape, value.kind_name()))
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Array(elem) => write!(f, "{}[]", elem),
            Shape::Sequence(elem) => write!(f, "seq<{}>", elem),
            Shape::Record(name) => write!(f, "{}", name),
            other => write!(f, "{}", other.wire_name().unwrap_or("?")),
        }
    }
}

impl Shape {
    /// Name of a unit shape on the wire. Composite shapes have none.
    pub(crate) fn wire_name(&self) -> Option<&'static str> {
        Some(match self {
            Shape::Any => "any",
            Shape::Void => "void",
            Shape::Bool => "bool",
            Shape::Byte => "byte",
            Shape::Char => "char",
            Shape::Decimal => "decimal",
            Shape::Double => "double",
            Shape::Int16 => "int16",
            Shape::Int32 => "int32",
            Shape::Int64 => "int64",
            Shape::Single => "single",
            Shape::String => "string",
            Shape::UInt16 => "uint16",
            Shape::UInt32 => "uint32",
            Shape::UInt64 => "uint64",
            Shape::Timestamp => "timestamp",
            Shape::Type => "type",
            Shape::Object => "object",
            Shape::Callable => "callable",
            Shape::Array(_) | Shape::Sequence(_) | Shape::Record(_) => return None,
        })
    }

    pub(crate) fn from_wire_name(name: &str) -> Option<Self> {
        Some(match name {
            "any" => Shape::Any,
            "void" => Shape::Void,
            "bool" => Shape::Bool,
            "byte" => Shape::Byte,
            "char" => Shape::Char,
            "decimal" => Shape::Decimal,
            "double" => Shape::Double,
            "int16" => Shape::Int16,
            "int32" => Shape::Int32,
            "int64" => Shape::Int64,
            "single" => Shape::Single,
            "string" => Shape::String,
            "uint16" => Shape::UInt16,
            "uint32" => Shape::UInt32,
            "uint64" => Shape::UInt64,
            "timestamp" => Shape::Timestamp,
            "type" => Shape::Type,
            "object" => Shape::Object,
            "callable" => Shape::Callable,
            _ => return None,
        })
    }
}

// ============================================================================
//  Signatures and type descriptions
// ============================================================================

/// How an argument flows between caller and callee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamMode {
    /// Caller to callee only.
    In,
    /// Callee to caller only; the value passed in is ignored.
    Out,
    /// Both ways.
    Ref,
}

impl ParamMode {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            ParamMode::In => 0,
            ParamMode::Out => 1,
            ParamMode::Ref => 2,
        }
    }

    pub(crate) fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(ParamMode::In),
            1 => Some(ParamMode::Out),
            2 => Some(ParamMode::Ref),
            _ => None,
        }
    }

    /// Whether the callee's value is copied back to the caller.
    pub fn flows_back(self) -> bool {
        !matches!(self, ParamMode::In)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Param {
    pub name: String,
    pub shape: Shape,
    pub mode: ParamMode,
}

/// Parameter and return shapes of a method or callable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub params: Vec<Param>,
    pub ret: Shape,
}

impl Signature {
    pub fn new(ret: Shape) -> Self {
        Self { params: Vec::new(), ret }
    }

    /// A signature that accepts and returns anything, for callers without static types.
    pub fn dynamic(arity: usize) -> Self {
        let mut sig = Self::new(Shape::Any);
        for i in 0..arity {
            sig = sig.param(format!("arg{}", i), Shape::Any);
        }
        sig
    }

    pub fn param(self, name: impl Into<String>, shape: Shape) -> Self {
        self.param_with(name, shape, ParamMode::In)
    }

    pub fn out_param(self, name: impl Into<String>, shape: Shape) -> Self {
        self.param_with(name, shape, ParamMode::Out)
    }

    pub fn ref_param(self, name: impl Into<String>, shape: Shape) -> Self {
        self.param_with(name, shape, ParamMode::Ref)
    }

    pub fn param_with(mut self, name: impl Into<String>, shape: Shape, mode: ParamMode) -> Self {
        self.params.push(Param { name: name.into(), shape, mode });
        self
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// Fixes in-flowing arguments to the declared parameter shapes.
    pub(crate) fn fix_args(&self, args: &mut [Value], schemas: &SchemaRegistry) -> Result<()> {
        if args.len() != self.params.len() {
            return Err(Fault::mismatch(
                format!("{} arguments", self.params.len()),
                format!("{} arguments", args.len()),
            ));
        }
        for (param, arg) in self.params.iter().zip(args.iter_mut()) {
            if param.mode == ParamMode::Out {
                continue;
            }
            let value = std::mem::replace(arg, Value::Null);
            *arg = param.shape.fix(value, schemas)?;
        }
        Ok(())
    }

    /// Collects the values of out and ref parameters after a call.
    pub(crate) fn collect_outs(&self, args: &[Value]) -> Vec<(u32, Value)> {
        self.params
            .iter()
            .zip(args)
            .enumerate()
            .filter(|(_, (param, _))| param.mode.flows_back())
            .map(|(i, (_, arg))| (i as u32, arg.clone()))
            .collect()
    }

    /// Writes returned out and ref values back into the caller's arguments.
    pub(crate) fn apply_outs(
        &self,
        args: &mut [Value],
        outs: Vec<(u32, Value)>,
        schemas: &SchemaRegistry,
    ) -> Result<()> {
        for (index, value) in outs {
            let i = index as usize;
            let (Some(param), Some(slot)) = (self.params.get(i), args.get_mut(i)) else {
                return Err(Fault::Protocol(format!("out value for missing parameter {}", index)));
            };
            if param.mode.flows_back() {
                *slot = param.shape.fix(value, schemas)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match p.mode {
                ParamMode::In => {}
                ParamMode::Out => write!(f, "out ")?,
                ParamMode::Ref => write!(f, "ref ")?,
            }
            write!(f, "{}: {}", p.name, p.shape)?;
        }
        write!(f, ") -> {}", self.ret)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodInfo {
    pub name: String,
    pub signature: Signature,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PropertyInfo {
    pub name: String,
    pub shape: Shape,
    pub writable: bool,
}

/// Description of an exposed object's type: its name, the interfaces it
/// implements and its members.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TypeInfo {
    pub name: String,
    pub interfaces: Vec<String>,
    pub methods: Vec<MethodInfo>,
    pub properties: Vec<PropertyInfo>,
}

impl TypeInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    pub fn implements(mut self, interface: impl Into<String>) -> Self {
        self.interfaces.push(interface.into());
        self
    }

    pub fn method(mut self, name: impl Into<String>, signature: Signature) -> Self {
        self.methods.push(MethodInfo { name: name.into(), signature });
        self
    }

    pub fn property(mut self, name: impl Into<String>, shape: Shape, writable: bool) -> Self {
        self.properties.push(PropertyInfo { name: name.into(), shape, writable });
        self
    }

    /// Finds a method by name, preferring the overload with matching arity.
    pub fn find_method(&self, name: &str, arity: usize) -> Option<&MethodInfo> {
        let mut candidates = self.methods.iter().filter(|m| m.name == name);
        let first = candidates.clone().next();
        candidates.find(|m| m.signature.arity() == arity).or(first)
    }

    pub fn find_property(&self, name: &str) -> Option<&PropertyInfo> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Whether an object of this type can be treated as `interface`.
    pub fn is_a(&self, interface: &str) -> bool {
        self.name == interface || self.interfaces.iter().any(|i| i == interface)
    }
}

/// What a handle refers to, as the importing side sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    Object(TypeInfo),
    Callable(Signature),
}

impl Capability {
    pub fn type_name(&self) -> &str {
        match self {
            Capability::Object(info) => &info.name,
            Capability::Callable(_) => "callable",
        }
    }
}
