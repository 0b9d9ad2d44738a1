use std::sync::Arc;
use std::sync::Mutex;

use crate::codec::Codec;
use crate::codec::NoReferences;
use crate::dispatch::Action;
use crate::dispatch::Completion;
use crate::dispatch::InboundCall;
use crate::dispatch::PendingCalls;
use crate::dispatch::Wake;
use crate::error::Fault;
use crate::error::RemoteFault;
use crate::frame::Frame;
use crate::frame::ReplyValue;
use crate::frame::Request;
use crate::object::Callable;
use crate::registry::HandleId;
use crate::registry::OWNER_BIT;
use crate::registry::Registry;
use crate::registry::Release;
use crate::registry::Target;
use crate::schema::RecordSchema;
use crate::schema::SchemaRegistry;
use crate::shape::Shape;
use crate::shape::Signature;
use crate::value::Array;
use crate::value::Decimal;
use crate::value::RecordValue;
use crate::value::Timestamp;
use crate::value::Value;

fn point_schema() -> RecordSchema {
    RecordSchema::new("test.Point").field("x", Shape::Int32).field("y", Shape::Int32)
}

fn roundtrip(schemas: &SchemaRegistry, value: &Value) -> Value {
    let refs = NoReferences;
    let codec = Codec::new(schemas, &refs);
    let bytes = codec.encode(value).expect("encode");
    codec.decode(&bytes).expect("decode")
}

// ============================================================================
//  Shapes
// ============================================================================

#[test]
fn test_fix_widens_losslessly() {
    let schemas = SchemaRegistry::new();
    assert_eq!(Shape::Int64.fix(Value::Int16(-3), &schemas), Ok(Value::Int64(-3)));
    assert_eq!(Shape::Double.fix(Value::Single(1.5), &schemas), Ok(Value::Double(1.5)));
    assert_eq!(Shape::UInt64.fix(Value::Byte(7), &schemas), Ok(Value::UInt64(7)));
    assert_eq!(
        Shape::Decimal.fix(Value::Int32(12), &schemas),
        Ok(Value::Decimal(Decimal::new(12, 0)))
    );
}

#[test]
fn test_fix_never_narrows() {
    let schemas = SchemaRegistry::new();
    let err = Shape::Int16.fix(Value::Int64(1), &schemas).unwrap_err();
    assert!(matches!(err, Fault::TypeMismatch { .. }));
    assert!(Shape::Int32.fix(Value::String("1".into()), &schemas).is_err());
}

#[test]
fn test_fix_null_only_for_nullable_shapes() {
    let schemas = SchemaRegistry::new();
    assert_eq!(Shape::String.fix(Value::Null, &schemas), Ok(Value::Null));
    assert_eq!(Shape::Object.fix(Value::Null, &schemas), Ok(Value::Null));
    assert!(Shape::Int32.fix(Value::Null, &schemas).is_err());
}

#[test]
fn test_fix_array_to_sequence_and_back() {
    let schemas = SchemaRegistry::new();
    let array = Value::Array(Array::new(Shape::Int16, vec![Value::Int16(1), Value::Int16(2)]));

    let seq = Shape::sequence(Shape::Int32).fix(array, &schemas).unwrap();
    assert_eq!(seq, Value::List(vec![Value::Int32(1), Value::Int32(2)]));

    let back = Shape::array(Shape::Int64).fix(seq, &schemas).unwrap();
    assert_eq!(back, Value::Array(Array::new(Shape::Int64, vec![Value::Int64(1), Value::Int64(2)])));
}

#[test]
fn test_fix_record_orders_fields_by_schema() {
    let schemas = SchemaRegistry::new();
    schemas.register(point_schema());

    let record = RecordValue::generic().with("y", 2i16).with("x", 1i32);
    let fixed = Shape::record("test.Point").fix(Value::Record(record), &schemas).unwrap();

    let expected = RecordValue::new("test.Point").with("x", 1i32).with("y", 2i32);
    assert_eq!(fixed, Value::Record(expected));
}

#[test]
fn test_fix_record_rejects_missing_field_and_foreign_schema() {
    let schemas = SchemaRegistry::new();
    schemas.register(point_schema());

    let partial = RecordValue::generic().with("x", 1i32);
    assert!(Shape::record("test.Point").fix(Value::Record(partial), &schemas).is_err());

    let other = RecordValue::new("test.Other").with("x", 1i32).with("y", 2i32);
    assert!(Shape::record("test.Point").fix(Value::Record(other), &schemas).is_err());
}

#[test]
fn test_signature_fix_args_checks_arity_and_skips_out() {
    let schemas = SchemaRegistry::new();
    let sig = Signature::new(Shape::Void).param("a", Shape::Int64).out_param("b", Shape::Int32);

    let mut args = vec![Value::Int16(4), Value::String("ignored".into())];
    sig.fix_args(&mut args, &schemas).unwrap();
    assert_eq!(args[0], Value::Int64(4));
    assert_eq!(args[1], Value::String("ignored".into()));

    let mut short = vec![Value::Int64(1)];
    assert!(sig.fix_args(&mut short, &schemas).is_err());
}

#[test]
fn test_signature_outs_flow_back() {
    let schemas = SchemaRegistry::new();
    let sig = Signature::new(Shape::Void)
        .param("a", Shape::Int32)
        .out_param("b", Shape::Int64)
        .ref_param("c", Shape::String);

    let served = vec![Value::Int32(1), Value::Int32(9), Value::String("new".into())];
    let outs = sig.collect_outs(&served);
    assert_eq!(outs, vec![(1, Value::Int32(9)), (2, Value::String("new".into()))]);

    let mut caller = vec![Value::Int32(1), Value::Null, Value::String("old".into())];
    sig.apply_outs(&mut caller, outs, &schemas).unwrap();
    assert_eq!(caller, vec![Value::Int32(1), Value::Int64(9), Value::String("new".into())]);

    assert!(sig.apply_outs(&mut caller, vec![(7, Value::Null)], &schemas).is_err());
}

// ============================================================================
//  Codec
// ============================================================================

#[test]
fn test_codec_roundtrip_scalars_and_containers() {
    let schemas = SchemaRegistry::new();
    let value = Value::List(vec![
        Value::Null,
        Value::Bool(true),
        Value::Byte(255),
        Value::Char('λ'),
        Value::Decimal(Decimal::new(-12345, 2)),
        Value::Double(2.5),
        Value::Int16(-2),
        Value::Int32(1 << 20),
        Value::Int64(i64::MIN),
        Value::Single(0.25),
        Value::String("hello".into()),
        Value::UInt16(u16::MAX),
        Value::UInt32(7),
        Value::UInt64(u64::MAX),
        Value::Timestamp(Timestamp::new(1_700_000_000, 42)),
        Value::Type("demo.Widget".into()),
        Value::Array(Array::new(Shape::Int32, vec![Value::Int32(1), Value::Int32(2)])),
        Value::Record(RecordValue::generic().with("k", "v").with("n", 3i64)),
    ]);
    assert_eq!(roundtrip(&schemas, &value), value);
}

#[test]
fn test_codec_roundtrip_random_integers() {
    let schemas = SchemaRegistry::new();
    for _ in 0..64 {
        let value = Value::List(vec![
            Value::Int64(rand::random::<i64>()),
            Value::UInt32(rand::random::<u32>()),
            Value::Int16(rand::random::<i16>()),
        ]);
        assert_eq!(roundtrip(&schemas, &value), value);
    }
}

#[test]
fn test_codec_known_schema_roundtrip() {
    let schemas = SchemaRegistry::new();
    schemas.register(point_schema());
    let value = Value::Record(RecordValue::new("test.Point").with("x", 1i32).with("y", -1i32));
    assert_eq!(roundtrip(&schemas, &value), value);
}

#[test]
fn test_codec_unknown_schema_degrades_to_generic() {
    let sender = SchemaRegistry::new();
    sender.register(point_schema());
    let receiver = SchemaRegistry::new();

    let refs = NoReferences;
    let value = Value::Record(RecordValue::new("test.Point").with("x", 1i32).with("y", 2i32));
    let bytes = Codec::new(&sender, &refs).encode(&value).unwrap();
    let decoded = Codec::new(&receiver, &refs).decode(&bytes).unwrap();

    let record = decoded.as_record().expect("record");
    assert_eq!(record.schema, None);
    assert_eq!(record.get("x"), Some(&Value::Int32(1)));
    assert_eq!(record.get("y"), Some(&Value::Int32(2)));
}

#[test]
fn test_codec_unknown_array_element_falls_back_to_any() {
    let sender = SchemaRegistry::new();
    let receiver = SchemaRegistry::new();
    let refs = NoReferences;

    let item = Value::Record(RecordValue::new("test.Missing").with("a", 1i32));
    let value = Value::Array(Array::new(Shape::record("test.Missing"), vec![item]));
    let bytes = Codec::new(&sender, &refs).encode(&value).unwrap();
    let decoded = Codec::new(&receiver, &refs).decode(&bytes).unwrap();

    let Value::Array(array) = decoded else {
        panic!("expected array, got {:?}", decoded);
    };
    assert_eq!(array.elem, Shape::Any);
    assert_eq!(array.items.len(), 1);
    assert_eq!(array.items[0].as_record().and_then(|r| r.schema.clone()), None);
}

#[test]
fn test_codec_rejects_heterogeneous_array() {
    let schemas = SchemaRegistry::new();
    let refs = NoReferences;
    let value = Value::Array(Array::new(Shape::Int32, vec![Value::Int32(1), Value::String("x".into())]));
    let err = Codec::new(&schemas, &refs).encode(&value).unwrap_err();
    assert!(matches!(err, Fault::Unmarshalable(_)));
}

#[test]
fn test_codec_rejects_schema_violation() {
    let schemas = SchemaRegistry::new();
    schemas.register(point_schema());
    let refs = NoReferences;
    let value = Value::Record(RecordValue::new("test.Point").with("x", "one").with("y", 2i32));
    let err = Codec::new(&schemas, &refs).encode(&value).unwrap_err();
    assert!(matches!(err, Fault::Unmarshalable(_)));
}

#[test]
fn test_codec_objects_need_a_session() {
    let schemas = SchemaRegistry::new();
    let refs = NoReferences;
    let callable = Callable::new(Signature::new(Shape::Void), |_, _| async { Ok(Value::Null) });
    let err = Codec::new(&schemas, &refs).encode(&Value::callable(callable)).unwrap_err();
    assert!(matches!(err, Fault::Unmarshalable(_)));
}

#[test]
fn test_codec_depth_limit() {
    let schemas = SchemaRegistry::new();
    let refs = NoReferences;
    let mut value = Value::Null;
    for _ in 0..100 {
        value = Value::List(vec![value]);
    }
    let err = Codec::new(&schemas, &refs).encode(&value).unwrap_err();
    assert!(matches!(err, Fault::Unmarshalable(_)));
}

#[test]
fn test_codec_bounds_decimal_scale() {
    let schemas = SchemaRegistry::new();
    let refs = NoReferences;
    let codec = Codec::new(&schemas, &refs);
    let huge = Value::Decimal(Decimal::new(1, u32::MAX));
    assert!(matches!(codec.encode(&huge), Err(Fault::Unmarshalable(_))));

    let mut enc = peerpack::Encoder::new();
    enc.decimal(1, u32::MAX).unwrap();
    let bytes = enc.into_bytes().unwrap();
    assert!(matches!(codec.decode(&bytes), Err(Fault::Protocol(_))));

    let widest = Value::Decimal(Decimal::new(i128::MAX, Decimal::MAX_SCALE));
    assert_eq!(codec.decode(&codec.encode(&widest).unwrap()).unwrap(), widest);
}

#[test]
fn test_timestamp_to_system_time() {
    for stamp in [Timestamp::new(1_700_000_000, 42), Timestamp::new(-5, 250), Timestamp::new(0, 0)] {
        let time = stamp.to_system_time().unwrap();
        assert_eq!(Timestamp::from(time), stamp);
    }
    assert_eq!(Timestamp::new(i64::MAX, 1_500_000_000).to_system_time(), None);
}

#[test]
fn test_codec_rejects_trailing_bytes() {
    let schemas = SchemaRegistry::new();
    let refs = NoReferences;
    let codec = Codec::new(&schemas, &refs);
    let mut bytes = codec.encode(&Value::Int32(1)).unwrap();
    bytes.extend(codec.encode(&Value::Int32(2)).unwrap());
    assert!(matches!(codec.decode(&bytes), Err(Fault::Protocol(_))));
}

// ============================================================================
//  Frames
// ============================================================================

fn frame_roundtrip(frame: &Frame) -> Frame {
    let schemas = SchemaRegistry::new();
    let refs = NoReferences;
    let codec = Codec::new(&schemas, &refs);
    let bytes = frame.encode(&codec).expect("encode frame");
    Frame::decode(&bytes, &codec).expect("decode frame")
}

#[test]
fn test_frame_requests_roundtrip() {
    let sig = Signature::new(Shape::sequence(Shape::Int32)).param("n", Shape::Int32).ref_param("s", Shape::String);
    let requests = vec![
        Request::GetRoot,
        Request::MethodCall {
            target: 3 | OWNER_BIT,
            method: "Range".into(),
            signature: sig.clone(),
            args: vec![Value::Int32(3), Value::String("x".into())],
        },
        Request::PropertyAccess { target: 9, name: "Name".into(), shape: Shape::String, value: None },
        Request::PropertyAccess {
            target: 9,
            name: "Name".into(),
            shape: Shape::String,
            value: Some(Value::String("new".into())),
        },
        Request::DelegateCall { target: 4, signature: sig, args: vec![Value::Int32(1), Value::Null] },
        Request::CanCastTo { target: 4, interface: "demo.IWidget".into() },
        Request::CreateStream { channel: 12 },
        Request::ReferenceRelease { handle: 5 | OWNER_BIT, count: 17 },
        Request::Echo(Value::List(vec![Value::Bool(false)])),
    ];
    for (i, request) in requests.into_iter().enumerate() {
        let frame = Frame::request(i as u32 + 1, Some(99), request);
        assert_eq!(frame_roundtrip(&frame), frame);
    }
}

#[test]
fn test_frame_replies_and_streams_roundtrip() {
    let ok = Frame::reply(
        7,
        Ok(ReplyValue { value: Value::Int64(42), outs: vec![(1, Value::String("out".into()))] }),
    );
    assert_eq!(frame_roundtrip(&ok), ok);

    let err = Frame::reply(8, Err(RemoteFault { kind: "application".into(), message: "boom".into() }));
    assert_eq!(frame_roundtrip(&err), err);

    let data = Frame::Data { channel: 3 | 0x8000, bytes: vec![1, 2, 3] };
    assert_eq!(frame_roundtrip(&data), data);

    let close = Frame::Close { channel: 3 };
    assert_eq!(frame_roundtrip(&close), close);
}

#[test]
fn test_frame_rejects_garbage() {
    let schemas = SchemaRegistry::new();
    let refs = NoReferences;
    let codec = Codec::new(&schemas, &refs);
    assert!(Frame::decode(&[0xFF, 0x00, 0x13], &codec).is_err());
    assert!(Frame::decode(&[], &codec).is_err());
}

#[test]
fn test_fault_kinds_and_fatality() {
    assert!(Fault::Protocol("bad frame".into()).is_fatal());
    assert!(Fault::UnknownHandle(7).is_fatal());
    assert!(!Fault::Timeout.is_fatal());
    assert!(!Fault::Application("nope".into()).is_fatal());

    let remote = Fault::MemberNotFound("Frobnicate".into()).to_remote();
    assert_eq!(remote.kind, "member_not_found");
    assert_eq!(remote.message, "member not found: Frobnicate");
    assert_eq!(Fault::Remote(remote.clone()).to_remote(), remote);
}

// ============================================================================
//  Registry
// ============================================================================

struct FakeProxy;

fn noop_callable() -> Callable {
    Callable::new(Signature::new(Shape::Void), |_, _| async { Ok(Value::Null) })
}

#[test]
fn test_handle_id_views() {
    let exposed = HandleId::exposed(5);
    assert!(!exposed.is_imported());
    assert_eq!(exposed.across(), HandleId::imported(5));
    assert_eq!(exposed.across().index(), 5);
    assert_eq!(exposed.across().across(), exposed);
}

#[test]
fn test_expose_counts_and_reuses_handles() {
    let registry: Registry<FakeProxy> = Registry::new(16);
    let callable = noop_callable();
    let target = Target::Callable(callable.clone());

    let (first, _) = registry.expose(&target).unwrap();
    let (again, _) = registry.expose(&Target::Callable(callable)).unwrap();
    assert_eq!(first, again);
    assert_eq!(registry.refcount(first), Some(2));

    let (other, _) = registry.expose(&Target::Callable(noop_callable())).unwrap();
    assert_ne!(first, other);
    assert!(!first.is_imported() && !other.is_imported());

    assert!(!registry.release(first, 1));
    assert!(registry.release(first, 1));
    assert_eq!(registry.refcount(first), None);
    assert!(registry.resolve(first).is_none());
    assert_eq!(registry.exposed_len(), 1);

    // Re-exposing after removal starts a fresh count.
    let (fresh, _) = registry.expose(&target).unwrap();
    assert_eq!(registry.refcount(fresh), Some(1));
}

#[test]
fn test_release_of_unknown_handle_is_ignored() {
    let registry: Registry<FakeProxy> = Registry::new(16);
    assert!(!registry.release(HandleId::exposed(77), 3));
}

#[test]
fn test_import_keeps_identity_while_alive() {
    let registry: Registry<FakeProxy> = Registry::new(16);
    let id = HandleId::imported(3);

    let (a, none) = registry.import(id, || Arc::new(FakeProxy)).unwrap();
    assert!(none.is_none());
    let (b, none) = registry.import(id, || Arc::new(FakeProxy)).unwrap();
    assert!(none.is_none());
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(registry.shadow(id), Some(2));
    assert!(registry.lookup(id).is_some_and(|p| Arc::ptr_eq(&p, &a)));
}

#[test]
fn test_import_throttle_conserves_count() {
    let registry: Registry<FakeProxy> = Registry::new(4);
    let id = HandleId::imported(8);
    let mut released = 0u32;

    let (proxy, _) = registry.import(id, || Arc::new(FakeProxy)).unwrap();
    for _ in 1..11 {
        let (_, release) = registry.import(id, || Arc::new(FakeProxy)).unwrap();
        if let Some(release) = release {
            assert_eq!(release.handle, HandleId::exposed(8));
            assert!(registry.shadow(id).is_some_and(|s| s == 1));
            released += release.count;
        }
    }
    assert!(registry.shadow(id).is_some_and(|s| s <= 4));

    let last = registry.finalize(id, Arc::as_ptr(&proxy)).expect("final release");
    released += last.count;
    assert_eq!(released, 11);
    assert_eq!(registry.imported_len(), 0);
}

#[test]
fn test_dead_proxy_is_replaced_and_its_count_released() {
    let registry: Registry<FakeProxy> = Registry::new(16);
    let id = HandleId::imported(2);

    let (old, _) = registry.import(id, || Arc::new(FakeProxy)).unwrap();
    registry.import(id, || Arc::new(FakeProxy)).unwrap();
    // Keep the allocation so the replacement cannot reuse its address.
    let old_weak = Arc::downgrade(&old);
    let old_ptr = old_weak.as_ptr();
    drop(old);

    let (new, stale) = registry.import(id, || Arc::new(FakeProxy)).unwrap();
    assert_eq!(stale, Some(Release { handle: HandleId::exposed(2), count: 2 }));

    // The late finalizer of the old proxy must not touch the new entry.
    assert_eq!(registry.finalize(id, old_ptr), None);
    assert_eq!(registry.shadow(id), Some(1));
    drop(new);
}

#[test]
fn test_registry_close_forgets_everything() {
    let registry: Registry<FakeProxy> = Registry::new(16);
    registry.expose(&Target::Callable(noop_callable())).unwrap();
    let (proxy, _) = registry.import(HandleId::imported(1), || Arc::new(FakeProxy)).unwrap();

    registry.close();
    registry.close();
    assert!(registry.is_closed());
    assert_eq!(registry.exposed_len(), 0);
    assert_eq!(registry.imported_len(), 0);
    assert!(registry.expose(&Target::Callable(noop_callable())).is_err());
    assert_eq!(registry.finalize(HandleId::imported(1), Arc::as_ptr(&proxy)), None);
}

// ============================================================================
//  Pending calls
// ============================================================================

fn echo_call(id: u32, linked: u32) -> InboundCall {
    InboundCall { id, linked: Some(linked), action: Action::Echo(Value::Int32(id as i32)) }
}

#[test]
fn test_pending_ids_are_unique_and_nonzero() {
    let calls = PendingCalls::new();
    let (a, _rx_a) = calls.register_blocking().unwrap();
    let (b, _rx_b) = calls.register_blocking().unwrap();
    assert!(a != 0 && b != 0 && a != b);
    assert_eq!(calls.len(), 2);
}

#[test]
fn test_complete_wakes_blocked_caller() {
    let calls = PendingCalls::new();
    let (id, mut rx) = calls.register_blocking().unwrap();
    assert_eq!(calls.complete(id, Ok(ReplyValue::of(Value::Int32(5)))), Completion::Delivered);
    match rx.try_recv() {
        Ok(Wake::Completed(Ok(reply))) => assert_eq!(reply.value, Value::Int32(5)),
        _ => panic!("expected completion"),
    }
    assert_eq!(calls.len(), 0);
}

#[test]
fn test_late_and_unknown_replies() {
    let calls = PendingCalls::new();
    let (id, _rx) = calls.register_blocking().unwrap();
    calls.abandon(id);
    assert_eq!(calls.complete(id, Ok(ReplyValue::default())), Completion::Late);
    // A late reply is only forgiven once.
    assert_eq!(calls.complete(id, Ok(ReplyValue::default())), Completion::Unknown);
    assert_eq!(calls.complete(4242, Ok(ReplyValue::default())), Completion::Unknown);
}

#[test]
fn test_continuation_runs_once() {
    let calls = PendingCalls::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let id = calls
        .register_continuation(Box::new(move |outcome| {
            sink.lock().unwrap().push(outcome.map(|r| r.value));
        }))
        .ok()
        .unwrap();
    assert_eq!(calls.complete(id, Ok(ReplyValue::of(Value::Bool(true)))), Completion::Delivered);
    assert_eq!(calls.close(), 0);
    assert_eq!(*seen.lock().unwrap(), vec![Ok(Value::Bool(true))]);
}

#[test]
fn test_panicking_continuation_is_contained() {
    let calls = PendingCalls::new();
    let id = calls.register_continuation(Box::new(|_| panic!("reply handler exploded"))).ok().unwrap();
    assert_eq!(calls.complete(id, Ok(ReplyValue::default())), Completion::Delivered);
    calls.register_continuation(Box::new(|_| panic!("close handler exploded"))).ok().unwrap();
    assert_eq!(calls.close(), 1);
    assert_eq!(calls.len(), 0);
}

#[test]
fn test_nested_calls_reach_blocked_caller_only() {
    let calls = PendingCalls::new();
    let (blocked, mut rx) = calls.register_blocking().unwrap();
    assert!(calls.route_nested(blocked, echo_call(11, blocked)).is_none());
    match rx.try_recv() {
        Ok(Wake::Nested(call)) => assert_eq!(call.id, 11),
        _ => panic!("expected nested call"),
    }

    let async_id = calls.register_continuation(Box::new(|_| {})).ok().unwrap();
    let back = calls.route_nested(async_id, echo_call(12, async_id));
    assert!(back.is_some_and(|call| call.id == 12));

    assert!(calls.route_nested(999, echo_call(13, 999)).is_some());
}

#[test]
fn test_close_fails_everything_once() {
    let calls = PendingCalls::new();
    let (_, mut rx) = calls.register_blocking().unwrap();
    let failed = Arc::new(Mutex::new(0));
    let counter = failed.clone();
    calls
        .register_continuation(Box::new(move |outcome| {
            assert_eq!(outcome.err(), Some(Fault::ConnectionClosed));
            *counter.lock().unwrap() += 1;
        }))
        .ok()
        .unwrap();

    assert_eq!(calls.close(), 2);
    assert_eq!(calls.close(), 0);
    assert_eq!(*failed.lock().unwrap(), 1);
    assert!(matches!(rx.try_recv(), Ok(Wake::Completed(Err(Fault::ConnectionClosed)))));
    assert!(calls.register_blocking().is_err());
}
