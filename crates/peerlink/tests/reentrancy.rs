mod common;

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use peerlink::Callable;
use peerlink::Proxy;
use peerlink::Shape;
use peerlink::Signature;
use peerlink::Value;

use common::Client;
use common::Server;
use common::eventually;
use common::log;
use common::pair;

fn entries(log: &common::Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

async fn server(left: &peerlink::Session) -> anyhow::Result<Proxy> {
    Ok(left.remote_root().await?.as_proxy().cloned().expect("server root"))
}

// --- Linked calls ---

#[tokio::test]
async fn test_callback_runs_while_caller_waits() -> anyhow::Result<()> {
    let client_log = log();
    let server_log = log();
    let (left, _right) = pair(Value::Null, Value::object(Server { log: server_log.clone() }));
    let server = server(&left).await?;

    let client = Value::object(Client { log: client_log.clone() });
    let answer = server.invoke("f", vec![client]).await?;

    assert_eq!(answer, Value::Int32(42));
    assert_eq!(entries(&client_log), vec!["g"]);
    assert_eq!(entries(&server_log), vec!["f saw 7"]);
    Ok(())
}

#[tokio::test]
async fn test_nested_callbacks_in_both_directions() -> anyhow::Result<()> {
    let shared = log();
    let (left, _right) = pair(Value::Null, Value::object(Server { log: shared.clone() }));
    let server = server(&left).await?;

    let client = Value::object(Client { log: shared.clone() });
    let answer = server.invoke("f2", vec![client, Value::proxy(server.clone())]).await?;

    assert_eq!(answer, Value::Int32(99));
    assert_eq!(entries(&shared), vec!["h", "g2", "f2"]);
    Ok(())
}

#[tokio::test]
async fn test_callable_argument_is_called_back() -> anyhow::Result<()> {
    let (left, _right) = pair(Value::Null, Value::object(Server { log: log() }));
    let server = server(&left).await?;

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let double = Callable::new(Signature::new(Shape::Int32).param("x", Shape::Int32), move |_, args| {
        seen.fetch_add(1, Ordering::SeqCst);
        async move { Ok(Value::Int32(args[0].as_i64().unwrap_or_default() as i32 * 2)) }
    });

    let answer = server.invoke("Apply", vec![Value::callable(double.clone()), Value::Int32(21)]).await?;
    assert_eq!(answer, Value::Int32(42));
    let answer = server.invoke("Apply", vec![Value::callable(double), Value::Byte(5)]).await?;
    assert_eq!(answer, Value::Int32(10));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // The peer's callable proxy dies with each call.
    eventually("the callable to be released", || left.exposed_count() == 0).await;
    Ok(())
}

// --- Callables ---

#[tokio::test]
async fn test_returned_callable_keeps_its_state() -> anyhow::Result<()> {
    let (left, right) = pair(Value::Null, Value::object(Server { log: log() }));
    let server = server(&left).await?;

    let counter = server.invoke("MakeCounter", vec![]).await?.as_proxy().cloned().expect("callable");
    assert!(counter.is_callable());
    assert_eq!(counter.signature().map(|s| s.ret.clone()), Some(Shape::Int32));

    assert_eq!(counter.call(vec![]).await?, Value::Int32(0));
    assert_eq!(left.call_remote(&counter, vec![]).await?, Value::Int32(1));

    let (tx, rx) = tokio::sync::oneshot::channel();
    counter.call_with(vec![], move |outcome| {
        let _ = tx.send(outcome);
    })?;
    assert_eq!(rx.await??, Value::Int32(2));
    let (tx, rx) = tokio::sync::oneshot::channel();
    left.call_remote_with(&counter, vec![], move |outcome| {
        let _ = tx.send(outcome);
    })?;
    assert_eq!(rx.await??, Value::Int32(3));

    // Calling an object as a function is refused before anything is sent.
    assert!(server.call(vec![]).await.is_err());

    assert_eq!(right.exposed_count(), 2);
    drop(counter);
    eventually("the counter to be released", || right.exposed_count() == 1).await;
    Ok(())
}

#[tokio::test]
async fn test_many_concurrent_callers() -> anyhow::Result<()> {
    let (left, _right) = pair(Value::Null, Value::object(Server { log: log() }));
    let server = server(&left).await?;

    let mut tasks = Vec::new();
    for i in 0..32 {
        let server = server.clone();
        tasks.push(tokio::spawn(async move {
            let client = Value::object(Client { log: log() });
            let answer = server.invoke("f", vec![client]).await;
            (i, answer)
        }));
    }
    for task in tasks {
        let (i, answer) = tokio::time::timeout(Duration::from_secs(5), task).await??;
        assert_eq!(answer?, Value::Int32(42), "caller {}", i);
    }
    assert_eq!(left.pending_count(), 0);
    Ok(())
}
