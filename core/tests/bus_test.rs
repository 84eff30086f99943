use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use busline_core::{
    Bus, BusError, BusOptions, Channel, Envelope, EnvelopeKind, HandlerError, Result,
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Echo {
    id: u32,
}

fn short_timeout(ms: u64) -> BusOptions {
    BusOptions {
        execute_timeout: Some(Duration::from_millis(ms)),
    }
}

#[tokio::test]
async fn emit_reaches_every_listener() -> Result<()> {
    let bus = Bus::new();
    let (tx, mut rx) = mpsc::unbounded_channel();

    for listener in ["a", "b"] {
        let tx = tx.clone();
        bus.on("user.created", move |payload: Value| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((listener, payload));
                Ok::<_, HandlerError>(())
            }
        });
    }

    bus.emit("user.created", json!({"name": "ada"}))?;

    let mut seen = Vec::new();
    for _ in 0..2 {
        let (listener, payload) = timeout(WAIT, rx.recv())
            .await
            .expect("timeout")
            .expect("channel closed");
        assert_eq!(payload, json!({"name": "ada"}));
        seen.push(listener);
    }
    seen.sort();
    assert_eq!(seen, vec!["a", "b"]);
    assert_eq!(bus.stats().emitted, 1);
    Ok(())
}

#[tokio::test]
async fn emit_without_listeners_is_ok() -> Result<()> {
    let bus = Bus::new();
    bus.emit("nobody.listens", json!(null))?;
    bus.emit("nobody.listens", "still fine")?;
    Ok(())
}

#[tokio::test]
async fn execute_ping_pong() -> Result<()> {
    let bus = Bus::new();
    bus.on("ping", |_: Value| async { Ok::<_, HandlerError>("pong") });

    let reply: String = bus.execute("ping", json!({})).await?;
    assert_eq!(reply, "pong");

    let stats = bus.stats();
    assert_eq!(stats.executed, 1);
    assert_eq!(stats.replies_matched, 1);
    assert_eq!(stats.pending, 0);
    Ok(())
}

#[tokio::test]
async fn concurrent_executes_never_cross_resolve() -> Result<()> {
    let bus = Bus::new();
    // Slower for lower ids so replies come back out of request order
    bus.on("echo", |echo: Echo| async move {
        tokio::time::sleep(Duration::from_millis(60 / u64::from(echo.id))).await;
        Ok::<_, HandlerError>(echo)
    });

    let (first, second) = tokio::join!(
        bus.execute::<_, Echo>("echo", Echo { id: 1 }),
        bus.execute::<_, Echo>("echo", Echo { id: 2 }),
    );
    assert_eq!(first?, Echo { id: 1 });
    assert_eq!(second?, Echo { id: 2 });
    Ok(())
}

#[tokio::test]
async fn handler_error_is_rebuilt_for_the_caller() {
    let bus = Bus::new();
    bus.on("explode", |_: Value| async {
        Err::<Value, _>(HandlerError::new("boom"))
    });

    let err = bus.execute::<_, Value>("explode", json!({})).await.unwrap_err();
    match err {
        BusError::Handler(e) => {
            assert_eq!(e, HandlerError::new("boom"));
            assert_eq!(e.message(), "boom");
            assert_eq!(e.status_code(), None);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(bus.stats().handler_failures, 1);
}

#[tokio::test]
async fn structured_error_keeps_status() {
    let bus = Bus::new();
    bus.on("user.get", |_: Value| async {
        Err::<Value, _>(HandlerError::status(404, "user not found"))
    });

    let err = bus.execute::<_, Value>("user.get", json!({"id": 7})).await.unwrap_err();
    assert!(matches!(
        err,
        BusError::Handler(HandlerError::Status { status: 404, ref message }) if message == "user not found"
    ));
}

#[tokio::test]
async fn undecodable_payload_is_a_400() {
    let bus = Bus::new();
    bus.on("echo", |echo: Echo| async move { Ok::<_, HandlerError>(echo) });

    let err = bus
        .execute::<_, Echo>("echo", json!("not an echo"))
        .await
        .unwrap_err();
    match err {
        BusError::Handler(e) => assert_eq!(e.status_code(), Some(400)),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn handler_panic_becomes_error_reply() {
    let bus = Bus::new();
    bus.on("fragile", |_: Value| async {
        if true {
            panic!("kaboom");
        }
        Ok::<_, HandlerError>(())
    });

    let err = bus.execute::<_, Value>("fragile", json!({})).await.unwrap_err();
    match err {
        BusError::Handler(e) => assert!(e.message().contains("kaboom")),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn execute_times_out_and_forgets_the_waiter() {
    let bus = Bus::with_options(Arc::new(Channel::default()), short_timeout(50));

    let err = bus.execute::<_, Value>("nobody.home", json!({})).await.unwrap_err();
    assert!(matches!(err, BusError::Timeout(d) if d == Duration::from_millis(50)));

    let stats = bus.stats();
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn without_timeout_execute_waits_until_shutdown() {
    let bus = Bus::with_options(
        Arc::new(Channel::default()),
        BusOptions {
            execute_timeout: None,
        },
    );

    let caller = bus.clone();
    let call = tokio::spawn(async move { caller.execute::<_, Value>("never", json!({})).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!call.is_finished());
    assert_eq!(bus.stats().pending, 1);

    bus.shutdown().await;
    let outcome = timeout(WAIT, call).await.expect("timeout").expect("join");
    assert!(matches!(outcome, Err(BusError::Closed)));
}

#[tokio::test]
async fn only_first_matching_reply_counts() -> Result<()> {
    let channel = Channel::default();
    let bus = Bus::with_transport(Arc::new(channel.clone()));

    // Hand-rolled responder that misbehaves: a wrong-type reply, then two
    // replies for the same request
    let mut requests = channel.subscribe();
    let responder = channel.clone();
    tokio::spawn(async move {
        while let Some(env) = requests.recv_envelope().await {
            if env.kind() != EnvelopeKind::Request || env.r#type != "lookup" {
                continue;
            }
            let id = env.correlation_id.clone().unwrap_or_default();
            let _ = responder.publish(Envelope::response("other", json!("wrong"), id.clone()));
            let _ = responder.publish(Envelope::response("lookup", json!("first"), id.clone()));
            let _ = responder.publish(Envelope::response("lookup", json!("second"), id));
        }
    });

    let reply: String = bus.execute("lookup", json!({})).await?;
    assert_eq!(reply, "first");

    timeout(WAIT, async {
        while bus.stats().unmatched_replies < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("unmatched replies not counted");
    assert_eq!(bus.stats().replies_matched, 1);
    Ok(())
}

#[tokio::test]
async fn every_registration_runs() -> Result<()> {
    let bus = Bus::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    for n in 0..3u32 {
        let tx = tx.clone();
        bus.on("tick", move |_: Value| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(n);
                Ok::<_, HandlerError>(())
            }
        });
    }

    bus.emit("tick", json!(1))?;
    let mut got = Vec::new();
    for _ in 0..3 {
        got.push(timeout(WAIT, rx.recv()).await.expect("timeout").expect("closed"));
    }
    got.sort();
    assert_eq!(got, vec![0, 1, 2]);
    Ok(())
}

#[tokio::test]
async fn cancelled_handler_stops_answering() {
    let bus = Bus::with_options(Arc::new(Channel::default()), short_timeout(100));
    let registration = bus.on("ping", |_: Value| async { Ok::<_, HandlerError>("pong") });
    assert_eq!(registration.event_type(), "ping");

    let pong: String = bus.execute("ping", json!({})).await.unwrap();
    assert_eq!(pong, "pong");

    registration.cancel();
    let err = bus.execute::<_, String>("ping", json!({})).await.unwrap_err();
    assert!(matches!(err, BusError::Timeout(_)));
}

#[tokio::test]
async fn closed_bus_rejects_emit_and_execute() {
    let bus = Bus::new();
    bus.shutdown().await;

    assert!(matches!(bus.emit("late", json!(1)), Err(BusError::Closed)));
    assert!(matches!(
        bus.execute::<_, Value>("late", json!(1)).await,
        Err(BusError::Closed)
    ));
    assert_eq!(bus.stats().pending, 0);
}

#[tokio::test]
async fn event_handler_failure_sends_no_reply() -> Result<()> {
    let channel = Channel::default();
    let bus = Bus::with_transport(Arc::new(channel.clone()));
    let mut observed = channel.subscribe();
    bus.on("audit", |_: Value| async {
        Err::<(), _>(HandlerError::new("ignored"))
    });

    bus.emit("audit", json!({}))?;
    let first = timeout(WAIT, observed.recv_envelope()).await.expect("timeout");
    assert_eq!(first.map(|e| e.r#type), Some("audit".to_string()));

    // Nothing else is published for an uncorrelated event
    let next = timeout(Duration::from_millis(150), observed.recv_envelope()).await;
    assert!(next.is_err());

    timeout(WAIT, async {
        while bus.stats().handler_failures == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("failure not counted");
    Ok(())
}

#[tokio::test]
async fn burst_of_events_larger_than_capacity_is_not_lost() -> Result<()> {
    let bus = Bus::new();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    bus.on("tick", move |_: Value| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, HandlerError>(())
        }
    });

    for i in 0..2000 {
        bus.emit("tick", i)?;
    }

    timeout(Duration::from_secs(5), async {
        while seen.load(Ordering::SeqCst) < 2000 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("handler invocations went missing");
    assert_eq!(seen.load(Ordering::SeqCst), 2000);
    Ok(())
}

#[tokio::test]
async fn burst_of_commands_larger_than_capacity_all_resolve() -> Result<()> {
    let bus = Bus::new();
    bus.on("echo", |echo: Echo| async move { Ok::<_, HandlerError>(echo) });

    let calls = (1..=1500u32).map(|id| bus.execute::<_, Echo>("echo", Echo { id }));
    let replies = timeout(Duration::from_secs(10), join_all(calls))
        .await
        .expect("burst did not finish");

    for (i, reply) in replies.into_iter().enumerate() {
        assert_eq!(reply?, Echo { id: i as u32 + 1 });
    }
    assert_eq!(bus.stats().pending, 0);
    Ok(())
}
