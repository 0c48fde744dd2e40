//! Guests reaching host objects through the remote object server.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use duopack::Handle;
use duopack::HandleTarget;
use duopack::RemoteRef;
use duopack::Value;
use duorpc::Error as RpcError;
use duorpc::GuestEvent;
use duorpc::GuestPort;
use duorpc::MessageChannel;
use duorun::callbacks::as_guest_function;
use duorun::remote::REMOTE_CALLBACK;
use duorun::remote::REMOTE_CONTEXT_RELEASE;
use duorun::remote::REMOTE_DEREFERENCE;
use duorun::remote::REMOTE_MEMBER_CALL;
use duorun::remote::REMOTE_MEMBER_GET;
use duorun::remote::REMOTE_MEMBER_SET;
use duorun::remote::REMOTE_REQUIRE;
use duorun::Error;
use duorun::GuestFunction;
use duorun::GuestFunctionRef;
use duorun::Host;
use duorun::HostConfig;
use duorun::PlainObject;

fn settings() -> PlainObject {
    PlainObject::new("Settings")
        .with_field("theme", "dark")
        .with_method("save", |_, _| Err(anyhow::anyhow!("disk full")))
        .with_method("describe", |this, _| {
            let theme = this.fields().get("theme").cloned().unwrap_or_default();
            Ok(Value::from(format!("theme={}", theme.as_str().unwrap_or("?"))))
        })
}

fn object_handle(value: &Value) -> Handle {
    match value {
        Value::Remote(r) => r.handle,
        other => panic!("expected a remote handle, got {:?}", other),
    }
}

/// Runs blocking guest code on its own thread.
async fn guest<T, F>(port: &Arc<GuestPort>, f: F) -> T
where
    T: Send + 'static,
    F: FnOnce(&GuestPort) -> T + Send + 'static,
{
    let port = Arc::clone(port);
    tokio::task::spawn_blocking(move || f(&port)).await.unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shared_object_lives_until_last_connection() {
    let host = Host::new(HostConfig::default()).unwrap();
    host.expose("settings", settings().into_object());

    let (a, port_a) = host.attach();
    let (b, port_b) = host.attach();
    let (port_a, port_b) = (Arc::new(port_a), Arc::new(port_b));

    let require = |port: &GuestPort| port.send_sync(REMOTE_REQUIRE, vec![Value::from("settings")]).unwrap();
    let ha = object_handle(&guest(&port_a, require).await);
    let hb = object_handle(&guest(&port_b, require).await);

    assert_eq!(ha, hb);
    assert_eq!(host.objects().refcount(ha), Some(2));

    // Same connection asking again holds it twice, still one connection.
    let again = object_handle(&guest(&port_a, require).await);
    assert_eq!(again, ha);
    assert_eq!(host.objects().holds(a, ha), 2);
    assert_eq!(host.objects().refcount(ha), Some(2));

    assert!(host.router().disconnect(a));
    assert_eq!(host.objects().refcount(ha), Some(1));
    assert!(host.objects().get(ha).is_ok());

    assert!(host.router().disconnect(b));
    assert!(matches!(host.objects().get(ha), Err(Error::NotFound(h)) if h == ha));
    assert!(host.objects().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_member_access() {
    let host = Host::new(HostConfig::default()).unwrap();
    host.expose("settings", settings().into_object());
    let (_, port) = host.attach();
    let port = Arc::new(port);

    let (theme, described, updated) = guest(&port, |port| {
        let handle = port.send_sync(REMOTE_REQUIRE, vec![Value::from("settings")]).unwrap();
        let theme = port
            .send_sync(REMOTE_MEMBER_GET, vec![handle.clone(), Value::from("theme")])
            .unwrap();
        let described = port
            .send_sync(REMOTE_MEMBER_CALL, vec![handle.clone(), Value::from("describe")])
            .unwrap();
        port.send_sync(
            REMOTE_MEMBER_SET,
            vec![handle.clone(), Value::from("theme"), Value::from("light")],
        )
        .unwrap();
        let updated = port
            .send_sync(REMOTE_MEMBER_CALL, vec![handle, Value::from("describe")])
            .unwrap();
        (theme, described, updated)
    })
    .await;

    assert_eq!(theme, Value::from("dark"));
    assert_eq!(described, Value::from("theme=dark"));
    assert_eq!(updated, Value::from("theme=light"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_method_is_wrapped_with_cause() {
    let host = Host::new(HostConfig::default()).unwrap();
    host.expose("settings", settings().into_object());
    let (_, port) = host.attach();
    let port = Arc::new(port);

    let err = guest(&port, |port| {
        let handle = port.send_sync(REMOTE_REQUIRE, vec![Value::from("settings")]).unwrap();
        port.send_sync(REMOTE_MEMBER_CALL, vec![handle, Value::from("save")])
            .unwrap_err()
    })
    .await;

    match err {
        RpcError::Remote(e) => {
            assert_eq!(
                e.message,
                "Could not call remote method 'save'. Check that the method signature is correct. Underlying error: disk full"
            );
            assert_eq!(e.cause_error().map(|c| c.message.as_str()), Some("disk full"));
        }
        other => panic!("expected remote error, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dereferenced_object_is_missing() {
    let host = Host::new(HostConfig::default()).unwrap();
    host.expose("settings", settings().into_object());
    let (_, port) = host.attach();
    let port = Arc::new(port);

    let (released, err) = guest(&port, |port| {
        let handle = port.send_sync(REMOTE_REQUIRE, vec![Value::from("settings")]).unwrap();
        let released = port.send_sync(REMOTE_DEREFERENCE, vec![handle.clone()]).unwrap();
        let err = port
            .send_sync(REMOTE_MEMBER_GET, vec![handle, Value::from("theme")])
            .unwrap_err();
        (released, err)
    })
    .await;

    assert_eq!(released, Value::Bool(true));
    match err {
        RpcError::Remote(e) => assert!(
            e.message.starts_with("Cannot get property 'theme' on missing remote object"),
            "{}",
            e.message
        ),
        other => panic!("expected remote error, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_module_is_rejected() {
    let host = Host::new(HostConfig::default()).unwrap();
    let (_, port) = host.attach();
    let port = Arc::new(port);

    let err = guest(&port, |port| {
        port.send_sync(REMOTE_REQUIRE, vec![Value::from("fs")]).unwrap_err()
    })
    .await;
    match err {
        RpcError::Remote(e) => assert_eq!(e.message, "module not found: fs"),
        other => panic!("expected remote error, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_context_release_drops_every_handle() {
    let host = Host::new(HostConfig::default()).unwrap();
    host.expose("settings", settings().into_object());
    host.expose("window", PlainObject::new("Window").into_object());
    let (conn, port) = host.attach();
    let port = Arc::new(port);

    let released = guest(&port, |port| {
        port.send_sync(REMOTE_REQUIRE, vec![Value::from("settings")]).unwrap();
        port.send_sync(REMOTE_REQUIRE, vec![Value::from("window")]).unwrap();
        port.send_sync(REMOTE_CONTEXT_RELEASE, vec![]).unwrap()
    })
    .await;

    assert_eq!(released, Value::from(2));
    assert!(host.objects().handles_of(conn).is_empty());
    assert!(host.objects().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_guest_callback_round_trip() {
    let host = Host::new(HostConfig::default()).unwrap();
    let emitter = PlainObject::new("Emitter").with_method("subscribe", |this, args| {
        let listener = args.first().cloned().unwrap_or_default();
        let callback = as_guest_function(&listener).ok_or_else(|| anyhow::anyhow!("not a function"))?;
        this.fields().insert("listener".into(), listener);
        callback.call(vec![Value::from("ready")])?;
        Ok(Value::Null)
    });
    host.expose("emitter", emitter.into_object());
    let (conn, port) = host.attach();
    let port = Arc::new(port);

    let received: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    port.on(
        REMOTE_CALLBACK,
        Arc::new(move |_: &GuestEvent, args: &[Value]| {
            sink.lock().unwrap().extend_from_slice(args);
        }),
    );

    let seen = Arc::clone(&received);
    guest(&port, move |port| {
        let handle = port.send_sync(REMOTE_REQUIRE, vec![Value::from("emitter")]).unwrap();
        let callback = Value::Remote(RemoteRef::callback(Handle(5)));
        port.send_sync(REMOTE_MEMBER_CALL, vec![handle, Value::from("subscribe"), callback])
            .unwrap();

        // The callback message may land before or after the reply.
        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.lock().unwrap().is_empty() && Instant::now() < deadline {
            port.poll(Some(Duration::from_millis(20))).unwrap();
        }
    })
    .await;

    assert_eq!(
        *received.lock().unwrap(),
        vec![Value::Remote(RemoteRef::callback(Handle(5))), Value::from("ready")]
    );

    let outstanding = host.callbacks().outstanding();
    assert_eq!(outstanding.len(), 1);
    assert_eq!(
        outstanding[0].1.as_deref(),
        Some(format!("guest {} callback 5", conn).as_str())
    );

    host.router().disconnect(conn);
    assert!(host.callbacks().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_callback_after_disconnect_is_noop() {
    let host = Host::new(HostConfig::default()).unwrap();
    let kept: Arc<Mutex<Option<GuestFunctionRef>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&kept);
    let keeper = PlainObject::new("Keeper").with_method("keep", move |_, args| {
        let callback = args.first().and_then(as_guest_function);
        *slot.lock().unwrap() = callback;
        Ok(Value::Null)
    });
    host.expose("keeper", keeper.into_object());
    let (conn, port) = host.attach();
    let port = Arc::new(port);

    guest(&port, |port| {
        let handle = port.send_sync(REMOTE_REQUIRE, vec![Value::from("keeper")]).unwrap();
        port.send_sync(
            REMOTE_MEMBER_CALL,
            vec![handle, Value::from("keep"), Value::Remote(RemoteRef::callback(Handle(1)))],
        )
        .unwrap();
    })
    .await;

    host.router().disconnect(conn);
    let callback = kept.lock().unwrap().clone().unwrap();
    assert_eq!(callback.call(vec![Value::from("late")]).unwrap(), Value::Null);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stored_callback_reads_back_as_callback() {
    let host = Host::new(HostConfig::default()).unwrap();
    host.expose("button", PlainObject::new("Button").into_object());
    let (_, port_a) = host.attach();
    let (_, port_b) = host.attach();
    let (port_a, port_b) = (Arc::new(port_a), Arc::new(port_b));

    let received: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    port_a.on(
        REMOTE_CALLBACK,
        Arc::new(move |_: &GuestEvent, args: &[Value]| {
            sink.lock().unwrap().extend_from_slice(args);
        }),
    );

    let own = guest(&port_a, |port| {
        let handle = port.send_sync(REMOTE_REQUIRE, vec![Value::from("button")]).unwrap();
        let onclick = Value::Remote(RemoteRef::callback(Handle(5)));
        port.send_sync(REMOTE_MEMBER_SET, vec![handle.clone(), Value::from("onclick"), onclick])
            .unwrap();
        port.send_sync(REMOTE_MEMBER_GET, vec![handle, Value::from("onclick")])
            .unwrap()
    })
    .await;
    assert_eq!(own, Value::Remote(RemoteRef::callback(Handle(5))));

    // Another guest gets an object it can call, which reaches A's function.
    guest(&port_b, |port| {
        let handle = port.send_sync(REMOTE_REQUIRE, vec![Value::from("button")]).unwrap();
        let onclick = port
            .send_sync(REMOTE_MEMBER_GET, vec![handle, Value::from("onclick")])
            .unwrap();
        assert!(matches!(onclick, Value::Remote(RemoteRef { target: HandleTarget::Object, .. })));
        port.send_sync(REMOTE_MEMBER_CALL, vec![onclick, Value::from("call"), Value::from("clicked")])
            .unwrap();
    })
    .await;

    let seen = Arc::clone(&received);
    guest(&port_a, move |port| {
        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.lock().unwrap().is_empty() && Instant::now() < deadline {
            port.poll(Some(Duration::from_millis(20))).unwrap();
        }
    })
    .await;
    assert_eq!(
        *received.lock().unwrap(),
        vec![Value::Remote(RemoteRef::callback(Handle(5))), Value::from("clicked")]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_imports_share_one_proxy() {
    let host = Host::new(HostConfig::default()).unwrap();
    let (conn, _port) = host.attach();
    let remote = host.remote().clone();

    let proxies: Vec<GuestFunctionRef> = std::thread::scope(|s| {
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let remote = remote.clone();
                s.spawn(move || {
                    let value = Value::Remote(RemoteRef::callback(Handle(9)));
                    let imported = remote.import_value(conn, value).unwrap();
                    as_guest_function(&imported).unwrap()
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    assert!(proxies.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    assert_eq!(host.remote().proxy_count(), 1);
    assert_eq!(host.callbacks().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_registering_from_embedder_records_call_site() {
    let host = Host::new(HostConfig::default()).unwrap();
    let called = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&called);
    let f: GuestFunctionRef = Arc::new(move |_: Vec<Value>| -> anyhow::Result<Value> {
        flag.store(true, Ordering::SeqCst);
        Ok(Value::Null)
    });

    let first = host.callbacks().register(Arc::clone(&f));
    let second = host.callbacks().register(Arc::clone(&f));
    assert_eq!(first, second);

    let location = host.callbacks().resolve(first).unwrap().debug_location.unwrap();
    assert!(location.contains("tests/remote.rs"), "{}", location);

    host.callbacks().invoke(first, vec![]).unwrap();
    assert!(called.load(Ordering::SeqCst));
}
