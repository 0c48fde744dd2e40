//! Preload scripts run against a live host over a local transport.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use duopack::ErrorKind;
use duopack::Origin;
use duopack::TypedBuffer;
use duopack::Value;
use duorpc::GuestPort;
use duorpc::MessageChannel;
use duorpc::MessageEvent;
use duorun::Error;
use duorun::Host;
use duorun::HostConfig;
use duorun::LoadReport;
use duorun::LoaderConfig;
use duorun::ScriptSource;

const SEND_FIRST: &str = r#"
(module
  (import "bridge" "send" (func $send (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "loaded")
  (data (i32.const 16) "[\"first\"]")
  (func (export "main")
    (drop (call $send (i32.const 0) (i32.const 6) (i32.const 16) (i32.const 9)))))
"#;

const TRAPS: &str = r#"
(module
  (func (export "main")
    unreachable))
"#;

const SEND_THIRD: &str = r#"
(module
  (import "bridge" "send" (func $send (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "loaded")
  (data (i32.const 16) "[\"third\"]")
  (func (export "main")
    (drop (call $send (i32.const 0) (i32.const 6) (i32.const 16) (i32.const 9)))))
"#;

/// Listens on `channel` and collects every argument list.
fn record(host: &Host, channel: &str) -> Arc<Mutex<Vec<Vec<Value>>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    host.router().on(
        channel,
        Arc::new(move |_: &MessageEvent, args: &[Value]| {
            sink.lock().unwrap().push(args.to_vec());
        }),
    );
    seen
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Loads `scripts` into a fresh guest on a blocking thread.
async fn load(host: &Host, scripts: Vec<ScriptSource>) -> (LoadReport, Arc<GuestPort>) {
    let (_, port) = host.attach();
    let port = Arc::new(port);
    let loader = host.loader().unwrap();
    let guest = Arc::clone(&port);
    let report = tokio::task::spawn_blocking(move || loader.load(&guest, &scripts))
        .await
        .unwrap();
    (report, port)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_script_does_not_stop_the_rest() {
    let host = Host::new(HostConfig::default()).unwrap();
    let loaded = record(&host, "loaded");

    let (report, _port) = load(
        &host,
        vec![
            ScriptSource::text("preload/a.wat", SEND_FIRST),
            ScriptSource::text("preload/b.wat", TRAPS),
            ScriptSource::text("preload/c.wat", SEND_THIRD),
        ],
    )
    .await;

    assert_eq!(report.ran, vec!["preload/a.wat", "preload/c.wat"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "preload/b.wat");
    assert!(matches!(report.failed[0].1, Error::ScriptExecution(_)));

    eventually(|| loaded.lock().unwrap().len() == 2 && host.preload_errors().len() == 1).await;

    let loaded = loaded.lock().unwrap().clone();
    assert_eq!(loaded, vec![vec![Value::from("first")], vec![Value::from("third")]]);

    let errors = host.preload_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].script_path, "preload/b.wat");
    assert_eq!(errors[0].error.origin, Origin::Guest);
    assert!(errors[0].error.message.starts_with("Script execution error"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unapproved_import_is_module_not_found() {
    let host = Host::new(HostConfig::default()).unwrap();
    let script = r#"
(module
  (import "env" "memory" (memory 1))
  (func (export "main")))
"#;

    let (report, _port) = load(&host, vec![ScriptSource::text("env.wat", script)]).await;

    assert!(report.ran.is_empty());
    match &report.failed[0].1 {
        Error::ModuleNotFound(name) => assert_eq!(name, "env"),
        other => panic!("expected ModuleNotFound, got {:?}", other),
    }

    eventually(|| host.preload_errors().len() == 1).await;
    let error = &host.preload_errors()[0].error;
    assert_eq!(error.kind, ErrorKind::ReferenceError);
    assert_eq!(error.message, "module not found: env");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreadable_script_is_reported_without_running() {
    let host = Host::new(HostConfig::default()).unwrap();

    let (report, _port) = load(
        &host,
        vec![
            ScriptSource::unavailable("missing.wat", "no such file"),
            ScriptSource::text("ok.wat", "(module (func (export \"main\")))"),
        ],
    )
    .await;

    assert_eq!(report.ran, vec!["ok.wat"]);
    assert!(matches!(report.failed[0].1, Error::SourceUnavailable(_)));

    eventually(|| host.preload_errors().len() == 1).await;
    let errors = host.preload_errors();
    assert_eq!(errors[0].script_path, "missing.wat");
    assert_eq!(errors[0].error.message, "Script unavailable: no such file");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_compile_error_and_missing_main() {
    let host = Host::new(HostConfig::default()).unwrap();

    let (report, _port) = load(
        &host,
        vec![
            ScriptSource::text("broken.wat", "(module (func"),
            ScriptSource::text("no-main.wat", "(module (func (export \"start\")))"),
        ],
    )
    .await;

    assert!(report.ran.is_empty());
    assert!(matches!(report.failed[0].1, Error::Compile(_)));
    assert!(matches!(report.failed[1].1, Error::MissingEntryPoint));

    eventually(|| host.preload_errors().len() == 2).await;
    assert_eq!(host.preload_errors()[0].error.kind, ErrorKind::SyntaxError);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_runaway_script_runs_out_of_fuel() {
    let config = HostConfig::default().with_loader(LoaderConfig::default().with_fuel(Some(10_000)));
    let host = Host::new(config).unwrap();
    let script = r#"
(module
  (func (export "main")
    (loop $forever
      (br $forever))))
"#;

    let (report, _port) = load(
        &host,
        vec![
            ScriptSource::text("spin.wat", script),
            ScriptSource::text("after.wat", "(module (func (export \"main\")))"),
        ],
    )
    .await;

    assert_eq!(report.ran, vec!["after.wat"]);
    match &report.failed[0].1 {
        Error::ScriptExecution(msg) => assert_eq!(msg, "script ran out of fuel"),
        other => panic!("expected ScriptExecution, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_script_send_sync_round_trip() {
    let host = Host::new(HostConfig::default()).unwrap();
    host.router()
        .handle("theme", |_, _| async { Ok(Value::from("dark")) })
        .unwrap();
    let echoed = record(&host, "echo");

    // Reads the JSON reply into 64.., wraps it in [ ] and sends it back.
    let script = r#"
(module
  (import "bridge" "send_sync" (func $sync (param i32 i32 i32 i32 i32 i32) (result i32)))
  (import "bridge" "send" (func $send (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "theme")
  (data (i32.const 16) "echo")
  (func (export "main")
    (local $n i32)
    (local.set $n
      (call $sync (i32.const 0) (i32.const 5) (i32.const 0) (i32.const 0) (i32.const 64) (i32.const 64)))
    (i32.store8 (i32.const 63) (i32.const 91))
    (i32.store8 (i32.add (i32.const 64) (local.get $n)) (i32.const 93))
    (drop (call $send (i32.const 16) (i32.const 4) (i32.const 63) (i32.add (local.get $n) (i32.const 2))))))
"#;

    let (report, _port) = load(&host, vec![ScriptSource::text("sync.wat", script)]).await;
    assert!(report.is_clean(), "{:?}", report.failed);

    eventually(|| echoed.lock().unwrap().len() == 1).await;
    assert_eq!(echoed.lock().unwrap()[0], vec![Value::from("dark")]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_process_shim_and_buffer_module() {
    let config = HostConfig::default().with_loader(LoaderConfig::default().with_platform("testos"));
    let host = Host::new(config).unwrap();
    let platforms = record(&host, "platform");
    let blobs = record(&host, "blob");

    let script = r#"
(module
  (import "process" "platform" (func $platform (param i32 i32) (result i32)))
  (import "bridge" "send" (func $send (param i32 i32 i32 i32) (result i32)))
  (import "buffer" "send" (func $send_bytes (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "platform")
  (data (i32.const 16) "blob")
  (data (i32.const 24) "\01\02\03")
  (func (export "main")
    (local $n i32)
    (local.set $n (call $platform (i32.const 64) (i32.const 32)))
    (i32.store8 (i32.const 62) (i32.const 91))
    (i32.store8 (i32.const 63) (i32.const 34))
    (i32.store8 (i32.add (i32.const 64) (local.get $n)) (i32.const 34))
    (i32.store8 (i32.add (i32.const 65) (local.get $n)) (i32.const 93))
    (drop (call $send (i32.const 0) (i32.const 8) (i32.const 62) (i32.add (local.get $n) (i32.const 4))))
    (drop (call $send_bytes (i32.const 16) (i32.const 4) (i32.const 24) (i32.const 3)))))
"#;

    let (report, _port) = load(&host, vec![ScriptSource::text("shim.wat", script)]).await;
    assert!(report.is_clean(), "{:?}", report.failed);

    eventually(|| platforms.lock().unwrap().len() == 1 && blobs.lock().unwrap().len() == 1).await;
    assert_eq!(platforms.lock().unwrap()[0], vec![Value::from("testos")]);
    assert_eq!(
        blobs.lock().unwrap()[0],
        vec![Value::Buffer(TypedBuffer::Buffer(vec![1, 2, 3]))]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_scripts_do_not_share_state() {
    let host = Host::new(HostConfig::default()).unwrap();
    let counts = record(&host, "count");

    // Bumps a global and reports it; a shared instance would report 2.
    let script = r#"
(module
  (import "bridge" "send" (func $send (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (global $runs (mut i32) (i32.const 0))
  (data (i32.const 0) "count")
  (data (i32.const 16) "[0]")
  (func (export "main")
    (global.set $runs (i32.add (global.get $runs) (i32.const 1)))
    (i32.store8 (i32.const 17) (i32.add (i32.const 48) (global.get $runs)))
    (drop (call $send (i32.const 0) (i32.const 5) (i32.const 16) (i32.const 3)))))
"#;

    let (report, _port) = load(
        &host,
        vec![ScriptSource::text("one.wat", script), ScriptSource::text("two.wat", script)],
    )
    .await;
    assert_eq!(report.ran.len(), 2);

    eventually(|| counts.lock().unwrap().len() == 2).await;
    assert_eq!(
        *counts.lock().unwrap(),
        vec![vec![Value::from(1)], vec![Value::from(1)]]
    );
}
