#![cfg(unix)]

mod harness;

use std::{os::unix::fs::PermissionsExt, path::Path};

use harness::{spawn_session, SOURCE_FILE};
use serde_json::json;
use tether_native::{
    mock::{MockNativeServer, MockNativeServerConfig, MockStop, MOCK_GENERATED_FILE},
    NativeDebuggerConfig,
};

fn write_script(path: &Path, body: &str) {
    std::fs::write(path, body).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// A program plus a stand-in native debugger that announces `native`'s address.
fn fake_debugger(dir: &Path, native: &MockNativeServer) -> (String, NativeDebuggerConfig) {
    let program = dir.join("app");
    write_script(&program, "#!/bin/sh\n");
    let executable = dir.join("fake-debugger");
    write_script(
        &executable,
        &format!(
            "#!/bin/sh\necho \"API server listening at: {}\"\nexec sleep 30\n",
            native.addr()
        ),
    );
    let config = NativeDebuggerConfig {
        executable,
        ..NativeDebuggerConfig::default()
    };
    (program.to_string_lossy().into_owned(), config)
}

#[tokio::test]
async fn launch_runs_to_first_breakpoint_after_configuration_done() {
    let native = MockNativeServer::spawn_with_config(MockNativeServerConfig {
        stops: vec![MockStop::At {
            file: MOCK_GENERATED_FILE.to_string(),
            line: 30,
        }],
        ..MockNativeServerConfig::default()
    })
    .await
    .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let (program, config) = fake_debugger(dir.path(), &native);
    let (mut client, task) = spawn_session(harness::context_with(config));
    client.initialize().await;

    client
        .request_ok("launch", json!({ "program": program, "stopOnEntry": false }))
        .await;
    let process = client.event("process").await;
    assert_eq!(process["body"]["startMethod"], "launch");
    assert!(process["body"]["systemProcessId"].as_u64().is_some());

    let output = client.event("output").await;
    assert!(output["body"]["output"].as_str().unwrap().contains("listening at"));

    let breakpoints = client.set_breakpoints(SOURCE_FILE, &[20]).await;
    assert_eq!(breakpoints[0]["verified"], true);

    client.request_ok("configurationDone", json!({})).await;
    let stopped = client.event("stopped").await;
    assert_eq!(stopped["body"]["reason"], "breakpoint");
    assert_eq!(stopped["body"]["hitBreakpointIds"], json!([breakpoints[0]["id"]]));

    client.request_ok("disconnect", json!({})).await;
    assert!(native.was_detached());

    drop(client);
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn stop_on_entry_waits_for_the_client() {
    let native = MockNativeServer::spawn().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let (program, config) = fake_debugger(dir.path(), &native);
    let (mut client, task) = spawn_session(harness::context_with(config));
    client.initialize().await;

    // Breakpoints sent before launch are installed once the debugger is up.
    let pending = client.set_breakpoints(SOURCE_FILE, &[10]).await;
    assert_eq!(pending[0]["verified"], false);

    client
        .request_ok("launch", json!({ "program": program, "stopOnEntry": true }))
        .await;
    let changed = client.event("breakpoint").await;
    assert_eq!(changed["body"]["breakpoint"]["verified"], true);

    client.request_ok("configurationDone", json!({})).await;
    let stopped = client.event("stopped").await;
    assert_eq!(stopped["body"]["reason"], "entry");
    assert_eq!(stopped["body"]["threadId"], 1);

    let calls = native.calls().await;
    assert!(!calls.iter().any(|call| call == "RPCServer.Command"));

    drop(client);
    task.await.unwrap().unwrap();
    assert!(native.was_detached());
}
