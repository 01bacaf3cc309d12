use serde_json::{json, Value};
use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::SocketAddr;
use std::process::{Command, Stdio};
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn stdio_server_loads_config_from_flag_and_initializes() {
    let temp = TempDir::new().expect("tempdir");
    let maps = temp.path().join("maps");
    fs::create_dir(&maps).expect("create maps dir");
    fs::write(
        maps.join("app.map.json"),
        r#"{"sourceFile":"/work/src/app.tt","generatedFile":"/work/gen/main.go","mappings":[{"sourceLine":10,"sourceColumn":1,"generatedLine":15,"generatedColumn":1}]}"#,
    )
    .expect("write map");
    let config_path = temp.path().join("tether.toml");
    fs::write(
        &config_path,
        format!(
            "[logging]\nlevel = \"debug\"\nstderr = false\n\n[maps]\ndir = {:?}\n",
            maps.to_string_lossy()
        ),
    )
    .expect("write config");

    let mut child = Command::new(env!("CARGO_BIN_EXE_tether-dap"))
        .arg("--config")
        .arg(&config_path)
        .env_remove("TETHER_CONFIG")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .expect("spawn tether-dap");

    let mut stdin = child.stdin.take().expect("stdin");
    let stdout = child.stdout.take().expect("stdout");
    let mut stdout = BufReader::new(stdout);

    write_dap_message(
        &mut stdin,
        &json!({ "seq": 1, "type": "request", "command": "initialize", "arguments": {} }),
    );
    let initialize = read_dap_response(&mut stdout, 1);
    assert_eq!(initialize["success"], true);

    // Before a debugger is attached the breakpoint is pending, but it was translated
    // through the map loaded from the config file.
    write_dap_message(
        &mut stdin,
        &json!({
            "seq": 2,
            "type": "request",
            "command": "setBreakpoints",
            "arguments": { "source": { "path": "/work/src/app.tt" }, "breakpoints": [{ "line": 10 }] }
        }),
    );
    let set = read_dap_response(&mut stdout, 2);
    let message = set["body"]["breakpoints"][0]["message"].as_str().unwrap();
    assert!(message.contains("installed once"), "{message}");

    write_dap_message(
        &mut stdin,
        &json!({ "seq": 3, "type": "request", "command": "disconnect", "arguments": {} }),
    );
    let disconnect = read_dap_response(&mut stdout, 3);
    assert_eq!(disconnect["success"], true);

    drop(stdin);
    let status = child.wait().expect("wait");
    assert!(status.success());
}

#[tokio::test]
async fn tcp_server_listens_and_speaks_dap() {
    use tether_dap::dap_tokio::{DapReader, DapWriter};
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpStream;

    let mut child = tokio::process::Command::new(env!("CARGO_BIN_EXE_tether-dap"))
        .arg("--listen")
        .arg("127.0.0.1:0")
        .env_remove("TETHER_CONFIG")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .expect("spawn tether-dap");

    let stderr = child.stderr.take().expect("stderr");
    let mut stderr_lines = tokio::io::BufReader::new(stderr).lines();

    let addr: SocketAddr = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let Some(line) = stderr_lines.next_line().await.expect("read stderr") else {
                panic!("tether-dap exited before reporting its listening address");
            };
            if let Some(rest) = line.strip_prefix("listening on ") {
                return rest.parse::<SocketAddr>().expect("parse SocketAddr");
            }
        }
    })
    .await
    .expect("timeout waiting for listen address");

    let stream = TcpStream::connect(addr).await.expect("connect");
    let (reader, writer) = stream.into_split();
    let mut reader = DapReader::new(reader);
    let mut writer = DapWriter::new(writer);

    writer
        .write_value(&json!({ "seq": 1, "type": "request", "command": "initialize", "arguments": {} }))
        .await
        .expect("write initialize");

    let mut got_response = false;
    let mut got_initialized = false;
    tokio::time::timeout(Duration::from_secs(5), async {
        while !(got_response && got_initialized) {
            let message = reader
                .read_value()
                .await
                .expect("read message")
                .expect("stream closed");
            match message["type"].as_str() {
                Some("response") => {
                    assert_eq!(message["request_seq"], 1);
                    assert_eq!(message["success"], true);
                    got_response = true;
                }
                Some("event") if message["event"] == "initialized" => got_initialized = true,
                _ => {}
            }
        }
    })
    .await
    .expect("timeout waiting for initialize");

    child.kill().await.expect("kill tether-dap");
}

fn write_dap_message(writer: &mut impl Write, message: &Value) {
    let body = serde_json::to_vec(message).expect("serialize");
    write!(writer, "Content-Length: {}\r\n\r\n", body.len()).expect("write header");
    writer.write_all(&body).expect("write body");
    writer.flush().expect("flush");
}

fn read_dap_message(reader: &mut impl BufRead) -> Value {
    let mut content_length = None;
    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line).expect("read header");
        assert!(read > 0, "unexpected EOF while reading headers");
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("Content-Length") {
                content_length = Some(value.trim().parse::<usize>().expect("Content-Length"));
            }
        }
    }
    let mut body = vec![0; content_length.expect("missing Content-Length")];
    reader.read_exact(&mut body).expect("read body");
    serde_json::from_slice(&body).expect("parse body")
}

fn read_dap_response(reader: &mut impl BufRead, request_seq: i64) -> Value {
    loop {
        let message = read_dap_message(reader);
        if message["type"] == "response" && message["request_seq"] == request_seq {
            return message;
        }
    }
}
