#![cfg(all(unix, feature = "cli"))]

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, Command, Output, Stdio};

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/objmuxcli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

/// A running `objmux serve`; killed on drop.
struct Server {
    child: Child,
    address: String,
    dir: Option<PathBuf>,
}

impl Server {
    fn start(address: &str, dir: Option<PathBuf>) -> Self {
        let mut child = Command::new(env!("CARGO_BIN_EXE_objmux"))
            .args(["--log-level", "error", "--format", "json", "serve", address])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("serve should start");

        let stdout = child.stdout.take().expect("stdout is piped");
        let mut line = String::new();
        BufReader::new(stdout)
            .read_line(&mut line)
            .expect("serve should announce its address");
        let listening: serde_json::Value =
            serde_json::from_str(&line).expect("listening line should be json");
        assert_eq!(listening["event"], "listening");
        let address = listening["address"]
            .as_str()
            .expect("address field")
            .to_string();

        Self {
            child,
            address,
            dir,
        }
    }

    fn unix(tag: &str) -> Self {
        let dir = unique_temp_dir(tag);
        let path = dir.join("calc.sock");
        Self::start(&path.display().to_string(), Some(dir))
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(dir) = &self.dir {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}

fn objmux(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_objmux"))
        .args(["--log-level", "error", "--format", "json"])
        .args(args)
        .output()
        .expect("objmux should run")
}

fn json_stdout(output: &Output) -> serde_json::Value {
    assert!(
        output.status.success(),
        "exit {:?}, stderr: {}",
        output.status.code(),
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("stdout should be json")
}

#[test]
fn invoke_static_method_prints_the_result() {
    let server = Server::unix("square");

    let out = json_stdout(&objmux(&[
        "invoke",
        &server.address,
        "--static",
        "math.square",
        "7",
    ]));
    assert_eq!(out["target"], "math.square");
    assert_eq!(out["result"], 49);
    assert_eq!(out["result_type"], "int");
}

#[test]
fn invoke_creates_an_object_and_calls_it() {
    let server = Server::unix("create");

    let out = json_stdout(&objmux(&[
        "invoke",
        &server.address,
        "--type",
        "Calculator",
        "--ctor-arg",
        "\"main\"",
        "--method",
        "divide",
        "7",
        "2.0",
    ]));
    assert_eq!(out["target"], "Calculator.divide");
    assert_eq!(out["result"], 3.5);
    assert_eq!(out["result_type"], "float");
}

#[test]
fn serve_over_tcp_reports_the_assigned_port() {
    let server = Server::start("tcp:127.0.0.1:0", None);
    assert!(server.address.starts_with("tcp:127.0.0.1:"));
    assert!(!server.address.ends_with(":0"));

    let out = json_stdout(&objmux(&[
        "invoke",
        &server.address,
        "--static",
        "math.square",
        "-3",
    ]));
    assert_eq!(out["result"], 9);
}

#[test]
fn info_reports_the_negotiated_protocol() {
    let server = Server::unix("info");

    let out = json_stdout(&objmux(&["info", &server.address, "--timeout", "3s"]));
    assert_eq!(out["connected"], true);
    assert_eq!(out["protocol"], "objmux");
    assert_eq!(out["transport"], "unix");
}

#[test]
fn info_timeout_returns_124() {
    let missing = PathBuf::from(format!(
        "/tmp/objmuxcli-missing-{}-{}.sock",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));

    let output = Command::new(env!("CARGO_BIN_EXE_objmux"))
        .arg("info")
        .arg(&missing)
        .arg("--timeout")
        .arg("1s")
        .output()
        .expect("info should run");

    assert_eq!(output.status.code(), Some(124));
}

#[test]
fn version_reports_the_package_version() {
    let output = Command::new(env!("CARGO_BIN_EXE_objmux"))
        .arg("version")
        .output()
        .expect("version should run");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(
        stdout.trim(),
        format!("objmux {}", env!("CARGO_PKG_VERSION"))
    );
}
