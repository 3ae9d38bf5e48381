// Integration tests for the whack binary: exit codes and signal shutdown.
// Run with: cargo test --test cli_test

mod common;

use std::fs;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use common::{FakeServer, WAIT};
use tempfile::TempDir;

const SECRET: &str = "s3cr3t";

fn whack(home: &Path) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_whack"));
    command
        .arg(home)
        .env("RUST_LOG", "info")
        .env_remove("WHACK_HOST")
        .env_remove("WHACK_PORT")
        .env_remove("WHACK_DOMAIN")
        .env_remove("WHACK_SECRET")
        .env_remove("WHACK_CONNECT_TIMEOUT_MS")
        .env_remove("WHACK_LOG_FILE");
    command
}

/// Wait for process to exit with timeout
fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Option<ExitStatus> {
    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {
                if start.elapsed() > timeout {
                    return None;
                }
                thread::sleep(Duration::from_millis(50));
            }
            Err(_) => return None,
        }
    }
}

#[cfg(unix)]
fn send_signal(child: &Child, signal: i32) {
    let pid = i32::try_from(child.id()).unwrap();
    // SAFETY: `pid` is a child process this test spawned and still owns.
    unsafe {
        libc::kill(pid, signal);
    }
}

#[test]
fn test_malformed_config_exits_with_failure() {
    let home = TempDir::new().unwrap();
    fs::write(home.path().join("whack.json"), "{ not json").unwrap();

    let output = whack(home.path()).output().unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("configuration"), "stderr: {stderr}");
}

#[test]
fn test_empty_home_writes_default_config_and_exits_without_components() {
    let home = TempDir::new().unwrap();

    let output = whack(home.path()).output().unwrap();

    assert_eq!(output.status.code(), Some(1));
    assert!(home.path().join("whack.json").is_file());
    assert!(home.path().join("components").is_dir());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("No components loaded"), "stderr: {stderr}");
}

#[cfg(unix)]
#[test]
fn test_serves_bundle_until_sigterm() {
    let server = FakeServer::start(SECRET);
    let home = TempDir::new().unwrap();
    fs::write(
        home.path().join("whack.json"),
        format!(
            r#"{{
                "server": {{
                    "host": "127.0.0.1",
                    "port": {port},
                    "domain": "example.com",
                    "default_secret": "{SECRET}"
                }},
                "loader": {{ "watch": false }}
            }}"#,
            port = server.port()
        ),
    )
    .unwrap();

    let bundle = home.path().join("components").join("hello");
    fs::create_dir_all(&bundle).unwrap();
    fs::write(
        bundle.join("component.xml"),
        "<component><class>Hello</class><subdomain>hello</subdomain></component>",
    )
    .unwrap();
    fs::write(bundle.join("Hello.lua"), "return { name = 'Hello' }").unwrap();

    let mut child = whack(home.path())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let bound = server.wait_for_bindings(1, WAIT * 2);
    if !bound {
        let _ = child.kill();
    }
    assert!(bound, "component never bound");
    assert!(server.is_connected("hello.example.com"));

    send_signal(&child, libc::SIGTERM);
    let status = wait_with_timeout(&mut child, WAIT).expect("whack did not exit");

    assert!(status.success(), "exit status {status:?}");
    assert!(server.wait_for_disconnect("hello.example.com", WAIT));
    // Extracted bundles survive a restart.
    assert!(bundle.join("component.xml").is_file());
}
