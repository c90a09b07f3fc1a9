use std::io::Read;
use std::net::TcpListener;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{bail, Context};

/// Picks a port nobody is listening on right now by binding it and letting
/// it go; good enough for a short-lived test daemon.
fn free_port() -> anyhow::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").context("binding an ephemeral port")?;
    Ok(listener.local_addr()?.port())
}

fn write_config(dir: &std::path::Path, port: u16) -> anyhow::Result<std::path::PathBuf> {
    let config_path = dir.join("jobd.toml");
    std::fs::write(
        &config_path,
        format!(
            r#"
            [comm]
            ip = "127.0.0.1"
            port = {port}

            [server]
            num_threads = 1
            data_dir = {data_dir:?}
            cookies = {cookies:?}

            [client]
            response_timeout_sec = 2.0
            long_response_timeout_sec = 2.0
            short_response_timeout_sec = 0.2
            identity_file = {identity_file:?}
            "#,
            port = port,
            data_dir = dir.join("data"),
            cookies = dir.join("cookies.txt"),
            identity_file = dir.join("client-id"),
        ),
    )
    .context("writing test config")?;
    Ok(config_path)
}

struct DaemonProc {
    child: std::process::Child,
}

impl DaemonProc {
    fn start(config_path: &std::path::Path) -> anyhow::Result<DaemonProc> {
        let child = Command::new(env!("CARGO_BIN_EXE_jobd"))
            .arg("--config-file")
            .arg(config_path)
            .arg("daemon")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawning jobd daemon")?;
        Ok(DaemonProc { child })
    }
}

impl Drop for DaemonProc {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn run_client(config_path: &std::path::Path, args: &[&str]) -> anyhow::Result<String> {
    let output = Command::new(env!("CARGO_BIN_EXE_jobd"))
        .arg("--config-file")
        .arg(config_path)
        .args(args)
        .output()
        .context("spawning jobd client")?;
    if !output.status.success() {
        bail!(
            "jobd {:?} exited with {}: {}",
            args,
            output.status,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[test]
#[ntest::timeout(10000)]
fn start() -> anyhow::Result<()> {
    let tmp_dir = tempfile::Builder::new().prefix("jobd-test").rand_bytes(20).tempdir().context("creating tmp dir")?;
    let port = free_port()?;
    let config_path = write_config(tmp_dir.path(), port)?;

    let mut daemon = DaemonProc::start(&config_path)?;
    std::thread::sleep(Duration::from_millis(500));

    // still running after half a second with no input
    assert!(daemon.child.try_wait()?.is_none());

    daemon.child.kill().context("killing daemon")?;
    let status = daemon.child.wait().context("waiting on killed daemon")?;
    assert!(!status.success());

    let mut stderr = String::new();
    daemon.child.stderr.take().context("missing stderr")?.read_to_string(&mut stderr)?;
    assert!(stderr.contains("STARTING JOBD"));

    Ok(())
}

#[test]
#[ntest::timeout(15000)]
fn add_then_list_round_trips_through_the_daemon() -> anyhow::Result<()> {
    let tmp_dir = tempfile::Builder::new().prefix("jobd-test").rand_bytes(20).tempdir().context("creating tmp dir")?;
    let port = free_port()?;
    let config_path = write_config(tmp_dir.path(), port)?;

    let _daemon = DaemonProc::start(&config_path)?;
    std::thread::sleep(Duration::from_millis(500));

    let add_reply = run_client(&config_path, &["add", "aaaaaaaaaaa"])?;
    assert!(add_reply.contains("queued"), "unexpected add reply: {add_reply}");

    let list_reply = run_client(&config_path, &["list"])?;
    assert!(list_reply.contains("aaaaaaaaaaa"), "unexpected list reply: {list_reply}");

    Ok(())
}
