//! End-to-end runs of the sales role against the compiled binary.

use std::ffi::CString;
use std::fs;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

static SEQ: AtomicU32 = AtomicU32::new(0);

fn unique_prefix(tag: &str) -> String {
    format!(
        "/fl_it_{tag}_{}_{}",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

fn sales(prefix: &str, log_dir: &Path, extra: &[&str]) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_factory_line"));
    command
        .arg("sales")
        .args(extra)
        .arg("--ipc-prefix")
        .arg(prefix)
        .arg("--log-dir")
        .arg(log_dir)
        .arg("--settle-delay-ms")
        .arg("0");
    command
}

fn shm_exists(name: &str) -> bool {
    let name = CString::new(name).expect("name");
    // SAFETY: name is a valid C string; the descriptor is closed right away.
    let fd = unsafe { libc::shm_open(name.as_ptr(), libc::O_RDONLY, 0) };
    if fd >= 0 {
        unsafe { libc::close(fd) };
        return true;
    }
    false
}

fn sem_exists(name: &str) -> bool {
    let name = CString::new(name).expect("name");
    // SAFETY: name is a valid C string; the handle is closed right away.
    let sem = unsafe { libc::sem_open(name.as_ptr(), 0) };
    if sem == libc::SEM_FAILED {
        return false;
    }
    unsafe { libc::sem_close(sem) };
    true
}

fn mq_exists(name: &str) -> bool {
    let name = CString::new(name).expect("name");
    // SAFETY: name is a valid C string; the descriptor is closed right away.
    let mq = unsafe { libc::mq_open(name.as_ptr(), libc::O_RDONLY) };
    if mq == -1 {
        return false;
    }
    unsafe { libc::mq_close(mq) };
    true
}

fn assert_released(prefix: &str) {
    assert!(!shm_exists(&format!("{prefix}_order")), "shared memory left behind");
    assert!(!mq_exists(&format!("{prefix}_progress")), "message queue left behind");
    for suffix in ["_loglock", "_done", "_print"] {
        assert!(!sem_exists(&format!("{prefix}{suffix}")), "semaphore {suffix} left behind");
    }
}

fn stdout_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn full_run_fills_the_order_and_cleans_up() {
    let dir = tempfile::tempdir().expect("tempdir");
    let prefix = unique_prefix("full");
    let output = sales(
        &prefix,
        dir.path(),
        &[
            "3",
            "100",
            "--min-capacity",
            "30",
            "--max-capacity",
            "30",
            "--min-duration-ms",
            "50",
            "--max-duration-ms",
            "50",
        ],
    )
    .output()
    .expect("failed to run sales");

    assert!(
        output.status.success(),
        "sales exited with {:?}: {}",
        output.status,
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = stdout_of(&output);
    assert_eq!(stdout.matches("was created, with Capacity=  30").count(), 3);
    assert!(stdout.contains("SALES: Permission granted to print the final report"));
    assert!(stdout.contains("SALES: Final order state: made=100 remain=0 active factories=0"));

    let supervisor = fs::read_to_string(dir.path().join("supervisor.log")).expect("supervisor.log");
    assert!(supervisor.contains("Grand total parts made =   100   vs   order size of   100"));
    assert!(supervisor.trim_end().ends_with(">>> Supervisor Terminated"));

    let factories = fs::read_to_string(dir.path().join("factory.log")).expect("factory.log");
    assert_eq!(factories.matches("STARTED").count(), 3);
    assert_eq!(factories.matches("Terminating after making").count(), 3);

    assert_released(&prefix);
}

#[test]
fn stale_resource_aborts_without_touching_it() {
    let dir = tempfile::tempdir().expect("tempdir");
    let prefix = unique_prefix("stale");
    let stale = CString::new(format!("{prefix}_order")).expect("name");
    // SAFETY: plain shm_open on a valid C string.
    let fd = unsafe {
        libc::shm_open(
            stale.as_ptr(),
            libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
            0o600,
        )
    };
    assert!(fd >= 0, "could not plant stale segment");

    let output = sales(&prefix, dir.path(), &["2", "10"])
        .output()
        .expect("failed to run sales");
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("resource provisioning failed"));

    // The stale segment survives and nothing else was left behind.
    assert!(shm_exists(&format!("{prefix}_order")));
    assert!(!sem_exists(&format!("{prefix}_done")));
    assert!(!mq_exists(&format!("{prefix}_progress")));
    // SAFETY: closing and unlinking the segment this test created.
    unsafe {
        libc::close(fd);
        libc::shm_unlink(stale.as_ptr());
    }
}

/// Start a long run, deliver `signal` once the factories are busy, and
/// collect the result.
fn interrupted_run(tag: &str, signal: libc::c_int) -> (String, Output) {
    let dir = tempfile::tempdir().expect("tempdir");
    let prefix = unique_prefix(tag);
    let child = sales(
        &prefix,
        dir.path(),
        &[
            "2",
            "1000",
            "--min-capacity",
            "10",
            "--max-capacity",
            "10",
            "--min-duration-ms",
            "1000",
            "--max-duration-ms",
            "1000",
        ],
    )
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .spawn()
    .expect("failed to spawn sales");

    thread::sleep(Duration::from_millis(800));
    // SAFETY: signalling the child this test spawned.
    assert_eq!(unsafe { libc::kill(child.id() as libc::pid_t, signal) }, 0);

    let output = child.wait_with_output().expect("wait for sales");
    (prefix, output)
}

#[test]
fn sigterm_shuts_down_in_order() {
    let (prefix, output) = interrupted_run("term", libc::SIGTERM);
    assert!(output.status.success(), "signal shutdown exits 0: {:?}", output.status);
    let stdout = stdout_of(&output);
    assert!(stdout.contains("nicely asked to TERMINATE by SIGTERM"));
    assert!(stdout.contains("Au revoir"));
    assert_released(&prefix);
}

#[test]
fn sigint_shuts_down_in_order() {
    let (prefix, output) = interrupted_run("int", libc::SIGINT);
    assert!(output.status.success(), "signal shutdown exits 0: {:?}", output.status);
    let stdout = stdout_of(&output);
    assert!(stdout.contains("INTERRUPTED by SIGINT"));
    assert!(stdout.contains("Au revoir"));
    assert!(!stdout.contains("Final order state"));
    assert_released(&prefix);
}

#[test]
fn invalid_arguments_are_usage_errors() {
    let output = Command::new(env!("CARGO_BIN_EXE_factory_line"))
        .args(["sales", "0", "10"])
        .output()
        .expect("failed to run sales");
    assert_eq!(output.status.code(), Some(1));
    assert!(!output.stderr.is_empty(), "usage message goes to stderr");

    let output = Command::new(env!("CARGO_BIN_EXE_factory_line"))
        .arg("--help")
        .output()
        .expect("failed to run --help");
    assert_eq!(output.status.code(), Some(0));
    assert!(stdout_of(&output).contains("sales"));

    let output = Command::new(env!("CARGO_BIN_EXE_factory_line"))
        .args([
            "factory",
            "1",
            "10",
            "100",
            "/fl_missing_order",
            "/fl_missing_q",
            "/fl_missing_lock",
        ])
        .output()
        .expect("failed to run factory");
    assert_eq!(output.status.code(), Some(1));
}
