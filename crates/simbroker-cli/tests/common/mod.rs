//! Shared helpers for simbroker CLI tests.
//!
//! Every test runs against a private `SIMBROKER_HOME` and fake tools written
//! as shell scripts into a temporary directory.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use assert_cmd::Command;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tempfile::TempDir;

/// Prints `<set>/devices.json` for `list`, records `create` and `boot`.
pub const FAKE_MANAGER: &str = r#"#!/bin/sh
cmd="$1"
shift
set_path=""
while [ $# -gt 0 ]; do
  case "$1" in
    --device-set-path) set_path="$2"; shift ;;
  esac
  shift
done
case "$cmd" in
  list) cat "$set_path/devices.json" ;;
  create|boot) echo "$cmd" >> "$set_path/calls.log" ;;
  *) echo "unknown command $cmd" >&2; exit 64 ;;
esac
"#;

/// Reports a domain socket, records its pid next to the socket and idles.
pub const FAKE_COMPANION: &str = r#"#!/bin/sh
udid=""
sock=""
while [ $# -gt 0 ]; do
  case "$1" in
    --udid) udid="$2"; shift ;;
    --grpc-domain-sock) sock="$2"; shift ;;
  esac
  shift
done
dir=$(dirname "$sock")
echo $$ > "$dir/$udid.pid"
case "$udid" in
  BAD*) echo "simulator $udid is not available" >&2; exit 3 ;;
esac
echo "{\"grpc_path\":\"$sock\"}"
exec sleep 300
"#;

/// Answers `simctl --set <set> list devices -j` with one shut down iPhone.
pub const FAKE_XCRUN: &str = r#"#!/bin/sh
case "$*" in
  *"list devices -j"*)
    echo '{"devices":{"com.apple.CoreSimulator.SimRuntime.iOS-17-2":[{"udid":"SIMCTL-1","name":"iPhone 15","state":"Shutdown","isAvailable":true}]}}'
    ;;
  *) echo "unexpected simctl call: $*" >&2; exit 1 ;;
esac
"#;

/// A sandbox with fake tools and an isolated broker home.
pub struct Sandbox {
    pub dir: TempDir,
}

impl Sandbox {
    pub fn new() -> Self {
        let sandbox = Self {
            dir: tempfile::tempdir().unwrap(),
        };
        std::fs::create_dir_all(sandbox.device_set()).unwrap();
        write_script(sandbox.dir.path(), "manager.sh", FAKE_MANAGER);
        write_script(sandbox.dir.path(), "companion.sh", FAKE_COMPANION);
        write_script(sandbox.dir.path(), "xcrun.sh", FAKE_XCRUN);
        sandbox
    }

    pub fn home(&self) -> PathBuf {
        self.dir.path().join("home")
    }

    pub fn device_set(&self) -> PathBuf {
        self.dir.path().join("set")
    }

    pub fn manager(&self) -> PathBuf {
        self.dir.path().join("manager.sh")
    }

    pub fn companions_dir(&self) -> PathBuf {
        self.home().join("companions")
    }

    /// Writes the manager's device list as `(udid, state)` pairs.
    pub fn set_devices(&self, devices: &[(&str, &str)]) {
        let entries: Vec<serde_json::Value> = devices
            .iter()
            .map(|(udid, state)| {
                serde_json::json!({
                    "udid": udid,
                    "name": "iPhone 15",
                    "state": state,
                    "os_version": "iOS 17.2",
                })
            })
            .collect();
        std::fs::write(
            self.device_set().join("devices.json"),
            serde_json::to_vec(&entries).unwrap(),
        )
        .unwrap();
    }

    /// The broker command with every tool pointed into the sandbox.
    pub fn simbroker(&self) -> Command {
        let mut cmd = Command::from_std(self.simbroker_std());
        cmd.timeout(Duration::from_secs(30));
        cmd
    }

    /// Same as [`simbroker`](Self::simbroker), for tests that need to wire
    /// the standard streams themselves.
    pub fn simbroker_std(&self) -> std::process::Command {
        let mut cmd = std::process::Command::new(assert_cmd::cargo::cargo_bin("simbroker"));
        cmd.env("SIMBROKER_HOME", self.home())
            .env("SIMBROKER_COMPANION", self.dir.path().join("companion.sh"))
            .env("SIMBROKER_XCRUN", self.dir.path().join("xcrun.sh"))
            .env("SIMBROKER_DEVICE_SET", self.device_set())
            .env("SIMBROKER_STARTUP_TIMEOUT", "10")
            .env("SIMBROKER_TERMINATION_GRACE", "1")
            .env_remove("SIMBROKER_SIMULATOR_MANAGER")
            .env_remove("RUST_LOG");
        cmd
    }

    /// Pid recorded by the fake companion for `udid`.
    pub fn companion_pid(&self, udid: &str) -> i32 {
        std::fs::read_to_string(self.companions_dir().join(format!("{udid}.pid")))
            .unwrap()
            .trim()
            .parse()
            .unwrap()
    }

    pub fn supervisor_log(&self, pid: i32) -> PathBuf {
        self.home().join("logs").join(format!("supervisor-{pid}.log"))
    }

    /// Pids of every supervisor that wrote a log in this sandbox.
    pub fn supervisor_pids(&self) -> Vec<i32> {
        let Ok(entries) = std::fs::read_dir(self.home().join("logs")) else {
            return Vec::new();
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()?
                    .strip_prefix("supervisor-")?
                    .strip_suffix(".log")?
                    .parse()
                    .ok()
            })
            .collect()
    }
}

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Whether `pid` is a live process. Zombies count as gone.
pub fn process_alive(pid: i32) -> bool {
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        // The state letter follows the parenthesised command name.
        return match stat.rsplit_once(')') {
            Some((_, rest)) => !rest.trim_start().starts_with('Z'),
            None => true,
        };
    }
    signal::kill(Pid::from_raw(pid), None).is_ok()
}

/// Polls until every pid in `pids` is gone or `timeout` passes.
pub fn wait_until_gone(pids: &[i32], timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pids.iter().all(|pid| !process_alive(*pid)) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    false
}

pub fn send(pid: i32, sig: Signal) {
    signal::kill(Pid::from_raw(pid), sig).unwrap();
}

/// Kills leftover processes when a test fails halfway.
pub struct KillOnDrop(pub Vec<i32>);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        for pid in &self.0 {
            let _ = signal::kill(Pid::from_raw(*pid), Signal::SIGKILL);
        }
    }
}
