//! Shared test helpers for simbroker-core integration tests.
//!
//! Provides fake simulator manager and companion executables and a fixture
//! that wires them into a [`Provisioner`] and [`CompanionLauncher`].

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use simbroker_core::companion::{CompanionLauncher, CompanionLauncherConfig};
use simbroker_core::provision::{ManagerBackend, Provisioner};
use simbroker_core::simctl::Simctl;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Fake executables
// ---------------------------------------------------------------------------

/// Prints `<set>/devices.json` for `list` and flips a device to `Booted` on
/// `boot`. `create` appends a shut down `NEW-<n>` device.
pub const FAKE_MANAGER: &str = r#"#!/bin/sh
cmd="$1"
shift
set_path=""
udid=""
while [ $# -gt 0 ]; do
  case "$1" in
    --device-set-path) set_path="$2"; shift ;;
    --only|--configuration) shift ;;
    *) udid="$1" ;;
  esac
  shift
done
list="$set_path/devices.json"
case "$cmd" in
  list) cat "$list" ;;
  boot) sed -i.bak "s/\"$udid\",\"state\":\"Shutdown\"/\"$udid\",\"state\":\"Booted\"/" "$list" ;;
  create)
    n=$(grep -o NEW- "$list" | wc -l | tr -d ' ')
    entry="{\"udid\":\"NEW-$n\",\"state\":\"Shutdown\",\"name\":\"iPhone 15\"}"
    if grep -q udid "$list"; then
      sed -i.bak "s/]\$/,$entry]/" "$list"
    else
      echo "[$entry]" > "$list"
    fi
    ;;
  *) echo "unknown command $cmd" >&2; exit 64 ;;
esac
"#;

/// Reports a domain socket, records its pid next to the socket and idles.
/// UDIDs starting with `BAD` exit with an error instead.
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

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

/// A device set driven by the fake manager plus a launcher for fake
/// companions, all inside one temporary directory.
pub struct Fixture {
    pub dir: TempDir,
}

impl Fixture {
    /// Creates the fixture with a device list of `(udid, state)` pairs.
    pub fn with_devices(devices: &[(&str, &str)]) -> Self {
        let fixture = Self {
            dir: tempfile::tempdir().unwrap(),
        };
        std::fs::create_dir_all(fixture.device_set()).unwrap();
        write_script(fixture.dir.path(), "manager.sh", FAKE_MANAGER);
        write_script(fixture.dir.path(), "companion.sh", FAKE_COMPANION);

        // One entry per line keeps the sed edits in the fake manager simple.
        let entries: Vec<String> = devices
            .iter()
            .map(|(udid, state)| {
                format!(r#"{{"udid":"{udid}","state":"{state}","name":"iPhone 15"}}"#)
            })
            .collect();
        std::fs::write(
            fixture.device_set().join("devices.json"),
            format!("[{}]\n", entries.join(",")),
        )
        .unwrap();
        fixture
    }

    pub fn device_set(&self) -> PathBuf {
        self.dir.path().join("set")
    }

    pub fn work_dir(&self) -> PathBuf {
        self.dir.path().join("companions")
    }

    pub fn provisioner(&self) -> Provisioner {
        Provisioner::new(Box::new(ManagerBackend::new(
            self.dir.path().join("manager.sh"),
            self.device_set(),
            Simctl::new("/nonexistent/xcrun"),
            Some("iPhone 15,iOS 17.2".to_string()),
        )))
    }

    pub fn launcher(&self) -> CompanionLauncher {
        CompanionLauncher::new(CompanionLauncherConfig {
            program: self.dir.path().join("companion.sh"),
            work_dir: self.work_dir(),
            startup_timeout: Duration::from_secs(10),
            termination_grace: Duration::from_secs(2),
        })
    }

    pub fn companion_pid(&self, udid: &str) -> i32 {
        std::fs::read_to_string(self.work_dir().join(format!("{udid}.pid")))
            .unwrap()
            .trim()
            .parse()
            .unwrap()
    }
}

pub fn pid_exists(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}
