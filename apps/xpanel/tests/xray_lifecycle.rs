#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use xpanel::PanelError;
use xpanel::xray::{ManagerSettings, XrayManager};
use xpanel_shared::status::ProcessPhase;

/// Stand-in binary: answers `-version`, rejects configs containing BROKEN on
/// `run -test`, and on `run -c` idles until TERM, logging every HUP.
fn fake_xray(dir: &Path) -> PathBuf {
    let reloads = dir.join("reloads");
    let script = format!(
        r#"#!/bin/sh
if [ "$1" = "-version" ]; then
  echo "Xray 1.8.24 (Xray, Penetrates Everything.) Custom (go1.22 linux/amd64)"
  echo "A unified platform for anti-censorship."
  exit 0
fi
if [ "$2" = "-test" ]; then
  if grep -q BROKEN "$4"; then
    echo "Failed to start: main: failed to load config files" >&2
    exit 23
  fi
  echo "Configuration OK."
  exit 0
fi
trap 'echo hup >> "{}"' HUP
trap 'exit 0' TERM
while true; do sleep 0.1; done
"#,
        reloads.display()
    );

    let path = dir.join("xray");
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {}", what);
}

// One test per binary: the script is exec'd right after being written.
#[tokio::test]
async fn manager_drives_the_process_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("etc/config.json");
    let manager = XrayManager::new(ManagerSettings {
        bin_path: fake_xray(dir.path()),
        config_path: config_path.clone(),
        auto_restart: true,
        restart_max_attempts: 3,
        stop_grace: Duration::from_secs(2),
        stable_after: Duration::from_millis(500),
    });

    // Stopping something that never ran is a no-op.
    let status = manager.stop().await.unwrap();
    assert_eq!(status.phase, ProcessPhase::Stopped);
    assert!(status.pid.is_none());

    assert!(manager.version().await.unwrap().starts_with("Xray 1.8.24"));

    let good = dir.path().join("good.json");
    std::fs::write(&good, r#"{"inbounds":[]}"#).unwrap();
    assert_eq!(manager.test_config(&good).await.unwrap(), "Configuration OK.");

    let bad = dir.path().join("bad.json");
    std::fs::write(&bad, r#"{"BROKEN":true}"#).unwrap();
    match manager.test_config(&bad).await {
        Err(PanelError::ConfigTestFailed { output }) => assert!(output.contains("failed to load config")),
        other => panic!("expected ConfigTestFailed, got {:?}", other),
    }

    // A missing config gets a placeholder so the process can come up.
    let started = manager.start().await.unwrap();
    assert!(started.running);
    assert!(config_path.exists());
    let pid = started.pid.expect("pid of the running child");

    let again = manager.start().await.unwrap();
    assert_eq!(again.pid, Some(pid));

    let reloaded = manager.reload_config().await.unwrap();
    assert_eq!(reloaded.pid, Some(pid));
    let reloads = dir.path().join("reloads");
    eventually("the HUP to reach the child", || reloads.exists()).await;

    let restarted = manager.restart().await.unwrap();
    assert!(restarted.running);
    assert_ne!(restarted.pid, Some(pid));
    let pid = restarted.pid.expect("pid after restart");

    // An unplanned exit is recovered with the same config.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
    eventually("the restart after a crash", || {
        let status = manager.status();
        status.running && status.pid.is_some() && status.pid != Some(pid)
    })
    .await;
    let recovered = manager.status();
    assert_eq!(recovered.restart_attempts, 1);
    assert!(recovered.last_error.unwrap().contains("exited unexpectedly"));

    // Crashes spaced past the stability window never exhaust the budget of 3.
    let mut pid = recovered.pid.expect("pid after recovery");
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(800)).await;
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGKILL);
        }
        let previous = pid;
        eventually("a restart after an isolated crash", || {
            let status = manager.status();
            status.running && status.pid.is_some() && status.pid != Some(previous)
        })
        .await;
        let status = manager.status();
        assert_eq!(status.restart_attempts, 1);
        pid = status.pid.expect("pid after recovery");
    }

    let stopped = manager.stop().await.unwrap();
    assert!(!stopped.running);
    assert_eq!(stopped.phase, ProcessPhase::Stopped);
    assert!(!manager.is_running());

    // An operator start clears the crash bookkeeping.
    let fresh = manager.start().await.unwrap();
    assert_eq!(fresh.restart_attempts, 0);
    assert!(fresh.last_error.is_none());
    manager.stop().await.unwrap();
}
