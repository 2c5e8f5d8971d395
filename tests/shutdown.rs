#![cfg(unix)]

use std::process::Command;
use std::time::Duration;

use motion_bridge_lib::shutdown_signal;

#[tokio::test]
async fn terminate_signal_triggers_shutdown() {
    let shutdown = shutdown_signal().expect("install handlers");

    let status = Command::new("kill")
        .args(["-TERM", &std::process::id().to_string()])
        .status()
        .expect("kill runs");
    assert!(status.success());

    let signal = tokio::time::timeout(Duration::from_secs(5), shutdown)
        .await
        .expect("SIGTERM observed");
    assert_eq!(signal, "SIGTERM");
}
