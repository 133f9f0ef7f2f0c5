//! Nested container runtime lifecycle.
//!
//! The daemon runs inside a fresh mount namespace so `/proc/sys` and the
//! cgroup hierarchy can be remounted read-write for bridge networking
//! without the change leaking to the host. Its data root points at the
//! target disk's mounted data partition, so every image it pulls lands
//! on the eventual boot disk.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use diskswap_shared::constants::{NESTED_BRIDGE_CIDR, NESTED_RUNTIME_SOCKET};
use diskswap_shared::{DiskswapError, DiskswapResult};
use serde_json::json;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::util::cmd;

const DAEMON_CONFIG_PATH: &str = "/tmp/dind-daemon.json";
const DAEMON_LOG_PATH: &str = "/tmp/dind.log";
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(500);
const STOP_GRACE: Duration = Duration::from_secs(15);

/// A running nested container runtime and the socket to address it by.
pub(crate) struct NestedRuntime {
    child: Child,
    socket_url: String,
}

impl NestedRuntime {
    /// Write the daemon configuration and launch the daemon.
    ///
    /// Firewall management stays off: the daemon would otherwise install
    /// broad rules that break the host's own ingress reachability, so
    /// the sandbox installs exactly the NAT rules it needs itself.
    pub async fn start(data_root: &Path) -> DiskswapResult<Self> {
        let config = json!({
            "storage-driver": "overlay2",
            "iptables": false,
            "seccomp-profile": "unconfined",
            "dns": ["8.8.8.8", "8.8.4.4"],
            "data-root": data_root,
        });
        tokio::fs::write(DAEMON_CONFIG_PATH, serde_json::to_vec_pretty(&config)?).await?;

        let log = std::fs::File::create(DAEMON_LOG_PATH)
            .map_err(|e| DiskswapError::Sandbox(format!("cannot open runtime log: {}", e)))?;
        let log_err = log
            .try_clone()
            .map_err(|e| DiskswapError::Sandbox(format!("cannot open runtime log: {}", e)))?;

        let script = format!(
            "mount -o remount,rw /proc/sys && \
             mount -o remount,rw /sys/fs/cgroup && \
             exec dockerd --config-file {config} --host unix://{socket} \
             --bip {bip} --userland-proxy=false --log-level info",
            config = DAEMON_CONFIG_PATH,
            socket = NESTED_RUNTIME_SOCKET,
            bip = NESTED_BRIDGE_CIDR,
        );

        let child = Command::new("unshare")
            .args(["--mount", "/bin/sh", "-c", &script])
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|e| DiskswapError::Sandbox(format!("failed to launch runtime: {}", e)))?;

        tracing::info!(socket = NESTED_RUNTIME_SOCKET, "nested runtime launched");
        Ok(NestedRuntime {
            child,
            socket_url: format!("unix://{}", NESTED_RUNTIME_SOCKET),
        })
    }

    /// Poll the control socket until the daemon answers, bounded by
    /// `timeout`.
    pub async fn wait_ready(
        &self,
        timeout: Duration,
        token: &CancellationToken,
    ) -> DiskswapResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if cmd::run_ok("docker", &["-H", &self.socket_url, "version"]).await {
                tracing::info!("nested runtime socket responsive");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(DiskswapError::Sandbox(format!(
                    "runtime socket {} not ready after {:?}",
                    NESTED_RUNTIME_SOCKET, timeout
                )));
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(DiskswapError::Cancelled),
                _ = tokio::time::sleep(SOCKET_POLL_INTERVAL) => {}
            }
        }
    }

    /// Run a runtime CLI command against the nested daemon.
    pub async fn control(&self, args: &[&str]) -> DiskswapResult<String> {
        let mut argv = vec!["-H", self.socket_url.as_str()];
        argv.extend_from_slice(args);
        cmd::run("docker", &argv)
            .await
            .map_err(|e| DiskswapError::Sandbox(e.to_string()))
    }

    /// Run a runtime CLI command best-effort (cleanup paths, "already
    /// exists" cases).
    pub async fn control_quiet(&self, args: &[&str]) {
        let mut argv = vec!["-H", self.socket_url.as_str()];
        argv.extend_from_slice(args);
        cmd::run_quiet("docker", &argv).await;
    }

    /// Stop the daemon: graceful signal, bounded wait, then forceful.
    pub async fn stop(mut self) {
        if let Some(pid) = self.child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
        match tokio::time::timeout(STOP_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(?status, "nested runtime exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "waiting on nested runtime failed");
            }
            Err(_) => {
                tracing::warn!("nested runtime ignored SIGTERM, killing");
                if let Err(e) = self.child.start_kill() {
                    tracing::warn!(error = %e, "SIGKILL failed");
                }
                let _ = self.child.wait().await;
            }
        }
    }
}
