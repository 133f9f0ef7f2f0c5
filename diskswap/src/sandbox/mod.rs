//! Sandbox orchestrator: boots a real nested instance of the platform
//! against the freshly provisioned disk so the user can restore their
//! backup interactively before first boot.
//!
//! Strictly sequential; any failure or cancellation routes to the same
//! unconditional cleanup. Best-effort by design: a failed sandbox leaves
//! the disk fully usable via blind first-boot auto-restore.

mod network;
mod runtime;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use diskswap_shared::constants::{
    DATA_MOUNT_POINT, DATA_PARTITION_LABEL, HASSIO_CORE_IP, HASSIO_GATEWAY, HASSIO_SUBNET,
    HASSIO_SUPERVISOR_IP, NESTED_RUNTIME_SOCKET, SANDBOX_READY_SENTINEL,
    SANDBOX_READY_TIMEOUT_SECS,
};
use diskswap_shared::{DiskswapError, DiskswapResult};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::blockdev;
use crate::flasher;
use crate::util::cmd;
use network::NetRule;
use runtime::NestedRuntime;

const SUPERVISOR_CONTAINER: &str = "hassio_supervisor";
const RUNTIME_READY_TIMEOUT: Duration = Duration::from_secs(30);
const READY_REBROADCAST: Duration = Duration::from_secs(5);
const LOG_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);
const HTTP_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Progress range interpolated over wall-clock time while the nested
/// core application boots; no structured progress signal exists there.
const BOOT_WAIT_RANGE: (u8, u8) = (40, 88);

/// First-boot state that must not leak into the interactive session.
/// Removing these forces the nested instance to start from onboarding.
const RESTART_MARKER: &str = "supervisor/tmp/restart";
const ONBOARDING_STATE: &str = "supervisor/homeassistant/.storage/onboarding";

/// Progress callback: `(percent, description)`.
pub type SandboxProgress<'a> = &'a (dyn Fn(u8, Option<&str>) + Send + Sync);

/// Shared handle through which the transport layer observes and unblocks
/// a running sandbox: the proxy target once the nested instance is
/// ready, and the one-shot "user is done" signal.
#[derive(Clone, Default)]
pub struct SandboxControl {
    inner: Arc<ControlInner>,
}

#[derive(Default)]
struct ControlInner {
    confirm: Mutex<Option<oneshot::Sender<()>>>,
    proxy_url: Mutex<Option<String>>,
}

impl SandboxControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unblock the sandbox's wait. Exactly-once: the sender is taken
    /// under the lock, so later or duplicate calls are no-ops.
    pub fn confirm_done(&self) {
        if let Some(tx) = self.inner.confirm.lock().take() {
            let _ = tx.send(());
            tracing::info!("sandbox completion confirmed");
        } else {
            tracing::debug!("sandbox completion signal ignored, nothing waiting");
        }
    }

    /// Address of the nested core application, once it is serving.
    pub fn proxy_url(&self) -> Option<String> {
        self.inner.proxy_url.lock().clone()
    }

    fn arm(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        *self.inner.confirm.lock() = Some(tx);
        rx
    }

    fn publish_proxy(&self, url: String) {
        *self.inner.proxy_url.lock() = Some(url);
    }

    fn clear(&self) {
        *self.inner.proxy_url.lock() = None;
        *self.inner.confirm.lock() = None;
    }
}

/// Everything cleanup must undo, recorded as setup progresses so a
/// failure at any step still tears down exactly what was established.
#[derive(Default)]
struct Teardown {
    loop_path: Option<PathBuf>,
    mounted: bool,
    runtime: Option<NestedRuntime>,
    net_rules: Vec<NetRule>,
    supervisor_started: bool,
}

/// Run the interactive sandbox stage against `device`.
pub async fn run(
    device: &Path,
    machine: &str,
    control: &SandboxControl,
    on_progress: SandboxProgress<'_>,
    token: &CancellationToken,
) -> DiskswapResult<()> {
    let mut teardown = Teardown::default();
    let result = run_inner(device, machine, control, on_progress, token, &mut teardown).await;
    cleanup(control, teardown).await;
    result
}

async fn run_inner(
    device: &Path,
    machine: &str,
    control: &SandboxControl,
    on_progress: SandboxProgress<'_>,
    token: &CancellationToken,
    teardown: &mut Teardown,
) -> DiskswapResult<()> {
    // 1. Grow the data partition to fill the disk, then reach it through
    // a partition-scoped loop device and mount it.
    on_progress(0, Some("Mounting data partition…"));
    flasher::reprobe_partitions(device).await?;
    let partition = blockdev::find_partition_by_label(device, DATA_PARTITION_LABEL)
        .await
        .map_err(|e| DiskswapError::Sandbox(e.to_string()))?;
    grow_data_partition(device, &partition).await?;

    let geometry = blockdev::partition_geometry(&partition)
        .await
        .map_err(|e| DiskswapError::Sandbox(e.to_string()))?;
    let loop_path = blockdev::bind_loop(device, &geometry)
        .await
        .map_err(|e| DiskswapError::Sandbox(e.to_string()))?;
    teardown.loop_path = Some(loop_path.clone());

    // The freshly flashed filesystem is deliberately undersized; bring
    // it up to the grown partition before mounting.
    cmd::run_quiet("e2fsck", &["-fp", &loop_path.to_string_lossy()]).await;
    cmd::run_quiet("resize2fs", &[&loop_path.to_string_lossy()]).await;

    let mount_point = Path::new(DATA_MOUNT_POINT);
    blockdev::mount(&loop_path, mount_point)
        .await
        .map_err(|e| DiskswapError::Sandbox(e.to_string()))?;
    teardown.mounted = true;
    check_cancelled(token)?;

    // 2-3. Runtime configuration and the host paths the nested
    // platform's plugins expect.
    on_progress(5, Some("Configuring sandbox environment…"));
    prepare_host_paths(mount_point).await;
    check_cancelled(token)?;

    // 4. Launch the nested runtime and wait for its socket.
    on_progress(15, Some("Starting sandbox runtime…"));
    let data_root = mount_point.join("docker");
    let runtime = NestedRuntime::start(&data_root).await?;
    teardown.runtime = Some(runtime);
    let runtime = teardown.runtime.as_ref().ok_or_else(|| {
        DiskswapError::Internal("runtime handle vanished".into())
    })?;
    runtime.wait_ready(RUNTIME_READY_TIMEOUT, token).await?;

    // 5. Exactly the NAT rules nested containers need; the runtime's
    // own firewall management is off.
    network::apply(network::nat_rules(), &mut teardown.net_rules).await?;
    check_cancelled(token)?;

    // 6. Pull before the Supervisor network exists: creating it installs
    // a route that would break the pull's connectivity.
    on_progress(20, Some("Pulling platform supervisor image…"));
    let image = supervisor_image().await?;
    runtime.control(&["pull", &image]).await?;
    tracing::info!(image, "supervisor image pulled");
    check_cancelled(token)?;

    // 7. The Supervisor network with its hard-coded subnet, then the
    // route surgery that keeps host and nested sides both reachable.
    on_progress(25, Some("Setting up sandbox network…"));
    runtime
        .control_quiet(&[
            "network",
            "create",
            "--driver",
            "bridge",
            "--subnet",
            HASSIO_SUBNET,
            "--gateway",
            HASSIO_GATEWAY,
            "--opt",
            "com.docker.network.bridge.name=hassio",
            "hassio",
        ])
        .await;
    network::apply(network::routing_rules(), &mut teardown.net_rules).await?;
    check_cancelled(token)?;

    // 8. The nested Supervisor, its data directory pointed straight at
    // the mounted partition's supervisor subtree so the injected backup
    // is already visible to it.
    on_progress(30, Some("Starting platform supervisor…"));
    let supervisor_data = mount_point.join("supervisor");
    runtime.control_quiet(&["rm", "-f", SUPERVISOR_CONTAINER]).await;
    start_supervisor(runtime, machine, &supervisor_data, &image).await?;
    teardown.supervisor_started = true;
    check_cancelled(token)?;

    // 9. Wait for the nested core application to serve HTTP.
    on_progress(
        BOOT_WAIT_RANGE.0,
        Some("Waiting for the platform to start (this may take a few minutes)…"),
    );
    let core_url = format!("http://{}:8123", HASSIO_CORE_IP);
    wait_for_core(runtime, &core_url, on_progress, token).await?;
    check_cancelled(token)?;

    // 10-11. Publish the proxy target, announce readiness on an interval
    // so late-joining observers see it, and block until the user is done
    // or the pipeline cancels.
    control.publish_proxy(core_url.clone());
    tracing::info!(url = %core_url, "sandbox ready for interactive use");
    on_progress(99, Some(SANDBOX_READY_SENTINEL));

    let mut done = control.arm();
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = &mut done => break,
            _ = tokio::time::sleep(READY_REBROADCAST) => {
                on_progress(99, Some(SANDBOX_READY_SENTINEL));
            }
        }
    }

    on_progress(99, Some("Shutting down sandbox…"));
    Ok(())
}

/// 12. Unconditional cleanup, in reverse order of establishment. Never
/// fails past its caller.
async fn cleanup(control: &SandboxControl, mut teardown: Teardown) {
    control.clear();

    if let Some(runtime) = teardown.runtime.take() {
        if teardown.supervisor_started {
            runtime.control_quiet(&["stop", SUPERVISOR_CONTAINER]).await;
        }
        runtime.stop().await;
    }

    network::remove(&mut teardown.net_rules).await;

    if teardown.mounted {
        blockdev::unmount(Path::new(DATA_MOUNT_POINT)).await;
    }
    if let Some(loop_path) = teardown.loop_path.take() {
        blockdev::unbind_loop(&loop_path).await;
    }

    // The nested runtime's mount-namespace teardown can take the host's
    // security filesystem with it.
    cmd::run_quiet(
        "mount",
        &["-t", "securityfs", "securityfs", "/sys/kernel/security"],
    )
    .await;

    tracing::info!("sandbox cleanup complete");
}

/// Grow the data partition to the end of the disk. "Nothing to do" is a
/// success.
async fn grow_data_partition(device: &Path, partition: &Path) -> DiskswapResult<()> {
    let number = blockdev::partition_number(partition)
        .map_err(|e| DiskswapError::Sandbox(e.to_string()))?
        .to_string();
    let device_str = device.to_string_lossy();

    match cmd::run("growpart", &[&device_str, &number]).await {
        Ok(_) => Ok(()),
        // growpart exits 1 with NOCHANGE when the partition already
        // fills the disk.
        Err(e) if e.to_string().contains("NOCHANGE") => Ok(()),
        Err(e) => Err(DiskswapError::Sandbox(format!("growpart failed: {}", e))),
    }
}

/// Host paths the nested platform's plugins require, plus removal of any
/// stale first-boot state so the session always starts from onboarding.
async fn prepare_host_paths(mount_point: &Path) {
    cmd::run_quiet("mkdir", &["-p", "/run/dbus"]).await;

    // The observer plugin expects the runtime socket at its usual path.
    cmd::run_quiet("ln", &["-sf", NESTED_RUNTIME_SOCKET, "/run/docker.sock"]).await;

    // The audio plugin bind-mounts the machine identity file.
    if tokio::fs::metadata("/etc/machine-id").await.is_err() {
        if let Err(e) = tokio::fs::write("/etc/machine-id", b"deadbeefdeadbeefdeadbeefdeadbeef\n").await {
            tracing::debug!(error = %e, "cannot write machine-id placeholder");
        }
    }

    for stale in [RESTART_MARKER, ONBOARDING_STATE] {
        let path = mount_point.join(stale);
        if tokio::fs::remove_file(&path).await.is_ok() {
            tracing::info!(path = %path.display(), "removed stale first-boot state");
        }
    }
}

async fn start_supervisor(
    runtime: &NestedRuntime,
    machine: &str,
    supervisor_data: &Path,
    image: &str,
) -> DiskswapResult<()> {
    let share = supervisor_data.to_string_lossy();
    let data_volume = format!("{}:/data:rw", share);
    let socket_volume = format!("{}:/run/docker.sock:rw", NESTED_RUNTIME_SOCKET);
    let share_env = format!("SUPERVISOR_SHARE={}", share);
    let machine_env = format!("SUPERVISOR_MACHINE={}", machine);

    runtime
        .control(&[
            "run",
            "-d",
            "--rm",
            "--name",
            SUPERVISOR_CONTAINER,
            "--network",
            "hassio",
            "--ip",
            HASSIO_SUPERVISOR_IP,
            "--privileged",
            "--security-opt",
            "apparmor=unconfined",
            "--security-opt",
            "seccomp=unconfined",
            "-e",
            &share_env,
            "-e",
            "SUPERVISOR_NAME=hassio_supervisor",
            "-e",
            &machine_env,
            "-e",
            "SUPERVISOR_WAIT_BOOT=180",
            "-v",
            &socket_volume,
            "-v",
            &data_volume,
            "-v",
            "/etc/machine-id:/etc/machine-id:ro",
            image,
        ])
        .await?;
    tracing::info!(container = SUPERVISOR_CONTAINER, "supervisor container started");
    Ok(())
}

/// Poll the nested core application's HTTP endpoint until it answers,
/// sampling the Supervisor's log tail on an interval to produce coarse,
/// time-interpolated progress.
async fn wait_for_core(
    runtime: &NestedRuntime,
    core_url: &str,
    on_progress: SandboxProgress<'_>,
    token: &CancellationToken,
) -> DiskswapResult<()> {
    let timeout = Duration::from_secs(SANDBOX_READY_TIMEOUT_SECS);
    let started = tokio::time::Instant::now();
    let deadline = started + timeout;
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(3))
        .build()
        .map_err(|e| DiskswapError::Sandbox(format!("http client: {}", e)))?;

    let mut last_sample = started;
    let mut last_log_line = String::new();

    loop {
        if let Ok(response) = client.get(core_url).send().await {
            // Any non-5xx answer (200, 302, 401...) means the
            // application is up.
            if response.status().as_u16() < 500 {
                return Ok(());
            }
        }

        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Err(DiskswapError::Sandbox(format!(
                "core application at {} not ready after {:?}",
                core_url, timeout
            )));
        }

        if now.duration_since(last_sample) >= LOG_SAMPLE_INTERVAL {
            last_sample = now;
            if let Ok(logs) = runtime
                .control(&["logs", "--tail", "3", SUPERVISOR_CONTAINER])
                .await
            {
                let last_line = logs.trim().lines().last().unwrap_or("").to_string();
                if last_line != last_log_line {
                    last_log_line = last_line;
                    let elapsed = now.duration_since(started).as_secs_f64();
                    let fraction = (elapsed / timeout.as_secs_f64()).min(1.0);
                    let percent = interpolate_boot_progress(fraction);
                    on_progress(percent, Some("Waiting for the platform to start…"));
                }
            }
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(DiskswapError::Cancelled),
            _ = tokio::time::sleep(HTTP_POLL_INTERVAL) => {}
        }
    }
}

fn interpolate_boot_progress(fraction: f64) -> u8 {
    let span = (BOOT_WAIT_RANGE.1 - BOOT_WAIT_RANGE.0) as f64;
    BOOT_WAIT_RANGE.0 + (fraction.clamp(0.0, 1.0) * span).round() as u8
}

/// The supervisor container image for the host's CPU architecture.
async fn supervisor_image() -> DiskswapResult<String> {
    let machine_arch = cmd::run("uname", &["-m"])
        .await
        .map_err(|e| DiskswapError::Sandbox(e.to_string()))?;
    Ok(format!(
        "ghcr.io/home-assistant/{}-hassio-supervisor:latest",
        image_arch(machine_arch.trim())
    ))
}

fn image_arch(machine_arch: &str) -> &str {
    match machine_arch {
        "x86_64" => "amd64",
        "aarch64" => "aarch64",
        other => other,
    }
}

fn check_cancelled(token: &CancellationToken) -> DiskswapResult<()> {
    if token.is_cancelled() {
        return Err(DiskswapError::Cancelled);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn confirm_done_unblocks_exactly_once() {
        let control = SandboxControl::new();
        let rx = control.arm();

        control.confirm_done();
        rx.await.unwrap();

        // Nothing armed; later and duplicate calls are no-ops.
        control.confirm_done();
        control.confirm_done();
    }

    #[tokio::test]
    async fn cleanup_releases_rules_then_mount_then_loop() {
        let script = cmd::script::intercept();

        let control = SandboxControl::new();
        control.publish_proxy("http://172.30.32.1:8123".into());

        let teardown = Teardown {
            loop_path: Some(PathBuf::from("/dev/loop0")),
            mounted: true,
            runtime: None,
            net_rules: network::nat_rules(),
            supervisor_started: false,
        };
        cleanup(&control, teardown).await;

        assert_eq!(control.proxy_url(), None);

        let log = script.log();
        let nat_del = log
            .iter()
            .position(|line| line.contains("-D POSTROUTING"))
            .expect("NAT rules were never removed");
        let detach = log
            .iter()
            .position(|line| line.starts_with("losetup -d"))
            .expect("loop device was never detached");
        assert!(nat_del < detach, "rules come down before the loop: {:?}", log);
        assert!(
            log.last().map(String::as_str).unwrap_or_default().starts_with("mount -t securityfs"),
            "securityfs remount is the final step: {:?}",
            log
        );
    }

    #[test]
    fn proxy_url_lifecycle() {
        let control = SandboxControl::new();
        assert_eq!(control.proxy_url(), None);

        control.publish_proxy("http://172.30.32.1:8123".into());
        assert_eq!(
            control.proxy_url().as_deref(),
            Some("http://172.30.32.1:8123")
        );

        control.clear();
        assert_eq!(control.proxy_url(), None);
    }

    #[test]
    fn boot_progress_interpolates_over_the_wait_range() {
        assert_eq!(interpolate_boot_progress(0.0), 40);
        assert_eq!(interpolate_boot_progress(0.5), 64);
        assert_eq!(interpolate_boot_progress(1.0), 88);
        assert_eq!(interpolate_boot_progress(7.3), 88);
    }

    #[test]
    fn image_arch_maps_x86() {
        assert_eq!(image_arch("x86_64"), "amd64");
        assert_eq!(image_arch("aarch64"), "aarch64");
        assert_eq!(image_arch("riscv64"), "riscv64");
    }
}
