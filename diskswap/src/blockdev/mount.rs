//! Filesystem creation, repair, and mount management.

use std::path::Path;

use diskswap_shared::{DiskswapError, DiskswapResult};

use crate::util::cmd;

/// Probe for a filesystem on `device` and create one only if absent.
///
/// Stale partition-table or filesystem signatures are wiped before
/// formatting, and the block-device cache is flushed afterwards so the
/// new superblock is visible to the next open.
pub async fn ensure_filesystem(device: &Path) -> DiskswapResult<()> {
    let device_str = device.to_string_lossy().into_owned();

    let fs_type = cmd::run("blkid", &["-o", "value", "-s", "TYPE", &device_str])
        .await
        .map(|out| out.trim().to_string())
        .unwrap_or_default();

    if !fs_type.is_empty() {
        tracing::debug!(device = %device_str, fs_type, "filesystem already present");
        return Ok(());
    }

    tracing::info!(device = %device_str, "no filesystem found, creating ext4");
    format_device(&device_str).await
}

/// Mount an ext4 filesystem read-write.
pub async fn mount(source: &Path, mount_point: &Path) -> DiskswapResult<()> {
    tokio::fs::create_dir_all(mount_point).await?;

    #[cfg(target_os = "linux")]
    {
        let source = source.to_path_buf();
        let mount_point = mount_point.to_path_buf();
        tokio::task::spawn_blocking(move || {
            nix::mount::mount(
                Some(source.as_path()),
                mount_point.as_path(),
                Some("ext4"),
                nix::mount::MsFlags::empty(),
                None::<&str>,
            )
            .map_err(|e| {
                DiskswapError::Device(format!(
                    "mount {} on {} failed: {}",
                    source.display(),
                    mount_point.display(),
                    e
                ))
            })
        })
        .await
        .map_err(|e| DiskswapError::Internal(format!("mount task panicked: {}", e)))?
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = source;
        Err(DiskswapError::Device(
            "mounting is only supported on Linux".into(),
        ))
    }
}

/// Mount with a single repair fallback: if the first attempt fails, the
/// filesystem is recreated once and the mount retried. A second failure
/// is fatal.
pub async fn mount_with_repair(source: &Path, mount_point: &Path) -> DiskswapResult<()> {
    match mount(source, mount_point).await {
        Ok(()) => Ok(()),
        Err(first) => {
            tracing::warn!(error = %first, "mount failed, reformatting once and retrying");
            format_device(&source.to_string_lossy()).await?;
            mount(source, mount_point).await
        }
    }
}

/// Synchronize and unmount. Never returns an error: the mount may
/// legitimately be absent on cleanup paths.
pub async fn unmount(mount_point: &Path) {
    cmd::run_quiet("sync", &[]).await;

    #[cfg(target_os = "linux")]
    {
        let mount_point = mount_point.to_path_buf();
        let result = tokio::task::spawn_blocking(move || {
            nix::mount::umount(mount_point.as_path())
        })
        .await;
        if let Ok(Err(e)) = result {
            tracing::debug!(error = %e, "unmount skipped (not mounted)");
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = mount_point;
    }
}

async fn format_device(device: &str) -> DiskswapResult<()> {
    cmd::run_quiet("wipefs", &["-a", device]).await;

    cmd::run("mkfs.ext4", &["-F", device])
        .await
        .map_err(|e| DiskswapError::Device(format!("mkfs.ext4 failed: {}", e)))?;

    // Drop cached blocks so the fresh superblock is what the next open sees.
    cmd::run_quiet("blockdev", &["--flushbufs", device]).await;
    Ok(())
}
