//! Backup injector: copies a backup archive onto the freshly flashed
//! data partition and writes auto-restore metadata for first boot.

mod locate;

pub use locate::{locate_backup, read_backup_meta, BackupMeta};

use std::path::Path;
use std::time::Instant;

use diskswap_shared::constants::{DATA_MOUNT_POINT, DATA_PARTITION_LABEL};
use diskswap_shared::{DiskswapError, DiskswapResult};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::blockdev;
use crate::flasher;
use crate::util::cmd;

/// Sub-range of the stage reserved for the actual archive copy. Below it
/// is setup, above it flush and teardown.
const COPY_RANGE: (u8, u8) = (3, 90);

/// Progress callback: `(percent, description, speed, eta)`.
pub type InjectProgress<'a> = &'a (dyn Fn(u8, Option<&str>, Option<f64>, Option<u64>) + Send + Sync);

/// Inject the backup identified by `slug` into `device`'s data partition.
///
/// The partition is reached through a loop device bound to its exact
/// geometry, never the whole disk. Teardown (sync, unmount, loop unbind)
/// runs unconditionally, on success, cancellation, and error alike.
pub async fn inject(
    device: &Path,
    backup_dir: &Path,
    slug: &str,
    on_progress: InjectProgress<'_>,
    token: &CancellationToken,
) -> DiskswapResult<()> {
    on_progress(0, Some("Locating backup…"), None, None);
    let source = locate_backup(backup_dir, slug).await?;

    on_progress(1, Some("Preparing data partition…"), None, None);
    flasher::reprobe_partitions(device).await?;
    let partition = blockdev::find_partition_by_label(device, DATA_PARTITION_LABEL)
        .await
        .map_err(|e| DiskswapError::Inject(e.to_string()))?;
    let geometry = blockdev::partition_geometry(&partition)
        .await
        .map_err(|e| DiskswapError::Inject(e.to_string()))?;

    inject_bound(
        device,
        &geometry,
        Path::new(DATA_MOUNT_POINT),
        &source,
        on_progress,
        token,
    )
    .await
}

/// Bind, mount, copy, tear down. Every successful bind gets exactly one
/// unbind, on success, cancellation, and error alike.
async fn inject_bound(
    device: &Path,
    geometry: &blockdev::PartitionGeometry,
    mount_point: &Path,
    source: &Path,
    on_progress: InjectProgress<'_>,
    token: &CancellationToken,
) -> DiskswapResult<()> {
    let loop_path = blockdev::bind_loop(device, geometry)
        .await
        .map_err(|e| DiskswapError::Inject(e.to_string()))?;

    let result = inject_mounted(&loop_path, mount_point, source, on_progress, token).await;

    blockdev::unmount(mount_point).await;
    blockdev::unbind_loop(&loop_path).await;

    result
}

async fn inject_mounted(
    loop_path: &Path,
    mount_point: &Path,
    source: &Path,
    on_progress: InjectProgress<'_>,
    token: &CancellationToken,
) -> DiskswapResult<()> {
    // A skip-flash run can hand over a partition that was never
    // formatted; probe and create the filesystem before mounting.
    blockdev::ensure_filesystem(loop_path)
        .await
        .map_err(|e| DiskswapError::Inject(e.to_string()))?;
    blockdev::mount_with_repair(loop_path, mount_point)
        .await
        .map_err(|e| DiskswapError::Inject(e.to_string()))?;

    let file_name = source
        .file_name()
        .ok_or_else(|| DiskswapError::Inject("backup archive has no file name".into()))?
        .to_string_lossy()
        .into_owned();

    let dest_dir = mount_point.join("supervisor/backup");
    tokio::fs::create_dir_all(&dest_dir).await?;
    let dest = dest_dir.join(&file_name);

    on_progress(COPY_RANGE.0, Some("Copying backup…"), None, None);
    copy_with_progress(source, &dest, on_progress, token).await?;

    on_progress(COPY_RANGE.1, Some("Flushing writes…"), None, None);
    cmd::run_quiet("sync", &[]).await;

    // Only a clean, non-cancelled copy gets the first-boot metadata.
    write_auto_restore(mount_point, &file_name).await?;
    link_for_core(mount_point, &file_name).await?;

    Ok(())
}

/// Stream the archive into place, mapping copy progress onto the
/// stage's 3-90% sub-range with smoothed speed and ETA.
async fn copy_with_progress(
    source: &Path,
    dest: &Path,
    on_progress: InjectProgress<'_>,
    token: &CancellationToken,
) -> DiskswapResult<()> {
    let total = tokio::fs::metadata(source).await?.len().max(1);
    let mut reader = tokio::fs::File::open(source).await?;
    let mut writer = tokio::fs::File::create(dest).await?;

    let started = Instant::now();
    let mut copied: u64 = 0;
    let mut buf = vec![0u8; 1024 * 1024];

    loop {
        if token.is_cancelled() {
            return Err(DiskswapError::Cancelled);
        }
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        copied += n as u64;

        let fraction = copied as f64 / total as f64;
        let span = (COPY_RANGE.1 - COPY_RANGE.0) as f64;
        let percent = COPY_RANGE.0 + (fraction * span).round() as u8;

        let elapsed = started.elapsed().as_secs_f64();
        let (speed, eta) = if elapsed >= 1.0 {
            let speed = copied as f64 / elapsed;
            let eta = ((total - copied) as f64 / speed).round() as u64;
            (Some(speed), Some(eta))
        } else {
            (None, None)
        };
        on_progress(percent.min(COPY_RANGE.1), Some("Copying backup…"), speed, eta);
    }

    writer.flush().await?;
    Ok(())
}

/// Write the auto-restore descriptor consumed by the platform's
/// first-boot logic: the archive path as seen from inside the platform
/// runtime, plus instructions to restore core configuration and its
/// database.
async fn write_auto_restore(mount_point: &Path, archive_name: &str) -> DiskswapResult<()> {
    let descriptor = json!({
        "backup_path": format!("/data/backup/{}", archive_name),
        "restore_homeassistant": true,
        "restore_database": true,
    });
    let path = mount_point.join("supervisor/auto_restore.json");
    tokio::fs::write(&path, serde_json::to_vec_pretty(&descriptor)?).await?;
    tracing::info!(path = %path.display(), "wrote auto-restore descriptor");
    Ok(())
}

/// Make the archive visible to the platform's core component, which
/// scans its own backup directory rather than the supervisor's. Hard
/// link when possible, copy when the link fails.
async fn link_for_core(mount_point: &Path, archive_name: &str) -> DiskswapResult<()> {
    let source = mount_point.join("supervisor/backup").join(archive_name);
    let core_dir = mount_point.join("supervisor/homeassistant/backups");
    tokio::fs::create_dir_all(&core_dir).await?;
    let dest = core_dir.join(archive_name);

    if tokio::fs::metadata(&dest).await.is_ok() {
        return Ok(());
    }
    if let Err(e) = tokio::fs::hard_link(&source, &dest).await {
        tracing::debug!(error = %e, "hard link failed, copying instead");
        tokio::fs::copy(&source, &dest).await?;
    }
    Ok(())
}
