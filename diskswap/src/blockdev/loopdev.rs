//! Loop-device binding scoped to a single partition.

use std::path::{Path, PathBuf};

use diskswap_shared::constants::LOOP_DEVICE;
use diskswap_shared::{DiskswapError, DiskswapResult};

use super::PartitionGeometry;
use crate::util::cmd;

/// Bind the fixed loop slot over exactly `geometry` within `device`.
///
/// Any prior binding on the slot is torn down first, so repeated calls
/// across stages are idempotent. The binding is always partition-scoped;
/// binding the whole disk would let stale page-cache blocks from the
/// flash stage shadow freshly written ones.
pub async fn bind_loop(device: &Path, geometry: &PartitionGeometry) -> DiskswapResult<PathBuf> {
    cmd::run_quiet("losetup", &["-d", LOOP_DEVICE]).await;

    let offset = geometry.offset_bytes.to_string();
    let sizelimit = geometry.size_bytes.to_string();
    let device_str = device.to_string_lossy();

    tracing::debug!(
        loop_device = LOOP_DEVICE,
        offset = %offset,
        sizelimit = %sizelimit,
        "binding loop device"
    );

    cmd::run(
        "losetup",
        &[
            "-o",
            &offset,
            "--sizelimit",
            &sizelimit,
            LOOP_DEVICE,
            &device_str,
        ],
    )
    .await
    .map_err(|e| DiskswapError::Device(format!("losetup failed: {}", e)))?;

    Ok(PathBuf::from(LOOP_DEVICE))
}

/// Detach a loop binding. Tolerates "already detached".
pub async fn unbind_loop(loop_path: &Path) {
    cmd::run_quiet("losetup", &["-d", &loop_path.to_string_lossy()]).await;
}
