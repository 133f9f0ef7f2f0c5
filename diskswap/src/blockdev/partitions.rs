//! Partition discovery and geometry extraction.

use std::path::{Path, PathBuf};

use diskswap_shared::constants::SECTOR_SIZE;
use diskswap_shared::{DiskswapError, DiskswapResult};

use crate::util::cmd;

/// Byte offset and byte length of a partition within a whole-disk device.
///
/// Used exclusively to bind a loop device precisely over one partition,
/// never the whole disk, so whole-disk writes and partition-scoped writes
/// cannot alias each other through the page cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionGeometry {
    pub offset_bytes: u64,
    pub size_bytes: u64,
}

/// Find a partition on `device` by filesystem label.
pub async fn find_partition_by_label(device: &Path, label: &str) -> DiskswapResult<PathBuf> {
    let device_str = device.to_string_lossy();
    let output = cmd::run("lsblk", &["-nro", "NAME,LABEL", &device_str])
        .await
        .map_err(|e| DiskswapError::Device(e.to_string()))?;

    for line in output.lines() {
        let mut parts = line.split_whitespace();
        if let (Some(name), Some(part_label)) = (parts.next(), parts.next()) {
            if part_label == label {
                return Ok(PathBuf::from(format!("/dev/{}", name)));
            }
        }
    }

    Err(DiskswapError::Device(format!(
        "no partition labelled {} on {}; flash may have failed or the partition layout is unexpected",
        label,
        device.display()
    )))
}

/// Read a partition's byte offset and size limit from sysfs.
pub async fn partition_geometry(partition: &Path) -> DiskswapResult<PartitionGeometry> {
    let name = partition
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            DiskswapError::Device(format!("invalid partition path: {}", partition.display()))
        })?;

    let start = read_sysfs_u64(&format!("/sys/class/block/{}/start", name)).await?;
    let size = read_sysfs_u64(&format!("/sys/class/block/{}/size", name)).await?;

    Ok(geometry_from_sectors(start, size))
}

/// The partition's index on its parent disk (trailing digits of the node
/// name), needed by `growpart`.
pub fn partition_number(partition: &Path) -> DiskswapResult<u32> {
    let name = partition
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let digits: String = name
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();

    digits.parse().map_err(|_| {
        DiskswapError::Device(format!(
            "cannot determine partition number of {}",
            partition.display()
        ))
    })
}

fn geometry_from_sectors(start_sectors: u64, size_sectors: u64) -> PartitionGeometry {
    PartitionGeometry {
        offset_bytes: start_sectors * SECTOR_SIZE,
        size_bytes: size_sectors * SECTOR_SIZE,
    }
}

async fn read_sysfs_u64(path: &str) -> DiskswapResult<u64> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| DiskswapError::Device(format!("failed to read {}: {}", path, e)))?;
    content
        .trim()
        .parse()
        .map_err(|e| DiskswapError::Device(format!("unparseable value in {}: {}", path, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_converts_sectors_to_bytes() {
        let geo = geometry_from_sectors(2048, 1048576);
        assert_eq!(geo.offset_bytes, 1024 * 1024);
        assert_eq!(geo.size_bytes, 512 * 1024 * 1024);
    }

    #[test]
    fn partition_number_from_node_name() {
        assert_eq!(partition_number(Path::new("/dev/sda8")).unwrap(), 8);
        assert_eq!(partition_number(Path::new("/dev/mmcblk0p3")).unwrap(), 3);
        assert!(partition_number(Path::new("/dev/sda")).is_err());
    }
}
