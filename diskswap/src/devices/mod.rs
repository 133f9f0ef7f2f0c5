//! USB target discovery.
//!
//! Enumerates block devices, filters them down to safe flash targets
//! (USB-attached, sanely sized, never the boot disk), and probes whether
//! a candidate already carries a bootable OS. Always re-queried, never
//! cached: devices come and go.

use std::path::Path;

use diskswap_shared::constants::BOOT_PARTITION_LABEL;
use diskswap_shared::{Device, DiskswapError, DiskswapResult};
use serde::Deserialize;

use crate::util::cmd;
use crate::util::format::format_disk_size;

const MIN_TARGET_SIZE: u64 = 8 * 1024 * 1024 * 1024;
const MAX_TARGET_SIZE: u64 = 2 * 1024 * 1024 * 1024 * 1024;

/// One entry of `lsblk --json` output.
#[derive(Debug, Clone, Deserialize)]
struct RawBlockDevice {
    name: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    tran: Option<String>,
    #[serde(default)]
    vendor: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    serial: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<RawBlockDevice>,
}

/// List all USB block devices that are safe flash targets.
pub async fn list_usb_devices() -> DiskswapResult<Vec<Device>> {
    let boot_disk = boot_disk().await?;

    let raw = cmd::run(
        "lsblk",
        &[
            "--json",
            "-b",
            "-o",
            "NAME,SIZE,TYPE,TRAN,VENDOR,MODEL,SERIAL",
            "--nodeps",
        ],
    )
    .await
    .map_err(|e| DiskswapError::Device(e.to_string()))?;

    let parsed: LsblkOutput = serde_json::from_str(&raw)
        .map_err(|e| DiskswapError::Device(format!("unparseable lsblk output: {}", e)))?;

    let mut devices = Vec::new();
    for dev in parsed
        .blockdevices
        .into_iter()
        .filter(|d| d.kind == "disk" && is_safe_target(d, &boot_disk))
    {
        let path = format!("/dev/{}", dev.name);
        let has_bootable_os = has_bootable_os(Path::new(&path)).await;
        let size = dev.size.unwrap_or(0);
        devices.push(Device {
            name: dev.name,
            path,
            size,
            size_human: format_disk_size(size),
            vendor: dev.vendor.unwrap_or_default().trim().to_string(),
            model: dev.model.unwrap_or_default().trim().to_string(),
            tran: dev.tran.unwrap_or_else(|| "unknown".into()),
            serial: dev.serial.unwrap_or_default().trim().to_string(),
            has_bootable_os,
        });
    }
    Ok(devices)
}

/// Find a device in the current discovery snapshot by path. Any path not
/// present is an invalid target.
pub async fn find_device(device_path: &str) -> DiskswapResult<Device> {
    list_usb_devices()
        .await?
        .into_iter()
        .find(|d| d.path == device_path)
        .ok_or_else(|| {
            DiskswapError::Preflight(format!(
                "target device {} not found or is not a safe USB target",
                device_path
            ))
        })
}

/// Name of the disk the running system booted from (e.g. `mmcblk0`).
async fn boot_disk() -> DiskswapResult<String> {
    let root_source = cmd::run("findmnt", &["--noheadings", "--output", "SOURCE", "--target", "/"])
        .await
        .map_err(|e| DiskswapError::Device(e.to_string()))?;
    let root_source = root_source.trim();

    let pkname = cmd::run("lsblk", &["--noheadings", "--output", "PKNAME", root_source])
        .await
        .map(|out| out.trim().to_string())
        .unwrap_or_default();

    let disk = if pkname.is_empty() {
        root_source.to_string()
    } else {
        pkname
    };
    Ok(disk.trim_start_matches("/dev/").to_string())
}

/// Safety filter: USB transport, between 8 GB and 2 TB, never the boot
/// disk.
fn is_safe_target(dev: &RawBlockDevice, boot_disk: &str) -> bool {
    if dev.name == boot_disk {
        return false;
    }
    if dev.tran.as_deref() != Some("usb") {
        return false;
    }
    let size = dev.size.unwrap_or(0);
    (MIN_TARGET_SIZE..=MAX_TARGET_SIZE).contains(&size)
}

/// Whether the device already carries a bootable OS, detected by the
/// boot partition label. Feeds the skip-flash shortcut.
async fn has_bootable_os(device: &Path) -> bool {
    match cmd::run("lsblk", &["-nro", "LABEL", &device.to_string_lossy()]).await {
        Ok(output) => output.lines().any(|l| l.trim() == BOOT_PARTITION_LABEL),
        Err(_) => false,
    }
}
