//! Human-readable byte formatting.

const MB: u64 = 1024 * 1024;
const GB: u64 = 1024 * 1024 * 1024;
const TB: u64 = 1024 * 1024 * 1024 * 1024;

/// Format a byte count the way the UI displays sizes: whole megabytes up
/// to 1 GB, one decimal for GB and TB.
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= TB {
        format!("{:.1} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else {
        format!("{} MB", bytes.div_ceil(MB))
    }
}

/// Format a disk size as the discovery layer shows it: whole gigabytes,
/// one decimal for terabytes.
pub fn format_disk_size(bytes: u64) -> String {
    if bytes >= TB {
        format!("{:.1} TB", bytes as f64 / TB as f64)
    } else {
        format!("{} GB", (bytes as f64 / GB as f64).round() as u64)
    }
}
