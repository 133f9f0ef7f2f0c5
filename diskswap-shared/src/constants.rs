//! Constants shared by the pipeline stages and their collaborators.

/// Base URL for OS release artifacts (images and detached checksums).
pub const RELEASE_BASE_URL: &str =
    "https://github.com/home-assistant/operating-system/releases/download";

/// Partition label of the data partition on a flashed disk.
pub const DATA_PARTITION_LABEL: &str = "hassos-data";

/// Partition label that marks a disk as already carrying a bootable OS.
pub const BOOT_PARTITION_LABEL: &str = "hassos-boot";

/// Fixed loop slot used for partition-scoped bindings. Binding tears down
/// any prior attachment on this slot first, so the slot is safe to reuse
/// across stages.
pub const LOOP_DEVICE: &str = "/dev/loop0";

/// Mount point for the target disk's data partition.
pub const DATA_MOUNT_POINT: &str = "/mnt/newsd";

/// Directory where downloaded images are cached.
pub const DEFAULT_IMAGE_DIR: &str = "/data";

/// Directory where the platform stores backup archives.
pub const DEFAULT_BACKUP_DIR: &str = "/backup";

/// Minimum free space required before starting an image download.
pub const MIN_DOWNLOAD_SPACE_BYTES: u64 = 600 * 1024 * 1024;

/// Base URL of the platform Supervisor API.
pub const SUPERVISOR_URL: &str = "http://supervisor";

/// Interval between Supervisor backup-job polls.
pub const BACKUP_POLL_INTERVAL_SECS: u64 = 2;

/// Control socket of the nested container runtime.
pub const NESTED_RUNTIME_SOCKET: &str = "/run/dind.sock";

/// Subnet handed to the nested runtime's default bridge.
pub const NESTED_BRIDGE_CIDR: &str = "10.99.99.1/24";

/// Subnet the nested Supervisor hard-codes for its internal network.
pub const HASSIO_SUBNET: &str = "172.30.32.0/23";

/// Gateway the nested Supervisor hard-codes for its internal network.
pub const HASSIO_GATEWAY: &str = "172.30.33.254";

/// Address of the nested core application. Collides with an address used
/// by the surrounding host-side platform, which is why the sandbox
/// installs fwmark-based policy routing.
pub const HASSIO_CORE_IP: &str = "172.30.32.1";

/// Fixed address of the nested Supervisor container.
pub const HASSIO_SUPERVISOR_IP: &str = "172.30.32.2";

/// Progress description sentinel meaning "sandbox ready for interactive use".
pub const SANDBOX_READY_SENTINEL: &str = "sandbox_ready";

/// Upper bound on waiting for the nested core application to serve HTTP.
pub const SANDBOX_READY_TIMEOUT_SECS: u64 = 15 * 60;

/// Bytes per disk sector as reported by sysfs partition geometry.
pub const SECTOR_SIZE: u64 = 512;
