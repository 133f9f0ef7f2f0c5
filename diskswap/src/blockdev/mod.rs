//! Block-device resource primitives.
//!
//! Pure, retryable, idempotent operations on partitions, loop devices,
//! and mounts. Discovery and geometry failures are fatal to the calling
//! stage; teardown operations tolerate "already unmounted" and "already
//! detached" so cleanup paths can always run them defensively.

mod loopdev;
mod mount;
mod partitions;

pub use loopdev::{bind_loop, unbind_loop};
pub use mount::{ensure_filesystem, mount, mount_with_repair, unmount};
pub use partitions::{
    find_partition_by_label, partition_geometry, partition_number, PartitionGeometry,
};
