//! Diskswap core: a cancellable, resumable, multi-stage pipeline that
//! provisions a USB disk with an OS image, a configuration backup, and an
//! optional interactively restored configuration.
//!
//! The pipeline orchestrator ([`pipeline::Pipeline`]) owns the stage
//! sequence; each stage calls into the leaf modules:
//!
//! - [`blockdev`] — partition discovery, loop bindings, mounts
//! - [`images`] — image download, checksum verification, cache
//! - [`flasher`] — compressed image streaming onto raw block storage
//! - [`injector`] — backup archive placement and auto-restore metadata
//! - [`sandbox`] — ephemeral nested platform instance for pre-boot restore
//! - [`jobs`] — crash-safe job state, persistence, progress broadcast
//! - [`supervisor`] — platform backup and system-info API client
//! - [`devices`] — USB target discovery and safety filtering

pub mod blockdev;
pub mod devices;
pub mod flasher;
pub mod images;
pub mod injector;
pub mod jobs;
pub mod pipeline;
pub mod sandbox;
pub mod supervisor;
pub mod util;

pub use diskswap_shared::{DiskswapError, DiskswapResult};
pub use jobs::JobStore;
pub use pipeline::{Pipeline, PipelineConfig};
pub use sandbox::SandboxControl;
