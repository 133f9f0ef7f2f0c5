//! Diskswap shared types.
//!
//! This crate contains the error type, the wire shapes exchanged with the
//! presentation layer (jobs, stages, devices, progress events), and the
//! constants that the core pipeline and its collaborators agree on.

pub mod constants;
pub mod errors;
pub mod types;

pub use errors::{DiskswapError, DiskswapResult};
pub use types::{
    CloneOptions, Device, ImageCacheInfo, Job, JobStatus, ProgressEvent, Stage, StageLink,
    StageName, StageStatus, SystemInfo,
};
