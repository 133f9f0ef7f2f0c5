//! Per-run pipeline context.
//!
//! One value constructed per pipeline run and threaded through the
//! stage functions. Working state (backup slug, board, version, image
//! path) lives here and nowhere else, so nothing can leak between runs.

use std::path::PathBuf;

use diskswap_shared::types::{CloneOptions, Device};
use diskswap_shared::{DiskswapError, DiskswapResult};

#[derive(Debug)]
pub(crate) struct RunContext {
    pub device: Device,
    pub opts: CloneOptions,
    pub backup_slug: Option<String>,
    pub machine: Option<String>,
    pub board_slug: Option<String>,
    pub os_version: Option<String>,
    pub image_path: Option<PathBuf>,
}

impl RunContext {
    pub fn new(device: Device, opts: CloneOptions) -> Self {
        RunContext {
            device,
            opts,
            backup_slug: None,
            machine: None,
            board_slug: None,
            os_version: None,
            image_path: None,
        }
    }

    /// Slug of the backup to inject. Set by the backup stage before any
    /// later stage reads it.
    pub fn backup_slug(&self) -> DiskswapResult<&str> {
        self.backup_slug
            .as_deref()
            .ok_or_else(|| DiskswapError::Internal("backup slug not set by backup stage".into()))
    }

    /// Path of the image to flash. Set by the download stage.
    pub fn image_path(&self) -> DiskswapResult<&std::path::Path> {
        self.image_path
            .as_deref()
            .ok_or_else(|| DiskswapError::Internal("image path not set by download stage".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device {
            name: "sda".into(),
            path: "/dev/sda".into(),
            size: 0,
            size_human: String::new(),
            vendor: String::new(),
            model: String::new(),
            tran: "usb".into(),
            serial: String::new(),
            has_bootable_os: false,
        }
    }

    #[test]
    fn unset_working_state_is_an_error() {
        let ctx = RunContext::new(device(), CloneOptions::default());
        assert!(ctx.backup_slug().is_err());
        assert!(ctx.image_path().is_err());
    }

    #[test]
    fn set_working_state_reads_back() {
        let mut ctx = RunContext::new(device(), CloneOptions::default());
        ctx.backup_slug = Some("abc12345".into());
        ctx.image_path = Some(PathBuf::from("/data/haos.img.xz"));
        assert_eq!(ctx.backup_slug().unwrap(), "abc12345");
        assert_eq!(
            ctx.image_path().unwrap(),
            std::path::Path::new("/data/haos.img.xz")
        );
    }
}
