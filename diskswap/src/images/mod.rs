//! Image store: URL building, download with progress, checksum
//! verification, and local cache handling.
//!
//! Cache policy: a local image is reusable unless its checksum is
//! confirmed to mismatch. An unavailable checksum (HTTP 404) is not
//! treated as invalidity.

mod checksum;
mod download;

pub use checksum::{is_cache_valid, verify_checksum};
pub use download::download;

use std::path::{Path, PathBuf};

use diskswap_shared::constants::RELEASE_BASE_URL;
use diskswap_shared::ImageCacheInfo;

use crate::util::format_bytes;

/// URL of the compressed OS image for a board and version.
pub fn download_url(board_slug: &str, version: &str) -> String {
    format!(
        "{}/{}/haos_{}-{}.img.xz",
        RELEASE_BASE_URL, version, board_slug, version
    )
}

/// URL of the detached checksum next to an image URL.
pub fn checksum_url(image_url: &str) -> String {
    format!("{}.sha256", image_url)
}

/// Human-readable release page for a version, linked next to the
/// download stage.
pub fn release_page_url(version: &str) -> String {
    format!(
        "https://github.com/home-assistant/operating-system/releases/tag/{}",
        version
    )
}

/// Deterministic local cache path for a board and version.
pub fn image_path(image_dir: &Path, board_slug: &str, version: &str) -> PathBuf {
    image_dir.join(format!("haos_{}-{}.img.xz", board_slug, version))
}

/// Describe the cache state for a board and version.
pub async fn cache_info(image_dir: &Path, board_slug: &str, version: &str) -> ImageCacheInfo {
    let path = image_path(image_dir, board_slug, version);
    match tokio::fs::metadata(&path).await {
        Ok(meta) => ImageCacheInfo {
            cached: true,
            board: Some(board_slug.to_string()),
            version: Some(version.to_string()),
            size_bytes: Some(meta.len()),
            size_human: Some(format_bytes(meta.len())),
        },
        Err(_) => ImageCacheInfo {
            cached: false,
            board: None,
            version: None,
            size_bytes: None,
            size_human: None,
        },
    }
}

/// Delete a downloaded image, best-effort.
pub async fn cleanup(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::debug!(path = %path.display(), error = %e, "image cleanup skipped");
    }
}

/// Discard the cached image for a board and version, best-effort.
pub async fn discard_cached_image(image_dir: &Path, board_slug: &str, version: &str) {
    cleanup(&image_path(image_dir, board_slug, version)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_release_urls() {
        let url = download_url("rpi4-64", "17.1");
        assert_eq!(
            url,
            "https://github.com/home-assistant/operating-system/releases/download/17.1/haos_rpi4-64-17.1.img.xz"
        );
        assert_eq!(
            checksum_url(&url),
            format!("{}.sha256", url)
        );
        assert_eq!(
            release_page_url("17.1"),
            "https://github.com/home-assistant/operating-system/releases/tag/17.1"
        );
    }

    #[test]
    fn image_path_is_deterministic() {
        let path = image_path(Path::new("/data"), "generic-x86-64", "17.1");
        assert_eq!(
            path,
            PathBuf::from("/data/haos_generic-x86-64-17.1.img.xz")
        );
    }

    #[tokio::test]
    async fn cache_info_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let info = cache_info(dir.path(), "rpi4-64", "17.1").await;
        assert!(!info.cached);
        assert!(info.size_bytes.is_none());
    }

    #[tokio::test]
    async fn cache_info_reports_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = image_path(dir.path(), "rpi4-64", "17.1");
        tokio::fs::write(&path, vec![0u8; 1024]).await.unwrap();

        let info = cache_info(dir.path(), "rpi4-64", "17.1").await;
        assert!(info.cached);
        assert_eq!(info.size_bytes, Some(1024));
        assert_eq!(info.board.as_deref(), Some("rpi4-64"));
    }
}
