//! Detached-checksum verification and cache validity.

use std::path::Path;

use diskswap_shared::{DiskswapError, DiskswapResult};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

/// Verify `path` against the detached checksum at `checksum_url`.
///
/// - HTTP 404: verification unavailable, returns `Ok(false)`.
/// - Mismatch: the local file is deleted and an error returned.
/// - Match: returns `Ok(true)`.
pub async fn verify_checksum(path: &Path, checksum_url: &str) -> DiskswapResult<bool> {
    let response = reqwest::get(checksum_url)
        .await
        .map_err(|e| DiskswapError::Image(format!("checksum fetch failed: {}", e)))?;

    if response.status() == reqwest::StatusCode::NOT_FOUND {
        tracing::info!(checksum_url, "no checksum published, skipping verification");
        return Ok(false);
    }
    if !response.status().is_success() {
        return Err(DiskswapError::Image(format!(
            "checksum fetch failed: HTTP {}",
            response.status()
        )));
    }

    let text = response
        .text()
        .await
        .map_err(|e| DiskswapError::Image(format!("checksum body unreadable: {}", e)))?;
    let expected = parse_checksum(&text).ok_or_else(|| {
        DiskswapError::Image(format!("malformed checksum file at {}", checksum_url))
    })?;

    verify_against(path, &expected).await
}

/// Whether a previously downloaded image at `path` is reusable.
///
/// True whenever the file exists and checksum verification does not
/// error: "verification unavailable" and "verified" are both cache hits.
/// Only a confirmed mismatch (which also deletes the file) evicts.
pub async fn is_cache_valid(path: &Path, checksum_url: &str) -> bool {
    if tokio::fs::metadata(path).await.is_err() {
        return false;
    }
    match verify_checksum(path, checksum_url).await {
        Ok(verified) => {
            if !verified {
                tracing::debug!(path = %path.display(), "cache accepted without checksum");
            }
            true
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cached image rejected");
            false
        }
    }
}

/// First whitespace-delimited token of a `sha256sum`-style checksum file.
fn parse_checksum(text: &str) -> Option<String> {
    text.split_whitespace()
        .next()
        .filter(|t| t.len() == 64 && t.chars().all(|c| c.is_ascii_hexdigit()))
        .map(|t| t.to_ascii_lowercase())
}

/// Compare the file's SHA-256 against `expected` (lowercase hex). A
/// mismatch deletes the file before returning the error.
async fn verify_against(path: &Path, expected: &str) -> DiskswapResult<bool> {
    let actual = sha256_file(path).await?;
    if actual != expected {
        let _ = tokio::fs::remove_file(path).await;
        return Err(DiskswapError::Image(format!(
            "checksum mismatch: expected {}, got {}",
            expected, actual
        )));
    }
    Ok(true)
}

async fn sha256_file(path: &Path) -> DiskswapResult<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 128 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    /// Minimal HTTP server answering every request with one canned
    /// response. Returns the checksum URL to point the code at.
    async fn serve(status: &'static str, body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                let body = body.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 2048];
                    let _ = sock.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = sock.write_all(response.as_bytes()).await;
                });
            }
        });
        format!("http://{}/haos.img.xz.sha256", addr)
    }

    #[test]
    fn parses_sha256sum_format() {
        let text = format!("{}  haos_rpi4-64-17.1.img.xz\n", HELLO_SHA256);
        assert_eq!(parse_checksum(&text).as_deref(), Some(HELLO_SHA256));
        assert_eq!(parse_checksum("not-a-digest file"), None);
        assert_eq!(parse_checksum(""), None);
    }

    #[tokio::test]
    async fn verify_against_accepts_matching_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.img.xz");
        tokio::fs::write(&path, b"hello").await.unwrap();

        assert!(verify_against(&path, HELLO_SHA256).await.unwrap());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn mismatch_deletes_the_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.img.xz");
        tokio::fs::write(&path, b"corrupted").await.unwrap();

        let err = verify_against(&path, HELLO_SHA256).await.unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
        assert!(!path.exists(), "mismatching file must be evicted");
    }

    #[tokio::test]
    async fn missing_file_is_never_a_cache_hit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.img.xz");
        assert!(!is_cache_valid(&path, "http://127.0.0.1:9/none").await);
    }

    #[tokio::test]
    async fn unpublished_checksum_is_still_a_cache_hit() {
        let url = serve("404 Not Found", String::new()).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.img.xz");
        tokio::fs::write(&path, b"hello").await.unwrap();

        assert!(is_cache_valid(&path, &url).await);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn published_mismatch_evicts_the_cached_image() {
        let wrong = "a".repeat(64);
        let url = serve("200 OK", format!("{}  haos.img.xz\n", wrong)).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.img.xz");
        tokio::fs::write(&path, b"hello").await.unwrap();

        assert!(!is_cache_valid(&path, &url).await);
        assert!(!path.exists(), "mismatching file must be evicted");
    }

    #[tokio::test]
    async fn published_match_verifies_the_cached_image() {
        let url = serve("200 OK", format!("{}  haos.img.xz\n", HELLO_SHA256)).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.img.xz");
        tokio::fs::write(&path, b"hello").await.unwrap();

        assert!(verify_checksum(&path, &url).await.unwrap());
        assert!(is_cache_valid(&path, &url).await);
    }
}
