//! Backup archive location by slug.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use diskswap_shared::{DiskswapError, DiskswapResult};
use serde::Deserialize;

/// The metadata record every backup archive embeds as `backup.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct BackupMeta {
    pub slug: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub homeassistant: Option<HomeassistantMeta>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HomeassistantMeta {
    #[serde(default)]
    pub version: Option<String>,
}

/// Locate a backup archive by slug.
///
/// Fast path: the deterministic `{slug}.tar` name. Slow path: scan every
/// archive in the directory and match on the slug declared in its
/// embedded metadata record, since automatically named backups do not
/// use the slug as their filename.
pub async fn locate_backup(backup_dir: &Path, slug: &str) -> DiskswapResult<PathBuf> {
    let direct = backup_dir.join(format!("{}.tar", slug));
    if tokio::fs::metadata(&direct).await.is_ok() {
        return Ok(direct);
    }

    tracing::debug!(slug, "no {{slug}}.tar, scanning archives for embedded slug");

    let mut entries = tokio::fs::read_dir(backup_dir)
        .await
        .map_err(|e| DiskswapError::Inject(format!("cannot read backup dir: {}", e)))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| DiskswapError::Inject(format!("cannot read backup dir: {}", e)))?
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("tar") {
            continue;
        }
        match read_backup_meta(&path).await {
            Ok(meta) if meta.slug == slug => return Ok(path),
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "skipping unreadable archive");
            }
        }
    }

    Err(DiskswapError::Inject(format!(
        "backup {} not found in {}",
        slug,
        backup_dir.display()
    )))
}

/// Read the embedded `backup.json` record out of an archive, opening it
/// only far enough to find the entry.
pub async fn read_backup_meta(archive: &Path) -> DiskswapResult<BackupMeta> {
    let archive = archive.to_path_buf();
    tokio::task::spawn_blocking(move || -> DiskswapResult<BackupMeta> {
        let file = File::open(&archive)?;
        let mut tar = tar::Archive::new(file);
        for entry in tar
            .entries()
            .map_err(|e| DiskswapError::Inject(format!("unreadable archive: {}", e)))?
        {
            let mut entry =
                entry.map_err(|e| DiskswapError::Inject(format!("unreadable archive: {}", e)))?;
            let name = entry
                .path()
                .map(|p| p.to_path_buf())
                .unwrap_or_default();
            if name.file_name().and_then(|n| n.to_str()) == Some("backup.json")
                && name.components().count() <= 2
            {
                let mut json = String::new();
                entry.read_to_string(&mut json).map_err(|e| {
                    DiskswapError::Inject(format!("unreadable backup.json: {}", e))
                })?;
                return serde_json::from_str(&json).map_err(|e| {
                    DiskswapError::Inject(format!("malformed backup.json: {}", e))
                });
            }
        }
        Err(DiskswapError::Inject(format!(
            "{} has no backup.json record",
            archive.display()
        )))
    })
    .await
    .map_err(|e| DiskswapError::Internal(format!("metadata read task panicked: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_archive(dir: &Path, file_name: &str, slug: &str) -> PathBuf {
        let path = dir.join(file_name);
        let file = File::create(&path).unwrap();
        let mut builder = tar::Builder::new(file);
        let json = format!(
            r#"{{"slug":"{}","name":"Test backup","homeassistant":{{"version":"2025.8.1"}}}}"#,
            slug
        );
        let mut header = tar::Header::new_gnu();
        header.set_size(json.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "./backup.json", json.as_bytes())
            .unwrap();
        builder.finish().unwrap();
        path
    }

    #[tokio::test]
    async fn fast_path_finds_slug_named_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_archive(dir.path(), "abc12345.tar", "abc12345");
        let found = locate_backup(dir.path(), "abc12345").await.unwrap();
        assert_eq!(found, path);
    }

    #[tokio::test]
    async fn slow_path_matches_embedded_slug() {
        let dir = tempfile::tempdir().unwrap();
        write_archive(dir.path(), "other.tar", "zzz99999");
        let path = write_archive(dir.path(), "MyBackup_2025-08-20.tar", "abc12345");

        let found = locate_backup(dir.path(), "abc12345").await.unwrap();
        assert_eq!(found, path);
    }

    #[tokio::test]
    async fn missing_slug_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write_archive(dir.path(), "other.tar", "zzz99999");
        assert!(locate_backup(dir.path(), "nope").await.is_err());
    }

    #[tokio::test]
    async fn reads_embedded_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_archive(dir.path(), "x.tar", "abc12345");
        let meta = read_backup_meta(&path).await.unwrap();
        assert_eq!(meta.slug, "abc12345");
        assert_eq!(
            meta.homeassistant.unwrap().version.as_deref(),
            Some("2025.8.1")
        );
    }
}
