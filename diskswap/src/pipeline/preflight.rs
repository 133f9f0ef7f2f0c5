//! Pre-flight free-space check.

use std::ffi::CString;
use std::path::Path;

use diskswap_shared::{DiskswapError, DiskswapResult};

/// Free bytes available to unprivileged writes on the filesystem holding
/// `path`.
pub fn free_space_bytes(path: &Path) -> DiskswapResult<u64> {
    let c_path = CString::new(path.to_string_lossy().as_bytes())
        .map_err(|_| DiskswapError::Preflight(format!("invalid path: {}", path.display())))?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(DiskswapError::Preflight(format!(
            "statvfs({}) failed: {}",
            path.display(),
            std::io::Error::last_os_error()
        )));
    }

    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

/// Fail fast when `path`'s filesystem has less than `required` bytes
/// free.
pub fn ensure_free_space(path: &Path, required: u64) -> DiskswapResult<()> {
    let free = free_space_bytes(path)?;
    if free < required {
        return Err(DiskswapError::Preflight(format!(
            "not enough disk space for image download: need ~{} MB, only {} MB free",
            required / 1024 / 1024,
            free / 1024 / 1024
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_free_space_on_a_real_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        assert!(free_space_bytes(dir.path()).unwrap() > 0);
    }

    #[test]
    fn impossible_requirement_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = ensure_free_space(dir.path(), u64::MAX).unwrap_err();
        assert!(matches!(err, DiskswapError::Preflight(_)));
    }

    #[test]
    fn modest_requirement_passes() {
        let dir = tempfile::tempdir().unwrap();
        ensure_free_space(dir.path(), 1).unwrap();
    }
}
