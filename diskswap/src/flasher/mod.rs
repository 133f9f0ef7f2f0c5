//! Flasher: streams a compressed image through decompression into the
//! raw target device with synchronous-write guarantees.
//!
//! The write pipeline is `xz -dc | pv --numeric --size N | dd` spawned as
//! a single new process group, so a cancellation can terminate the whole
//! group at once. Killing only the shell would leave orphaned decompress
//! and write processes still writing to the disk.

use std::path::Path;
use std::time::{Duration, Instant};

use diskswap_shared::{DiskswapError, DiskswapResult};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::util::cmd;

/// Exact decompressed byte count from the xz container's own index.
///
/// Needed up front because the pipeline reports percent against a known
/// total rather than counting bytes written.
pub async fn uncompressed_size(image: &Path) -> DiskswapResult<u64> {
    let output = cmd::run("xz", &["--list", "--robot", &image.to_string_lossy()])
        .await
        .map_err(|e| DiskswapError::Flash(e.to_string()))?;
    parse_uncompressed_size(&output).ok_or_else(|| {
        DiskswapError::Flash(format!(
            "could not read uncompressed size from xz index of {}",
            image.display()
        ))
    })
}

/// Parse `xz --list --robot` output: the `totals` row carries the
/// uncompressed byte count in its fifth column.
fn parse_uncompressed_size(output: &str) -> Option<u64> {
    output
        .lines()
        .find(|line| line.starts_with("totals"))
        .and_then(|line| line.split('\t').nth(4))
        .and_then(|field| field.trim().parse().ok())
}

/// Derives speed and ETA from percent deltas over wall-clock time, since
/// the meter in the pipeline reports only percent.
struct FlashMeter {
    total_bytes: u64,
    started: Instant,
    last_percent: u8,
}

impl FlashMeter {
    fn new(total_bytes: u64) -> Self {
        FlashMeter {
            total_bytes,
            started: Instant::now(),
            last_percent: 0,
        }
    }

    fn record(&mut self, percent: u8) -> (u8, Option<f64>, Option<u64>) {
        let percent = percent.min(100).max(self.last_percent);
        self.last_percent = percent;

        let elapsed = self.started.elapsed().as_secs_f64();
        if percent == 0 || elapsed < 1.0 {
            return (percent, None, None);
        }

        let written = self.total_bytes as f64 * percent as f64 / 100.0;
        let speed = written / elapsed;
        let remaining = self.total_bytes as f64 - written;
        let eta = if speed > 0.0 {
            Some((remaining / speed).round() as u64)
        } else {
            None
        };
        (percent, Some(speed), eta)
    }
}

/// Flash `image` onto `device`, reporting `(percent, speed, eta)`.
///
/// On cancellation the whole process group receives SIGKILL and the exit
/// status is not checked: a killed pipeline exits non-zero by design and
/// must not surface as a user-facing failure.
pub async fn flash<F>(
    image: &Path,
    device: &Path,
    on_progress: F,
    token: &CancellationToken,
) -> DiskswapResult<()>
where
    F: Fn(u8, Option<f64>, Option<u64>) + Send + Sync,
{
    let total = uncompressed_size(image).await?;

    let script = format!(
        "xz -dc \"{}\" | pv --numeric --size {} | dd of=\"{}\" bs=4M conv=fdatasync status=none",
        image.display(),
        total,
        device.display()
    );

    tracing::info!(device = %device.display(), total_bytes = total, "starting flash pipeline");

    let mut command = tokio::process::Command::new("sh");
    command
        .args(["-c", &script])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::piped());
    // New session so a cancel can kill xz, pv, and dd together.
    unsafe {
        command.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    let mut child = command
        .spawn()
        .map_err(|e| DiskswapError::Flash(format!("failed to spawn flash pipeline: {}", e)))?;

    let pid = child.id();
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| DiskswapError::Flash("flash pipeline stderr not captured".into()))?;

    let mut lines = BufReader::new(stderr).lines();
    let mut meter = FlashMeter::new(total);
    // Non-numeric stderr is pv/dd diagnostics, kept for the error message.
    let mut diagnostics: Vec<String> = Vec::new();

    loop {
        let line = tokio::select! {
            biased;
            _ = token.cancelled() => {
                kill_process_group(pid);
                // Reap the killed pipeline; its exit code is meaningless here.
                let _ = child.wait().await;
                tracing::info!("flash pipeline cancelled and process group killed");
                return Err(DiskswapError::Cancelled);
            }
            line = lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) => match line.trim().parse::<f64>() {
                Ok(value) => {
                    let (percent, speed, eta) = meter.record(value.round() as u8);
                    on_progress(percent, speed, eta);
                }
                Err(_) => {
                    if !line.trim().is_empty() {
                        diagnostics.push(line.trim().to_string());
                    }
                }
            },
            Ok(None) => break,
            Err(e) => {
                diagnostics.push(format!("stderr read error: {}", e));
                break;
            }
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| DiskswapError::Flash(format!("flash pipeline wait failed: {}", e)))?;

    if !status.success() {
        let detail = if diagnostics.is_empty() {
            String::new()
        } else {
            format!(": {}", diagnostics.join("; "))
        };
        return Err(DiskswapError::Flash(format!(
            "flash pipeline exited with {:?}{}",
            status.code(),
            detail
        )));
    }

    Ok(())
}

/// Re-read the partition table after a raw write, with one retry and a
/// settle delay. The kernel's view of partitions is stale immediately
/// after flashing.
pub async fn reprobe_partitions(device: &Path) -> DiskswapResult<()> {
    let device_str = device.to_string_lossy().into_owned();

    if cmd::run("partprobe", &[&device_str]).await.is_err() {
        tokio::time::sleep(Duration::from_secs(2)).await;
        cmd::run("partprobe", &[&device_str])
            .await
            .map_err(|e| DiskswapError::Flash(format!("partprobe failed: {}", e)))?;
    }

    cmd::run_quiet("udevadm", &["settle", "--timeout=5"]).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    Ok(())
}

/// Kill an entire process group rooted at `pid` (the session leader).
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_xz_robot_listing() {
        let output = "name\t/data/haos.img.xz\n\
                      file\t1\t1\t1\t262footer\n\
                      totals\t1\t1\t346980360\t2155872256\t0.161\tCRC64\t0\t1\n";
        assert_eq!(parse_uncompressed_size(output), Some(2155872256));
    }

    #[test]
    fn rejects_listing_without_totals_row() {
        assert_eq!(parse_uncompressed_size("name\t/x.img.xz\n"), None);
    }

    #[test]
    fn meter_is_monotonic_and_clamped() {
        let mut meter = FlashMeter::new(1000);
        let (p1, _, _) = meter.record(10);
        assert_eq!(p1, 10);
        // pv occasionally re-reports a lower value right after a seek
        let (p2, _, _) = meter.record(8);
        assert_eq!(p2, 10);
        let (p3, _, _) = meter.record(150);
        assert_eq!(p3, 100);
    }

    #[tokio::test]
    async fn cancelled_flash_surfaces_cancellation_not_failure() {
        let script = cmd::script::intercept();
        script.stdout_for("xz", "totals\t1\t1\t100\t4096\t0.1\tCRC64\t0\t1\n");

        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("haos.img.xz");
        tokio::fs::write(&image, b"not really xz").await.unwrap();
        let dest = dir.path().join("disk.img");

        let token = CancellationToken::new();
        token.cancel();
        let err = flash(&image, &dest, |_, _, _| {}, &token).await.unwrap_err();
        assert!(err.is_cancelled(), "killed pipeline must not read as a flash failure");
    }

    #[test]
    fn meter_has_no_speed_in_first_second() {
        let mut meter = FlashMeter::new(1 << 30);
        let (_, speed, eta) = meter.record(5);
        assert!(speed.is_none());
        assert!(eta.is_none());
    }
}
