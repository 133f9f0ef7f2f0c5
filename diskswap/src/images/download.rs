//! Streaming image download with throughput and ETA tracking.

use std::path::Path;
use std::time::{Duration, Instant};

use diskswap_shared::{DiskswapError, DiskswapResult};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Minimum window over which throughput is averaged. Shorter windows make
/// the ETA jitter badly on bursty links.
const SPEED_WINDOW: Duration = Duration::from_secs(1);

/// Smoothed percent/speed/ETA tracker fed with cumulative byte counts.
struct DownloadMeter {
    total: u64,
    received: u64,
    window_start: Instant,
    window_bytes: u64,
    speed: Option<f64>,
}

impl DownloadMeter {
    fn new(total: u64) -> Self {
        DownloadMeter {
            total,
            received: 0,
            window_start: Instant::now(),
            window_bytes: 0,
            speed: None,
        }
    }

    /// Account `chunk` bytes; returns `(percent, speed, eta)` when the
    /// observation is worth reporting.
    fn record(&mut self, chunk: u64) -> Option<(u8, Option<f64>, Option<u64>)> {
        self.received += chunk;
        self.window_bytes += chunk;

        let elapsed = self.window_start.elapsed();
        if elapsed >= SPEED_WINDOW {
            self.speed = Some(self.window_bytes as f64 / elapsed.as_secs_f64());
            self.window_start = Instant::now();
            self.window_bytes = 0;
        }

        if self.total == 0 {
            return None;
        }

        let percent = ((self.received * 100) / self.total).min(100) as u8;
        let eta = self.speed.filter(|s| *s > 0.0).map(|s| {
            let remaining = self.total.saturating_sub(self.received);
            (remaining as f64 / s).round() as u64
        });
        Some((percent, self.speed, eta))
    }
}

/// Stream `url` to `dest`, reporting `(percent, speed, eta)` as the body
/// arrives.
///
/// Cancellation mid-stream removes the partial file and returns
/// [`DiskswapError::Cancelled`].
pub async fn download<F>(
    url: &str,
    dest: &Path,
    on_progress: F,
    token: &CancellationToken,
) -> DiskswapResult<()>
where
    F: Fn(u8, Option<f64>, Option<u64>) + Send + Sync,
{
    let response = reqwest::get(url)
        .await
        .map_err(|e| DiskswapError::Image(format!("download request failed: {}", e)))?;

    if !response.status().is_success() {
        return Err(DiskswapError::Image(format!(
            "download failed: HTTP {} from {}",
            response.status(),
            url
        )));
    }

    let total = response.content_length().unwrap_or(0);
    let mut meter = DownloadMeter::new(total);
    let mut file = tokio::fs::File::create(dest).await?;
    let mut stream = response.bytes_stream();
    let mut last_percent = 0u8;

    loop {
        let chunk = tokio::select! {
            biased;
            _ = token.cancelled() => {
                drop(file);
                let _ = tokio::fs::remove_file(dest).await;
                tracing::info!(url, "download cancelled, partial file discarded");
                return Err(DiskswapError::Cancelled);
            }
            chunk = stream.next() => chunk,
        };

        let Some(chunk) = chunk else { break };
        let chunk =
            chunk.map_err(|e| DiskswapError::Image(format!("download stream error: {}", e)))?;

        file.write_all(&chunk).await?;

        if let Some((percent, speed, eta)) = meter.record(chunk.len() as u64) {
            // Progress is monotonic within the stage; only report forward motion.
            if percent > last_percent || speed.is_some() {
                last_percent = percent.max(last_percent);
                on_progress(last_percent, speed, eta);
            }
        }
    }

    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meter_reports_percent_from_known_total() {
        let mut meter = DownloadMeter::new(1000);
        let (percent, _, _) = meter.record(250).unwrap();
        assert_eq!(percent, 25);
        let (percent, _, _) = meter.record(750).unwrap();
        assert_eq!(percent, 100);
    }

    #[test]
    fn meter_without_total_reports_nothing() {
        let mut meter = DownloadMeter::new(0);
        assert!(meter.record(4096).is_none());
    }

    #[test]
    fn meter_has_no_speed_before_first_window() {
        let mut meter = DownloadMeter::new(1000);
        let (_, speed, eta) = meter.record(100).unwrap();
        assert!(speed.is_none());
        assert!(eta.is_none());
    }
}
