//! Platform Supervisor API client.
//!
//! The backup and system-info endpoints the pipeline depends on, behind
//! a trait so the pipeline can be driven against a test double.

mod boards;

pub use boards::machine_to_board_slug;

use std::time::Duration;

use async_trait::async_trait;
use diskswap_shared::constants::{BACKUP_POLL_INTERVAL_SECS, SUPERVISOR_URL};
use diskswap_shared::types::{BackupJobResponse, SupervisorBackup, SupervisorJobStatus};
use diskswap_shared::{DiskswapError, DiskswapResult, SystemInfo};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::util::format_bytes;

/// Supervisor `GET /info` payload (subset used).
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformInfo {
    pub machine: String,
    pub arch: String,
}

/// Supervisor `GET /os/info` payload (subset used).
#[derive(Debug, Clone, Deserialize)]
pub struct OsInfo {
    pub version: String,
    pub version_latest: String,
}

/// Supervisor `GET /host/info` payload. Disk figures are GB floats.
#[derive(Debug, Clone, Deserialize)]
pub struct HostInfo {
    pub disk_free: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkInterface {
    pub interface: String,
    #[serde(default)]
    pub ipv4: Option<Ipv4Config>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ipv4Config {
    #[serde(default)]
    pub address: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkInfo {
    pub interfaces: Vec<NetworkInterface>,
}

/// The Supervisor operations the pipeline calls.
#[async_trait]
pub trait SupervisorClient: Send + Sync {
    async fn create_full_backup(&self) -> DiskswapResult<BackupJobResponse>;
    async fn poll_job(&self, job_id: &str) -> DiskswapResult<SupervisorJobStatus>;
    async fn list_backups(&self) -> DiskswapResult<Vec<SupervisorBackup>>;
    async fn info(&self) -> DiskswapResult<PlatformInfo>;
    async fn os_info(&self) -> DiskswapResult<OsInfo>;
    async fn host_info(&self) -> DiskswapResult<HostInfo>;
    async fn network_info(&self) -> DiskswapResult<NetworkInfo>;
}

/// Poll the Supervisor until the backup job completes, reporting its
/// progress. Returns the backup slug.
pub async fn wait_for_backup(
    client: &dyn SupervisorClient,
    job_id: &str,
    on_progress: &(dyn Fn(u8) + Send + Sync),
    token: &CancellationToken,
) -> DiskswapResult<String> {
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(DiskswapError::Cancelled),
            _ = tokio::time::sleep(Duration::from_secs(BACKUP_POLL_INTERVAL_SECS)) => {}
        }

        let status = client.poll_job(job_id).await?;
        if !status.errors.is_empty() {
            return Err(DiskswapError::Supervisor(format!(
                "backup failed: {}",
                status.errors.join(", ")
            )));
        }

        on_progress(status.progress.round().clamp(0.0, 100.0) as u8);

        if status.done {
            let slug = status.reference.unwrap_or_default();
            if slug.is_empty() {
                return Err(DiskswapError::Supervisor(
                    "backup completed but no slug returned".into(),
                ));
            }
            return Ok(slug);
        }
    }
}

/// Aggregate the read-only system information the UI renders.
pub async fn system_info(client: &dyn SupervisorClient) -> DiskswapResult<SystemInfo> {
    let (info, os, host, network) = tokio::try_join!(
        client.info(),
        client.os_info(),
        client.host_info(),
        client.network_info(),
    )?;

    let free_space_bytes = (host.disk_free * (1u64 << 30) as f64).round() as u64;
    Ok(SystemInfo {
        board_slug: machine_to_board_slug(&info.machine)?.to_string(),
        machine: info.machine,
        os_version: os.version,
        os_version_latest: os.version_latest,
        ip_address: extract_ip_address(&network),
        free_space_human: format_bytes(free_space_bytes),
        free_space_bytes,
    })
}

fn extract_ip_address(network: &NetworkInfo) -> String {
    for iface in &network.interfaces {
        if iface.interface == "lo" {
            continue;
        }
        if let Some(addr) = iface
            .ipv4
            .as_ref()
            .and_then(|v4| v4.address.first())
        {
            // Strip the CIDR suffix ("192.168.1.42/24" -> "192.168.1.42")
            return addr.split('/').next().unwrap_or(addr).to_string();
        }
    }
    "unknown".to_string()
}

/// HTTP client for the real Supervisor, authenticated with the token the
/// platform injects into the add-on environment.
pub struct HttpSupervisorClient {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

/// The `{result, data}` envelope every Supervisor response uses.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    result: String,
    data: Option<T>,
    message: Option<String>,
}

impl HttpSupervisorClient {
    /// Build a client from the environment. Fails when the Supervisor
    /// token is absent, which means we are not running inside the
    /// platform.
    pub fn from_env() -> DiskswapResult<Self> {
        let token = std::env::var("SUPERVISOR_TOKEN").map_err(|_| {
            DiskswapError::Supervisor(
                "SUPERVISOR_TOKEN not set; this service must run inside the platform".into(),
            )
        })?;
        Ok(Self::new(SUPERVISOR_URL.to_string(), token))
    }

    pub fn new(base_url: String, token: String) -> Self {
        HttpSupervisorClient {
            base_url,
            token,
            client: reqwest::Client::new(),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> DiskswapResult<T> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| DiskswapError::Supervisor(format!("GET {} failed: {}", path, e)))?;
        Self::unwrap_envelope(path, response).await
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> DiskswapResult<T> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| DiskswapError::Supervisor(format!("POST {} failed: {}", path, e)))?;
        Self::unwrap_envelope(path, response).await
    }

    async fn unwrap_envelope<T: DeserializeOwned>(
        path: &str,
        response: reqwest::Response,
    ) -> DiskswapResult<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DiskswapError::Supervisor(format!(
                "{} returned {}: {}",
                path, status, body
            )));
        }
        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| DiskswapError::Supervisor(format!("{} body unreadable: {}", path, e)))?;
        if envelope.result != "ok" {
            return Err(DiskswapError::Supervisor(format!(
                "{} result={}: {}",
                path,
                envelope.result,
                envelope.message.unwrap_or_else(|| "unknown error".into())
            )));
        }
        envelope
            .data
            .ok_or_else(|| DiskswapError::Supervisor(format!("{} returned no data", path)))
    }
}

#[async_trait]
impl SupervisorClient for HttpSupervisorClient {
    async fn create_full_backup(&self) -> DiskswapResult<BackupJobResponse> {
        let name = format!("diskswap-clone-{}", chrono::Utc::now().format("%Y-%m-%d"));
        self.post(
            "/backups/new/full",
            serde_json::json!({
                "name": name,
                "background": true,
                "homeassistant_exclude_database": false,
            }),
        )
        .await
    }

    async fn poll_job(&self, job_id: &str) -> DiskswapResult<SupervisorJobStatus> {
        self.get(&format!("/jobs/{}", job_id)).await
    }

    async fn list_backups(&self) -> DiskswapResult<Vec<SupervisorBackup>> {
        #[derive(Deserialize)]
        struct Backups {
            backups: Vec<SupervisorBackup>,
        }
        let data: Backups = self.get("/backups").await?;
        Ok(data.backups)
    }

    async fn info(&self) -> DiskswapResult<PlatformInfo> {
        self.get("/info").await
    }

    async fn os_info(&self) -> DiskswapResult<OsInfo> {
        self.get("/os/info").await
    }

    async fn host_info(&self) -> DiskswapResult<HostInfo> {
        self.get("/host/info").await
    }

    async fn network_info(&self) -> DiskswapResult<NetworkInfo> {
        self.get("/network/info").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_extraction_skips_loopback_and_strips_cidr() {
        let network = NetworkInfo {
            interfaces: vec![
                NetworkInterface {
                    interface: "lo".into(),
                    ipv4: Some(Ipv4Config {
                        address: vec!["127.0.0.1/8".into()],
                    }),
                },
                NetworkInterface {
                    interface: "eth0".into(),
                    ipv4: Some(Ipv4Config {
                        address: vec!["192.168.1.42/24".into()],
                    }),
                },
            ],
        };
        assert_eq!(extract_ip_address(&network), "192.168.1.42");
    }

    #[test]
    fn ip_extraction_without_addresses_is_unknown() {
        let network = NetworkInfo { interfaces: vec![] };
        assert_eq!(extract_ip_address(&network), "unknown");
    }

    #[test]
    fn envelope_parses_supervisor_shape() {
        let raw = r#"{"result":"ok","data":{"job_id":"abc"},"message":null}"#;
        let envelope: Envelope<BackupJobResponse> = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.result, "ok");
        assert_eq!(envelope.data.unwrap().job_id, "abc");
    }
}
