use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use diskswap::supervisor::HttpSupervisorClient;
use diskswap::{JobStore, Pipeline, PipelineConfig};

use crate::commands;

#[derive(Parser, Debug)]
#[command(name = "diskswap", version, about = "Provision a USB disk with the OS and a configuration backup")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Args, Debug)]
pub struct GlobalFlags {
    /// Directory where downloaded images are cached
    #[arg(long, global = true, default_value = "/data")]
    pub image_dir: PathBuf,

    /// Directory holding the platform's backup archives
    #[arg(long, global = true, default_value = "/backup")]
    pub backup_dir: PathBuf,

    /// Job state file, persisted across restarts
    #[arg(long, global = true, default_value = "/data/diskswap-job.json")]
    pub state_file: PathBuf,

    /// Supervisor API base URL
    #[arg(long, global = true, default_value = "http://supervisor")]
    pub supervisor_url: String,

    /// Supervisor API token
    #[arg(long, global = true, env = "SUPERVISOR_TOKEN", hide_env_values = true)]
    pub supervisor_token: Option<String>,
}

impl GlobalFlags {
    pub fn supervisor(&self) -> anyhow::Result<Arc<HttpSupervisorClient>> {
        let token = self
            .supervisor_token
            .clone()
            .ok_or_else(|| anyhow::anyhow!("SUPERVISOR_TOKEN is not set"))?;
        Ok(Arc::new(HttpSupervisorClient::new(
            self.supervisor_url.clone(),
            token,
        )))
    }

    pub fn store(&self) -> anyhow::Result<Arc<JobStore>> {
        Ok(Arc::new(JobStore::open(self.state_file.clone())?))
    }

    pub fn pipeline(&self) -> anyhow::Result<Arc<Pipeline>> {
        let config = PipelineConfig {
            image_dir: self.image_dir.clone(),
            backup_dir: self.backup_dir.clone(),
        };
        Ok(Arc::new(Pipeline::new(
            self.store()?,
            self.supervisor()?,
            config,
        )))
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List USB devices that are safe flash targets
    Devices(commands::devices::DevicesArgs),
    /// List backups known to the platform
    Backups(commands::backups::BackupsArgs),
    /// Show aggregated system information
    System(commands::system::SystemArgs),
    /// Inspect or discard the local image cache
    Cache(commands::cache::CacheArgs),
    /// Show the current job, if any
    Status(commands::status::StatusArgs),
    /// Dismiss a finished or failed job
    Dismiss(commands::status::DismissArgs),
    /// Run the provisioning pipeline against a device
    Run(commands::run::RunArgs),
}

impl Cli {
    pub async fn run(self) -> anyhow::Result<()> {
        match self.command {
            Command::Devices(args) => commands::devices::execute(args, &self.global).await,
            Command::Backups(args) => commands::backups::execute(args, &self.global).await,
            Command::System(args) => commands::system::execute(args, &self.global).await,
            Command::Cache(args) => commands::cache::execute(args, &self.global).await,
            Command::Status(args) => commands::status::execute(args, &self.global).await,
            Command::Dismiss(args) => commands::status::dismiss(args, &self.global).await,
            Command::Run(args) => commands::run::execute(args, &self.global).await,
        }
    }
}
