//! Pipeline orchestrator: sequences the provisioning stages for one job.
//!
//! Pre-flight runs before a job exists; everything after is a background
//! task whose outcome is observed only through the job store. One
//! cancellation token is threaded through every stage and every child
//! process those stages spawn.

mod context;
mod preflight;

pub use preflight::{ensure_free_space, free_space_bytes};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use diskswap_shared::constants::{DEFAULT_BACKUP_DIR, DEFAULT_IMAGE_DIR, MIN_DOWNLOAD_SPACE_BYTES};
use diskswap_shared::types::{CloneOptions, Device, Job, StageLink, StageName, StageStatus};
use diskswap_shared::{DiskswapError, DiskswapResult};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::devices;
use crate::flasher;
use crate::images;
use crate::injector;
use crate::jobs::JobStore;
use crate::sandbox::{self, SandboxControl};
use crate::supervisor::{self, machine_to_board_slug, SupervisorClient};
use context::RunContext;

/// Filesystem roots the pipeline works against.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Where downloaded images are cached.
    pub image_dir: PathBuf,
    /// Where the platform stores backup archives.
    pub backup_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            image_dir: PathBuf::from(DEFAULT_IMAGE_DIR),
            backup_dir: PathBuf::from(DEFAULT_BACKUP_DIR),
        }
    }
}

/// The run currently in flight. The id ties the slot to one driver task
/// so a finished run cannot clear a successor's token.
struct ActiveRun {
    id: u64,
    token: CancellationToken,
}

pub struct Pipeline {
    store: Arc<JobStore>,
    supervisor: Arc<dyn SupervisorClient>,
    sandbox: SandboxControl,
    config: PipelineConfig,
    active: Mutex<Option<ActiveRun>>,
    run_counter: AtomicU64,
}

impl Pipeline {
    pub fn new(
        store: Arc<JobStore>,
        supervisor: Arc<dyn SupervisorClient>,
        config: PipelineConfig,
    ) -> Self {
        Pipeline {
            store,
            supervisor,
            sandbox: SandboxControl::new(),
            config,
            active: Mutex::new(None),
            run_counter: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Handle through which the transport layer reads the sandbox proxy
    /// target and signals "user is done".
    pub fn sandbox_control(&self) -> SandboxControl {
        self.sandbox.clone()
    }

    /// Validate and start a provisioning run against `device_path`.
    ///
    /// Pre-flight (free space, device presence) happens here, before any
    /// job state is created. The returned job is a snapshot; progress is
    /// observed through the job store.
    pub async fn start(
        self: &Arc<Self>,
        device_path: &str,
        opts: CloneOptions,
    ) -> DiskswapResult<Job> {
        if !opts.skip_flash {
            ensure_free_space(&self.config.image_dir, MIN_DOWNLOAD_SPACE_BYTES)?;
        }
        let device = devices::find_device(device_path).await?;
        self.start_with_device(device, opts)
    }

    /// Start a run for an already-validated device.
    pub fn start_with_device(
        self: &Arc<Self>,
        device: Device,
        opts: CloneOptions,
    ) -> DiskswapResult<Job> {
        let job = self.store.create_job(device.clone(), !opts.skip_sandbox)?;

        let token = CancellationToken::new();
        let run_id = self.run_counter.fetch_add(1, Ordering::Relaxed);
        *self.active.lock() = Some(ActiveRun {
            id: run_id,
            token: token.clone(),
        });

        let pipeline = Arc::clone(self);
        let ctx = RunContext::new(device, opts);
        tokio::spawn(async move {
            pipeline.drive(ctx, token, run_id).await;
        });

        Ok(job)
    }

    /// Cancel the run in flight. The driver observes the token, tears
    /// down, and clears the job; with no run in flight the job (if any)
    /// is cleared directly.
    pub fn cancel(&self) {
        let run = self.active.lock().take();
        match run {
            Some(run) => {
                tracing::info!("cancelling active pipeline run");
                run.token.cancel();
            }
            None => self.store.clear_job(),
        }
    }

    /// Run the stages and join the outcome back into the job store.
    async fn drive(&self, mut ctx: RunContext, token: CancellationToken, run_id: u64) {
        let result = self.run_stages(&mut ctx, &token).await;
        match result {
            Ok(()) => {
                self.store.complete_job();
                tracing::info!("pipeline completed");
            }
            Err(e) if e.is_cancelled() => {
                self.store.clear_job();
                tracing::info!("pipeline cancelled");
            }
            Err(e) => {
                let stage = self
                    .store
                    .current_job()
                    .and_then(|job| job.active_stage())
                    .unwrap_or(StageName::Backup);
                tracing::error!(stage = %stage, error = %e, "pipeline failed");
                self.store.fail_job(stage, &e.to_string());
            }
        }

        // A successor run may have taken the slot already; clear only
        // this run's own entry.
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|run| run.id == run_id) {
            *active = None;
        }
    }

    async fn run_stages(
        &self,
        ctx: &mut RunContext,
        token: &CancellationToken,
    ) -> DiskswapResult<()> {
        self.run_backup_stage(ctx, token).await?;
        check_cancelled(token)?;

        if ctx.opts.skip_flash {
            // The device already carries a bootable OS.
            tracing::info!("skipping download and flash");
            self.update(StageName::Download, StageStatus::Completed, 100, None);
            self.update(StageName::Flash, StageStatus::Completed, 100, None);
        } else {
            self.run_download_stage(ctx, token).await?;
            check_cancelled(token)?;
            self.run_flash_stage(ctx, token).await?;
        }
        check_cancelled(token)?;

        self.run_inject_stage(ctx, token).await?;
        check_cancelled(token)?;

        if !ctx.opts.skip_sandbox {
            self.run_sandbox_stage(ctx, token).await?;
        }
        Ok(())
    }

    async fn run_backup_stage(
        &self,
        ctx: &mut RunContext,
        token: &CancellationToken,
    ) -> DiskswapResult<()> {
        if let Some(slug) = ctx.opts.backup_slug.clone() {
            // Reusing an existing backup; resolve its display name and
            // short-circuit the stage.
            let backups = self.supervisor.list_backups().await?;
            let existing = backups.into_iter().find(|b| b.slug == slug).ok_or_else(|| {
                DiskswapError::Supervisor(format!("backup {} no longer exists", slug))
            })?;
            tracing::info!(slug, name = %existing.name, "using existing backup");
            self.store.set_backup_name(&existing.name);
            ctx.backup_slug = Some(slug);
            self.update(StageName::Backup, StageStatus::Completed, 100, None);
            return Ok(());
        }

        self.update(
            StageName::Backup,
            StageStatus::InProgress,
            0,
            Some("Creating backup…"),
        );
        let backup_job = self.supervisor.create_full_backup().await?;
        tracing::info!(job_id = %backup_job.job_id, "backup job created");

        let store = &self.store;
        let slug = supervisor::wait_for_backup(
            self.supervisor.as_ref(),
            &backup_job.job_id,
            &|percent| {
                store.update_stage(
                    StageName::Backup,
                    StageStatus::InProgress,
                    percent.min(99),
                    None,
                    None,
                    None,
                );
            },
            token,
        )
        .await?;

        let archive = self.config.backup_dir.join(format!("{}.tar", slug));
        if tokio::fs::metadata(&archive).await.is_err() {
            return Err(DiskswapError::Supervisor(format!(
                "backup archive {} not found after completion",
                archive.display()
            )));
        }

        if let Ok(backups) = self.supervisor.list_backups().await {
            if let Some(created) = backups.iter().find(|b| b.slug == slug) {
                self.store.set_backup_name(&created.name);
            }
        }

        ctx.backup_slug = Some(slug);
        self.update(StageName::Backup, StageStatus::Completed, 100, None);
        Ok(())
    }

    async fn run_download_stage(
        &self,
        ctx: &mut RunContext,
        token: &CancellationToken,
    ) -> DiskswapResult<()> {
        self.update(
            StageName::Download,
            StageStatus::InProgress,
            0,
            Some("Preparing download…"),
        );

        let (info, os) = tokio::try_join!(self.supervisor.info(), self.supervisor.os_info())?;
        let board = machine_to_board_slug(&info.machine)?;
        ctx.machine = Some(info.machine);
        ctx.board_slug = Some(board.to_string());
        ctx.os_version = Some(os.version.clone());

        let url = images::download_url(board, &os.version);
        let checksum_url = images::checksum_url(&url);
        let path = images::image_path(&self.config.image_dir, board, &os.version);
        ctx.image_path = Some(path.clone());

        self.store.set_stage_link(
            StageName::Download,
            StageLink {
                text: format!("OS {} release notes", os.version),
                url: images::release_page_url(&os.version),
            },
        );

        if images::is_cache_valid(&path, &checksum_url).await {
            tracing::info!(path = %path.display(), "using cached image");
            self.update(
                StageName::Download,
                StageStatus::Completed,
                100,
                Some("Using cached image"),
            );
            return Ok(());
        }

        let store = &self.store;
        let result = async {
            images::download(
                &url,
                &path,
                |percent, speed, eta| {
                    store.update_stage(
                        StageName::Download,
                        StageStatus::InProgress,
                        percent,
                        None,
                        speed,
                        eta,
                    );
                },
                token,
            )
            .await?;

            if !images::verify_checksum(&path, &checksum_url).await? {
                tracing::warn!("no published checksum, accepting download unverified");
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            if !matches!(e, DiskswapError::Cancelled) {
                images::cleanup(&path).await;
            }
            return Err(e);
        }

        self.update(StageName::Download, StageStatus::Completed, 100, None);
        Ok(())
    }

    async fn run_flash_stage(
        &self,
        ctx: &mut RunContext,
        token: &CancellationToken,
    ) -> DiskswapResult<()> {
        self.update(
            StageName::Flash,
            StageStatus::InProgress,
            0,
            Some("Flashing image…"),
        );

        let image = ctx.image_path()?.to_path_buf();
        let device = Path::new(&ctx.device.path);

        let store = &self.store;
        flasher::flash(
            &image,
            device,
            |percent, speed, eta| {
                store.update_stage(
                    StageName::Flash,
                    StageStatus::InProgress,
                    percent,
                    None,
                    speed,
                    eta,
                );
            },
            token,
        )
        .await?;

        flasher::reprobe_partitions(device).await?;
        self.update(StageName::Flash, StageStatus::Completed, 100, None);

        // Free the cache once the image is on the disk.
        images::cleanup(&image).await;
        Ok(())
    }

    async fn run_inject_stage(
        &self,
        ctx: &mut RunContext,
        token: &CancellationToken,
    ) -> DiskswapResult<()> {
        self.update(
            StageName::Inject,
            StageStatus::InProgress,
            0,
            Some("Preparing backup injection…"),
        );

        let device = PathBuf::from(&ctx.device.path);
        let slug = ctx.backup_slug()?.to_string();
        let store = &self.store;
        injector::inject(
            &device,
            &self.config.backup_dir,
            &slug,
            &|percent, description, speed, eta| {
                store.update_stage(
                    StageName::Inject,
                    StageStatus::InProgress,
                    percent,
                    description,
                    speed,
                    eta,
                );
            },
            token,
        )
        .await?;

        self.update(StageName::Inject, StageStatus::Completed, 100, None);
        Ok(())
    }

    async fn run_sandbox_stage(
        &self,
        ctx: &mut RunContext,
        token: &CancellationToken,
    ) -> DiskswapResult<()> {
        self.update(
            StageName::Sandbox,
            StageStatus::InProgress,
            0,
            Some("Preparing sandbox…"),
        );

        // Machine identifier is already known when the download stage
        // ran; fetch it here when flashing was skipped.
        let machine = match &ctx.machine {
            Some(machine) => machine.clone(),
            None => self.supervisor.info().await?.machine,
        };

        let device = PathBuf::from(&ctx.device.path);
        let store = &self.store;
        sandbox::run(
            &device,
            &machine,
            &self.sandbox,
            &|percent, description| {
                store.update_stage(
                    StageName::Sandbox,
                    StageStatus::InProgress,
                    percent,
                    description,
                    None,
                    None,
                );
            },
            token,
        )
        .await?;

        self.update(StageName::Sandbox, StageStatus::Completed, 100, None);
        Ok(())
    }

    fn update(&self, name: StageName, status: StageStatus, progress: u8, description: Option<&str>) {
        self.store
            .update_stage(name, status, progress, description, None, None);
    }
}

fn check_cancelled(token: &CancellationToken) -> DiskswapResult<()> {
    if token.is_cancelled() {
        return Err(DiskswapError::Cancelled);
    }
    Ok(())
}
