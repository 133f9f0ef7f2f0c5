//! The single-job store: holds the one active job, persists it across
//! restarts, and broadcasts every mutation to progress observers.
//!
//! All mutations funnel through the store's own update functions; that
//! discipline is what keeps persistence and broadcast consistent without
//! a separate lock, since only one job is ever active.

use std::path::PathBuf;

use diskswap_shared::types::{
    Device, Job, JobStatus, ProgressEvent, Stage, StageLink, StageName, StageStatus,
};
use diskswap_shared::{DiskswapError, DiskswapResult};
use parking_lot::Mutex;
use tokio::sync::broadcast;

/// Capacity of the event channel. Observers that fall this far behind
/// lose events rather than back-pressuring the pipeline.
const EVENT_BUFFER: usize = 256;

pub struct JobStore {
    state_path: PathBuf,
    job: Mutex<Option<Job>>,
    events: broadcast::Sender<ProgressEvent>,
}

impl JobStore {
    /// Open the store, rehydrating any persisted job from a previous
    /// process.
    ///
    /// A stage frozen `in_progress` that cannot have survived the
    /// restart (the interactive sandbox session) is coerced to
    /// `completed` so observers never see a dead interactive session;
    /// if that coercion leaves every stage complete, the job itself
    /// completes.
    pub fn open(state_path: PathBuf) -> DiskswapResult<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let job = match std::fs::read(&state_path) {
            Ok(raw) => match serde_json::from_slice::<Job>(&raw) {
                Ok(mut job) => {
                    rehydrate(&mut job);
                    tracing::info!(job_id = %job.id, status = ?job.status, "rehydrated persisted job");
                    Some(job)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "persisted job unreadable, discarding");
                    let _ = std::fs::remove_file(&state_path);
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(DiskswapError::Io(e)),
        };

        let store = JobStore {
            state_path,
            job: Mutex::new(job),
            events,
        };
        store.persist();
        Ok(store)
    }

    /// Create a new job for `device`. Fails fast while another job is
    /// `in_progress`; a terminal job is replaced.
    pub fn create_job(&self, device: Device, with_sandbox: bool) -> DiskswapResult<Job> {
        let mut guard = self.job.lock();
        if matches!(&*guard, Some(job) if job.status == JobStatus::InProgress) {
            return Err(DiskswapError::JobLocked);
        }

        let mut stages = vec![
            Stage::pending(StageName::Backup),
            Stage::pending(StageName::Download),
            Stage::pending(StageName::Flash),
            Stage::pending(StageName::Inject),
        ];
        if with_sandbox {
            stages.push(Stage::pending(StageName::Sandbox));
        }

        let job = Job {
            id: uuid::Uuid::new_v4().simple().to_string()[..8].to_string(),
            status: JobStatus::InProgress,
            device,
            stages,
            error: None,
            backup_name: None,
            created_at: chrono::Utc::now(),
        };
        tracing::info!(job_id = %job.id, device = %job.device.path, "job created");

        *guard = Some(job.clone());
        drop(guard);
        self.persist();
        Ok(job)
    }

    /// Update one stage in place, persist, and broadcast.
    pub fn update_stage(
        &self,
        name: StageName,
        status: StageStatus,
        progress: u8,
        description: Option<&str>,
        speed: Option<f64>,
        eta: Option<u64>,
    ) {
        let mut guard = self.job.lock();
        let Some(job) = guard.as_mut() else { return };
        let Some(stage) = job.stage_mut(name) else { return };

        stage.status = status;
        stage.progress = progress;
        stage.description = description.map(|d| d.to_string());
        stage.speed = speed;
        stage.eta = eta;
        drop(guard);

        self.persist();
        let _ = self.events.send(ProgressEvent::StageUpdate {
            stage: name,
            status,
            progress,
            description: description.map(|d| d.to_string()),
            speed,
            eta,
        });
    }

    /// Attach an external reference link to a stage.
    pub fn set_stage_link(&self, name: StageName, link: StageLink) {
        let mut guard = self.job.lock();
        if let Some(stage) = guard.as_mut().and_then(|job| job.stage_mut(name)) {
            stage.link = Some(link);
        }
        drop(guard);
        self.persist();
    }

    /// Record the display name of the backup the job used.
    pub fn set_backup_name(&self, name: &str) {
        let mut guard = self.job.lock();
        if let Some(job) = guard.as_mut() {
            job.backup_name = Some(name.to_string());
        }
        drop(guard);
        self.persist();
    }

    /// Mark the job completed and broadcast the terminal event.
    pub fn complete_job(&self) {
        let mut guard = self.job.lock();
        let Some(job) = guard.as_mut() else { return };
        job.status = JobStatus::Completed;
        let backup_name = job.backup_name.clone();
        drop(guard);

        self.persist();
        let _ = self.events.send(ProgressEvent::Done { backup_name });
    }

    /// Mark `stage` and the job failed and broadcast the terminal event.
    pub fn fail_job(&self, stage: StageName, message: &str) {
        let mut guard = self.job.lock();
        let Some(job) = guard.as_mut() else { return };
        job.status = JobStatus::Failed;
        job.error = Some(message.to_string());
        if let Some(failed_stage) = job.stage_mut(stage) {
            failed_stage.status = StageStatus::Failed;
        }
        drop(guard);

        self.persist();
        let _ = self.events.send(ProgressEvent::Error {
            stage,
            message: message.to_string(),
        });
    }

    /// Remove the job (cancellation) and broadcast `Cancelled` so every
    /// observer sees it as the job's last event.
    pub fn clear_job(&self) {
        let had_job = self.job.lock().take().is_some();
        self.remove_state();
        if had_job {
            let _ = self.events.send(ProgressEvent::Cancelled);
        }
    }

    /// Remove the job silently. Used when the user acknowledges a
    /// terminal state without wanting reconnecting observers to replay
    /// it.
    pub fn dismiss_job(&self) {
        self.job.lock().take();
        self.remove_state();
    }

    pub fn current_job(&self) -> Option<Job> {
        self.job.lock().clone()
    }

    /// Subscribe to progress events.
    ///
    /// Snapshot and receiver are taken under the same lock, so a new
    /// observer first sees the full current state and then every later
    /// update, with nothing missed in between.
    pub fn subscribe(&self) -> (Option<Job>, broadcast::Receiver<ProgressEvent>) {
        let guard = self.job.lock();
        let snapshot = guard.clone();
        let receiver = self.events.subscribe();
        (snapshot, receiver)
    }

    /// Persist the current job atomically (write-then-rename). Best
    /// effort: a persistence failure is logged, never propagated into
    /// the pipeline.
    fn persist(&self) {
        let serialized = {
            let guard = self.job.lock();
            match &*guard {
                Some(job) => serde_json::to_vec_pretty(job),
                None => return,
            }
        };
        let result = serialized.map_err(std::io::Error::other).and_then(|bytes| {
            let tmp = self.state_path.with_extension("tmp");
            std::fs::write(&tmp, bytes)?;
            std::fs::rename(&tmp, &self.state_path)
        });
        if let Err(e) = result {
            tracing::error!(path = %self.state_path.display(), error = %e, "job persistence failed");
        }
    }

    fn remove_state(&self) {
        if let Err(e) = std::fs::remove_file(&self.state_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.state_path.display(), error = %e, "cannot remove job state");
            }
        }
    }
}

/// Restart coercion for a rehydrated job.
fn rehydrate(job: &mut Job) {
    if let Some(stage) = job.stage_mut(StageName::Sandbox) {
        if stage.status == StageStatus::InProgress {
            stage.status = StageStatus::Completed;
            stage.progress = 100;
            stage.description = None;
            stage.speed = None;
            stage.eta = None;
        }
    }
    if job.status == JobStatus::InProgress
        && job
            .stages
            .iter()
            .all(|s| s.status == StageStatus::Completed)
    {
        job.status = JobStatus::Completed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device {
            name: "sda".into(),
            path: "/dev/sda".into(),
            size: 32 * 1024 * 1024 * 1024,
            size_human: "32 GB".into(),
            vendor: "Generic".into(),
            model: "Flash Disk".into(),
            tran: "usb".into(),
            serial: "0401".into(),
            has_bootable_os: false,
        }
    }

    fn open_store(dir: &tempfile::TempDir) -> JobStore {
        JobStore::open(dir.path().join("job.json")).unwrap()
    }

    #[test]
    fn second_job_is_rejected_while_one_runs() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let first = store.create_job(device(), false).unwrap();
        let err = store.create_job(device(), false).unwrap_err();
        assert!(matches!(err, DiskswapError::JobLocked));
        // The existing job is untouched.
        assert_eq!(store.current_job().unwrap().id, first.id);
    }

    #[test]
    fn terminal_job_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let first = store.create_job(device(), false).unwrap();
        store.fail_job(StageName::Flash, "boom");
        let second = store.create_job(device(), false).unwrap();
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn sandbox_stage_is_optional() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let without = store.create_job(device(), false).unwrap();
        assert!(without.stage(StageName::Sandbox).is_none());
        store.dismiss_job();

        let with = store.create_job(device(), true).unwrap();
        assert!(with.stage(StageName::Sandbox).is_some());
        assert_eq!(with.stages.len(), 5);
    }

    #[test]
    fn update_persists_and_broadcasts() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        store.create_job(device(), false).unwrap();

        let (_, mut rx) = store.subscribe();
        store.update_stage(
            StageName::Backup,
            StageStatus::InProgress,
            30,
            Some("Creating backup…"),
            None,
            None,
        );

        match rx.try_recv().unwrap() {
            ProgressEvent::StageUpdate { stage, status, progress, .. } => {
                assert_eq!(stage, StageName::Backup);
                assert_eq!(status, StageStatus::InProgress);
                assert_eq!(progress, 30);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let raw = std::fs::read_to_string(dir.path().join("job.json")).unwrap();
        let persisted: Job = serde_json::from_str(&raw).unwrap();
        assert_eq!(persisted.stage(StageName::Backup).unwrap().progress, 30);
    }

    #[test]
    fn clear_broadcasts_cancelled_and_drops_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        store.create_job(device(), false).unwrap();

        let (_, mut rx) = store.subscribe();
        store.clear_job();

        assert!(matches!(rx.try_recv().unwrap(), ProgressEvent::Cancelled));
        assert!(store.current_job().is_none());
        assert!(!dir.path().join("job.json").exists());
    }

    #[test]
    fn dismiss_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        store.create_job(device(), false).unwrap();
        store.complete_job();

        let (_, mut rx) = store.subscribe();
        store.dismiss_job();

        assert!(rx.try_recv().is_err());
        assert!(store.current_job().is_none());
        assert!(!dir.path().join("job.json").exists());
    }

    #[test]
    fn subscribe_snapshot_precedes_live_events() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        store.create_job(device(), false).unwrap();
        store.update_stage(StageName::Backup, StageStatus::InProgress, 10, None, None, None);

        let (snapshot, mut rx) = store.subscribe();
        // The pre-subscription update is in the snapshot, not the channel.
        assert_eq!(
            snapshot.unwrap().stage(StageName::Backup).unwrap().progress,
            10
        );
        assert!(rx.try_recv().is_err());

        store.update_stage(StageName::Backup, StageStatus::InProgress, 20, None, None, None);
        assert!(matches!(
            rx.try_recv().unwrap(),
            ProgressEvent::StageUpdate { progress: 20, .. }
        ));
    }

    #[test]
    fn restart_coerces_interrupted_sandbox_to_completed() {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("job.json");
        {
            let store = JobStore::open(state_path.clone()).unwrap();
            store.create_job(device(), true).unwrap();
            for name in [
                StageName::Backup,
                StageName::Download,
                StageName::Flash,
                StageName::Inject,
            ] {
                store.update_stage(name, StageStatus::Completed, 100, None, None, None);
            }
            store.update_stage(
                StageName::Sandbox,
                StageStatus::InProgress,
                99,
                Some("sandbox_ready"),
                None,
                None,
            );
        }

        // New process over the same state file.
        let store = JobStore::open(state_path).unwrap();
        let job = store.current_job().unwrap();
        let sandbox = job.stage(StageName::Sandbox).unwrap();
        assert_eq!(sandbox.status, StageStatus::Completed);
        assert_eq!(sandbox.progress, 100);
        assert_eq!(sandbox.description, None);
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[test]
    fn restart_with_incomplete_stages_keeps_job_in_progress() {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("job.json");
        {
            let store = JobStore::open(state_path.clone()).unwrap();
            store.create_job(device(), true).unwrap();
            store.update_stage(
                StageName::Sandbox,
                StageStatus::InProgress,
                99,
                None,
                None,
                None,
            );
        }

        let store = JobStore::open(state_path).unwrap();
        let job = store.current_job().unwrap();
        assert_eq!(
            job.stage(StageName::Sandbox).unwrap().status,
            StageStatus::Completed
        );
        // Other stages never ran, so the job stays in progress.
        assert_eq!(job.status, JobStatus::InProgress);
    }
}
