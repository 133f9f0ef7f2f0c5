//! Pipeline behavior against a scripted Supervisor double.
//!
//! These runs use a device path that does not exist, so stages that
//! touch real block devices fail at their first partition reprobe. That
//! is enough to observe the orchestration semantics: short-circuits,
//! failure attribution, the single-job invariant, and cancellation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use diskswap::supervisor::{HostInfo, NetworkInfo, OsInfo, PlatformInfo, SupervisorClient};
use diskswap::{DiskswapError, DiskswapResult, JobStore, Pipeline, PipelineConfig};
use diskswap_shared::types::{
    BackupJobResponse, CloneOptions, Device, JobStatus, ProgressEvent, StageName, StageStatus,
    SupervisorBackup, SupervisorJobStatus,
};

const MISSING_DEVICE: &str = "/dev/diskswap-test-missing";

struct MockSupervisor {
    backups: Vec<SupervisorBackup>,
    /// Whether backup jobs complete on first poll or run forever.
    backup_completes: bool,
    create_calls: AtomicUsize,
}

impl MockSupervisor {
    fn new(backups: Vec<SupervisorBackup>, backup_completes: bool) -> Self {
        MockSupervisor {
            backups,
            backup_completes,
            create_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SupervisorClient for MockSupervisor {
    async fn create_full_backup(&self) -> DiskswapResult<BackupJobResponse> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        Ok(BackupJobResponse {
            job_id: "job-1".into(),
        })
    }

    async fn poll_job(&self, _job_id: &str) -> DiskswapResult<SupervisorJobStatus> {
        if self.backup_completes {
            Ok(SupervisorJobStatus {
                done: true,
                progress: 100.0,
                reference: Some("abc12345".into()),
                errors: vec![],
            })
        } else {
            Ok(SupervisorJobStatus {
                done: false,
                progress: 10.0,
                reference: None,
                errors: vec![],
            })
        }
    }

    async fn list_backups(&self) -> DiskswapResult<Vec<SupervisorBackup>> {
        Ok(self.backups.clone())
    }

    async fn info(&self) -> DiskswapResult<PlatformInfo> {
        Ok(PlatformInfo {
            machine: "qemux86-64".into(),
            arch: "amd64".into(),
        })
    }

    async fn os_info(&self) -> DiskswapResult<OsInfo> {
        Ok(OsInfo {
            version: "17.1".into(),
            version_latest: "17.1".into(),
        })
    }

    async fn host_info(&self) -> DiskswapResult<HostInfo> {
        Ok(HostInfo { disk_free: 12.5 })
    }

    async fn network_info(&self) -> DiskswapResult<NetworkInfo> {
        Ok(NetworkInfo { interfaces: vec![] })
    }
}

fn backup_entry(slug: &str, name: &str) -> SupervisorBackup {
    SupervisorBackup {
        slug: slug.into(),
        name: name.into(),
        date: "2026-08-01T00:00:00Z".into(),
        kind: "full".into(),
        size: 42.0,
    }
}

fn device() -> Device {
    Device {
        name: "diskswap-test-missing".into(),
        path: MISSING_DEVICE.into(),
        size: 32 * 1024 * 1024 * 1024,
        size_human: "32 GB".into(),
        vendor: "Generic".into(),
        model: "Flash Disk".into(),
        tran: "usb".into(),
        serial: "0401".into(),
        has_bootable_os: true,
    }
}

struct Fixture {
    pipeline: Arc<Pipeline>,
    supervisor: Arc<MockSupervisor>,
    _dirs: (tempfile::TempDir, tempfile::TempDir),
}

fn fixture(supervisor: MockSupervisor, backup_files: &[&str]) -> Fixture {
    let image_dir = tempfile::tempdir().unwrap();
    let backup_dir = tempfile::tempdir().unwrap();
    for name in backup_files {
        std::fs::write(backup_dir.path().join(name), b"tar bytes").unwrap();
    }

    let store = Arc::new(JobStore::open(image_dir.path().join("job.json")).unwrap());
    let supervisor = Arc::new(supervisor);
    let config = PipelineConfig {
        image_dir: image_dir.path().to_path_buf(),
        backup_dir: backup_dir.path().to_path_buf(),
    };
    let pipeline = Arc::new(Pipeline::new(
        store,
        Arc::clone(&supervisor) as Arc<dyn SupervisorClient>,
        config,
    ));
    Fixture {
        pipeline,
        supervisor,
        _dirs: (image_dir, backup_dir),
    }
}

/// Wait for the next terminal event, skipping stage updates.
async fn wait_terminal(
    events: &mut tokio::sync::broadcast::Receiver<ProgressEvent>,
) -> ProgressEvent {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match events.recv().await.unwrap() {
                ProgressEvent::StageUpdate { .. } => continue,
                terminal => return terminal,
            }
        }
    })
    .await
    .expect("pipeline did not reach a terminal state")
}

#[tokio::test(flavor = "multi_thread")]
async fn skip_flash_completes_download_and_flash_without_fetching() {
    let fx = fixture(
        MockSupervisor::new(vec![backup_entry("abc12345", "My backup")], false),
        &["abc12345.tar"],
    );
    let (_, mut events) = fx.pipeline.store().subscribe();

    fx.pipeline
        .start_with_device(
            device(),
            CloneOptions {
                backup_slug: Some("abc12345".into()),
                skip_flash: true,
                skip_sandbox: true,
            },
        )
        .unwrap();

    // The run fails at inject (no such device), after the short-circuits.
    match wait_terminal(&mut events).await {
        ProgressEvent::Error { stage, .. } => assert_eq!(stage, StageName::Inject),
        other => panic!("unexpected terminal event: {:?}", other),
    }

    let job = fx.pipeline.store().current_job().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    for name in [StageName::Backup, StageName::Download, StageName::Flash] {
        let stage = job.stage(name).unwrap();
        assert_eq!(stage.status, StageStatus::Completed);
        assert_eq!(stage.progress, 100);
    }
    assert_eq!(
        job.stage(StageName::Inject).unwrap().status,
        StageStatus::Failed
    );
    assert_eq!(job.backup_name.as_deref(), Some("My backup"));
    // No backup was created and nothing was downloaded.
    assert_eq!(fx.supervisor.create_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn fresh_backup_completes_and_records_display_name() {
    let fx = fixture(
        MockSupervisor::new(vec![backup_entry("abc12345", "Nightly")], true),
        &["abc12345.tar"],
    );
    let (_, mut events) = fx.pipeline.store().subscribe();

    fx.pipeline
        .start_with_device(
            device(),
            CloneOptions {
                backup_slug: None,
                skip_flash: true,
                skip_sandbox: true,
            },
        )
        .unwrap();

    wait_terminal(&mut events).await;

    let job = fx.pipeline.store().current_job().unwrap();
    let backup = job.stage(StageName::Backup).unwrap();
    assert_eq!(backup.status, StageStatus::Completed);
    assert_eq!(backup.progress, 100);
    assert_eq!(job.backup_name.as_deref(), Some("Nightly"));
    assert_eq!(fx.supervisor.create_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn second_start_is_rejected_while_a_job_runs() {
    // Backup polls forever, keeping the first job in progress.
    let fx = fixture(MockSupervisor::new(vec![], false), &[]);

    let first = fx
        .pipeline
        .start_with_device(device(), CloneOptions::default())
        .unwrap();
    let err = fx
        .pipeline
        .start_with_device(device(), CloneOptions::default())
        .unwrap_err();
    assert!(matches!(err, DiskswapError::JobLocked));
    assert_eq!(fx.pipeline.store().current_job().unwrap().id, first.id);

    fx.pipeline.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_reaches_a_run_started_after_an_earlier_one_finished() {
    let fx = fixture(
        MockSupervisor::new(vec![backup_entry("abc12345", "My backup")], false),
        &["abc12345.tar"],
    );
    let (_, mut events) = fx.pipeline.store().subscribe();

    // First run fails quickly at inject.
    fx.pipeline
        .start_with_device(
            device(),
            CloneOptions {
                backup_slug: Some("abc12345".into()),
                skip_flash: true,
                skip_sandbox: true,
            },
        )
        .unwrap();
    match wait_terminal(&mut events).await {
        ProgressEvent::Error { .. } => {}
        other => panic!("unexpected terminal event: {:?}", other),
    }

    // Second run sits in backup polling until cancelled; the finished
    // driver must not have clobbered its token.
    fx.pipeline
        .start_with_device(device(), CloneOptions::default())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    fx.pipeline.cancel();

    match wait_terminal(&mut events).await {
        ProgressEvent::Cancelled => {}
        other => panic!("unexpected terminal event: {:?}", other),
    }
    assert!(fx.pipeline.store().current_job().is_none());
    // The cancelled driver stops polling; no events may trickle in.
    let quiet = tokio::time::timeout(Duration::from_secs(3), events.recv()).await;
    assert!(quiet.is_err(), "events arrived after cancellation: {:?}", quiet);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_clears_the_job_and_cancelled_is_the_last_event() {
    let fx = fixture(MockSupervisor::new(vec![], false), &[]);
    let (_, mut events) = fx.pipeline.store().subscribe();

    fx.pipeline
        .start_with_device(device(), CloneOptions::default())
        .unwrap();

    // Let the driver enter the backup polling loop, then cancel.
    tokio::time::sleep(Duration::from_millis(200)).await;
    fx.pipeline.cancel();

    match wait_terminal(&mut events).await {
        ProgressEvent::Cancelled => {}
        other => panic!("unexpected terminal event: {:?}", other),
    }
    assert!(fx.pipeline.store().current_job().is_none());
    // Nothing follows the cancellation event.
    assert!(events.try_recv().is_err());
}
