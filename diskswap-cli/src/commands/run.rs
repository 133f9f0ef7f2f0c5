use clap::Args;
use diskswap_shared::constants::SANDBOX_READY_SENTINEL;
use diskswap_shared::types::{CloneOptions, ProgressEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path of the target device, e.g. /dev/sda
    #[arg(long)]
    pub device: String,

    /// Reuse an existing backup by slug instead of creating a new one
    #[arg(long)]
    pub backup_slug: Option<String>,

    /// Skip download and flash (the device already carries a bootable OS)
    #[arg(long)]
    pub skip_flash: bool,

    /// Skip the interactive sandbox stage
    #[arg(long)]
    pub skip_sandbox: bool,
}

pub async fn execute(args: RunArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let pipeline = global.pipeline()?;
    let opts = CloneOptions {
        backup_slug: args.backup_slug,
        skip_flash: args.skip_flash,
        skip_sandbox: args.skip_sandbox,
    };

    // Subscribe before starting so no event is missed.
    let (_, mut events) = pipeline.store().subscribe();
    let job = pipeline.start(&args.device, opts).await?;
    println!("Job {} started on {}. Ctrl-C cancels.", job.id, job.device.path);

    let control = pipeline.sandbox_control();
    let mut sandbox_prompted = false;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Cancelling…");
                pipeline.cancel();
            }
            event = events.recv() => match event {
                Ok(ProgressEvent::StageUpdate { stage, status, progress, description, speed, eta }) => {
                    if description.as_deref() == Some(SANDBOX_READY_SENTINEL) {
                        if !sandbox_prompted {
                            sandbox_prompted = true;
                            let url = control.proxy_url().unwrap_or_default();
                            println!("Sandbox ready at {} — restore your backup there, then press Enter.", url);
                            let control = control.clone();
                            tokio::spawn(async move {
                                let mut line = String::new();
                                let _ = BufReader::new(tokio::io::stdin()).read_line(&mut line).await;
                                control.confirm_done();
                            });
                        }
                        continue;
                    }
                    let mut line = format!("[{stage}] {status:?} {progress}%");
                    if let Some(d) = description {
                        line.push_str(&format!(" — {d}"));
                    }
                    if let Some(s) = speed {
                        line.push_str(&format!(" ({:.1} MB/s)", s / 1024.0 / 1024.0));
                    }
                    if let Some(e) = eta {
                        line.push_str(&format!(" ETA {e}s"));
                    }
                    println!("{line}");
                }
                Ok(ProgressEvent::Done { backup_name }) => {
                    match backup_name {
                        Some(name) => println!("Done. Provisioned with backup \"{}\".", name),
                        None => println!("Done."),
                    }
                    return Ok(());
                }
                Ok(ProgressEvent::Error { stage, message }) => {
                    anyhow::bail!("stage {} failed: {}", stage, message);
                }
                Ok(ProgressEvent::Cancelled) => {
                    println!("Cancelled.");
                    return Ok(());
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "progress observer lagged");
                }
                Err(RecvError::Closed) => {
                    anyhow::bail!("event stream closed unexpectedly");
                }
            }
        }
    }
}
