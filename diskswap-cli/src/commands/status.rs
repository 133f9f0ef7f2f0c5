use clap::Args;
use comfy_table::{presets::UTF8_FULL, Table};
use diskswap_shared::types::Job;

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Print raw JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct DismissArgs {}

pub async fn execute(args: StatusArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let store = global.store()?;
    let Some(job) = store.current_job() else {
        println!("No job.");
        return Ok(());
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&job)?);
        return Ok(());
    }

    print_job(&job);
    Ok(())
}

pub async fn dismiss(_args: DismissArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let store = global.store()?;
    match store.current_job() {
        Some(job) => {
            store.dismiss_job();
            println!("Dismissed job {}.", job.id);
        }
        None => println!("No job to dismiss."),
    }
    Ok(())
}

fn print_job(job: &Job) {
    println!(
        "Job {} on {} — {:?}, created {}",
        job.id,
        job.device.path,
        job.status,
        job.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(name) = &job.backup_name {
        println!("Backup: {}", name);
    }
    if let Some(error) = &job.error {
        println!("Error: {}", error);
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(["STAGE", "STATUS", "PROGRESS", "DESCRIPTION"]);
    for stage in &job.stages {
        table.add_row([
            stage.name.to_string(),
            format!("{:?}", stage.status),
            format!("{}%", stage.progress),
            stage.description.clone().unwrap_or_default(),
        ]);
    }
    println!("{table}");
}
