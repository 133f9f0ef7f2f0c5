use clap::Args;
use comfy_table::{presets::UTF8_FULL, Table};
use diskswap::supervisor::SupervisorClient;

#[derive(Args, Debug)]
pub struct BackupsArgs {
    /// Print raw JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: BackupsArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let supervisor = global.supervisor()?;
    let backups = supervisor.list_backups().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&backups)?);
        return Ok(());
    }

    if backups.is_empty() {
        println!("No backups found.");
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(["SLUG", "NAME", "DATE", "TYPE", "SIZE (MB)"]);
    for backup in backups {
        table.add_row([
            backup.slug,
            backup.name,
            backup.date,
            backup.kind,
            format!("{:.1}", backup.size),
        ]);
    }
    println!("{table}");
    Ok(())
}
