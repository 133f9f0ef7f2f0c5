use clap::{Args, Subcommand};
use diskswap::supervisor::{machine_to_board_slug, SupervisorClient};

#[derive(Args, Debug)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommand,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    /// Show the cache state for this machine's board and OS version
    Show,
    /// Discard the cached image for this machine's board and OS version
    Discard,
}

pub async fn execute(args: CacheArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let supervisor = global.supervisor()?;
    let (info, os) = tokio::try_join!(supervisor.info(), supervisor.os_info())?;
    let board = machine_to_board_slug(&info.machine)?;

    match args.command {
        CacheCommand::Show => {
            let cache = diskswap::images::cache_info(&global.image_dir, board, &os.version).await;
            println!("{}", serde_json::to_string_pretty(&cache)?);
        }
        CacheCommand::Discard => {
            diskswap::images::discard_cached_image(&global.image_dir, board, &os.version).await;
            println!("Discarded cached image for {} {}.", board, os.version);
        }
    }
    Ok(())
}
