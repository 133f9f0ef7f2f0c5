use clap::Args;

#[derive(Args, Debug)]
pub struct SystemArgs {
    /// Print raw JSON instead of key/value lines
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: SystemArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let supervisor = global.supervisor()?;
    let info = diskswap::supervisor::system_info(supervisor.as_ref()).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("machine:            {}", info.machine);
    println!("board slug:         {}", info.board_slug);
    println!("OS version:         {}", info.os_version);
    println!("OS version latest:  {}", info.os_version_latest);
    println!("IP address:         {}", info.ip_address);
    println!("free space:         {}", info.free_space_human);
    Ok(())
}
