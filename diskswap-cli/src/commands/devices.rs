use clap::Args;
use comfy_table::{presets::UTF8_FULL, Table};

#[derive(Args, Debug)]
pub struct DevicesArgs {
    /// Print raw JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: DevicesArgs, _global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let devices = diskswap::devices::list_usb_devices().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No safe USB targets found.");
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(["PATH", "SIZE", "VENDOR", "MODEL", "SERIAL", "BOOTABLE OS"]);
    for device in devices {
        table.add_row([
            device.path,
            device.size_human,
            device.vendor,
            device.model,
            device.serial,
            if device.has_bootable_os { "yes" } else { "no" }.to_string(),
        ]);
    }
    println!("{table}");
    Ok(())
}
