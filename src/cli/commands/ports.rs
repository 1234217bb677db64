//! Ports command - show the port layout of every task slot

use crate::cli::args::{OutputFormat, PortsArgs};
use crate::config::Config;
use crate::error::WardenResult;
use crate::ports::{PortAllocator, PortBlock};

/// Execute the ports command
pub async fn execute(args: PortsArgs, config: &Config) -> WardenResult<()> {
    let allocator = PortAllocator::from_config(&config.ports)?;
    let blocks: Vec<PortBlock> = (0..allocator.capacity())
        .filter_map(|slot| allocator.block_for_slot(slot))
        .collect();

    match args.format {
        OutputFormat::Table => {
            println!(
                "{:<6} {:<14} {:<14} {:<12} {:<8}",
                "SLOT", "LIVELOG GET", "LIVELOG PUT", "INTERACTIVE", "PROXY"
            );
            println!("{}", "-".repeat(58));
            for (slot, block) in blocks.iter().enumerate() {
                println!(
                    "{:<6} {:<14} {:<14} {:<12} {:<8}",
                    slot, block.live_log_get, block.live_log_put, block.interactive, block.proxy
                );
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&blocks)?),
        OutputFormat::Plain => {
            for block in &blocks {
                let ports: Vec<String> = block.ports().iter().map(u16::to_string).collect();
                println!("{}", ports.join(" "));
            }
        }
    }

    Ok(())
}
