//! Show command - displays the contract, configuration or kernel command line.

use anyhow::Result;
use serde_json::json;

use crate::config::Config;
use crate::contract::{contract, BootMode};
use crate::qemu;

use super::print_json;

/// Show target for the show command.
pub enum ShowTarget {
    /// The integration contract
    Contract,
    /// Effective configuration
    Config,
    /// Kernel command line; `None` shows every mode
    Cmdline { mode: Option<BootMode> },
}

/// Execute the show command.
pub fn cmd_show(target: ShowTarget, config: &Config) -> Result<()> {
    match target {
        ShowTarget::Contract => show_contract(config),
        ShowTarget::Config => {
            config.print();
            Ok(())
        }
        ShowTarget::Cmdline { mode } => {
            let modes = match mode {
                Some(m) => vec![m],
                None => vec![BootMode::Debug, BootMode::Production],
            };
            let mut lines = Vec::new();
            for mode in modes {
                lines.push((mode, qemu::boot_cmdline(mode, &[])?));
            }
            if config.json {
                let map: serde_json::Map<String, serde_json::Value> = lines
                    .into_iter()
                    .map(|(mode, line)| (mode.to_string(), json!(line)))
                    .collect();
                print_json(&map)?;
            } else {
                for (mode, line) in lines {
                    println!("{:<10} {}", format!("{}:", mode), line);
                }
            }
            Ok(())
        }
    }
}

fn show_contract(config: &Config) -> Result<()> {
    let c = contract();
    if config.json {
        return print_json(c);
    }

    println!("=== rock-init Integration Contract v{} ===\n", c.version);

    println!("Binaries:");
    for b in c.binaries {
        if b.is_renamed() {
            println!("  {:<24} {:o}  (from {})", b.destination, b.permissions, b.source);
        } else {
            println!("  {:<24} {:o}", b.destination, b.permissions);
        }
    }

    println!("\nDirectories:");
    for d in c.directories {
        println!(
            "  {:<24} {}",
            d.path,
            if d.critical { "critical" } else { "optional" }
        );
    }

    println!("\nDevice nodes:");
    for n in c.device_nodes {
        println!("  {:<24} {:o}  {}:{}", n.path, n.mode, n.major, n.minor);
    }

    println!("\nBusybox commands:");
    println!("  {}", c.busybox_commands.join(" "));

    println!("\nKernel parameters:");
    println!("  required:   {}", c.kernel.mandatory_init_token);
    println!("  forbidden:  {}", c.kernel.forbidden_alternate_token);
    println!("  flags:      {}", c.kernel.required_flags.join(" "));
    println!("  debug:      {}", c.kernel.debug_flags.join(" "));
    println!("  production: {}", c.kernel.production_flags.join(" "));
    Ok(())
}
