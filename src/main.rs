/*!
 * Tether CLI - configuration checks and delivery log inspection
 *
 * Author: Shane Wall <shaneawall@gmail.com>
 */

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets, Attribute, Cell, Color, ContentArrangement, Table};
use std::path::{Path, PathBuf};
use tether::{logging, DeliveryLog, TetherConfig};

#[derive(Parser)]
#[command(name = "tether")]
#[command(version, about = "Durable named broker connections", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate a configuration file, then list its connections
    CheckConfig {
        /// Path to the TOML configuration
        #[arg(short = 'c', long = "config", value_name = "FILE")]
        config: PathBuf,
    },

    /// Show per-connection delivery log backlog
    Status {
        /// Path to the TOML configuration
        #[arg(short = 'c', long = "config", value_name = "FILE")]
        config: PathBuf,
    },
}

fn header(cells: &[&str]) -> Vec<Cell> {
    cells
        .iter()
        .map(|title| {
            Cell::new(title)
                .fg(Color::Cyan)
                .add_attribute(Attribute::Bold)
        })
        .collect()
}

fn create_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn load_config(path: &Path, verbose: bool) -> Result<TetherConfig> {
    let mut config = TetherConfig::from_file(path)
        .with_context(|| format!("loading configuration from {}", path.display()))?;
    config.logging.verbose |= verbose;
    logging::init_logging(&config.logging).context("initializing logging")?;
    Ok(config)
}

fn check_config(path: &Path, verbose: bool) -> Result<()> {
    let config = load_config(path, verbose)?;

    let mut table = create_table();
    table.set_header(header(&["Connection", "Type", "Enabled", "Settings"]));
    for (name, connection) in &config.connections {
        let enabled = if connection.enabled {
            Cell::new("yes").fg(Color::Green)
        } else {
            Cell::new("no").fg(Color::Yellow)
        };
        let mut keys: Vec<&str> = connection.properties.keys().map(String::as_str).collect();
        keys.sort_unstable();
        table.add_row(vec![
            Cell::new(name),
            Cell::new(connection.kind),
            enabled,
            Cell::new(keys.join(", ")),
        ]);
    }

    println!("{}", table);
    println!(
        "Delivery log: {} ({})",
        if config.delivery_log.enabled {
            "enabled"
        } else {
            "disabled, best-effort delivery"
        },
        config.delivery_log.location.display()
    );
    println!("Configuration OK");
    Ok(())
}

fn status(path: &Path, verbose: bool) -> Result<()> {
    let config = load_config(path, verbose)?;
    if !config.delivery_log.enabled {
        println!("Delivery log disabled; nothing is recorded");
        return Ok(());
    }

    // Read-only: a live process may own this log
    let names = config.enabled_connections().map(|(name, _)| name.as_str());
    let statuses = DeliveryLog::inspect(&config.delivery_log.location, names).with_context(|| {
        format!(
            "reading delivery log at {}",
            config.delivery_log.location.display()
        )
    })?;

    let mut table = create_table();
    table.set_header(header(&["Connection", "Entries", "Pointer", "Backlog", "Log file"]));
    for status in statuses {
        let backlog = if status.backlog() > 0 {
            Cell::new(status.backlog()).fg(Color::Yellow)
        } else {
            Cell::new(0).fg(Color::Green)
        };
        table.add_row(vec![
            Cell::new(&status.connection_name),
            Cell::new(status.entries),
            Cell::new(status.pointer),
            backlog,
            Cell::new(status.log_location.display()),
        ]);
    }

    println!("{}", table);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::CheckConfig { config } => check_config(&config, cli.verbose),
        Commands::Status { config } => status(&config, cli.verbose),
    }
}
