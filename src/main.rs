/*
 * This file is part of Titon Controller.
 *
 * Copyright (C) 2025 Titon Controller contributors
 *
 * Titon Controller is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Titon Controller is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Titon Controller. If not, see <https://www.gnu.org/licenses/>.
 */


use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use titon_controller::config::RuntimeConfig;
use titon_controller::logger::init_tracing;
use titon_controller::service::Service;

#[derive(Parser)]
#[command(name = "titond")]
#[command(version)]
#[command(about = "Titon ventilation unit controller")]
#[command(long_about = "Titon ventilation unit controller

Drives a Titon unit over its 1200 baud serial link and runs the
humidity-driven automatic controller.

ENVIRONMENT VARIABLES:
    TITON_LOG               Log filter (trace, debug, info, warn, error)
    TITON_SERIAL_PORT       Serial device (default /dev/ttyUSB1)
    TITON_SETTINGS_PATH     Settings file
    TITON_LOG_PATH          Event log file (JSON lines)
    TITON_SENSOR_ENTITIES   JSON list of [name, entity_id] humidity sensors")]
#[command(propagate_version = true)]
struct Cli {
    /// Serial device
    #[arg(long, global = true)]
    port: Option<String>,

    /// Settings file
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Event log file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller until interrupted (default)
    Run,
    /// Set the fan level once
    Level {
        #[arg(value_parser = clap::value_parser!(u8).range(1..=4))]
        level: u8,
    },
    /// Turn every speed off
    Off,
    /// Toggle boost (speed 4)
    Boost,
    /// Read sensors and status, print the state as JSON
    Status,
    /// Print the merged settings as JSON
    Settings,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        "debug".to_string()
    } else {
        std::env::var("TITON_LOG").unwrap_or_else(|_| "info".to_string())
    };
    init_tracing(&log_level);

    let config = RuntimeConfig::resolve(cli.port, cli.settings, cli.log_file);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&config),
        Commands::Level { level } => {
            let service = one_shot(&config);
            let applied = service.set_level(level).context("setting level")?;
            println!("Level {} applied", applied);
            Ok(())
        }
        Commands::Off => {
            one_shot(&config).turn_off().context("turning off")?;
            println!("All levels off");
            Ok(())
        }
        Commands::Boost => {
            let on = one_shot(&config).toggle_boost().context("toggling boost")?;
            println!("Boost {}", if on { "ON" } else { "OFF" });
            Ok(())
        }
        Commands::Status => {
            let service = Service::from_config(&config);
            service.refresh_sensors();
            println!("{}", serde_json::to_string_pretty(&service.snapshot())?);
            Ok(())
        }
        Commands::Settings => {
            let service = Service::from_config(&config);
            println!("{}", serde_json::to_string_pretty(&service.settings())?);
            Ok(())
        }
    }
}

fn one_shot(config: &RuntimeConfig) -> Service {
    let service = Service::from_config(config);
    if !service.device().claim_remote_control() {
        warn!("remote control claim failed, sending command anyway");
    }
    service
}

fn run(config: &RuntimeConfig) -> anyhow::Result<()> {
    let service = Arc::new(Service::from_config(config));
    let stop = Arc::new(AtomicBool::new(false));

    let stop_flag = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("received interrupt, shutting down");
        stop_flag.store(true, Ordering::SeqCst);
    }) {
        warn!("failed to set signal handler: {}", e);
    }

    service.start();
    info!(settings = %config.settings_path.display(), log = %config.log_path.display(), "controller running");

    while !stop.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(200));
    }
    service.shutdown();
    Ok(())
}
