//! CLI entry point for scope-daq
//!
//! Builds the devices named in the configuration file and runs one command
//! against them.
//!
//! # Usage
//!
//! ```bash
//! scope-daq ports
//! scope-daq detect /dev/ttyUSB0 --family asi
//! scope-daq list
//! scope-daq get laser "Operating Status"
//! scope-daq set laser Wavelength 561
//! scope-daq move stage 1000 -250
//! scope-daq focus crisp
//! scope-daq fire led 50
//! ```

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use daq_core::detect::DetectionStatus;
use daq_core::device::PropertyAction;
use scope_daq::config::{AppConfig, DEFAULT_CONFIG_PATH};
use scope_daq::logging;
use scope_daq::registry::DeviceRegistry;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "scope-daq")]
#[command(about = "Serial adapters for ASI stages, autofocus units and Cobolt/Skyra lasers", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports present on this machine
    Ports,

    /// Probe a port for a controller family
    Detect {
        /// Serial port path
        port: String,
        #[arg(long, value_enum, default_value_t = Family::Asi)]
        family: Family,
    },

    /// Build the configured devices and list their capabilities
    List,

    /// Read a device property
    Get { device: String, property: String },

    /// Write a device property and print the value read back
    Set {
        device: String,
        property: String,
        value: String,
    },

    /// Move an XY stage to (x, y) or a Z stage to x, in micrometres
    Move {
        device: String,
        #[arg(allow_negative_numbers = true)]
        x: f64,
        #[arg(allow_negative_numbers = true)]
        y: Option<f64>,
    },

    /// Run a full focus and print the focus score
    Focus { device: String },

    /// Open a shutter for the given number of milliseconds
    Fire { device: String, ms: u64 },
}

#[derive(Clone, Copy, ValueEnum)]
enum Family {
    /// ASI MS-2000 / LX-4000 controllers
    Asi,
    /// Cobolt single lasers and Skyra units
    Skyra,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config)?;
    logging::init_from_config(&config)?;
    daq_driver_asi::link();
    daq_driver_skyra::link();

    match cli.command {
        Commands::Ports => list_ports(),
        Commands::Detect { port, family } => detect(&config, &port, family).await,
        command => {
            let registry = DeviceRegistry::with_default_factories();
            let known = registry.list_factories();
            let known: Vec<&str> = known.iter().map(String::as_str).collect();
            config.validate(&known)?;

            let result = run_device_command(&registry, &config, command).await;
            registry.shutdown_all().await;
            result
        }
    }
}

fn list_ports() -> Result<()> {
    let ports = serialport::available_ports().context("Failed to enumerate serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        match port.port_type {
            serialport::SerialPortType::UsbPort(usb) => println!(
                "{}  USB {:04x}:{:04x} {}",
                port.port_name,
                usb.vid,
                usb.pid,
                usb.product.unwrap_or_default()
            ),
            _ => println!("{}", port.port_name),
        }
    }
    Ok(())
}

async fn detect(config: &AppConfig, port: &str, family: Family) -> Result<()> {
    let (baud_rate, name) = match family {
        Family::Asi => (daq_driver_asi::ASI_DEFAULT_BAUD, "ASI"),
        Family::Skyra => (daq_driver_skyra::SKYRA_BAUD_RATES[0], "Skyra"),
    };
    let endpoint = daq_core::ports::get_or_open_endpoint(port, baud_rate, name).await?;

    let status = match family {
        Family::Asi => {
            daq_driver_asi::detect_controller(&endpoint, config.application.detect_timeout).await
        }
        Family::Skyra => daq_driver_skyra::detect_skyra(&endpoint).await,
    };
    match status {
        DetectionStatus::CanCommunicate { baud_rate } => {
            println!("{name} controller found on {port} at {baud_rate} baud");
            Ok(())
        }
        DetectionStatus::CanNotCommunicate => bail!("No {name} controller answered on {port}"),
        DetectionStatus::Misconfigured => bail!("'{port}' is not a usable port name"),
    }
}

async fn run_device_command(
    registry: &DeviceRegistry,
    config: &AppConfig,
    command: Commands,
) -> Result<()> {
    // `list` builds everything; other commands build only the device they name
    match &command {
        Commands::List => {
            for (id, e) in registry.build_from_config(config).await {
                eprintln!("{id}: {e:#}");
            }
        }
        Commands::Get { device, .. }
        | Commands::Set { device, .. }
        | Commands::Move { device, .. }
        | Commands::Focus { device }
        | Commands::Fire { device, .. } => {
            let definition = config
                .device(device)
                .ok_or_else(|| anyhow!("Device '{device}' is not configured"))?;
            registry
                .register_from_toml(&definition.id, &definition.r#type, definition.config.clone())
                .await?;
        }
        Commands::Ports | Commands::Detect { .. } => {}
    }

    match command {
        Commands::List => {
            for info in registry.list_devices() {
                let capabilities: Vec<&str> = info.capabilities.iter().map(|c| c.name()).collect();
                println!(
                    "{:<16} {:<18} {:<24} {}",
                    info.id,
                    info.driver_type,
                    info.port.unwrap_or_default(),
                    capabilities.join(", ")
                );
            }
        }
        Commands::Get { device, property } => {
            let target = registry
                .get_device(&device)
                .ok_or_else(|| anyhow!("Device '{device}' has no property access"))?;
            println!("{}", target.on_property(&property, PropertyAction::Get).await?);
        }
        Commands::Set {
            device,
            property,
            value,
        } => {
            let target = registry
                .get_device(&device)
                .ok_or_else(|| anyhow!("Device '{device}' has no property access"))?;
            let read_back = target
                .on_property(&property, PropertyAction::Set(value))
                .await?;
            println!("{property} = {read_back}");
        }
        Commands::Move { device, x, y } => {
            if let Some(stage) = registry.get_xy_stage(&device) {
                let y = y.ok_or_else(|| anyhow!("XY stage '{device}' needs both x and y"))?;
                stage.set_position_um(x, y).await?;
                stage.wait_settled().await?;
                let (x, y) = stage.position_um().await?;
                println!("{device} at ({x:.2}, {y:.2}) um");
            } else if let Some(stage) = registry.get_stage(&device) {
                stage.set_position_um(x).await?;
                println!("{device} at {:.2} um", stage.position_um().await?);
            } else {
                bail!("Device '{device}' is not a stage");
            }
        }
        Commands::Focus { device } => {
            let autofocus = registry
                .get_autofocus(&device)
                .ok_or_else(|| anyhow!("Device '{device}' has no autofocus"))?;
            autofocus.full_focus().await?;
            println!("Focus score: {}", autofocus.last_focus_score().await?);
        }
        Commands::Fire { device, ms } => {
            let shutter = registry
                .get_shutter_control(&device)
                .ok_or_else(|| anyhow!("Device '{device}' has no shutter"))?;
            shutter.fire(Duration::from_millis(ms)).await?;
        }
        Commands::Ports | Commands::Detect { .. } => {}
    }
    Ok(())
}
