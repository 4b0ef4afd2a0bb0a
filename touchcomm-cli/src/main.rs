//! touchcomm CLI - inspect firmware images and drive a touch controller
//! through a serial bridge.

use anyhow::Result;
use clap::{Parser, Subcommand};
use env_logger::Env;
use std::path::PathBuf;
use std::process::ExitCode;

mod commands;

/// touchcomm - talk to TouchComm touch controllers.
///
/// Environment variables:
///   TOUCHCOMM_PORT   - Default serial bridge port
///   TOUCHCOMM_BAUD   - Default baud rate (default: 921600)
#[derive(Parser)]
#[command(name = "touchcomm")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial bridge port (e.g. /dev/ttyUSB0, COM3).
    #[arg(short, long, global = true, env = "TOUCHCOMM_PORT")]
    port: Option<String>,

    /// Baud rate of the serial bridge.
    #[arg(
        short,
        long,
        global = true,
        default_value = "921600",
        env = "TOUCHCOMM_BAUD"
    )]
    baud: u32,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect a firmware image container.
    Info {
        /// Path to the firmware image.
        image: PathBuf,
    },

    /// Identify the connected device.
    Identify,

    /// Flash a firmware image onto the connected device.
    Update {
        /// Path to the firmware image.
        image: PathBuf,

        /// Reflash even when the device firmware is current.
        #[arg(short, long)]
        force: bool,

        /// Per-page erase settle time in milliseconds.
        #[arg(long, default_value_t = 20)]
        erase_delay: u32,

        /// Per-block write settle time in milliseconds.
        #[arg(long, default_value_t = 20)]
        write_delay: u32,
    },

    /// Soft-reset the connected device.
    Reset,
}

fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Info { image } => commands::info::run(image),
        Commands::Identify => commands::identify::run(cli.port.as_deref(), cli.baud),
        Commands::Update {
            image,
            force,
            erase_delay,
            write_delay,
        } => commands::update::run(
            cli.port.as_deref(),
            cli.baud,
            image,
            *force,
            *erase_delay,
            *write_delay,
        ),
        Commands::Reset => commands::reset::run(cli.port.as_deref(), cli.baud),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_level)).init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
