use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::{Parser, Subcommand};

use error::CliError;
use fleet::{BatchOutcome, ReflashPlan, RoleSelection};
use finder::UsbFinder;
use list::list_devices;

mod batch;
mod error;
mod list;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// list connected devices
    List,
    /// reboot processors into the UF2 bootloader, in lockstep
    EnterBootloader {
        /// device serials (default: every discovered device)
        serials: Vec<String>,
        /// main processor only
        #[clap(long, conflicts_with = "display_only")]
        main_only: bool,
        /// display processor only
        #[clap(long)]
        display_only: bool,
    },
    /// flash firmware onto every device, display cohort first
    Reflash {
        /// main processor image (UF2)
        #[clap(short, long)]
        main: Option<PathBuf>,
        /// display processor image (UF2)
        #[clap(short, long)]
        display: Option<PathBuf>,
        /// device serials (default: every discovered device)
        serials: Vec<String>,
    },
}

impl Default for Commands {
    fn default() -> Self {
        Commands::List
    }
}

fn role_selection(main_only: bool, display_only: bool) -> RoleSelection {
    RoleSelection {
        main: !display_only,
        display: !main_only,
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::init();

    let scanner = Arc::new(UsbFinder::default());

    let outcome = match cli.command.unwrap_or_default() {
        Commands::List => match list_devices(scanner.as_ref()) {
            Ok(()) => return ExitCode::SUCCESS,
            Err(err) => Err(err),
        },
        Commands::EnterBootloader {
            serials,
            main_only,
            display_only,
        } => batch::enter_bootloader(scanner, serials, role_selection(main_only, display_only)),
        Commands::Reflash {
            main,
            display,
            serials,
        } => {
            let roles = RoleSelection {
                main: main.is_some(),
                display: display.is_some(),
            };
            batch::reflash(
                scanner,
                ReflashPlan {
                    serials,
                    main_image: main,
                    display_image: display,
                    roles,
                },
            )
        }
    };

    match outcome {
        Ok(BatchOutcome { failed: 0, cancelled: false, .. }) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}
