use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::{ops::Deref, panic};

mod commandline;
mod daemon;
mod mqtt;

use commandline::{CliArgs, CliCommands};

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

macro_rules! print_version {
    ($bms:expr, $pack:expr) => {
        println!(
            "Pack{} version: {}",
            $pack,
            $bms.get_version_info($pack)
                .with_context(|| "Cannot get version info")?
                .version
        )
    };
}
macro_rules! print_barcode {
    ($bms:expr, $pack:expr) => {
        println!(
            "Pack{} barcode: {}",
            $pack,
            $bms.get_barcode($pack)
                .with_context(|| "Cannot get barcode")?
                .barcode
        )
    };
}
macro_rules! print_alarms {
    ($bms:expr, $pack:expr) => {
        println!(
            "Pack{} alarms: {:#?}",
            $pack,
            $bms.get_alarm_info($pack)
                .with_context(|| "Cannot get alarm info")?
        )
    };
}
macro_rules! print_analog {
    ($bms:expr, $pack:expr) => {
        println!(
            "Pack{} analog values: {:#?}",
            $pack,
            $bms.get_analog_values($pack)
                .with_context(|| "Cannot get analog values")?
        )
    };
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let mut bms = pylonbms_lib::serialport::PylonBMS::new(&args.device)
        .with_context(|| format!("Cannot open serial port '{}'", args.device))?;
    bms.set_timeout(args.timeout)?;

    match args.command {
        CliCommands::PackCount => println!(
            "Pack count: {}",
            bms.get_pack_count()
                .with_context(|| "Cannot get pack count")?
                .count
        ),
        CliCommands::Version { pack } => print_version!(bms, pack),
        CliCommands::Barcode { pack } => print_barcode!(bms, pack),
        CliCommands::Alarms { pack } => print_alarms!(bms, pack),
        CliCommands::Analog { pack } => print_analog!(bms, pack),
        CliCommands::All => {
            let count = bms
                .get_pack_count()
                .with_context(|| "Cannot get pack count")?
                .count;
            println!("Pack count: {count}");
            for pack in 1..=count {
                print_version!(bms, pack);
                print_barcode!(bms, pack);
                print_analog!(bms, pack);
                print_alarms!(bms, pack);
            }
        }
        CliCommands::Daemon {
            output,
            interval,
            no_alarms,
        } => daemon::run(bms, output, interval, !no_alarms)?,
    }

    Ok(())
}
