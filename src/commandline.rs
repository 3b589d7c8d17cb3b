use crate::mqtt;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::time::Duration;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Show the number of battery packs daisy-chained on the bus
    PackCount,
    /// Show the firmware version reported by one pack
    Version {
        /// Pack number, 1-based
        #[clap(default_value_t = 1)]
        pack: u8,
    },
    /// Show the barcode/serial of one pack
    Barcode {
        /// Pack number, 1-based
        #[clap(default_value_t = 1)]
        pack: u8,
    },
    /// Show alarm, protection, system and fault states of one pack
    Alarms {
        /// Pack number, 1-based
        #[clap(default_value_t = 1)]
        pack: u8,
    },
    /// Show analog values of one pack: cell voltages, temperatures, current, capacity
    Analog {
        /// Pack number, 1-based
        #[clap(default_value_t = 1)]
        pack: u8,
    },
    /// Show all available information for every pack on the bus
    All,
    /// Run in daemon mode, periodically polling all packs
    Daemon {
        /// Output destination for readings
        #[command(subcommand)]
        output: DaemonOutput,
        /// Poll interval; one pack is serviced per tick (e.g. "5s", "1m")
        #[clap(long, short, value_parser = humantime::parse_duration, default_value = "5s")]
        interval: Duration,
        /// Skip the alarm-info poll; readings are published without state fields
        #[clap(long, action)]
        no_alarms: bool,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum DaemonOutput {
    /// Continuously read metrics and print them to the standard output (console).
    Console,
    /// Continuously read metrics and publish them to an MQTT broker.
    Mqtt {
        /// The configuration file for the MQTT broker
        #[arg(long, default_value_t = mqtt::MqttConfig::DEFAULT_CONFIG_FILE.to_string())]
        config_file: String,
    },
}

const fn about_text() -> &'static str {
    "pylontech bms command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Serial port device path (e.g., /dev/ttyUSB0 on Linux, COM1 on Windows)
    #[arg(short, long, default_value_t = default_device_name())]
    pub device: String,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Timeout for one request/response exchange (e.g., "500ms", "2s")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "2s")]
    pub timeout: Duration,
}
