//! Provides an asynchronous client for interacting with Pylontech-compatible
//! BMS packs using Tokio and the `tokio-serial` crate for serial
//! communication.
//!
//! This module is suitable for applications built on the Tokio runtime.
//! The protocol itself stays strictly request/response: one command is
//! written and its reply read to the `\r` terminator before the next
//! command may be issued.
//!
//! # Example
//!
//! ```no_run
//! use pylonbms_lib::tokio_serial_async::PylonBMS;
//! use std::time::Duration;
//!
//! async fn poll_rack() -> Result<(), pylonbms_lib::Error> {
//!     let mut bms = PylonBMS::new("/dev/ttyUSB0")?;
//!     bms.set_timeout(Duration::from_secs(2));
//!
//!     let packs = bms.get_pack_count().await?;
//!     println!("Packs on the bus: {}", packs.count);
//!
//!     for pack in 1..=packs.count {
//!         let values = bms.get_analog_values(pack).await?;
//!         println!("Pack {}: {:.3} V, {:.2} A", pack, values.voltage, values.current);
//!     }
//!     Ok(())
//! }
//! ```

use crate::protocol::{
    self, AlarmInfo, AnalogValues, Barcode, DecodedEnvelope, PackCount, VersionInfo,
};
use crate::Error;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPort, SerialPortBuilderExt};

type Result<T> = std::result::Result<T, Error>;

const BAUD_RATE: u32 = 9600;

/// Asynchronous client for a rack of Pylontech packs on one serial line.
///
/// Mirrors [`crate::serialport::PylonBMS`]; every exchange needs `&mut
/// self`, which also enforces the one-outstanding-request rule of the
/// half-duplex link.
#[derive(Debug)]
pub struct PylonBMS {
    serial: tokio_serial::SerialStream,
    io_timeout: Duration,
}

impl PylonBMS {
    /// Opens the serial device at 9600 8N1.
    ///
    /// # Arguments
    ///
    /// * `port`: The path to the serial port device (e.g., `/dev/ttyUSB0`
    ///   on Linux, `COM3` on Windows).
    pub fn new(port: &str) -> Result<Self> {
        Ok(Self {
            serial: tokio_serial::new(port, BAUD_RATE)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
                .map_err(std::io::Error::from)?,
            io_timeout: Duration::from_secs(2),
        })
    }

    /// Sets the deadline for each request/response exchange. A reply whose
    /// terminator has not arrived in time fails with
    /// [`Error::TransportTimeout`].
    pub fn set_timeout(&mut self, timeout: Duration) {
        log::trace!("set timeout to {timeout:?}");
        self.io_timeout = timeout;
    }

    // Drop any bytes a previous, timed-out exchange may have left behind,
    // so a stale reply is never matched to the current command.
    async fn drain_pending(&mut self) -> Result<()> {
        loop {
            let pending = self
                .serial
                .bytes_to_read()
                .map_err(std::io::Error::from)?;
            if pending == 0 {
                return Ok(());
            }
            log::trace!("got {pending} pending bytes");
            let mut buf: Vec<u8> = vec![0; 64];
            let received = self.serial.read(buf.as_mut_slice()).await?;
            log::trace!("{received} pending bytes consumed");
        }
    }

    async fn read_frame(&mut self) -> Result<Vec<u8>> {
        let io_timeout = self.io_timeout;
        let serial = &mut self.serial;
        tokio::time::timeout(io_timeout, async {
            let mut frame = Vec::with_capacity(128);
            let mut byte = [0u8; 1];
            loop {
                serial.read_exact(&mut byte).await?;
                frame.push(byte[0]);
                if byte[0] == protocol::EOI {
                    return Ok(frame);
                }
                if frame.len() > protocol::MAX_FRAME_LENGTH {
                    return Err(Error::FrameFormat("response exceeds maximum frame length"));
                }
            }
        })
        .await
        .map_err(|_| Error::TransportTimeout)?
    }

    async fn transact(&mut self, tx_frame: &[u8]) -> Result<DecodedEnvelope> {
        self.drain_pending().await?;
        log::trace!("write frame: {}", String::from_utf8_lossy(tx_frame));
        let io_timeout = self.io_timeout;
        tokio::time::timeout(io_timeout, self.serial.write_all(tx_frame))
            .await
            .map_err(|_| Error::TransportTimeout)??;

        let raw = self.read_frame().await?;
        log::trace!("read frame: {}", String::from_utf8_lossy(&raw));

        let envelope = protocol::decode_frame(&raw)?;
        if envelope.cid2 != protocol::RESPONSE_NORMAL {
            return Err(Error::ResponseCode(envelope.cid2));
        }
        Ok(envelope)
    }

    /// Number of packs on the bus. Pack numbers for the other calls run
    /// from 1 to this count.
    pub async fn get_pack_count(&mut self) -> Result<PackCount> {
        let envelope = self.transact(&PackCount::request()).await?;
        PackCount::decode(&envelope.info)
    }

    /// Firmware version string of one pack.
    pub async fn get_version_info(&mut self, pack: u8) -> Result<VersionInfo> {
        let envelope = self.transact(&VersionInfo::request(pack)).await?;
        VersionInfo::decode(&envelope.info)
    }

    /// Barcode/serial of one pack.
    pub async fn get_barcode(&mut self, pack: u8) -> Result<Barcode> {
        let envelope = self.transact(&Barcode::request(pack)).await?;
        Barcode::decode(&envelope.info)
    }

    /// Alarm, protection, system and fault states of one pack.
    pub async fn get_alarm_info(&mut self, pack: u8) -> Result<AlarmInfo> {
        let envelope = self.transact(&AlarmInfo::request(pack)).await?;
        AlarmInfo::decode(&envelope.info)
    }

    /// Analog telemetry of one pack: cell voltages, temperatures, current,
    /// voltage and capacity counters.
    pub async fn get_analog_values(&mut self, pack: u8) -> Result<AnalogValues> {
        let envelope = self.transact(&AnalogValues::request(pack)).await?;
        AnalogValues::decode(&envelope.info)
    }
}
