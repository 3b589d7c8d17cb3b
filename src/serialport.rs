use crate::protocol::{
    self, AlarmInfo, AnalogValues, Barcode, DecodedEnvelope, PackCount, VersionInfo,
};
use crate::Error;
use std::io::{Read, Write};
use std::time::Duration;

type Result<T> = std::result::Result<T, Error>;

/// All documented devices talk 9600 8N1 without flow control.
const BAUD_RATE: u32 = 9600;

/// Reads bytes one at a time until the frame terminator arrives. The
/// reader's own timeout bounds each read; a timed-out read surfaces as
/// [`Error::TransportTimeout`] so callers can tell link silence from
/// protocol corruption.
pub(crate) fn read_until_eoi<R: Read + ?Sized>(reader: &mut R) -> Result<Vec<u8>> {
    let mut frame = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "serial stream closed before frame terminator",
                )))
            }
            Ok(_) => {
                frame.push(byte[0]);
                if byte[0] == protocol::EOI {
                    return Ok(frame);
                }
                if frame.len() > protocol::MAX_FRAME_LENGTH {
                    return Err(Error::FrameFormat("response exceeds maximum frame length"));
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {
                return Err(Error::TransportTimeout)
            }
            Err(err) => return Err(Error::Io(err)),
        }
    }
}

/// Synchronous client for a rack of Pylontech packs on one serial line.
///
/// The link is half-duplex: one request is written, then the reply is read
/// to its terminator before anything else happens. A host polling several
/// packs must funnel every exchange through one instance of this struct.
#[derive(Debug)]
pub struct PylonBMS {
    serial: Box<dyn serialport::SerialPort>,
}

impl PylonBMS {
    pub fn new(port: &str) -> Result<Self> {
        Ok(Self {
            serial: serialport::new(port, BAUD_RATE)
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .flow_control(serialport::FlowControl::None)
                .open()
                .map_err(std::io::Error::from)?,
        })
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.serial
            .set_timeout(timeout)
            .map_err(std::io::Error::from)?;
        Ok(())
    }

    // clear all incoming serial to avoid data collision with a stale,
    // timed-out reply
    fn drain_pending(&mut self) -> Result<()> {
        loop {
            let pending = self
                .serial
                .bytes_to_read()
                .map_err(std::io::Error::from)?;
            if pending == 0 {
                return Ok(());
            }
            log::trace!("Got {} pending bytes", pending);
            let mut buf: Vec<u8> = vec![0; 64];
            let received = self.serial.read(buf.as_mut_slice())?;
            log::trace!("Read {} pending bytes", received);
        }
    }

    fn transact(&mut self, tx_frame: &[u8]) -> Result<DecodedEnvelope> {
        self.drain_pending()?;
        log::trace!("write frame: {}", String::from_utf8_lossy(tx_frame));
        self.serial.write_all(tx_frame)?;

        let raw = read_until_eoi(&mut *self.serial)?;
        log::trace!("read frame: {}", String::from_utf8_lossy(&raw));

        let envelope = protocol::decode_frame(&raw)?;
        if envelope.cid2 != protocol::RESPONSE_NORMAL {
            return Err(Error::ResponseCode(envelope.cid2));
        }
        Ok(envelope)
    }

    /// Number of packs on the bus. Pack numbers for the other calls run
    /// from 1 to this count.
    pub fn get_pack_count(&mut self) -> Result<PackCount> {
        let envelope = self.transact(&PackCount::request())?;
        PackCount::decode(&envelope.info)
    }

    pub fn get_version_info(&mut self, pack: u8) -> Result<VersionInfo> {
        let envelope = self.transact(&VersionInfo::request(pack))?;
        VersionInfo::decode(&envelope.info)
    }

    pub fn get_barcode(&mut self, pack: u8) -> Result<Barcode> {
        let envelope = self.transact(&Barcode::request(pack))?;
        Barcode::decode(&envelope.info)
    }

    pub fn get_alarm_info(&mut self, pack: u8) -> Result<AlarmInfo> {
        let envelope = self.transact(&AlarmInfo::request(pack))?;
        AlarmInfo::decode(&envelope.info)
    }

    pub fn get_analog_values(&mut self, pack: u8) -> Result<AnalogValues> {
        let envelope = self.transact(&AnalogValues::request(pack))?;
        AnalogValues::decode(&envelope.info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Read impl that plays back a byte script, then reports a timeout the
    // way a serial port with a configured read timeout does.
    struct ScriptedPort {
        data: Vec<u8>,
        pos: usize,
    }

    impl ScriptedPort {
        fn new(data: &[u8]) -> Self {
            Self {
                data: data.to_vec(),
                pos: 0,
            }
        }
    }

    impl Read for ScriptedPort {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos < self.data.len() {
                buf[0] = self.data[self.pos];
                self.pos += 1;
                Ok(1)
            } else {
                Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "read timed out",
                ))
            }
        }
    }

    #[test]
    fn read_stops_at_terminator() {
        let mut port = ScriptedPort::new(b"~200046900000FDAB\rtrailing noise");
        let frame = read_until_eoi(&mut port).unwrap();
        assert_eq!(frame, b"~200046900000FDAB\r".to_vec());
    }

    #[test]
    fn silent_port_times_out() {
        let mut port = ScriptedPort::new(b"");
        assert!(matches!(
            read_until_eoi(&mut port),
            Err(Error::TransportTimeout)
        ));
    }

    #[test]
    fn partial_frame_without_terminator_times_out() {
        let mut port = ScriptedPort::new(b"~20004690");
        assert!(matches!(
            read_until_eoi(&mut port),
            Err(Error::TransportTimeout)
        ));
    }

    #[test]
    fn oversized_garbage_is_cut_off() {
        let mut port = ScriptedPort::new(&vec![b'A'; protocol::MAX_FRAME_LENGTH + 2]);
        assert!(matches!(
            read_until_eoi(&mut port),
            Err(Error::FrameFormat(_))
        ));
    }
}
