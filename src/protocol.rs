use crate::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Start-of-information delimiter of every frame.
pub const SOI: u8 = b'~';
/// End-of-information delimiter of every frame.
pub const EOI: u8 = b'\r';
/// Protocol version byte sent in every request.
pub const VERSION: u8 = 0x20;
/// Command category byte for battery data (CID1).
pub const CID1: u8 = 0x46;
/// CID2 value of a response frame that completed without error. Any other
/// value in a response is a device-side error code.
pub const RESPONSE_NORMAL: u8 = 0x00;

// SOI + 12 hex header chars + up to 4095 info chars + 4 checksum chars + EOI
pub const MAX_FRAME_LENGTH: usize = 4113;

// 1 SOI + 12 header + 4 checksum + 1 EOI, info may be empty
const MIN_FRAME_LENGTH: usize = 18;

macro_rules! read_bit {
    ($byte:expr,$position:expr) => {
        ($byte >> $position) & 1 != 0
    };
}

/// Computes the checksum trailing a frame: the 16-bit sum of all body
/// bytes, complemented and incremented (two's complement negation).
pub fn get_frame_checksum(body: &[u8]) -> u16 {
    let mut sum: u16 = 0;
    for byte in body {
        sum = sum.wrapping_add(u16::from(*byte));
    }
    sum.wrapping_neg()
}

// Checksum nibble over the three hex digits of a 12-bit length.
fn length_checksum(length: u16) -> u8 {
    let sum = (length & 0xF) + ((length >> 4) & 0xF) + ((length >> 8) & 0xF);
    (((0xF - sum % 16) + 1) & 0xF) as u8
}

/// Builds the 16-bit length field of a frame header: the checksum nibble
/// in the top 4 bits, the info length (in bytes as transmitted, 0-4095)
/// in the low 12.
pub fn get_info_length(length: u16) -> u16 {
    debug_assert!(length <= 0x0FFF);
    (u16::from(length_checksum(length)) << 12) | (length & 0x0FFF)
}

/// Verifies the checksum nibble of a received length field against its own
/// low 12 bits and returns the plain length.
pub fn check_info_length(field: u16) -> std::result::Result<u16, Error> {
    let length = field & 0x0FFF;
    let calculated = length_checksum(length);
    let received = (field >> 12) as u8;
    if calculated != received {
        log::warn!(
            "Invalid length checksum - calculated={:X} received={:X} length={}",
            calculated,
            received,
            length
        );
        return Err(Error::LengthChecksum {
            calculated,
            received,
        });
    }
    Ok(length)
}

/// Encodes one command frame ready to be written to the serial line.
///
/// `info` is appended to the frame verbatim; for all documented commands it
/// is either empty or the 2-character uppercase hex pack id.
pub fn encode_cmd(address: u8, cid2: u8, info: &[u8]) -> Vec<u8> {
    let mut body = format!(
        "{:02X}{:02X}{:02X}{:02X}{:04X}",
        VERSION,
        address,
        CID1,
        cid2,
        get_info_length(info.len() as u16)
    )
    .into_bytes();
    body.extend_from_slice(info);
    let checksum = get_frame_checksum(&body);

    let mut frame = Vec::with_capacity(body.len() + 7);
    frame.push(SOI);
    frame.append(&mut body);
    frame.extend_from_slice(format!("{:04X}", checksum).as_bytes());
    frame.push(EOI);
    frame
}

fn parse_hex_u16(digits: &[u8]) -> std::result::Result<u16, Error> {
    let text = std::str::from_utf8(digits)
        .map_err(|_| Error::FrameFormat("checksum field is not ASCII"))?;
    u16::from_str_radix(text, 16).map_err(|_| Error::FrameFormat("checksum field is not hex"))
}

/// The envelope of a validated response frame, with all header fields
/// hex-decoded and `info` as raw bytes ready for payload decoding.
#[derive(Debug, Clone)]
pub struct DecodedEnvelope {
    pub version: u8,
    pub address: u8,
    pub cid1: u8,
    /// Response code in replies, command id in echoed requests.
    pub cid2: u8,
    /// Length of the info field in transmitted characters, as claimed by
    /// the (already verified) header length field.
    pub info_length: u16,
    pub info: Vec<u8>,
}

/// Validates and strips the envelope of one raw frame as read from the
/// transport, including the trailing `\r`.
pub fn decode_frame(raw: &[u8]) -> std::result::Result<DecodedEnvelope, Error> {
    if raw.len() < MIN_FRAME_LENGTH {
        return Err(Error::FrameFormat("frame shorter than minimal envelope"));
    }
    if raw[0] != SOI {
        return Err(Error::FrameFormat("missing start delimiter"));
    }
    if raw[raw.len() - 1] != EOI {
        return Err(Error::FrameFormat("missing end delimiter"));
    }

    let body = &raw[1..raw.len() - 5];
    let received = parse_hex_u16(&raw[raw.len() - 5..raw.len() - 1])?;
    let calculated = get_frame_checksum(body);
    if calculated != received {
        log::warn!(
            "Invalid frame checksum - calculated={:04X} received={:04X}",
            calculated,
            received
        );
        return Err(Error::FrameChecksum {
            calculated,
            received,
        });
    }

    let decoded =
        hex::decode(body).map_err(|_| Error::FrameFormat("frame body is not valid hex"))?;
    if decoded.len() < 6 {
        return Err(Error::FrameFormat("envelope header incomplete"));
    }
    let length_field = u16::from_be_bytes([decoded[4], decoded[5]]);
    let info_length = check_info_length(length_field)?;

    Ok(DecodedEnvelope {
        version: decoded[0],
        address: decoded[1],
        cid1: decoded[2],
        cid2: decoded[3],
        info_length,
        info: decoded[6..].to_vec(),
    })
}

// Sequential reader over an info slice. Every accessor fails with
// PayloadFormat instead of reading past the end.
struct InfoReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> InfoReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, n: usize, what: &'static str) -> std::result::Result<&'a [u8], Error> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or(Error::PayloadFormat(what))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self, what: &'static str) -> std::result::Result<u8, Error> {
        Ok(self.bytes(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> std::result::Result<u16, Error> {
        let raw = self.bytes(2, what)?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    fn i16(&mut self, what: &'static str) -> std::result::Result<i16, Error> {
        let raw = self.bytes(2, what)?;
        Ok(i16::from_be_bytes([raw[0], raw[1]]))
    }
}

fn round1(value: f32) -> f32 {
    (value * 10.0).round() / 10.0
}

fn round2(value: f32) -> f32 {
    (value * 100.0).round() / 100.0
}

fn round3(value: f32) -> f32 {
    (value * 1000.0).round() / 1000.0
}

// millivolt to volt, 3 decimals
fn to_volt(raw: i32) -> f32 {
    round3(raw as f32 / 1000.0)
}

// 0.01 A units, 2 decimals
fn to_amp(raw: i16) -> f32 {
    round2(f32::from(raw) / 100.0)
}

// tenths of Kelvin to degrees Celsius, 2 decimals
fn to_celsius(raw: i16) -> f32 {
    round2((f32::from(raw) - 2730.0) / 10.0)
}

fn pack_id(pack: u8) -> Vec<u8> {
    format!("{pack:02X}").into_bytes()
}

/// Number of packs daisy-chained on the bus.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PackCount {
    pub count: u8,
}

impl PackCount {
    pub fn request() -> Vec<u8> {
        encode_cmd(0, 0x90, b"")
    }

    pub fn decode(info: &[u8]) -> std::result::Result<Self, Error> {
        let mut reader = InfoReader::new(info);
        Ok(Self {
            count: reader.u8("pack count")?,
        })
    }
}

/// Firmware version string of one pack.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct VersionInfo {
    pub version: String,
}

impl VersionInfo {
    pub fn request(pack: u8) -> Vec<u8> {
        encode_cmd(0, 0xC1, &pack_id(pack))
    }

    pub fn decode(info: &[u8]) -> std::result::Result<Self, Error> {
        let end = info.iter().position(|b| *b == 0).unwrap_or(info.len());
        Ok(Self {
            version: String::from_utf8_lossy(&info[..end]).into_owned(),
        })
    }
}

/// Barcode/serial of one pack, a fixed 15-character field on the wire.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Barcode {
    pub barcode: String,
}

impl Barcode {
    pub fn request(pack: u8) -> Vec<u8> {
        encode_cmd(0, 0xC2, &pack_id(pack))
    }

    pub fn decode(info: &[u8]) -> std::result::Result<Self, Error> {
        let mut reader = InfoReader::new(info);
        let raw = reader.bytes(15, "barcode")?;
        let text = String::from_utf8_lossy(raw);
        Ok(Self {
            barcode: text.trim_end_matches(['\0', ' ']).to_string(),
        })
    }
}

/// Protection trips, decoded from the two protection status bytes.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProtectionStatus {
    pub charger_ovp: bool,
    pub short_circuit: bool,
    pub discharge_ocp: bool,
    pub charge_ocp: bool,
    pub pack_uvp: bool,
    pub pack_ovp: bool,
    pub cell_uvp: bool,
    pub cell_ovp: bool,
    pub env_utp: bool,
    pub env_otp: bool,
    pub mos_otp: bool,
    pub discharge_utp: bool,
    pub charge_utp: bool,
    pub discharge_otp: bool,
    pub charge_otp: bool,
}

impl ProtectionStatus {
    /// Reserved bits may hold either value; only the documented positions
    /// are interpreted.
    pub fn from_bytes(sts1: u8, sts2: u8) -> Self {
        Self {
            charger_ovp: read_bit!(sts1, 7),
            short_circuit: read_bit!(sts1, 6),
            discharge_ocp: read_bit!(sts1, 5),
            charge_ocp: read_bit!(sts1, 4),
            pack_uvp: read_bit!(sts1, 3),
            pack_ovp: read_bit!(sts1, 2),
            cell_uvp: read_bit!(sts1, 1),
            cell_ovp: read_bit!(sts1, 0),
            env_utp: read_bit!(sts2, 6),
            env_otp: read_bit!(sts2, 5),
            mos_otp: read_bit!(sts2, 4),
            discharge_utp: read_bit!(sts2, 3),
            charge_utp: read_bit!(sts2, 2),
            discharge_otp: read_bit!(sts2, 1),
            charge_otp: read_bit!(sts2, 0),
        }
    }
}

/// Operational state flags. `fully_charged` rides in the top bit of the
/// second protection byte on the wire but belongs here logically.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SystemStatus {
    pub fully_charged: bool,
    pub heater: bool,
    pub ac_in: bool,
    pub discharge_mos: bool,
    pub charge_mos: bool,
    pub charge_limit: bool,
}

impl SystemStatus {
    pub fn from_bytes(sts: u8, protect_sts2: u8) -> Self {
        Self {
            fully_charged: read_bit!(protect_sts2, 7),
            heater: read_bit!(sts, 7),
            ac_in: read_bit!(sts, 5),
            discharge_mos: read_bit!(sts, 2),
            charge_mos: read_bit!(sts, 1),
            charge_limit: read_bit!(sts, 0),
        }
    }
}

/// Hardware fault flags.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FaultStatus {
    pub heater_fault: bool,
    pub ccb_fault: bool,
    pub sampling_fault: bool,
    pub cell_fault: bool,
    pub ntc_fault: bool,
    pub discharge_mos_fault: bool,
    pub charge_mos_fault: bool,
}

impl FaultStatus {
    pub fn from_byte(sts: u8) -> Self {
        Self {
            heater_fault: read_bit!(sts, 7),
            ccb_fault: read_bit!(sts, 6),
            sampling_fault: read_bit!(sts, 5),
            cell_fault: read_bit!(sts, 4),
            ntc_fault: read_bit!(sts, 2),
            discharge_mos_fault: read_bit!(sts, 1),
            charge_mos_fault: read_bit!(sts, 0),
        }
    }
}

/// Pre-protection warning flags, decoded from the two alarm status bytes.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AlarmStatus {
    pub discharge_oc: bool,
    pub charge_oc: bool,
    pub pack_uv: bool,
    pub pack_ov: bool,
    pub cell_uv: bool,
    pub cell_ov: bool,
    pub soc_low: bool,
    pub mos_ot: bool,
    pub env_ut: bool,
    pub env_ot: bool,
    pub discharge_ut: bool,
    pub charge_ut: bool,
    pub discharge_ot: bool,
    pub charge_ot: bool,
}

impl AlarmStatus {
    pub fn from_bytes(sts1: u8, sts2: u8) -> Self {
        Self {
            discharge_oc: read_bit!(sts1, 5),
            charge_oc: read_bit!(sts1, 4),
            pack_uv: read_bit!(sts1, 3),
            pack_ov: read_bit!(sts1, 2),
            cell_uv: read_bit!(sts1, 1),
            cell_ov: read_bit!(sts1, 0),
            soc_low: read_bit!(sts2, 7),
            mos_ot: read_bit!(sts2, 6),
            env_ut: read_bit!(sts2, 5),
            env_ot: read_bit!(sts2, 4),
            discharge_ut: read_bit!(sts2, 3),
            charge_ut: read_bit!(sts2, 2),
            discharge_ot: read_bit!(sts2, 1),
            charge_ot: read_bit!(sts2, 0),
        }
    }
}

/// Alarm information of one pack (command 0x44).
///
/// Per-cell and per-sensor state bytes are 0 for normal; the trailing
/// status bytes are decoded into their bitfield views.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AlarmInfo {
    pub module: u8,
    pub cell_states: Vec<u8>,
    pub temperature_states: Vec<u8>,
    pub current_state: u8,
    pub voltage_state: u8,
    pub protection: ProtectionStatus,
    pub system: SystemStatus,
    pub fault: FaultStatus,
    pub alarm: AlarmStatus,
}

impl AlarmInfo {
    pub fn request(pack: u8) -> Vec<u8> {
        encode_cmd(pack, 0x44, &pack_id(pack))
    }

    pub fn decode(info: &[u8]) -> std::result::Result<Self, Error> {
        let mut reader = InfoReader::new(info);
        let _infoflag = reader.u8("info flag")?;
        let module = reader.u8("module number")?;

        let cell_count = reader.u8("cell count")?;
        let cell_states = reader.bytes(cell_count.into(), "cell states")?.to_vec();

        let temperature_count = reader.u8("temperature count")?;
        let temperature_states = reader
            .bytes(temperature_count.into(), "temperature states")?
            .to_vec();

        let _user_defined = reader.u8("user defined byte")?;
        let current_state = reader.u8("current state")?;
        let voltage_state = reader.u8("voltage state")?;

        let protect_sts1 = reader.u8("protect status 1")?;
        let protect_sts2 = reader.u8("protect status 2")?;
        let system_sts = reader.u8("system status")?;
        let fault_sts = reader.u8("fault status")?;
        let alarm_sts1 = reader.u8("alarm status 1")?;
        let alarm_sts2 = reader.u8("alarm status 2")?;

        Ok(Self {
            module,
            cell_states,
            temperature_states,
            current_state,
            voltage_state,
            protection: ProtectionStatus::from_bytes(protect_sts1, protect_sts2),
            system: SystemStatus::from_bytes(system_sts, protect_sts2),
            fault: FaultStatus::from_byte(fault_sts),
            alarm: AlarmStatus::from_bytes(alarm_sts1, alarm_sts2),
        })
    }
}

/// Analog telemetry of one pack (command 0x42).
///
/// `power` and `state_of_charge` are not transmitted; they are derived
/// from the other fields during decoding.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AnalogValues {
    pub module: u8,
    /// Per-cell voltages in V, 3 decimals.
    pub cell_voltages: Vec<f32>,
    /// Per-sensor temperatures in °C, 2 decimals.
    pub temperatures: Vec<f32>,
    /// Pack current in A, 2 decimals. Negative while discharging.
    pub current: f32,
    /// Pack voltage in V, 3 decimals.
    pub voltage: f32,
    /// current * voltage in W, 1 decimal.
    pub power: f32,
    /// Remaining capacity in Ah.
    pub remaining_capacity: f32,
    /// Total capacity in Ah.
    pub total_capacity: f32,
    pub cycle_count: u16,
    /// remaining/total ratio, 1 decimal.
    pub state_of_charge: f32,
}

impl AnalogValues {
    pub fn request(pack: u8) -> Vec<u8> {
        encode_cmd(pack, 0x42, &pack_id(pack))
    }

    pub fn decode(info: &[u8]) -> std::result::Result<Self, Error> {
        let mut reader = InfoReader::new(info);
        let _infoflag = reader.u8("info flag")?;
        let module = reader.u8("module number")?;

        let cell_count = reader.u8("cell count")?;
        let mut cell_voltages = Vec::with_capacity(cell_count.into());
        for _ in 0..cell_count {
            cell_voltages.push(to_volt(reader.i16("cell voltage")?.into()));
        }

        let temperature_count = reader.u8("temperature count")?;
        let mut temperatures = Vec::with_capacity(temperature_count.into());
        for _ in 0..temperature_count {
            temperatures.push(to_celsius(reader.i16("temperature")?));
        }

        let current = to_amp(reader.i16("current")?);
        let voltage = to_volt(reader.u16("pack voltage")?.into());
        let remaining_raw = reader.u16("remaining capacity")?;
        let _user_defined = reader.u8("user defined item count")?;
        let total_raw = reader.u16("total capacity")?;
        let cycle_count = reader.u16("cycle number")?;

        if total_raw == 0 {
            // state of charge would be meaningless
            return Err(Error::PayloadFormat("total capacity is zero"));
        }

        Ok(Self {
            module,
            cell_voltages,
            temperatures,
            current,
            voltage,
            power: round1(current * voltage),
            remaining_capacity: f32::from(remaining_raw) / 100.0,
            total_capacity: f32::from(total_raw) / 100.0,
            cycle_count,
            state_of_charge: round1(f32::from(remaining_raw) / f32::from(total_raw)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Builds a syntactically valid response frame around raw info bytes,
    // the way a pack would: info is transmitted hex-encoded, CID2 carries
    // the response code.
    fn build_response(address: u8, cid2: u8, info: &[u8]) -> Vec<u8> {
        let info_hex = info
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<String>()
            .into_bytes();
        encode_cmd(address, cid2, &info_hex)
    }

    #[test]
    fn pack_count_request_is_byte_exact() {
        assert_eq!(PackCount::request(), b"~200046900000FDAB\r".to_vec());
    }

    #[test]
    fn version_request_is_byte_exact() {
        assert_eq!(VersionInfo::request(1), b"~200046C1E00201FD28\r".to_vec());
    }

    #[test]
    fn frame_round_trip_recovers_envelope() {
        let frame = encode_cmd(2, 0x44, b"02");
        let envelope = decode_frame(&frame).unwrap();
        assert_eq!(envelope.version, VERSION);
        assert_eq!(envelope.address, 2);
        assert_eq!(envelope.cid1, CID1);
        assert_eq!(envelope.cid2, 0x44);
        assert_eq!(envelope.info_length, 2);
        assert_eq!(envelope.info, vec![0x02]);
    }

    #[test]
    fn empty_info_round_trips() {
        assert_eq!(get_info_length(0), 0x0000);
        let frame = encode_cmd(0, 0x90, b"");
        let envelope = decode_frame(&frame).unwrap();
        assert_eq!(envelope.info_length, 0);
        assert!(envelope.info.is_empty());
    }

    #[test]
    fn flipping_any_body_bit_fails_the_checksum() {
        let frame = PackCount::request();
        for pos in 1..frame.len() - 5 {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[pos] ^= 1 << bit;
                match decode_frame(&corrupted) {
                    Err(Error::FrameChecksum { .. }) => {}
                    other => panic!("expected checksum failure at {pos}/{bit}, got {other:?}"),
                }
            }
        }
    }

    #[test]
    fn length_checksum_accepts_all_valid_lengths() {
        for length in 0..=0x0FFFu16 {
            let field = get_info_length(length);
            assert_eq!(field & 0x0FFF, length);
            assert_eq!(check_info_length(field).unwrap(), length);
        }
    }

    #[test]
    fn length_checksum_rejects_every_other_nibble() {
        for length in [0u16, 1, 2, 0x10, 0xFF, 0x100, 0xABC, 0xFFF] {
            let good = get_info_length(length) >> 12;
            for nibble in 0..16u16 {
                if nibble == good {
                    continue;
                }
                let field = (nibble << 12) | length;
                match check_info_length(field) {
                    Err(Error::LengthChecksum { .. }) => {}
                    other => panic!("expected length checksum failure, got {other:?}"),
                }
            }
        }
    }

    #[test]
    fn known_length_fields() {
        // two info characters: digit sum 2 -> nibble 0xE
        assert_eq!(get_info_length(2), 0xE002);
        // digit sum of 0x012 is 3 -> nibble 0xD
        assert_eq!(get_info_length(0x012), 0xD012);
    }

    #[test]
    fn malformed_frames_are_rejected() {
        let mut frame = PackCount::request();
        frame[0] = b'x';
        assert!(matches!(
            decode_frame(&frame),
            Err(Error::FrameFormat("missing start delimiter"))
        ));

        let mut frame = PackCount::request();
        let last = frame.len() - 1;
        frame[last] = b'\n';
        assert!(matches!(
            decode_frame(&frame),
            Err(Error::FrameFormat("missing end delimiter"))
        ));

        assert!(matches!(
            decode_frame(b"~20004690\r"),
            Err(Error::FrameFormat(_))
        ));
    }

    #[test]
    fn non_hex_body_is_rejected_after_checksum() {
        // build a frame whose body contains a non-hex character but whose
        // trailing checksum is consistent with it
        let mut body = b"200046900000".to_vec();
        body[11] = b'G';
        let checksum = get_frame_checksum(&body);
        let mut frame = vec![SOI];
        frame.extend_from_slice(&body);
        frame.extend_from_slice(format!("{checksum:04X}").as_bytes());
        frame.push(EOI);
        assert!(matches!(
            decode_frame(&frame),
            Err(Error::FrameFormat("frame body is not valid hex"))
        ));
    }

    #[test]
    fn pack_count_response_decodes() {
        let frame = build_response(0, RESPONSE_NORMAL, &[0x02]);
        let envelope = decode_frame(&frame).unwrap();
        let count = PackCount::decode(&envelope.info).unwrap();
        assert_eq!(count.count, 2);
    }

    #[test]
    fn pack_count_rejects_empty_info() {
        assert!(matches!(
            PackCount::decode(&[]),
            Err(Error::PayloadFormat("pack count"))
        ));
    }

    #[test]
    fn version_decodes_to_first_nul() {
        let decoded = VersionInfo::decode(b"PHANTOM-S 48V V2.3\0garbage").unwrap();
        assert_eq!(decoded.version, "PHANTOM-S 48V V2.3");
        // no terminator: the whole slice is the version
        let decoded = VersionInfo::decode(b"V1.3").unwrap();
        assert_eq!(decoded.version, "V1.3");
    }

    #[test]
    fn barcode_strips_padding() {
        let decoded = Barcode::decode(b"PPTAH0213220371").unwrap();
        assert_eq!(decoded.barcode, "PPTAH0213220371");
        let decoded = Barcode::decode(b"AB123\0\0\0\0\0\0\0\0\0\0tail").unwrap();
        assert_eq!(decoded.barcode, "AB123");
        let decoded = Barcode::decode(b"AB123          ").unwrap();
        assert_eq!(decoded.barcode, "AB123");
        assert!(matches!(
            Barcode::decode(b"SHORT"),
            Err(Error::PayloadFormat("barcode"))
        ));
    }

    fn sample_alarm_info() -> Vec<u8> {
        vec![
            0x11, // info flag
            0x01, // module number
            0x02, // cell count
            0x00, 0x01, // cell states
            0x01, // temperature count
            0x00, // temperature states
            0x00, // user defined
            0x00, // current state
            0x01, // voltage state
            0b1000_0001, // protect sts1
            0b1000_0000, // protect sts2
            0b0000_0110, // system sts
            0b0000_0100, // fault sts
            0b0010_0000, // alarm sts1
            0b1000_0000, // alarm sts2
        ]
    }

    #[test]
    fn alarm_info_decodes_all_fields() {
        let decoded = AlarmInfo::decode(&sample_alarm_info()).unwrap();
        assert_eq!(decoded.module, 1);
        assert_eq!(decoded.cell_states, vec![0, 1]);
        assert_eq!(decoded.temperature_states, vec![0]);
        assert_eq!(decoded.current_state, 0);
        assert_eq!(decoded.voltage_state, 1);
        assert!(decoded.protection.charger_ovp);
        assert!(decoded.protection.cell_ovp);
        assert!(!decoded.protection.short_circuit);
        assert!(decoded.system.fully_charged);
        assert!(decoded.system.discharge_mos);
        assert!(decoded.system.charge_mos);
        assert!(!decoded.system.heater);
        assert!(decoded.fault.ntc_fault);
        assert!(!decoded.fault.heater_fault);
        assert!(decoded.alarm.discharge_oc);
        assert!(decoded.alarm.soc_low);
        assert!(!decoded.alarm.charge_ot);
    }

    #[test]
    fn alarm_info_rejects_truncation_everywhere() {
        let full = sample_alarm_info();
        for end in 0..full.len() {
            match AlarmInfo::decode(&full[..end]) {
                Err(Error::PayloadFormat(_)) => {}
                other => panic!("expected payload error at length {end}, got {other:?}"),
            }
        }
    }

    #[test]
    fn alarm_info_rejects_counts_larger_than_slice() {
        // claims 16 cells but carries none
        let info = [0x11, 0x01, 0x10];
        assert!(matches!(
            AlarmInfo::decode(&info),
            Err(Error::PayloadFormat("cell states"))
        ));
    }

    #[test]
    fn status_bitfields_tolerate_reserved_bits() {
        let protection = ProtectionStatus::from_bytes(0xFF, 0xFF);
        assert!(protection.charger_ovp && protection.charge_otp);
        let system = SystemStatus::from_bytes(0xFF, 0x00);
        assert!(system.heater && !system.fully_charged);
        let fault = FaultStatus::from_byte(0xFF);
        assert!(fault.heater_fault && fault.charge_mos_fault);
        let alarm = AlarmStatus::from_bytes(0x00, 0x00);
        assert!(!alarm.soc_low && !alarm.cell_ov);
    }

    fn sample_analog_values() -> Vec<u8> {
        vec![
            0x11, // info flag
            0x01, // module number
            0x02, // cell count
            0x04, 0xD2, // 1234 mV
            0x0D, 0xAC, // 3500 mV
            0x02, // temperature count
            0x0B, 0xB8, // 3000 -> 27.00 C
            0x0B, 0xA4, // 2980 -> 25.00 C
            0xFF, 0x6A, // current -150 -> -1.50 A
            0xC0, 0xBC, // 49340 mV -> 49.340 V
            0x1F, 0x40, // remaining 8000 -> 80.00 Ah
            0x02, // user defined item count
            0x27, 0x10, // total 10000 -> 100.00 Ah
            0x00, 0x05, // cycle number
        ]
    }

    #[test]
    fn analog_values_scaling_is_exact() {
        let decoded = AnalogValues::decode(&sample_analog_values()).unwrap();
        assert_eq!(decoded.module, 1);
        assert_eq!(decoded.cell_voltages, vec![1.234, 3.5]);
        assert_eq!(decoded.temperatures, vec![27.0, 25.0]);
        assert_eq!(decoded.current, -1.5);
        assert_eq!(decoded.voltage, 49.34);
        assert_eq!(decoded.remaining_capacity, 80.0);
        assert_eq!(decoded.total_capacity, 100.0);
        assert_eq!(decoded.cycle_count, 5);
    }

    #[test]
    fn analog_values_derived_fields() {
        let decoded = AnalogValues::decode(&sample_analog_values()).unwrap();
        // -1.5 A * 49.34 V = -74.01, one decimal
        assert_eq!(decoded.power, -74.0);
        // 8000/10000, one decimal
        assert_eq!(decoded.state_of_charge, 0.8);
    }

    #[test]
    fn analog_values_reject_truncation_everywhere() {
        let full = sample_analog_values();
        for end in 0..full.len() {
            match AnalogValues::decode(&full[..end]) {
                Err(Error::PayloadFormat(_)) => {}
                other => panic!("expected payload error at length {end}, got {other:?}"),
            }
        }
    }

    #[test]
    fn analog_values_reject_zero_total_capacity() {
        let mut info = sample_analog_values();
        let len = info.len();
        info[len - 4] = 0;
        info[len - 3] = 0;
        assert!(matches!(
            AnalogValues::decode(&info),
            Err(Error::PayloadFormat("total capacity is zero"))
        ));
    }

    #[test]
    fn analog_response_through_the_full_codec() {
        let frame = build_response(1, RESPONSE_NORMAL, &sample_analog_values());
        let envelope = decode_frame(&frame).unwrap();
        assert_eq!(envelope.address, 1);
        assert_eq!(envelope.cid2, RESPONSE_NORMAL);
        let decoded = AnalogValues::decode(&envelope.info).unwrap();
        assert_eq!(decoded.voltage, 49.34);
        assert_eq!(decoded.state_of_charge, 0.8);
    }
}
