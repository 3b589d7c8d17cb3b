/// Errors produced by the protocol engine and the serial clients.
///
/// All variants are recoverable from the caller's point of view: a failed
/// request leaves the link usable, so an orchestrator may log the error,
/// skip the affected pack for this cycle and carry on.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The whole-frame checksum trailing the frame body did not match.
    #[error("frame checksum mismatch - calculated={calculated:04X} received={received:04X}")]
    FrameChecksum { calculated: u16, received: u16 },
    /// The checksum nibble embedded in the length field did not match its
    /// own low 12 bits.
    #[error("length checksum mismatch - calculated={calculated:X} received={received:X}")]
    LengthChecksum { calculated: u8, received: u8 },
    /// The frame envelope itself is malformed: missing delimiters, an
    /// incomplete header or a body that is not valid ASCII hex.
    #[error("malformed frame: {0}")]
    FrameFormat(&'static str),
    /// The info payload is shorter than the layout it claims, or a count
    /// field implies more elements than there are bytes.
    #[error("malformed payload: {0}")]
    PayloadFormat(&'static str),
    /// The device answered with a non-normal response code in CID2.
    #[error("device reported response code {0:#04X}")]
    ResponseCode(u8),
    /// No frame terminator arrived within the configured read timeout.
    #[error("no response within the read timeout")]
    TransportTimeout,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
