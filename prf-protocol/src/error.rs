//! Error types for the PRF protocol engine.

use thiserror::Error;

use crate::catalog::TransportKind;
use crate::types::{DfuState, ProtocolVersion, RecordKind};

/// Everything that can go wrong while coding records or running transactions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer length does not match the fixed size of the expected record.
    #[error("Size mismatch for {kind}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        kind: RecordKind,
        expected: usize,
        actual: usize,
    },

    /// Recomputed checksum differs from the record trailer.
    #[error("Checksum error in {kind}: trailer 0x{stored:08X}, computed 0x{computed:08X}")]
    ChecksumError {
        kind: RecordKind,
        stored: u32,
        computed: u32,
    },

    /// The channel moved fewer bytes than the phase required.
    #[error("Short transfer: expected {expected} bytes, got {actual}")]
    ShortTransfer { expected: usize, actual: usize },

    /// A transaction was attempted before the channel was opened.
    #[error("Channel not open")]
    ChannelNotOpen,

    /// The command is not allowed on this kind of transport.
    #[error("Opcode 0x{opcode:02X} is not supported on {transport}")]
    UnsupportedOnTransport {
        opcode: u8,
        transport: TransportKind,
    },

    /// A composite mask-data buffer ended before the next enabled record.
    #[error("Truncated composite: {kind} needs {needed} bytes, {remaining} remain")]
    TruncatedComposite {
        kind: RecordKind,
        needed: usize,
        remaining: usize,
    },

    /// A composite mask-data buffer is longer than its mask implies.
    #[error("Composite overrun: mask implies {expected} bytes, got {actual}")]
    CompositeOverrun { expected: usize, actual: usize },

    /// A telemetry record carries the selector of a different kind.
    #[error("Selector mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    SelectorMismatch { expected: u8, actual: u8 },

    /// The record kind (or mask bit) does not exist in this protocol version.
    #[error("{kind} is not part of protocol {version}")]
    UnsupportedInVersion {
        kind: RecordKind,
        version: ProtocolVersion,
    },

    /// A version-tagged field set does not match the version being coded.
    #[error("{kind} field set does not match protocol {version}")]
    LayoutMismatch {
        kind: RecordKind,
        version: ProtocolVersion,
    },

    /// Device and host disagree on the protocol version.
    #[error("Protocol version mismatch: device={device}, host={host}")]
    VersionMismatch { device: u8, host: u8 },

    /// A variable-length field exceeds its fixed capacity, or a fixed
    /// field has the wrong length.
    #[error("Field {field} out of range: {value} (limit {limit})")]
    FieldOutOfRange {
        field: &'static str,
        value: usize,
        limit: usize,
    },

    /// An enumerated field holds a value with no meaning.
    #[error("Invalid value 0x{value:02X} for {field}")]
    InvalidEnumValue { field: &'static str, value: u8 },

    /// Opcode is not in the command catalog.
    #[error("Unknown opcode: 0x{0:02X}")]
    UnknownOpcode(u8),

    /// No catalog command matches the requested logical operation.
    #[error("No command for {0}")]
    NoSuchCommand(String),

    /// Transaction phases were driven out of order.
    #[error("Phase order violated: {0}")]
    PhaseOrder(&'static str),

    /// The DFU session cannot make the requested move from its state.
    #[error("Invalid DFU transition: {from:?} -> {to:?}")]
    InvalidDfuTransition { from: DfuState, to: DfuState },

    /// A transaction failed while a DFU session was active. The session is
    /// halted until explicitly abandoned.
    #[error("DFU mode state error: {0}")]
    DfuModeState(Box<ProtocolError>),

    /// The DFU session was halted by an earlier failure.
    #[error("DFU session halted; abandon it before continuing")]
    DfuHalted,

    /// The underlying bus reported an I/O failure.
    #[error("Transport error: {0}")]
    Transport(String),
}

impl ProtocolError {
    /// Whether this error invalidates a single sample but leaves the channel
    /// usable (poll loops skip the sample and continue).
    pub fn is_sample_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::ChecksumError { .. } | ProtocolError::SelectorMismatch { .. }
        )
    }
}

/// Block acknowledgement code returned by the device during DFU.
///
/// These are data, not errors: the session reports them to the caller, which
/// decides whether to retry or abandon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DfuStatus {
    /// Block (or mode change) accepted.
    Ok = 0x00,
    /// Block checksum did not verify on the device.
    CrcErr = 0x01,
    /// Flash programming failed.
    FlashErr = 0x02,
    /// Requested mode is not supported by this firmware.
    ModeNotSupported = 0x03,
    /// Request is not valid in the device's current mode.
    ModeStateError = 0x04,
    /// Block number or length is wrong.
    BlockErr = 0x05,
}

impl TryFrom<u8> for DfuStatus {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0x00 => Ok(DfuStatus::Ok),
            0x01 => Ok(DfuStatus::CrcErr),
            0x02 => Ok(DfuStatus::FlashErr),
            0x03 => Ok(DfuStatus::ModeNotSupported),
            0x04 => Ok(DfuStatus::ModeStateError),
            0x05 => Ok(DfuStatus::BlockErr),
            v => Err(v),
        }
    }
}

impl From<DfuStatus> for u8 {
    fn from(value: DfuStatus) -> Self {
        value as u8
    }
}

impl DfuStatus {
    /// Returns true if the device accepted the request.
    pub fn is_ok(self) -> bool {
        self == DfuStatus::Ok
    }
}

impl std::fmt::Display for DfuStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            DfuStatus::Ok => "ok",
            DfuStatus::CrcErr => "crc error",
            DfuStatus::FlashErr => "flash error",
            DfuStatus::ModeNotSupported => "mode not supported",
            DfuStatus::ModeStateError => "mode state error",
            DfuStatus::BlockErr => "block error",
        };
        f.write_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dfu_status_wire_values() {
        for code in 0u8..=5 {
            let status = DfuStatus::try_from(code).unwrap();
            assert_eq!(u8::from(status), code);
        }
        assert_eq!(DfuStatus::try_from(0x06), Err(0x06));
        assert!(DfuStatus::Ok.is_ok());
        assert!(!DfuStatus::BlockErr.is_ok());
    }

    #[test]
    fn test_sample_errors() {
        let crc = ProtocolError::ChecksumError {
            kind: RecordKind::Tick,
            stored: 0,
            computed: 1,
        };
        assert!(crc.is_sample_error());
        assert!(!ProtocolError::ChannelNotOpen.is_sample_error());
    }

    #[test]
    fn test_error_display() {
        let err = ProtocolError::UnsupportedOnTransport {
            opcode: 0x11,
            transport: TransportKind::Spi,
        };
        assert_eq!(err.to_string(), "Opcode 0x11 is not supported on SPI");
    }
}
