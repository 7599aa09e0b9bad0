//! Record and constant definitions for the PRF protocol.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crc::CRC_SIZE;
use crate::error::{DfuStatus, ProtocolError};

/// Length of the device serial number.
pub const SERIAL_NO_LEN: usize = 6;

/// Number of FIR coefficients in the tuner option record.
pub const FIR_TAPS: usize = 23;

/// Mode I has 12 FIBs in each transmission frame.
pub const NO_TF_FIBS: usize = 12;

/// Size of one Fast Information Block.
pub const FIB_SIZE: usize = 32;

/// FIC + 544 kbit/s (204 CU) gross capacity of one transmission frame.
pub const MAX_TF_SIZE: usize = 7680;

/// IQ diagram sample count.
pub const IQ_SAMPLES: usize = 3072;

/// Spectrum bin count.
pub const SPECTRUM_BINS: usize = 2048;

/// Impulse response length.
pub const IMPULSE_RESPONSE_LEN: usize = 1008;

/// Maximum transmitters reported in one TII record.
pub const TII_MAX_ENTRIES: usize = 16;

/// Payload capacity of one DFU block.
pub const DFU_BLOCK_SIZE: usize = 1024;

/// Selector byte + update counter at the start of every telemetry record.
pub const TELEMETRY_HEADER_SIZE: usize = 5;

/// Protocol header revision.
///
/// V1 is the legacy field set. V2 adds transmitter identification, DFU,
/// subchannel addressing metadata and the TII processing option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProtocolVersion {
    V1 = 1,
    V2 = 2,
}

impl ProtocolVersion {
    /// The revision this build speaks by default.
    pub const CURRENT: ProtocolVersion = ProtocolVersion::V2;

    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            1 => Ok(ProtocolVersion::V1),
            2 => Ok(ProtocolVersion::V2),
            v => Err(v),
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.as_u8())
    }
}

/// Every fixed-layout record the device and host exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    SerialNo,
    DabConfig,
    TunerOption,
    ProcessOption,
    PwsConfig,
    PwsStatus,
    Version,
    TunerRegister,
    PortValue,
    SignalInfo,
    FibInfo,
    Subchannel,
    Iq,
    Spectrum,
    ImpulseResponse,
    Tii,
    Tick,
    DfuMode,
    DfuBlock,
    DfuAck,
}

impl RecordKind {
    /// Fixed wire size (including the checksum trailer) in `version`, or
    /// `None` if the record does not exist there.
    pub const fn size(self, version: ProtocolVersion) -> Option<usize> {
        let v2 = matches!(version, ProtocolVersion::V2);
        let body = match self {
            RecordKind::SerialNo => SERIAL_NO_LEN,
            RecordKind::DabConfig => 1,
            RecordKind::TunerOption => 2 + FIR_TAPS,
            RecordKind::ProcessOption => {
                if v2 {
                    5 + 4 + 4 + 2
                } else {
                    5 + 4 + 4
                }
            }
            RecordKind::PwsConfig => 6,
            RecordKind::PwsStatus => 1,
            RecordKind::Version => 4,
            RecordKind::TunerRegister => 4,
            RecordKind::PortValue => 1,
            RecordKind::SignalInfo => TELEMETRY_HEADER_SIZE + 16,
            RecordKind::FibInfo => TELEMETRY_HEADER_SIZE + NO_TF_FIBS * FIB_SIZE + NO_TF_FIBS + 4,
            RecordKind::Subchannel => {
                if v2 {
                    TELEMETRY_HEADER_SIZE + 6 + MAX_TF_SIZE + 2
                } else {
                    TELEMETRY_HEADER_SIZE + MAX_TF_SIZE + 2
                }
            }
            RecordKind::Iq => TELEMETRY_HEADER_SIZE + IQ_SAMPLES,
            RecordKind::Spectrum => TELEMETRY_HEADER_SIZE + SPECTRUM_BINS,
            RecordKind::ImpulseResponse => TELEMETRY_HEADER_SIZE + IMPULSE_RESPONSE_LEN,
            RecordKind::Tii => {
                if !v2 {
                    return None;
                }
                TELEMETRY_HEADER_SIZE + 1 + TII_MAX_ENTRIES * 4
            }
            RecordKind::Tick => TELEMETRY_HEADER_SIZE,
            RecordKind::DfuMode => {
                if !v2 {
                    return None;
                }
                5
            }
            RecordKind::DfuBlock => {
                if !v2 {
                    return None;
                }
                6 + DFU_BLOCK_SIZE
            }
            RecordKind::DfuAck => {
                if !v2 {
                    return None;
                }
                5
            }
        };
        Some(body + CRC_SIZE)
    }

    /// Size in `version`, or `UnsupportedInVersion`.
    pub fn size_in(self, version: ProtocolVersion) -> Result<usize, ProtocolError> {
        self.size(version)
            .ok_or(ProtocolError::UnsupportedInVersion { kind: self, version })
    }

    /// The telemetry kind this record is streamed as, if any.
    pub const fn telemetry(self) -> Option<TelemetryKind> {
        match self {
            RecordKind::SignalInfo => Some(TelemetryKind::SignalInfo),
            RecordKind::FibInfo => Some(TelemetryKind::FibInfo),
            RecordKind::Subchannel => Some(TelemetryKind::Subchannel),
            RecordKind::Iq => Some(TelemetryKind::Iq),
            RecordKind::Spectrum => Some(TelemetryKind::Spectrum),
            RecordKind::ImpulseResponse => Some(TelemetryKind::ImpulseResponse),
            RecordKind::Tii => Some(TelemetryKind::Tii),
            RecordKind::Tick => Some(TelemetryKind::Tick),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RecordKind::SerialNo => "serial number",
            RecordKind::DabConfig => "DAB config",
            RecordKind::TunerOption => "tuner option",
            RecordKind::ProcessOption => "process option",
            RecordKind::PwsConfig => "PWS config",
            RecordKind::PwsStatus => "PWS status",
            RecordKind::Version => "version",
            RecordKind::TunerRegister => "tuner register",
            RecordKind::PortValue => "port value",
            RecordKind::SignalInfo => "signal info",
            RecordKind::FibInfo => "FIB info",
            RecordKind::Subchannel => "subchannel",
            RecordKind::Iq => "IQ",
            RecordKind::Spectrum => "spectrum",
            RecordKind::ImpulseResponse => "impulse response",
            RecordKind::Tii => "TII",
            RecordKind::Tick => "tick",
            RecordKind::DfuMode => "DFU mode",
            RecordKind::DfuBlock => "DFU block",
            RecordKind::DfuAck => "DFU ack",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Telemetry record kinds that can be multiplexed into mask data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TelemetryKind {
    SignalInfo,
    FibInfo,
    Subchannel,
    Iq,
    Spectrum,
    ImpulseResponse,
    Tii,
    Tick,
}

impl TelemetryKind {
    /// Concatenation order inside a composite buffer. Independent of the
    /// numeric order of the mask bits (TII has the highest bit but precedes
    /// tick).
    pub const CANONICAL_ORDER: [TelemetryKind; 8] = [
        TelemetryKind::SignalInfo,
        TelemetryKind::FibInfo,
        TelemetryKind::Subchannel,
        TelemetryKind::Iq,
        TelemetryKind::Spectrum,
        TelemetryKind::ImpulseResponse,
        TelemetryKind::Tii,
        TelemetryKind::Tick,
    ];

    /// Mask bit, also written as the record's leading selector byte.
    pub const fn mask_bit(self) -> u8 {
        match self {
            TelemetryKind::SignalInfo => 0x01,
            TelemetryKind::FibInfo => 0x02,
            TelemetryKind::Subchannel => 0x04,
            TelemetryKind::Iq => 0x08,
            TelemetryKind::Spectrum => 0x10,
            TelemetryKind::ImpulseResponse => 0x20,
            TelemetryKind::Tick => 0x40,
            TelemetryKind::Tii => 0x80,
        }
    }

    pub const fn record_kind(self) -> RecordKind {
        match self {
            TelemetryKind::SignalInfo => RecordKind::SignalInfo,
            TelemetryKind::FibInfo => RecordKind::FibInfo,
            TelemetryKind::Subchannel => RecordKind::Subchannel,
            TelemetryKind::Iq => RecordKind::Iq,
            TelemetryKind::Spectrum => RecordKind::Spectrum,
            TelemetryKind::ImpulseResponse => RecordKind::ImpulseResponse,
            TelemetryKind::Tii => RecordKind::Tii,
            TelemetryKind::Tick => RecordKind::Tick,
        }
    }

    /// Look up a kind by its selector byte.
    pub fn from_selector(selector: u8) -> Option<Self> {
        Self::CANONICAL_ORDER
            .iter()
            .copied()
            .find(|kind| kind.mask_bit() == selector)
    }

    pub const fn is_available(self, version: ProtocolVersion) -> bool {
        self.record_kind().size(version).is_some()
    }
}

impl fmt::Display for TelemetryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.record_kind().name())
    }
}

/// Set of telemetry kinds selected for the composite mask-data buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Mask(u8);

impl Mask {
    pub const EMPTY: Mask = Mask(0);

    pub const fn from_bits(bits: u8) -> Self {
        Mask(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn with(self, kind: TelemetryKind) -> Self {
        Mask(self.0 | kind.mask_bit())
    }

    #[must_use]
    pub const fn without(self, kind: TelemetryKind) -> Self {
        Mask(self.0 & !kind.mask_bit())
    }

    pub const fn contains(self, kind: TelemetryKind) -> bool {
        self.0 & kind.mask_bit() != 0
    }

    /// Enabled kinds in canonical order.
    pub fn kinds(self) -> impl Iterator<Item = TelemetryKind> {
        TelemetryKind::CANONICAL_ORDER
            .into_iter()
            .filter(move |kind| self.contains(*kind))
    }

    /// Fail if the mask selects a kind that `version` does not have.
    pub fn validate(self, version: ProtocolVersion) -> Result<(), ProtocolError> {
        match self.kinds().find(|kind| !kind.is_available(version)) {
            Some(kind) => Err(ProtocolError::UnsupportedInVersion {
                kind: kind.record_kind(),
                version,
            }),
            None => Ok(()),
        }
    }

    /// Mask with every kind available in `version`.
    pub fn all(version: ProtocolVersion) -> Self {
        TelemetryKind::CANONICAL_ORDER
            .into_iter()
            .filter(|kind| kind.is_available(version))
            .collect()
    }
}

impl FromIterator<TelemetryKind> for Mask {
    fn from_iter<I: IntoIterator<Item = TelemetryKind>>(iter: I) -> Self {
        iter.into_iter().fold(Mask::EMPTY, Mask::with)
    }
}

impl fmt::Display for Mask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

/// Where a configuration write lands on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Storage {
    /// Written to flash; survives restart.
    Persistent,
    /// Applied to the running device only.
    Volatile,
}

// ---------------------------------------------------------------------------
// Configuration records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SerialNo {
    pub serial: [u8; SERIAL_NO_LEN],
}

impl SerialNo {
    /// Build from text, padding with NUL.
    pub fn from_text(text: &str) -> Result<Self, ProtocolError> {
        let bytes = text.as_bytes();
        if bytes.len() > SERIAL_NO_LEN {
            return Err(ProtocolError::FieldOutOfRange {
                field: "serial",
                value: bytes.len(),
                limit: SERIAL_NO_LEN,
            });
        }
        let mut serial = [0u8; SERIAL_NO_LEN];
        serial[..bytes.len()].copy_from_slice(bytes);
        Ok(Self { serial })
    }

    /// Text form with trailing NUL padding removed.
    pub fn as_text(&self) -> String {
        let end = self
            .serial
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(SERIAL_NO_LEN);
        String::from_utf8_lossy(&self.serial[..end]).into_owned()
    }
}

/// DAB tuning. `channel_idx` indexes the device's VHF frequency table;
/// changing it re-tunes and drops in-flight data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DabConfig {
    pub channel_idx: i8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TunerOption {
    pub use_digital_diode: bool,
    pub use_bb_filter_770: bool,
    pub fir: [u8; FIR_TAPS],
}

/// Output mode of USB endpoint 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsbOutput {
    /// Tuner samples forwarded unprocessed.
    Raw = 0,
    /// Processed telemetry forwarded as mask data.
    #[default]
    MaskData = 1,
}

impl TryFrom<u8> for UsbOutput {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(UsbOutput::Raw),
            1 => Ok(UsbOutput::MaskData),
            v => Err(v),
        }
    }
}

/// Offset tuning. Typically written persistently since offset tuning runs
/// right at start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetOpt {
    /// Coarse + fine.
    #[default]
    Fine = 0,
    /// Coarse only.
    Coarse = 1,
    None = 2,
}

impl TryFrom<u8> for OffsetOpt {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(OffsetOpt::Fine),
            1 => Ok(OffsetOpt::Coarse),
            2 => Ok(OffsetOpt::None),
            v => Err(v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IqOpt {
    #[default]
    Raw = 0,
    Normalized = 1,
}

impl TryFrom<u8> for IqOpt {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(IqOpt::Raw),
            1 => Ok(IqOpt::Normalized),
            v => Err(v),
        }
    }
}

/// Rendering options of a spectrum-like diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct XyDiagramOpt {
    pub window_function: i8,
    pub y_scalar: u8,
    pub y_offset: u8,
    pub x_scalar: u8,
}

/// Transmitter identification processing (V2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TiiOption {
    pub enabled: bool,
    pub threshold: u8,
}

/// Processing options. Changes do not cause a re-tune.
///
/// `tii_opt` is the V2 extension: `None` is the V1 field set, `Some` the V2
/// field set. Coding with the other version fails with `LayoutMismatch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProcessOption {
    pub usb_output: UsbOutput,
    pub offset_opt: OffsetOpt,
    /// Multiples of 96 ms.
    pub fib_crc_trap_limit: u16,
    pub iq_opt: IqOpt,
    pub spectrum_opt: XyDiagramOpt,
    pub impulse_response_opt: XyDiagramOpt,
    #[serde(default)]
    pub tii_opt: Option<TiiOption>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PwsConfig {
    pub event_id_1: u8,
    pub event_id_2: u8,
    pub zone_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PwsStatus {
    pub triggered: bool,
}

/// Firmware and protocol revision reported by GET_VERSION.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Version {
    pub protocol: u8,
    pub fw_major: u8,
    pub fw_minor: u8,
    pub fw_patch: u8,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "firmware {}.{}.{} (protocol {})",
            self.fw_major, self.fw_minor, self.fw_patch, self.protocol
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TunerRegister {
    pub address: u16,
    pub value: u16,
}

/// Value written to a tile1 GPIO port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PortValue {
    pub value: u8,
}

// ---------------------------------------------------------------------------
// Telemetry records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignalInfo {
    pub update_counter: u32,
    pub coarse_offset: i32,
    pub fine_offset_accum: i32,
    pub fine_offset: i16,
    pub ratio: u8,
    pub is_tii: bool,
    pub power_in: i8,
    pub is_blocker: bool,
    pub temperature: i16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FibInfo {
    pub update_counter: u32,
    /// Exactly `NO_TF_FIBS * FIB_SIZE` bytes.
    pub fib_data: Vec<u8>,
    pub fib_crc_errors: [i8; NO_TF_FIBS],
    pub bit_errors: u16,
    pub used_ber_bits: u16,
}

impl Default for FibInfo {
    fn default() -> Self {
        Self {
            update_counter: 0,
            fib_data: vec![0; NO_TF_FIBS * FIB_SIZE],
            fib_crc_errors: [0; NO_TF_FIBS],
            bit_errors: 0,
            used_ber_bits: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubchannelFormat {
    /// Subchannel bits as received.
    #[default]
    Raw = 0,
    /// Deinterleaved and error corrected.
    Processed = 1,
}

impl TryFrom<u8> for SubchannelFormat {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(SubchannelFormat::Raw),
            1 => Ok(SubchannelFormat::Processed),
            v => Err(v),
        }
    }
}

/// Per-subchannel addressing (V2), mirroring FIG 0/1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubchannelAddress {
    pub format: SubchannelFormat,
    /// -1 when no subchannel is selected.
    pub subch_id: i8,
    /// In capacity units; 0xFFFF when unknown.
    pub start_address: u16,
    /// In capacity units.
    pub subch_size: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Subchannel {
    pub update_counter: u32,
    /// `None` in V1, `Some` in V2.
    pub address: Option<SubchannelAddress>,
    /// At most `MAX_TF_SIZE` bytes; the wire carries its length as `act_len`.
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iq {
    pub update_counter: u32,
    /// Exactly `IQ_SAMPLES` values.
    pub data: Vec<i8>,
}

impl Default for Iq {
    fn default() -> Self {
        Self {
            update_counter: 0,
            data: vec![0; IQ_SAMPLES],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spectrum {
    pub update_counter: u32,
    /// Exactly `SPECTRUM_BINS` values.
    pub data: Vec<u8>,
}

impl Default for Spectrum {
    fn default() -> Self {
        Self {
            update_counter: 0,
            data: vec![0; SPECTRUM_BINS],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImpulseResponse {
    pub update_counter: u32,
    /// Exactly `IMPULSE_RESPONSE_LEN` values.
    pub data: Vec<u8>,
}

impl Default for ImpulseResponse {
    fn default() -> Self {
        Self {
            update_counter: 0,
            data: vec![0; IMPULSE_RESPONSE_LEN],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TiiEntry {
    pub main_id: u8,
    pub sub_id: u8,
    pub level: i16,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Tii {
    pub update_counter: u32,
    /// At most `TII_MAX_ENTRIES`.
    pub entries: Vec<TiiEntry>,
}

/// Heartbeat; one per sampling interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tick {
    pub update_counter: u32,
}

// ---------------------------------------------------------------------------
// Firmware update records
// ---------------------------------------------------------------------------

/// DFU session state, also the wire value of the mode record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum DfuState {
    #[default]
    Stopped = 0,
    Enter = 1,
    Started = 2,
    Download = 3,
    Upload = 4,
    RevertFactory = 5,
    Exit = 6,
}

impl TryFrom<u8> for DfuState {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(DfuState::Stopped),
            1 => Ok(DfuState::Enter),
            2 => Ok(DfuState::Started),
            3 => Ok(DfuState::Download),
            4 => Ok(DfuState::Upload),
            5 => Ok(DfuState::RevertFactory),
            6 => Ok(DfuState::Exit),
            v => Err(v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DfuMode {
    pub state: DfuState,
    /// Only meaningful with `DfuState::Started`.
    pub total_blocks: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DfuBlock {
    pub sequence: u32,
    /// At most `DFU_BLOCK_SIZE` bytes; the wire carries its length.
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfuAck {
    pub block: u32,
    pub status: DfuStatus,
}

// ---------------------------------------------------------------------------
// Dynamic wrappers
// ---------------------------------------------------------------------------

/// One decoded telemetry record of any kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelemetryRecord {
    SignalInfo(SignalInfo),
    FibInfo(FibInfo),
    Subchannel(Subchannel),
    Iq(Iq),
    Spectrum(Spectrum),
    ImpulseResponse(ImpulseResponse),
    Tii(Tii),
    Tick(Tick),
}

impl TelemetryRecord {
    pub fn kind(&self) -> TelemetryKind {
        match self {
            TelemetryRecord::SignalInfo(_) => TelemetryKind::SignalInfo,
            TelemetryRecord::FibInfo(_) => TelemetryKind::FibInfo,
            TelemetryRecord::Subchannel(_) => TelemetryKind::Subchannel,
            TelemetryRecord::Iq(_) => TelemetryKind::Iq,
            TelemetryRecord::Spectrum(_) => TelemetryKind::Spectrum,
            TelemetryRecord::ImpulseResponse(_) => TelemetryKind::ImpulseResponse,
            TelemetryRecord::Tii(_) => TelemetryKind::Tii,
            TelemetryRecord::Tick(_) => TelemetryKind::Tick,
        }
    }

    pub fn update_counter(&self) -> u32 {
        match self {
            TelemetryRecord::SignalInfo(r) => r.update_counter,
            TelemetryRecord::FibInfo(r) => r.update_counter,
            TelemetryRecord::Subchannel(r) => r.update_counter,
            TelemetryRecord::Iq(r) => r.update_counter,
            TelemetryRecord::Spectrum(r) => r.update_counter,
            TelemetryRecord::ImpulseResponse(r) => r.update_counter,
            TelemetryRecord::Tii(r) => r.update_counter,
            TelemetryRecord::Tick(r) => r.update_counter,
        }
    }
}

/// One decoded record of any kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnyRecord {
    SerialNo(SerialNo),
    DabConfig(DabConfig),
    TunerOption(TunerOption),
    ProcessOption(ProcessOption),
    PwsConfig(PwsConfig),
    PwsStatus(PwsStatus),
    Version(Version),
    TunerRegister(TunerRegister),
    PortValue(PortValue),
    Telemetry(TelemetryRecord),
    DfuMode(DfuMode),
    DfuBlock(DfuBlock),
    DfuAck(DfuAck),
}

impl AnyRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            AnyRecord::SerialNo(_) => RecordKind::SerialNo,
            AnyRecord::DabConfig(_) => RecordKind::DabConfig,
            AnyRecord::TunerOption(_) => RecordKind::TunerOption,
            AnyRecord::ProcessOption(_) => RecordKind::ProcessOption,
            AnyRecord::PwsConfig(_) => RecordKind::PwsConfig,
            AnyRecord::PwsStatus(_) => RecordKind::PwsStatus,
            AnyRecord::Version(_) => RecordKind::Version,
            AnyRecord::TunerRegister(_) => RecordKind::TunerRegister,
            AnyRecord::PortValue(_) => RecordKind::PortValue,
            AnyRecord::Telemetry(t) => t.kind().record_kind(),
            AnyRecord::DfuMode(_) => RecordKind::DfuMode,
            AnyRecord::DfuBlock(_) => RecordKind::DfuBlock,
            AnyRecord::DfuAck(_) => RecordKind::DfuAck,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sizes_v2() {
        let v = ProtocolVersion::V2;
        assert_eq!(RecordKind::SerialNo.size(v), Some(10));
        assert_eq!(RecordKind::DabConfig.size(v), Some(5));
        assert_eq!(RecordKind::TunerOption.size(v), Some(29));
        assert_eq!(RecordKind::ProcessOption.size(v), Some(19));
        assert_eq!(RecordKind::PwsConfig.size(v), Some(10));
        assert_eq!(RecordKind::PwsStatus.size(v), Some(5));
        assert_eq!(RecordKind::SignalInfo.size(v), Some(25));
        assert_eq!(RecordKind::FibInfo.size(v), Some(409));
        assert_eq!(RecordKind::Subchannel.size(v), Some(7697));
        assert_eq!(RecordKind::Iq.size(v), Some(3081));
        assert_eq!(RecordKind::Spectrum.size(v), Some(2057));
        assert_eq!(RecordKind::ImpulseResponse.size(v), Some(1017));
        assert_eq!(RecordKind::Tii.size(v), Some(74));
        assert_eq!(RecordKind::Tick.size(v), Some(9));
        assert_eq!(RecordKind::DfuMode.size(v), Some(9));
        assert_eq!(RecordKind::DfuBlock.size(v), Some(1034));
        assert_eq!(RecordKind::DfuAck.size(v), Some(9));
    }

    #[test]
    fn test_record_sizes_v1() {
        let v = ProtocolVersion::V1;
        assert_eq!(RecordKind::ProcessOption.size(v), Some(17));
        assert_eq!(RecordKind::Subchannel.size(v), Some(7691));
        assert_eq!(RecordKind::Tii.size(v), None);
        assert_eq!(RecordKind::DfuBlock.size(v), None);
        assert!(matches!(
            RecordKind::DfuAck.size_in(v),
            Err(ProtocolError::UnsupportedInVersion { .. })
        ));
    }

    #[test]
    fn test_mask_canonical_order() {
        // TII has bit 7 but comes before tick (bit 6).
        let mask: Mask = [TelemetryKind::Tick, TelemetryKind::Tii, TelemetryKind::SignalInfo]
            .into_iter()
            .collect();
        assert_eq!(mask.bits(), 0xC1);
        let kinds: Vec<_> = mask.kinds().collect();
        assert_eq!(
            kinds,
            vec![TelemetryKind::SignalInfo, TelemetryKind::Tii, TelemetryKind::Tick]
        );
    }

    #[test]
    fn test_mask_validate() {
        let mask = Mask::EMPTY.with(TelemetryKind::Tii);
        assert!(mask.validate(ProtocolVersion::V2).is_ok());
        assert!(mask.validate(ProtocolVersion::V1).is_err());
        assert_eq!(Mask::all(ProtocolVersion::V1).bits(), 0x7F);
        assert_eq!(Mask::all(ProtocolVersion::V2).bits(), 0xFF);
    }

    #[test]
    fn test_selector_lookup() {
        for kind in TelemetryKind::CANONICAL_ORDER {
            assert_eq!(TelemetryKind::from_selector(kind.mask_bit()), Some(kind));
        }
        assert_eq!(TelemetryKind::from_selector(0x03), None);
    }

    #[test]
    fn test_serial_text() {
        let serial = SerialNo::from_text("PRF01").unwrap();
        assert_eq!(serial.serial, *b"PRF01\0");
        assert_eq!(serial.as_text(), "PRF01");
        assert!(SerialNo::from_text("TOOLONG").is_err());
    }

    #[test]
    fn test_version_negotiation_values() {
        assert_eq!(ProtocolVersion::try_from(2), Ok(ProtocolVersion::V2));
        assert_eq!(ProtocolVersion::try_from(3), Err(3));
        assert_eq!(ProtocolVersion::CURRENT.to_string(), "v2");
    }
}
