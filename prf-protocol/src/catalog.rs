//! Command catalog.
//!
//! Opcode convention:
//! - bit 7 clear: write ("set"), the request carries a record
//! - bit 7 set, bit 6 clear: full-record read
//! - bits 7 and 6 set: single-value read (one byte response)
//!
//! The persistent configuration writes occupy the contiguous block starting
//! at 0x01. The catalog is checked at compile time; adding a command that
//! breaks one of the rules fails the build.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::{ProtocolVersion, RecordKind, Storage};

/// Physical path a transaction travels over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Half-duplex SPI bus to the PRF board.
    Spi,
    /// USB control endpoint.
    UsbControl,
    /// USB streaming endpoint.
    UsbStream,
}

impl TransportKind {
    const fn bit(self) -> u8 {
        match self {
            TransportKind::Spi => 0x01,
            TransportKind::UsbControl => 0x02,
            TransportKind::UsbStream => 0x04,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TransportKind::Spi => "SPI",
            TransportKind::UsbControl => "USB control",
            TransportKind::UsbStream => "USB stream",
        };
        f.write_str(text)
    }
}

/// Set of transports a command may be issued on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Transports(u8);

impl Transports {
    pub const SPI: Transports = Transports(0x01);
    pub const USB_CONTROL: Transports = Transports(0x02);
    pub const USB_STREAM: Transports = Transports(0x04);
    /// SPI and the USB control endpoint; everything but the stream.
    pub const CONTROL: Transports = Transports(0x03);
    pub const USB: Transports = Transports(0x06);
    pub const ALL: Transports = Transports(0x07);

    pub const fn contains(self, kind: TransportKind) -> bool {
        self.0 & kind.bit() != 0
    }
}

/// Direction and response shape of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Write,
    Read,
    ReadValue,
}

impl Access {
    /// Access class implied by the opcode bits.
    pub const fn of_opcode(opcode: u8) -> Access {
        if opcode & 0x80 == 0 {
            Access::Write
        } else if opcode & 0xC0 == 0xC0 {
            Access::ReadValue
        } else {
            Access::Read
        }
    }
}

/// Every command the device understands. The discriminant indexes
/// [`CATALOG`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    SetDabConfigPersistent,
    SetDabConfigVolatile,
    SetTunerOptionPersistent,
    SetTunerOptionVolatile,
    SetProcessOptionPersistent,
    SetProcessOptionVolatile,
    SetTile1Port4B,
    SetTile1Port4C,
    SetPwsConfig,
    SetTunerRegister,
    SetSerialNo,
    SetMask,
    SetDfuMode,
    SetDfuBlock,
    GetDabConfigPersistent,
    GetDabConfigVolatile,
    GetTunerOptionPersistent,
    GetTunerOptionVolatile,
    GetProcessOptionPersistent,
    GetProcessOptionVolatile,
    GetPwsConfig,
    GetPwsStatus,
    GetVersion,
    GetSerialNo,
    GetSignalInfo,
    GetDfuMode,
    GetDfuAck,
    GetDfuBlock,
    GetMaskData,
    Ping,
}

/// Static description of one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    pub command: Command,
    pub name: &'static str,
    pub opcode: u8,
    pub access: Access,
    /// Record carried by the request (writes) or response (reads).
    pub record: Option<RecordKind>,
    pub storage: Option<Storage>,
    pub transports: Transports,
}

const fn spec(
    command: Command,
    name: &'static str,
    opcode: u8,
    access: Access,
    record: Option<RecordKind>,
    storage: Option<Storage>,
    transports: Transports,
) -> CommandSpec {
    CommandSpec {
        command,
        name,
        opcode,
        access,
        record,
        storage,
        transports,
    }
}

use Access::{Read, ReadValue, Write};
use Storage::{Persistent, Volatile};

pub const CATALOG: &[CommandSpec] = &[
    spec(Command::SetDabConfigPersistent, "SET_DAB_CONFIG_PERSISTENT", 0x01, Write, Some(RecordKind::DabConfig), Some(Persistent), Transports::ALL),
    spec(Command::SetDabConfigVolatile, "SET_DAB_CONFIG_VOLATILE", 0x02, Write, Some(RecordKind::DabConfig), Some(Volatile), Transports::ALL),
    spec(Command::SetTunerOptionPersistent, "SET_TUNER_OPTION_PERSISTENT", 0x03, Write, Some(RecordKind::TunerOption), Some(Persistent), Transports::ALL),
    spec(Command::SetTunerOptionVolatile, "SET_TUNER_OPTION_VOLATILE", 0x04, Write, Some(RecordKind::TunerOption), Some(Volatile), Transports::ALL),
    spec(Command::SetProcessOptionPersistent, "SET_PROCESS_OPTION_PERSISTENT", 0x05, Write, Some(RecordKind::ProcessOption), Some(Persistent), Transports::ALL),
    spec(Command::SetProcessOptionVolatile, "SET_PROCESS_OPTION_VOLATILE", 0x06, Write, Some(RecordKind::ProcessOption), Some(Volatile), Transports::ALL),
    spec(Command::SetTile1Port4B, "SET_TILE1_PORT_4B", 0x07, Write, Some(RecordKind::PortValue), None, Transports::ALL),
    spec(Command::SetTile1Port4C, "SET_TILE1_PORT_4C", 0x08, Write, Some(RecordKind::PortValue), None, Transports::ALL),
    spec(Command::SetPwsConfig, "SET_PWS_CONFIG", 0x09, Write, Some(RecordKind::PwsConfig), None, Transports::ALL),
    spec(Command::SetTunerRegister, "SET_TUNER_REGISTER", 0x0a, Write, Some(RecordKind::TunerRegister), None, Transports::ALL),
    spec(Command::SetSerialNo, "SET_SERIAL_NO", 0x0b, Write, Some(RecordKind::SerialNo), None, Transports::ALL),
    spec(Command::SetMask, "SET_MASK", 0x11, Write, None, None, Transports::USB_STREAM),
    spec(Command::SetDfuMode, "SET_DFU_MODE", 0x20, Write, Some(RecordKind::DfuMode), None, Transports::CONTROL),
    spec(Command::SetDfuBlock, "SET_DFU_BLOCK", 0x21, Write, Some(RecordKind::DfuBlock), None, Transports::CONTROL),
    spec(Command::GetDabConfigPersistent, "GET_DAB_CONFIG_PERSISTENT", 0x81, Read, Some(RecordKind::DabConfig), Some(Persistent), Transports::ALL),
    spec(Command::GetDabConfigVolatile, "GET_DAB_CONFIG_VOLATILE", 0x82, Read, Some(RecordKind::DabConfig), Some(Volatile), Transports::ALL),
    spec(Command::GetTunerOptionPersistent, "GET_TUNER_OPTION_PERSISTENT", 0x83, Read, Some(RecordKind::TunerOption), Some(Persistent), Transports::ALL),
    spec(Command::GetTunerOptionVolatile, "GET_TUNER_OPTION_VOLATILE", 0x84, Read, Some(RecordKind::TunerOption), Some(Volatile), Transports::ALL),
    spec(Command::GetProcessOptionPersistent, "GET_PROCESS_OPTION_PERSISTENT", 0x85, Read, Some(RecordKind::ProcessOption), Some(Persistent), Transports::ALL),
    spec(Command::GetProcessOptionVolatile, "GET_PROCESS_OPTION_VOLATILE", 0x86, Read, Some(RecordKind::ProcessOption), Some(Volatile), Transports::ALL),
    spec(Command::GetPwsConfig, "GET_PWS_CONFIG", 0x87, Read, Some(RecordKind::PwsConfig), None, Transports::ALL),
    spec(Command::GetPwsStatus, "GET_PWS_STATUS", 0x88, Read, Some(RecordKind::PwsStatus), None, Transports::ALL),
    spec(Command::GetVersion, "GET_VERSION", 0x89, Read, Some(RecordKind::Version), None, Transports::ALL),
    spec(Command::GetSerialNo, "GET_SERIAL_NO", 0x8a, Read, Some(RecordKind::SerialNo), None, Transports::ALL),
    spec(Command::GetSignalInfo, "GET_SIGNAL_INFO", 0x90, Read, Some(RecordKind::SignalInfo), None, Transports::USB),
    spec(Command::GetDfuMode, "GET_DFU_MODE", 0xa0, Read, Some(RecordKind::DfuMode), None, Transports::CONTROL),
    spec(Command::GetDfuAck, "GET_DFU_ACK", 0xa1, Read, Some(RecordKind::DfuAck), None, Transports::CONTROL),
    spec(Command::GetDfuBlock, "GET_DFU_BLOCK", 0xa2, Read, Some(RecordKind::DfuBlock), None, Transports::CONTROL),
    spec(Command::GetMaskData, "GET_MASK_DATA", 0xc0, ReadValue, None, None, Transports::ALL),
    spec(Command::Ping, "PING", 0xc1, ReadValue, None, None, Transports::ALL),
];

/// First opcode above the persistent configuration block.
const CONFIG_BLOCK_END: u8 = 0x10;

const fn catalog_is_consistent(catalog: &[CommandSpec]) -> bool {
    let mut i = 0;
    let mut config_writes = 0u8;
    let mut highest_config = 0u8;
    while i < catalog.len() {
        let entry = &catalog[i];

        // Indexed by discriminant.
        if entry.command as usize != i {
            return false;
        }

        // Access class agrees with the opcode bits.
        let implied = Access::of_opcode(entry.opcode);
        let agrees = match entry.access {
            Access::Write => matches!(implied, Access::Write),
            Access::Read => matches!(implied, Access::Read) && entry.record.is_some(),
            Access::ReadValue => matches!(implied, Access::ReadValue) && entry.record.is_none(),
        };
        if !agrees {
            return false;
        }

        let mut j = i + 1;
        while j < catalog.len() {
            if catalog[j].opcode == entry.opcode {
                return false;
            }
            j += 1;
        }

        if entry.opcode == 0 {
            return false;
        }
        if entry.opcode < CONFIG_BLOCK_END {
            config_writes += 1;
            if entry.opcode > highest_config {
                highest_config = entry.opcode;
            }
        }
        i += 1;
    }
    // Distinct opcodes 0x01..=highest with no gap.
    config_writes == highest_config
}

const _: () = assert!(
    catalog_is_consistent(CATALOG),
    "command catalog violates the opcode convention"
);

impl Command {
    pub fn spec(self) -> &'static CommandSpec {
        &CATALOG[self as usize]
    }

    pub fn opcode(self) -> u8 {
        self.spec().opcode
    }

    pub fn access(self) -> Access {
        self.spec().access
    }

    pub fn record(self) -> Option<RecordKind> {
        self.spec().record
    }

    pub fn name(self) -> &'static str {
        self.spec().name
    }

    pub fn from_opcode(opcode: u8) -> Result<Command, ProtocolError> {
        CATALOG
            .iter()
            .find(|entry| entry.opcode == opcode)
            .map(|entry| entry.command)
            .ok_or(ProtocolError::UnknownOpcode(opcode))
    }

    /// Map a logical operation to its command.
    ///
    /// `storage` must be given for the commands that come in persistent and
    /// volatile variants and omitted otherwise.
    pub fn resolve(
        access: Access,
        record: RecordKind,
        storage: Option<Storage>,
    ) -> Result<Command, ProtocolError> {
        CATALOG
            .iter()
            .find(|entry| {
                entry.access == access && entry.record == Some(record) && entry.storage == storage
            })
            .map(|entry| entry.command)
            .ok_or_else(|| {
                let storage = match storage {
                    Some(Storage::Persistent) => " (persistent)",
                    Some(Storage::Volatile) => " (volatile)",
                    None => "",
                };
                ProtocolError::NoSuchCommand(format!("{:?} {}{}", access, record, storage))
            })
    }

    pub fn check_transport(self, transport: TransportKind) -> Result<(), ProtocolError> {
        let spec = self.spec();
        if spec.transports.contains(transport) {
            Ok(())
        } else {
            Err(ProtocolError::UnsupportedOnTransport {
                opcode: spec.opcode,
                transport,
            })
        }
    }

    /// Payload bytes following the opcode in the write phase.
    pub fn request_size(self, version: ProtocolVersion) -> Result<usize, ProtocolError> {
        let spec = self.spec();
        match (spec.access, spec.record) {
            (Access::Write, Some(kind)) => kind.size_in(version),
            // SET_MASK carries the bare mask byte.
            (Access::Write, None) => Ok(1),
            _ => Ok(0),
        }
    }

    /// Bytes received in the read phase. Zero for writes.
    pub fn response_size(self, version: ProtocolVersion) -> Result<usize, ProtocolError> {
        let spec = self.spec();
        match (spec.access, spec.record) {
            (Access::Read, Some(kind)) => kind.size_in(version),
            (Access::ReadValue, _) => Ok(1),
            _ => Ok(0),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), self.opcode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_convention() {
        for entry in CATALOG {
            let is_write = entry.opcode & 0x80 == 0;
            assert_eq!(is_write, entry.access == Access::Write, "{}", entry.name);
            if entry.opcode & 0xC0 == 0xC0 {
                assert_eq!(
                    entry.command.response_size(ProtocolVersion::V2).unwrap(),
                    1,
                    "{}",
                    entry.name
                );
            }
        }
    }

    #[test]
    fn test_config_block_contiguous() {
        let mut opcodes: Vec<u8> = CATALOG
            .iter()
            .map(|e| e.opcode)
            .filter(|&op| op < CONFIG_BLOCK_END)
            .collect();
        opcodes.sort_unstable();
        let expected: Vec<u8> = (0x01..=0x0b).collect();
        assert_eq!(opcodes, expected);
    }

    #[test]
    fn test_catalog_check_rejects_gap() {
        let mut broken = CATALOG.to_vec();
        // Move SET_SERIAL_NO out of the block, leaving 0x0b empty and 0x0c used.
        broken[Command::SetSerialNo as usize].opcode = 0x0c;
        assert!(!catalog_is_consistent(&broken));

        let mut misclassified = CATALOG.to_vec();
        misclassified[Command::Ping as usize].opcode = 0x91;
        assert!(!catalog_is_consistent(&misclassified));

        assert!(catalog_is_consistent(CATALOG));
    }

    #[test]
    fn test_from_opcode() {
        for entry in CATALOG {
            assert_eq!(Command::from_opcode(entry.opcode).unwrap(), entry.command);
            assert_eq!(entry.command.spec(), entry);
        }
        assert_eq!(
            Command::from_opcode(0x7F),
            Err(ProtocolError::UnknownOpcode(0x7F))
        );
    }

    #[test]
    fn test_resolve() {
        assert_eq!(
            Command::resolve(Access::Write, RecordKind::DabConfig, Some(Storage::Volatile)).unwrap(),
            Command::SetDabConfigVolatile
        );
        assert_eq!(
            Command::resolve(Access::Read, RecordKind::ProcessOption, Some(Storage::Persistent))
                .unwrap()
                .opcode(),
            0x85
        );
        assert_eq!(
            Command::resolve(Access::Read, RecordKind::PwsStatus, None).unwrap(),
            Command::GetPwsStatus
        );
        assert!(matches!(
            Command::resolve(Access::Write, RecordKind::PwsStatus, None),
            Err(ProtocolError::NoSuchCommand(_))
        ));
    }

    #[test]
    fn test_transport_restrictions() {
        assert!(Command::SetMask.check_transport(TransportKind::UsbStream).is_ok());
        assert_eq!(
            Command::SetMask.check_transport(TransportKind::Spi),
            Err(ProtocolError::UnsupportedOnTransport {
                opcode: 0x11,
                transport: TransportKind::Spi,
            })
        );
        assert!(Command::SetDfuBlock.check_transport(TransportKind::UsbStream).is_err());
        assert!(Command::SetDfuBlock.check_transport(TransportKind::Spi).is_ok());
        assert!(Command::GetMaskData.check_transport(TransportKind::Spi).is_ok());
        assert!(Command::GetSignalInfo.check_transport(TransportKind::Spi).is_err());
    }

    #[test]
    fn test_sizes() {
        let v2 = ProtocolVersion::V2;
        assert_eq!(Command::SetDabConfigPersistent.request_size(v2).unwrap(), 5);
        assert_eq!(Command::SetMask.request_size(v2).unwrap(), 1);
        assert_eq!(Command::GetVersion.request_size(v2).unwrap(), 0);
        assert_eq!(Command::GetVersion.response_size(v2).unwrap(), 8);
        assert_eq!(Command::SetPwsConfig.response_size(v2).unwrap(), 0);
        assert!(Command::GetDfuAck.response_size(ProtocolVersion::V1).is_err());
    }
}
