//! Command/telemetry protocol engine for the PRF DAB radio front-end.
//!
//! The host talks to the PRF board over a half-duplex SPI bus or USB. Each
//! transaction is a single opcode (plus a record for writes), followed for
//! reads by a fixed-size record protected by a CRC-32/MPEG-2 trailer.
//!
//! # Record Format
//!
//! ```text
//! +-------------------------------+----------+
//! |     Fields (packed, LE)       |  CRC32   |
//! +-------------------------------+----------+
//! |         size - 4 bytes        | u32 LE   |
//! +-------------------------------+----------+
//! ```
//!
//! Telemetry records additionally start with a selector byte and an update
//! counter, and can be concatenated into one mask-data buffer.
//!
//! # Example
//!
//! ```rust
//! use prf_protocol::{decode, encode, Command, DabConfig, ProtocolVersion};
//!
//! let version = ProtocolVersion::CURRENT;
//! let payload = encode(&DabConfig { channel_idx: 5 }, version).unwrap();
//! assert_eq!(payload.len(), 5);
//!
//! let decoded: DabConfig = decode(&payload, version).unwrap();
//! assert_eq!(decoded.channel_idx, 5);
//!
//! assert_eq!(Command::SetDabConfigVolatile.opcode(), 0x02);
//! ```
//!
//! # Modules
//!
//! - [`codec`]: record encode/decode with checksum verification
//! - [`catalog`]: opcode table and transport restrictions
//! - [`mask`]: composite telemetry buffers
//! - [`link`]: the serialized two-phase transaction discipline
//! - [`client`]: typed wrappers for every command
//! - [`dfu`]: firmware update session
//! - [`pws`]: warning registration matching and edge detection

pub mod catalog;
pub mod client;
pub mod codec;
pub mod crc;
pub mod dfu;
pub mod error;
pub mod link;
pub mod mask;
pub mod pws;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod types;

pub use catalog::{Access, Command, CommandSpec, TransportKind, Transports, CATALOG};
pub use client::{MaskData, PrfClient, Tile1Port};
pub use codec::{decode, decode_any, encode, encode_any, Record};
pub use crc::crc32_mpeg2;
pub use dfu::DfuSession;
pub use error::{DfuStatus, ProtocolError};
pub use link::{Channel, Link, Transaction};
pub use mask::{
    build_composite, composite_len, max_composite_size, parse_composite, CounterTracker,
    SampleSource,
};
pub use pws::{EventKey, TriggerTracker};
pub use types::{
    // Versioning and kinds
    Mask, ProtocolVersion, RecordKind, Storage, TelemetryKind,
    // Configuration records
    DabConfig, PortValue, ProcessOption, PwsConfig, PwsStatus, SerialNo, TunerOption,
    TunerRegister, Version,
    // Telemetry records
    AnyRecord, FibInfo, ImpulseResponse, Iq, SignalInfo, Spectrum, Subchannel, TelemetryRecord,
    Tick, Tii,
    // Firmware update
    DfuAck, DfuBlock, DfuMode, DfuState,
};
