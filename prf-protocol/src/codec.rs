//! Fixed-layout record codec.
//!
//! Record format:
//! ```text
//! +------------------------------+----------+
//! |     Fields (packed, LE)      |  CRC32   |
//! |                              |  u32 LE  |
//! +------------------------------+----------+
//! |       size - 4 bytes         | 4 bytes  |
//! +------------------------------+----------+
//! ```
//!
//! Telemetry records begin with a selector byte (the kind's mask bit) and a
//! u32 update counter. There are no length prefixes or markers: both sides
//! know every record size from the opcode and protocol version.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::warn;

use crate::crc::{crc32_mpeg2, stored_crc, CRC_SIZE};
use crate::error::{DfuStatus, ProtocolError};
use crate::types::*;

/// A fixed-layout record.
///
/// Implementations write and read the fields only; framing, size checks and
/// the checksum trailer are handled by [`encode`] and [`decode`]. `get_fields`
/// is only ever called with exactly `size - 4` bytes.
pub trait Record: Sized {
    const KIND: RecordKind;

    fn put_fields(&self, version: ProtocolVersion, buf: &mut BytesMut) -> Result<(), ProtocolError>;

    fn get_fields(version: ProtocolVersion, buf: &mut Bytes) -> Result<Self, ProtocolError>;
}

/// Encode a record with its checksum trailer.
pub fn encode<R: Record>(record: &R, version: ProtocolVersion) -> Result<Bytes, ProtocolError> {
    let size = R::KIND.size_in(version)?;
    let mut buf = BytesMut::with_capacity(size);
    record.put_fields(version, &mut buf)?;
    debug_assert_eq!(buf.len(), size - CRC_SIZE, "{} field layout", R::KIND);

    let crc = crc32_mpeg2(&buf);
    buf.put_u32_le(crc);
    Ok(buf.freeze())
}

/// Decode a record, verifying its size and checksum.
pub fn decode<R: Record>(bytes: &[u8], version: ProtocolVersion) -> Result<R, ProtocolError> {
    let body_len = verify(R::KIND, bytes, version)?;
    let mut body = Bytes::copy_from_slice(&bytes[..body_len]);
    R::get_fields(version, &mut body)
}

/// Check size and trailer of a raw record. Returns the body length.
pub fn verify(kind: RecordKind, bytes: &[u8], version: ProtocolVersion) -> Result<usize, ProtocolError> {
    let size = kind.size_in(version)?;
    if bytes.len() != size {
        return Err(ProtocolError::SizeMismatch {
            kind,
            expected: size,
            actual: bytes.len(),
        });
    }

    let body_len = size - CRC_SIZE;
    let computed = crc32_mpeg2(&bytes[..body_len]);
    let stored = stored_crc(bytes).unwrap_or_default();
    if computed != stored {
        warn!("{} checksum mismatch: trailer 0x{:08X}, computed 0x{:08X}", kind, stored, computed);
        return Err(ProtocolError::ChecksumError {
            kind,
            stored,
            computed,
        });
    }
    Ok(body_len)
}

/// Decode a record whose kind is only known at runtime.
pub fn decode_any(
    kind: RecordKind,
    bytes: &[u8],
    version: ProtocolVersion,
) -> Result<AnyRecord, ProtocolError> {
    Ok(match kind {
        RecordKind::SerialNo => AnyRecord::SerialNo(decode(bytes, version)?),
        RecordKind::DabConfig => AnyRecord::DabConfig(decode(bytes, version)?),
        RecordKind::TunerOption => AnyRecord::TunerOption(decode(bytes, version)?),
        RecordKind::ProcessOption => AnyRecord::ProcessOption(decode(bytes, version)?),
        RecordKind::PwsConfig => AnyRecord::PwsConfig(decode(bytes, version)?),
        RecordKind::PwsStatus => AnyRecord::PwsStatus(decode(bytes, version)?),
        RecordKind::Version => AnyRecord::Version(decode(bytes, version)?),
        RecordKind::TunerRegister => AnyRecord::TunerRegister(decode(bytes, version)?),
        RecordKind::PortValue => AnyRecord::PortValue(decode(bytes, version)?),
        RecordKind::DfuMode => AnyRecord::DfuMode(decode(bytes, version)?),
        RecordKind::DfuBlock => AnyRecord::DfuBlock(decode(bytes, version)?),
        RecordKind::DfuAck => AnyRecord::DfuAck(decode(bytes, version)?),
        RecordKind::SignalInfo
        | RecordKind::FibInfo
        | RecordKind::Subchannel
        | RecordKind::Iq
        | RecordKind::Spectrum
        | RecordKind::ImpulseResponse
        | RecordKind::Tii
        | RecordKind::Tick => {
            let telemetry = kind
                .telemetry()
                .ok_or_else(|| ProtocolError::NoSuchCommand(kind.to_string()))?;
            AnyRecord::Telemetry(decode_telemetry(telemetry, bytes, version)?)
        }
    })
}

/// Encode a record whose kind is only known at runtime.
pub fn encode_any(record: &AnyRecord, version: ProtocolVersion) -> Result<Bytes, ProtocolError> {
    match record {
        AnyRecord::SerialNo(r) => encode(r, version),
        AnyRecord::DabConfig(r) => encode(r, version),
        AnyRecord::TunerOption(r) => encode(r, version),
        AnyRecord::ProcessOption(r) => encode(r, version),
        AnyRecord::PwsConfig(r) => encode(r, version),
        AnyRecord::PwsStatus(r) => encode(r, version),
        AnyRecord::Version(r) => encode(r, version),
        AnyRecord::TunerRegister(r) => encode(r, version),
        AnyRecord::PortValue(r) => encode(r, version),
        AnyRecord::Telemetry(t) => encode_telemetry(t, version),
        AnyRecord::DfuMode(r) => encode(r, version),
        AnyRecord::DfuBlock(r) => encode(r, version),
        AnyRecord::DfuAck(r) => encode(r, version),
    }
}

/// Decode one telemetry record of a known kind.
pub fn decode_telemetry(
    kind: TelemetryKind,
    bytes: &[u8],
    version: ProtocolVersion,
) -> Result<TelemetryRecord, ProtocolError> {
    Ok(match kind {
        TelemetryKind::SignalInfo => TelemetryRecord::SignalInfo(decode(bytes, version)?),
        TelemetryKind::FibInfo => TelemetryRecord::FibInfo(decode(bytes, version)?),
        TelemetryKind::Subchannel => TelemetryRecord::Subchannel(decode(bytes, version)?),
        TelemetryKind::Iq => TelemetryRecord::Iq(decode(bytes, version)?),
        TelemetryKind::Spectrum => TelemetryRecord::Spectrum(decode(bytes, version)?),
        TelemetryKind::ImpulseResponse => TelemetryRecord::ImpulseResponse(decode(bytes, version)?),
        TelemetryKind::Tii => TelemetryRecord::Tii(decode(bytes, version)?),
        TelemetryKind::Tick => TelemetryRecord::Tick(decode(bytes, version)?),
    })
}

pub fn encode_telemetry(record: &TelemetryRecord, version: ProtocolVersion) -> Result<Bytes, ProtocolError> {
    match record {
        TelemetryRecord::SignalInfo(r) => encode(r, version),
        TelemetryRecord::FibInfo(r) => encode(r, version),
        TelemetryRecord::Subchannel(r) => encode(r, version),
        TelemetryRecord::Iq(r) => encode(r, version),
        TelemetryRecord::Spectrum(r) => encode(r, version),
        TelemetryRecord::ImpulseResponse(r) => encode(r, version),
        TelemetryRecord::Tii(r) => encode(r, version),
        TelemetryRecord::Tick(r) => encode(r, version),
    }
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(if value { 1 } else { 0 });
}

fn get_bool(buf: &mut Bytes) -> bool {
    buf.get_u8() != 0
}

fn put_telemetry_header(buf: &mut BytesMut, kind: TelemetryKind, update_counter: u32) {
    buf.put_u8(kind.mask_bit());
    buf.put_u32_le(update_counter);
}

fn get_telemetry_header(buf: &mut Bytes, kind: TelemetryKind) -> Result<u32, ProtocolError> {
    let selector = buf.get_u8();
    if selector != kind.mask_bit() {
        return Err(ProtocolError::SelectorMismatch {
            expected: kind.mask_bit(),
            actual: selector,
        });
    }
    Ok(buf.get_u32_le())
}

fn check_exact_len(field: &'static str, len: usize, expected: usize) -> Result<(), ProtocolError> {
    if len != expected {
        return Err(ProtocolError::FieldOutOfRange {
            field,
            value: len,
            limit: expected,
        });
    }
    Ok(())
}

fn check_capacity(field: &'static str, len: usize, capacity: usize) -> Result<(), ProtocolError> {
    if len > capacity {
        return Err(ProtocolError::FieldOutOfRange {
            field,
            value: len,
            limit: capacity,
        });
    }
    Ok(())
}

/// Write `data` into a zero-padded slot of `capacity` bytes.
fn put_padded(buf: &mut BytesMut, data: &[u8], capacity: usize) {
    buf.put_slice(data);
    buf.put_bytes(0, capacity - data.len());
}

fn get_enum<T: TryFrom<u8, Error = u8>>(buf: &mut Bytes, field: &'static str) -> Result<T, ProtocolError> {
    T::try_from(buf.get_u8()).map_err(|value| ProtocolError::InvalidEnumValue { field, value })
}

fn put_i8_slice(buf: &mut BytesMut, data: &[i8]) {
    for &v in data {
        buf.put_i8(v);
    }
}

fn get_i8_vec(buf: &mut Bytes, len: usize) -> Vec<i8> {
    (0..len).map(|_| buf.get_i8()).collect()
}

fn put_xy(buf: &mut BytesMut, opt: &XyDiagramOpt) {
    buf.put_i8(opt.window_function);
    buf.put_u8(opt.y_scalar);
    buf.put_u8(opt.y_offset);
    buf.put_u8(opt.x_scalar);
}

fn get_xy(buf: &mut Bytes) -> XyDiagramOpt {
    XyDiagramOpt {
        window_function: buf.get_i8(),
        y_scalar: buf.get_u8(),
        y_offset: buf.get_u8(),
        x_scalar: buf.get_u8(),
    }
}

/// V1 and V2 disagree on some field sets; `present` says whether the
/// V2-only fields are populated.
fn check_layout(kind: RecordKind, version: ProtocolVersion, present: bool) -> Result<(), ProtocolError> {
    let expected = version >= ProtocolVersion::V2;
    if present != expected {
        return Err(ProtocolError::LayoutMismatch { kind, version });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Configuration records
// ---------------------------------------------------------------------------

impl Record for SerialNo {
    const KIND: RecordKind = RecordKind::SerialNo;

    fn put_fields(&self, _: ProtocolVersion, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_slice(&self.serial);
        Ok(())
    }

    fn get_fields(_: ProtocolVersion, buf: &mut Bytes) -> Result<Self, ProtocolError> {
        let mut serial = [0u8; SERIAL_NO_LEN];
        buf.copy_to_slice(&mut serial);
        Ok(SerialNo { serial })
    }
}

impl Record for DabConfig {
    const KIND: RecordKind = RecordKind::DabConfig;

    fn put_fields(&self, _: ProtocolVersion, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_i8(self.channel_idx);
        Ok(())
    }

    fn get_fields(_: ProtocolVersion, buf: &mut Bytes) -> Result<Self, ProtocolError> {
        Ok(DabConfig {
            channel_idx: buf.get_i8(),
        })
    }
}

impl Record for TunerOption {
    const KIND: RecordKind = RecordKind::TunerOption;

    fn put_fields(&self, _: ProtocolVersion, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        put_bool(buf, self.use_digital_diode);
        put_bool(buf, self.use_bb_filter_770);
        buf.put_slice(&self.fir);
        Ok(())
    }

    fn get_fields(_: ProtocolVersion, buf: &mut Bytes) -> Result<Self, ProtocolError> {
        let use_digital_diode = get_bool(buf);
        let use_bb_filter_770 = get_bool(buf);
        let mut fir = [0u8; FIR_TAPS];
        buf.copy_to_slice(&mut fir);
        Ok(TunerOption {
            use_digital_diode,
            use_bb_filter_770,
            fir,
        })
    }
}

impl Record for ProcessOption {
    const KIND: RecordKind = RecordKind::ProcessOption;

    fn put_fields(&self, version: ProtocolVersion, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        check_layout(Self::KIND, version, self.tii_opt.is_some())?;
        buf.put_u8(self.usb_output as u8);
        buf.put_u8(self.offset_opt as u8);
        buf.put_u16_le(self.fib_crc_trap_limit);
        buf.put_u8(self.iq_opt as u8);
        put_xy(buf, &self.spectrum_opt);
        put_xy(buf, &self.impulse_response_opt);
        if let Some(tii) = &self.tii_opt {
            put_bool(buf, tii.enabled);
            buf.put_u8(tii.threshold);
        }
        Ok(())
    }

    fn get_fields(version: ProtocolVersion, buf: &mut Bytes) -> Result<Self, ProtocolError> {
        let usb_output = get_enum(buf, "usb_output")?;
        let offset_opt = get_enum(buf, "offset_opt")?;
        let fib_crc_trap_limit = buf.get_u16_le();
        let iq_opt = get_enum(buf, "iq_opt")?;
        let spectrum_opt = get_xy(buf);
        let impulse_response_opt = get_xy(buf);
        let tii_opt = if version >= ProtocolVersion::V2 {
            Some(TiiOption {
                enabled: get_bool(buf),
                threshold: buf.get_u8(),
            })
        } else {
            None
        };
        Ok(ProcessOption {
            usb_output,
            offset_opt,
            fib_crc_trap_limit,
            iq_opt,
            spectrum_opt,
            impulse_response_opt,
            tii_opt,
        })
    }
}

impl Record for PwsConfig {
    const KIND: RecordKind = RecordKind::PwsConfig;

    fn put_fields(&self, _: ProtocolVersion, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u8(self.event_id_1);
        buf.put_u8(self.event_id_2);
        buf.put_u32_le(self.zone_id);
        Ok(())
    }

    fn get_fields(_: ProtocolVersion, buf: &mut Bytes) -> Result<Self, ProtocolError> {
        Ok(PwsConfig {
            event_id_1: buf.get_u8(),
            event_id_2: buf.get_u8(),
            zone_id: buf.get_u32_le(),
        })
    }
}

impl Record for PwsStatus {
    const KIND: RecordKind = RecordKind::PwsStatus;

    fn put_fields(&self, _: ProtocolVersion, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        put_bool(buf, self.triggered);
        Ok(())
    }

    fn get_fields(_: ProtocolVersion, buf: &mut Bytes) -> Result<Self, ProtocolError> {
        Ok(PwsStatus {
            triggered: get_bool(buf),
        })
    }
}

impl Record for Version {
    const KIND: RecordKind = RecordKind::Version;

    fn put_fields(&self, _: ProtocolVersion, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u8(self.protocol);
        buf.put_u8(self.fw_major);
        buf.put_u8(self.fw_minor);
        buf.put_u8(self.fw_patch);
        Ok(())
    }

    fn get_fields(_: ProtocolVersion, buf: &mut Bytes) -> Result<Self, ProtocolError> {
        Ok(Version {
            protocol: buf.get_u8(),
            fw_major: buf.get_u8(),
            fw_minor: buf.get_u8(),
            fw_patch: buf.get_u8(),
        })
    }
}

impl Record for TunerRegister {
    const KIND: RecordKind = RecordKind::TunerRegister;

    fn put_fields(&self, _: ProtocolVersion, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u16_le(self.address);
        buf.put_u16_le(self.value);
        Ok(())
    }

    fn get_fields(_: ProtocolVersion, buf: &mut Bytes) -> Result<Self, ProtocolError> {
        Ok(TunerRegister {
            address: buf.get_u16_le(),
            value: buf.get_u16_le(),
        })
    }
}

impl Record for PortValue {
    const KIND: RecordKind = RecordKind::PortValue;

    fn put_fields(&self, _: ProtocolVersion, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u8(self.value);
        Ok(())
    }

    fn get_fields(_: ProtocolVersion, buf: &mut Bytes) -> Result<Self, ProtocolError> {
        Ok(PortValue { value: buf.get_u8() })
    }
}

// ---------------------------------------------------------------------------
// Telemetry records
// ---------------------------------------------------------------------------

impl Record for SignalInfo {
    const KIND: RecordKind = RecordKind::SignalInfo;

    fn put_fields(&self, _: ProtocolVersion, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        put_telemetry_header(buf, TelemetryKind::SignalInfo, self.update_counter);
        buf.put_i32_le(self.coarse_offset);
        buf.put_i32_le(self.fine_offset_accum);
        buf.put_i16_le(self.fine_offset);
        buf.put_u8(self.ratio);
        put_bool(buf, self.is_tii);
        buf.put_i8(self.power_in);
        put_bool(buf, self.is_blocker);
        buf.put_i16_le(self.temperature);
        Ok(())
    }

    fn get_fields(_: ProtocolVersion, buf: &mut Bytes) -> Result<Self, ProtocolError> {
        let update_counter = get_telemetry_header(buf, TelemetryKind::SignalInfo)?;
        Ok(SignalInfo {
            update_counter,
            coarse_offset: buf.get_i32_le(),
            fine_offset_accum: buf.get_i32_le(),
            fine_offset: buf.get_i16_le(),
            ratio: buf.get_u8(),
            is_tii: get_bool(buf),
            power_in: buf.get_i8(),
            is_blocker: get_bool(buf),
            temperature: buf.get_i16_le(),
        })
    }
}

impl Record for FibInfo {
    const KIND: RecordKind = RecordKind::FibInfo;

    fn put_fields(&self, _: ProtocolVersion, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        check_exact_len("fib_data", self.fib_data.len(), NO_TF_FIBS * FIB_SIZE)?;
        put_telemetry_header(buf, TelemetryKind::FibInfo, self.update_counter);
        buf.put_slice(&self.fib_data);
        put_i8_slice(buf, &self.fib_crc_errors);
        buf.put_u16_le(self.bit_errors);
        buf.put_u16_le(self.used_ber_bits);
        Ok(())
    }

    fn get_fields(_: ProtocolVersion, buf: &mut Bytes) -> Result<Self, ProtocolError> {
        let update_counter = get_telemetry_header(buf, TelemetryKind::FibInfo)?;
        let fib_data = buf.copy_to_bytes(NO_TF_FIBS * FIB_SIZE).to_vec();
        let mut fib_crc_errors = [0i8; NO_TF_FIBS];
        for slot in fib_crc_errors.iter_mut() {
            *slot = buf.get_i8();
        }
        Ok(FibInfo {
            update_counter,
            fib_data,
            fib_crc_errors,
            bit_errors: buf.get_u16_le(),
            used_ber_bits: buf.get_u16_le(),
        })
    }
}

impl Record for Subchannel {
    const KIND: RecordKind = RecordKind::Subchannel;

    fn put_fields(&self, version: ProtocolVersion, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        check_layout(Self::KIND, version, self.address.is_some())?;
        check_capacity("subchannel data", self.data.len(), MAX_TF_SIZE)?;
        put_telemetry_header(buf, TelemetryKind::Subchannel, self.update_counter);
        if let Some(address) = &self.address {
            buf.put_u8(address.format as u8);
            buf.put_i8(address.subch_id);
            buf.put_u16_le(address.start_address);
            buf.put_u16_le(address.subch_size);
        }
        put_padded(buf, &self.data, MAX_TF_SIZE);
        buf.put_u16_le(self.data.len() as u16);
        Ok(())
    }

    fn get_fields(version: ProtocolVersion, buf: &mut Bytes) -> Result<Self, ProtocolError> {
        let update_counter = get_telemetry_header(buf, TelemetryKind::Subchannel)?;
        let address = if version >= ProtocolVersion::V2 {
            Some(SubchannelAddress {
                format: get_enum(buf, "subchannel format")?,
                subch_id: buf.get_i8(),
                start_address: buf.get_u16_le(),
                subch_size: buf.get_u16_le(),
            })
        } else {
            None
        };
        let mut data = buf.copy_to_bytes(MAX_TF_SIZE).to_vec();
        let act_len = buf.get_u16_le() as usize;
        check_capacity("subchannel act_len", act_len, MAX_TF_SIZE)?;
        data.truncate(act_len);
        Ok(Subchannel {
            update_counter,
            address,
            data,
        })
    }
}

impl Record for Iq {
    const KIND: RecordKind = RecordKind::Iq;

    fn put_fields(&self, _: ProtocolVersion, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        check_exact_len("iq data", self.data.len(), IQ_SAMPLES)?;
        put_telemetry_header(buf, TelemetryKind::Iq, self.update_counter);
        put_i8_slice(buf, &self.data);
        Ok(())
    }

    fn get_fields(_: ProtocolVersion, buf: &mut Bytes) -> Result<Self, ProtocolError> {
        let update_counter = get_telemetry_header(buf, TelemetryKind::Iq)?;
        Ok(Iq {
            update_counter,
            data: get_i8_vec(buf, IQ_SAMPLES),
        })
    }
}

impl Record for Spectrum {
    const KIND: RecordKind = RecordKind::Spectrum;

    fn put_fields(&self, _: ProtocolVersion, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        check_exact_len("spectrum data", self.data.len(), SPECTRUM_BINS)?;
        put_telemetry_header(buf, TelemetryKind::Spectrum, self.update_counter);
        buf.put_slice(&self.data);
        Ok(())
    }

    fn get_fields(_: ProtocolVersion, buf: &mut Bytes) -> Result<Self, ProtocolError> {
        let update_counter = get_telemetry_header(buf, TelemetryKind::Spectrum)?;
        Ok(Spectrum {
            update_counter,
            data: buf.copy_to_bytes(SPECTRUM_BINS).to_vec(),
        })
    }
}

impl Record for ImpulseResponse {
    const KIND: RecordKind = RecordKind::ImpulseResponse;

    fn put_fields(&self, _: ProtocolVersion, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        check_exact_len("impulse response data", self.data.len(), IMPULSE_RESPONSE_LEN)?;
        put_telemetry_header(buf, TelemetryKind::ImpulseResponse, self.update_counter);
        buf.put_slice(&self.data);
        Ok(())
    }

    fn get_fields(_: ProtocolVersion, buf: &mut Bytes) -> Result<Self, ProtocolError> {
        let update_counter = get_telemetry_header(buf, TelemetryKind::ImpulseResponse)?;
        Ok(ImpulseResponse {
            update_counter,
            data: buf.copy_to_bytes(IMPULSE_RESPONSE_LEN).to_vec(),
        })
    }
}

impl Record for Tii {
    const KIND: RecordKind = RecordKind::Tii;

    fn put_fields(&self, _: ProtocolVersion, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        check_capacity("tii entries", self.entries.len(), TII_MAX_ENTRIES)?;
        put_telemetry_header(buf, TelemetryKind::Tii, self.update_counter);
        buf.put_u8(self.entries.len() as u8);
        for entry in &self.entries {
            buf.put_u8(entry.main_id);
            buf.put_u8(entry.sub_id);
            buf.put_i16_le(entry.level);
        }
        buf.put_bytes(0, (TII_MAX_ENTRIES - self.entries.len()) * 4);
        Ok(())
    }

    fn get_fields(_: ProtocolVersion, buf: &mut Bytes) -> Result<Self, ProtocolError> {
        let update_counter = get_telemetry_header(buf, TelemetryKind::Tii)?;
        let count = buf.get_u8() as usize;
        check_capacity("tii count", count, TII_MAX_ENTRIES)?;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(TiiEntry {
                main_id: buf.get_u8(),
                sub_id: buf.get_u8(),
                level: buf.get_i16_le(),
            });
        }
        Ok(Tii {
            update_counter,
            entries,
        })
    }
}

impl Record for Tick {
    const KIND: RecordKind = RecordKind::Tick;

    fn put_fields(&self, _: ProtocolVersion, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        put_telemetry_header(buf, TelemetryKind::Tick, self.update_counter);
        Ok(())
    }

    fn get_fields(_: ProtocolVersion, buf: &mut Bytes) -> Result<Self, ProtocolError> {
        Ok(Tick {
            update_counter: get_telemetry_header(buf, TelemetryKind::Tick)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Firmware update records
// ---------------------------------------------------------------------------

impl Record for DfuMode {
    const KIND: RecordKind = RecordKind::DfuMode;

    fn put_fields(&self, _: ProtocolVersion, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u8(self.state as u8);
        buf.put_u32_le(self.total_blocks);
        Ok(())
    }

    fn get_fields(_: ProtocolVersion, buf: &mut Bytes) -> Result<Self, ProtocolError> {
        Ok(DfuMode {
            state: get_enum(buf, "dfu state")?,
            total_blocks: buf.get_u32_le(),
        })
    }
}

impl Record for DfuBlock {
    const KIND: RecordKind = RecordKind::DfuBlock;

    fn put_fields(&self, _: ProtocolVersion, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        check_capacity("dfu block data", self.data.len(), DFU_BLOCK_SIZE)?;
        buf.put_u32_le(self.sequence);
        buf.put_u16_le(self.data.len() as u16);
        put_padded(buf, &self.data, DFU_BLOCK_SIZE);
        Ok(())
    }

    fn get_fields(_: ProtocolVersion, buf: &mut Bytes) -> Result<Self, ProtocolError> {
        let sequence = buf.get_u32_le();
        let act_len = buf.get_u16_le() as usize;
        check_capacity("dfu block act_len", act_len, DFU_BLOCK_SIZE)?;
        let mut data = buf.copy_to_bytes(DFU_BLOCK_SIZE).to_vec();
        data.truncate(act_len);
        Ok(DfuBlock { sequence, data })
    }
}

impl Record for DfuAck {
    const KIND: RecordKind = RecordKind::DfuAck;

    fn put_fields(&self, _: ProtocolVersion, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32_le(self.block);
        buf.put_u8(self.status.into());
        Ok(())
    }

    fn get_fields(_: ProtocolVersion, buf: &mut Bytes) -> Result<Self, ProtocolError> {
        let block = buf.get_u32_le();
        let status: DfuStatus = get_enum(buf, "dfu status")?;
        Ok(DfuAck { block, status })
    }
}
