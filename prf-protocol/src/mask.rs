//! Mask-based telemetry multiplexing.
//!
//! A composite buffer is the concatenation, in canonical order, of one
//! complete record (with its own trailer) for every kind enabled in the mask.
//! Disabled kinds contribute zero bytes. There is no per-record length
//! prefix: the parser walks the mask in the same order and slices by fixed
//! size.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, warn};

use crate::codec::{decode_telemetry, encode_telemetry};
use crate::error::ProtocolError;
use crate::types::{Mask, ProtocolVersion, TelemetryKind, TelemetryRecord};

/// Supplies the current sample of a telemetry kind.
pub trait SampleSource {
    fn sample(&mut self, kind: TelemetryKind) -> TelemetryRecord;
}

/// Length of the composite buffer `mask` implies.
pub fn composite_len(mask: Mask, version: ProtocolVersion) -> Result<usize, ProtocolError> {
    mask.validate(version)?;
    mask.kinds()
        .map(|kind| kind.record_kind().size_in(version))
        .sum()
}

/// Worst-case composite size: every kind the version has.
pub fn max_composite_size(version: ProtocolVersion) -> usize {
    TelemetryKind::CANONICAL_ORDER
        .iter()
        .filter_map(|kind| kind.record_kind().size(version))
        .sum()
}

/// Concatenate one record per enabled kind, in canonical order.
pub fn build_composite<S: SampleSource + ?Sized>(
    mask: Mask,
    source: &mut S,
    version: ProtocolVersion,
) -> Result<Bytes, ProtocolError> {
    let len = composite_len(mask, version)?;
    let mut buf = BytesMut::with_capacity(len);
    for kind in mask.kinds() {
        let record = source.sample(kind);
        if record.kind() != kind {
            return Err(ProtocolError::SelectorMismatch {
                expected: kind.mask_bit(),
                actual: record.kind().mask_bit(),
            });
        }
        buf.put(encode_telemetry(&record, version)?);
    }
    Ok(buf.freeze())
}

/// Split a composite buffer into its records.
///
/// The outer error covers the framing (truncation, overrun, unsupported
/// kind); those leave the remainder unreadable. A record whose checksum or
/// selector fails is reported in place and parsing continues with the next
/// one, since its size is still known.
pub fn parse_composite(
    buf: &[u8],
    mask: Mask,
    version: ProtocolVersion,
) -> Result<Vec<Result<TelemetryRecord, ProtocolError>>, ProtocolError> {
    mask.validate(version)?;

    let mut records = Vec::with_capacity(mask.bits().count_ones() as usize);
    let mut offset = 0usize;
    for kind in mask.kinds() {
        let record_kind = kind.record_kind();
        let size = record_kind.size_in(version)?;
        let remaining = buf.len() - offset;
        if remaining < size {
            return Err(ProtocolError::TruncatedComposite {
                kind: record_kind,
                needed: size,
                remaining,
            });
        }

        let result = decode_telemetry(kind, &buf[offset..offset + size], version);
        if let Err(e) = &result {
            warn!("Skipping {} in composite at offset {}: {}", kind, offset, e);
        }
        records.push(result);
        offset += size;
    }

    if offset != buf.len() {
        return Err(ProtocolError::CompositeOverrun {
            expected: offset,
            actual: buf.len(),
        });
    }
    Ok(records)
}

/// Tracks the last update counter seen per telemetry kind.
///
/// Counters are 32-bit and wrap; the gap is computed modulo 2^32.
#[derive(Debug, Default)]
pub struct CounterTracker {
    last: HashMap<TelemetryKind, u32>,
}

impl CounterTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `counter` for `kind` and return how many intervals were missed
    /// since the previous observation. The first observation misses nothing;
    /// a repeated counter (stale sample) also reports zero.
    pub fn observe(&mut self, kind: TelemetryKind, counter: u32) -> u32 {
        let missed = match self.last.insert(kind, counter) {
            Some(previous) => counter.wrapping_sub(previous).saturating_sub(1),
            None => 0,
        };
        if missed > 0 {
            debug!("{} counter jumped to {}: {} intervals missed", kind, counter, missed);
        }
        missed
    }

    pub fn last(&self, kind: TelemetryKind) -> Option<u32> {
        self.last.get(&kind).copied()
    }

    /// Forget all counters (after reconnect the device restarts them).
    pub fn reset(&mut self) {
        self.last.clear();
    }
}
