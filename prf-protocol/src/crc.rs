//! Record checksum.
//!
//! The PRF board computes its trailer with the STM32 hardware CRC unit in its
//! default configuration: CRC-32/MPEG-2 (polynomial 0x04C11DB7, initial value
//! 0xFFFFFFFF, no input/output reflection, no final XOR).

/// Size of the checksum trailer at the end of every record.
pub const CRC_SIZE: usize = 4;

static CRC_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 24;
        let mut j = 0;
        while j < 8 {
            if crc & 0x8000_0000 != 0 {
                crc = (crc << 1) ^ 0x04C1_1DB7;
            } else {
                crc <<= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// Calculate CRC-32/MPEG-2 over `data`.
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        let index = ((crc >> 24) ^ byte as u32) as usize;
        crc = (crc << 8) ^ CRC_TABLE[index];
    }
    crc
}

/// Checksum of a complete record buffer: everything except the trailer.
///
/// Returns `None` if the buffer is too short to hold a trailer.
pub fn record_crc(record: &[u8]) -> Option<u32> {
    let body_len = record.len().checked_sub(CRC_SIZE)?;
    Some(crc32_mpeg2(&record[..body_len]))
}

/// The trailer value stored in the last four bytes of `record`.
pub fn stored_crc(record: &[u8]) -> Option<u32> {
    let start = record.len().checked_sub(CRC_SIZE)?;
    let mut trailer = [0u8; CRC_SIZE];
    trailer.copy_from_slice(&record[start..]);
    Some(u32::from_le_bytes(trailer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_empty() {
        assert_eq!(crc32_mpeg2(&[]), 0xFFFF_FFFF);
    }

    #[test]
    fn test_crc32_check_value() {
        // Catalogued check value for CRC-32/MPEG-2.
        assert_eq!(crc32_mpeg2(b"123456789"), 0x0376_E6E7);
    }

    #[test]
    fn test_record_crc_excludes_trailer() {
        let mut record = b"123456789".to_vec();
        record.extend_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(record_crc(&record), Some(0x0376_E6E7));
        assert_eq!(stored_crc(&record), Some(0xDDCC_BBAA));
    }

    #[test]
    fn test_too_short_for_trailer() {
        assert_eq!(record_crc(&[1, 2, 3]), None);
        assert_eq!(stored_crc(&[1, 2, 3]), None);
    }
}
