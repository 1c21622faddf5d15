//! Validating TimeSyncFile reader

use std::path::Path;

use bytes::Buf;

use super::{get_value, TimeSyncFile, TimeSyncHeader, CHECKSUM, FORMAT_VERSION, MAGIC, TAG_BLOCK, TAG_END};
use crate::TimeSyncError;

/// Upper bound for a header, guards against garbage lengths
const MAX_HEADER_LEN: usize = 1 << 20;

/// Reads a complete TimeSyncFile, rejecting any corruption
pub struct TimeSyncFileReader;

impl TimeSyncFileReader {
    pub fn open(path: impl AsRef<Path>) -> Result<TimeSyncFile, TimeSyncError> {
        let data = std::fs::read(path)?;
        Self::parse(&data)
    }

    /// Parse an in-memory file image
    pub fn parse(data: &[u8]) -> Result<TimeSyncFile, TimeSyncError> {
        let mut buf = data;

        ensure(&buf, MAGIC.len())?;
        if &buf[..MAGIC.len()] != MAGIC {
            return Err(TimeSyncError::BadMagic);
        }
        buf.advance(MAGIC.len());

        ensure(&buf, 6)?;
        let version = buf.get_u16_le();
        if version != FORMAT_VERSION {
            return Err(TimeSyncError::UnsupportedVersion(version));
        }
        let header_len = buf.get_u32_le() as usize;
        if header_len > MAX_HEADER_LEN {
            return Err(TimeSyncError::Truncated);
        }
        ensure(&buf, header_len + 4)?;
        let header_bytes = &buf[..header_len];
        buf.advance(header_len);
        if buf.get_u32_le() != CHECKSUM.checksum(header_bytes) {
            return Err(TimeSyncError::ChecksumMismatch { block: 0 });
        }
        let header: TimeSyncHeader = bincode::deserialize(header_bytes)?;

        let pair_width = header.pair_width();
        let mut pairs = Vec::new();
        let mut block_no: u64 = 0;

        loop {
            ensure(&buf, 1)?;
            match buf.get_u8() {
                TAG_BLOCK => {
                    block_no += 1;
                    ensure(&buf, 4)?;
                    let count = (&buf[..4]).get_u32_le() as usize;
                    let payload_len = 4 + count * pair_width;
                    ensure(&buf, payload_len + 4)?;

                    let payload = &buf[..payload_len];
                    buf.advance(payload_len);
                    if buf.get_u32_le() != CHECKSUM.checksum(payload) {
                        return Err(TimeSyncError::ChecksumMismatch { block: block_no });
                    }

                    let mut values = &payload[4..];
                    pairs.reserve(count);
                    for _ in 0..count {
                        let time1 = get_value(&mut values, 0, header.time_dtypes[0])?;
                        let time2 = get_value(&mut values, 1, header.time_dtypes[1])?;
                        pairs.push((time1, time2));
                    }
                }
                TAG_END => {
                    ensure(&buf, 12)?;
                    let total_bytes = &buf[..8];
                    let declared = (&buf[..8]).get_u64_le();
                    let expected_crc = CHECKSUM.checksum(total_bytes);
                    buf.advance(8);
                    if buf.get_u32_le() != expected_crc {
                        return Err(TimeSyncError::ChecksumMismatch {
                            block: block_no + 1,
                        });
                    }
                    if declared != pairs.len() as u64 {
                        return Err(TimeSyncError::CountMismatch {
                            declared,
                            found: pairs.len() as u64,
                        });
                    }
                    if buf.has_remaining() {
                        return Err(TimeSyncError::TrailingData);
                    }
                    return Ok(TimeSyncFile { header, pairs });
                }
                other => return Err(TimeSyncError::UnknownBlockTag(other)),
            }
        }
    }
}

fn ensure(buf: &&[u8], needed: usize) -> Result<(), TimeSyncError> {
    if buf.len() < needed {
        Err(TimeSyncError::Truncated)
    } else {
        Ok(())
    }
}
