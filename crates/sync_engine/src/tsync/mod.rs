//! TimeSyncFile - durable log of device/master timestamp pairs
//!
//! Layout (little-endian):
//!
//! ```text
//! magic "DFTSYNC\0" | version u16 | header_len u32 | bincode header | crc32
//! { 0x01 | count u32 | count x (time1, time2) | crc32(count + pairs) }*
//! 0xFF | total u64 | crc32(total)
//! ```
//!
//! Checksums are CRC-32/ISCSI. Each time column is stored with the integer
//! type declared in the header.

mod reader;
mod writer;

pub use reader::TimeSyncFileReader;
pub use writer::TimeSyncFileWriter;

use bytes::{Buf, BufMut};
use chrono::{DateTime, Utc};
use contracts::{TimeSyncDataType, TimeSyncFileMode, TimeSyncUnit};
use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::TimeSyncError;

pub(crate) const MAGIC: &[u8; 8] = b"DFTSYNC\0";
pub(crate) const FORMAT_VERSION: u16 = 1;
pub(crate) const TAG_BLOCK: u8 = 0x01;
pub(crate) const TAG_END: u8 = 0xFF;
pub(crate) const CHECKSUM: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Pairs per checksummed block
pub const DEFAULT_BLOCK_SIZE: usize = 2048;

/// File extension of TimeSyncFiles
pub const TSYNC_EXTENSION: &str = "tsync";

/// TimeSyncFile header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSyncHeader {
    pub module_name: String,
    pub collection_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub tolerance_us: i64,
    pub mode: TimeSyncFileMode,
    pub time_names: [String; 2],
    pub time_units: [TimeSyncUnit; 2],
    pub time_dtypes: [TimeSyncDataType; 2],
}

impl TimeSyncHeader {
    /// Header with creation time set to now
    pub fn new(
        module_name: impl Into<String>,
        collection_id: Uuid,
        tolerance_us: i64,
        mode: TimeSyncFileMode,
    ) -> Self {
        Self {
            module_name: module_name.into(),
            collection_id,
            created_at: Utc::now(),
            tolerance_us,
            mode,
            time_names: ["device-time".to_string(), "master-time".to_string()],
            time_units: [TimeSyncUnit::Microseconds, TimeSyncUnit::Microseconds],
            time_dtypes: [TimeSyncDataType::Int64, TimeSyncDataType::Int64],
        }
    }

    /// Declare names, units and storage types of both columns
    pub fn with_columns(
        mut self,
        names: [&str; 2],
        units: [TimeSyncUnit; 2],
        dtypes: [TimeSyncDataType; 2],
    ) -> Self {
        self.time_names = names.map(str::to_string);
        self.time_units = units;
        self.time_dtypes = dtypes;
        self
    }

    pub(crate) fn pair_width(&self) -> usize {
        self.time_dtypes[0].width() + self.time_dtypes[1].width()
    }
}

/// Contents of a validated TimeSyncFile
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSyncFile {
    pub header: TimeSyncHeader,
    pub pairs: Vec<(i64, i64)>,
}

pub(crate) fn put_value(buf: &mut impl BufMut, dtype: TimeSyncDataType, value: i64) {
    // range was checked by the writer
    match dtype {
        TimeSyncDataType::Int16 => buf.put_i16_le(value as i16),
        TimeSyncDataType::Int32 => buf.put_i32_le(value as i32),
        TimeSyncDataType::Int64 => buf.put_i64_le(value),
        TimeSyncDataType::UInt16 => buf.put_u16_le(value as u16),
        TimeSyncDataType::UInt32 => buf.put_u32_le(value as u32),
        TimeSyncDataType::UInt64 => buf.put_u64_le(value as u64),
    }
}

pub(crate) fn get_value(
    buf: &mut impl Buf,
    column: usize,
    dtype: TimeSyncDataType,
) -> Result<i64, TimeSyncError> {
    if buf.remaining() < dtype.width() {
        return Err(TimeSyncError::Truncated);
    }
    let value = match dtype {
        TimeSyncDataType::Int16 => i64::from(buf.get_i16_le()),
        TimeSyncDataType::Int32 => i64::from(buf.get_i32_le()),
        TimeSyncDataType::Int64 => buf.get_i64_le(),
        TimeSyncDataType::UInt16 => i64::from(buf.get_u16_le()),
        TimeSyncDataType::UInt32 => i64::from(buf.get_u32_le()),
        TimeSyncDataType::UInt64 => {
            let raw = buf.get_u64_le();
            i64::try_from(raw).map_err(|_| TimeSyncError::ValueOutOfRange {
                column,
                value: i64::MAX,
                dtype,
            })?
        }
    };
    Ok(value)
}
