//! Append-only TimeSyncFile writer

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use bytes::{BufMut, BytesMut};
use tracing::{debug, warn};

use super::{put_value, TimeSyncHeader, CHECKSUM, DEFAULT_BLOCK_SIZE, FORMAT_VERSION, MAGIC, TAG_BLOCK, TAG_END};
use crate::TimeSyncError;

/// Buffers pairs into fixed-size blocks and checksums each block on flush
pub struct TimeSyncFileWriter {
    out: Option<BufWriter<File>>,
    path: PathBuf,
    header: TimeSyncHeader,
    block: Vec<(i64, i64)>,
    block_size: usize,
    total: u64,
    last_pair: Option<(i64, i64)>,
}

impl TimeSyncFileWriter {
    /// Create the file and write its header
    pub fn create(path: impl AsRef<Path>, header: TimeSyncHeader) -> Result<Self, TimeSyncError> {
        Self::with_block_size(path, header, DEFAULT_BLOCK_SIZE)
    }

    pub fn with_block_size(
        path: impl AsRef<Path>,
        header: TimeSyncHeader,
        block_size: usize,
    ) -> Result<Self, TimeSyncError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = BufWriter::new(File::create(&path)?);

        let encoded = bincode::serialize(&header)?;
        let mut prelude = BytesMut::with_capacity(MAGIC.len() + 10 + encoded.len());
        prelude.put_slice(MAGIC);
        prelude.put_u16_le(FORMAT_VERSION);
        prelude.put_u32_le(encoded.len() as u32);
        prelude.put_slice(&encoded);
        prelude.put_u32_le(CHECKSUM.checksum(&encoded));
        out.write_all(&prelude)?;

        debug!(path = %path.display(), module = %header.module_name, "TimeSyncFile created");

        let block_size = block_size.max(1);
        Ok(Self {
            out: Some(out),
            path,
            header,
            block: Vec::with_capacity(block_size),
            block_size,
            total: 0,
            last_pair: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &TimeSyncHeader {
        &self.header
    }

    /// Number of pairs accepted so far
    pub fn pair_count(&self) -> u64 {
        self.total
    }

    /// Last pair accepted
    pub fn last_pair(&self) -> Option<(i64, i64)> {
        self.last_pair
    }

    pub fn is_closed(&self) -> bool {
        self.out.is_none()
    }

    /// Append a pair; a full block is flushed to disk.
    ///
    /// # Errors
    /// - `ValueOutOfRange` if a value does not fit its declared column type
    /// - `Closed` after [`close`](Self::close)
    pub fn write_pair(&mut self, time1: i64, time2: i64) -> Result<(), TimeSyncError> {
        if self.out.is_none() {
            return Err(TimeSyncError::Closed);
        }
        for (column, value) in [(0, time1), (1, time2)] {
            let dtype = self.header.time_dtypes[column];
            if !dtype.accepts(value) {
                return Err(TimeSyncError::ValueOutOfRange {
                    column,
                    value,
                    dtype,
                });
            }
        }

        self.block.push((time1, time2));
        self.total += 1;
        self.last_pair = Some((time1, time2));
        if self.block.len() >= self.block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    /// Write buffered pairs as one checksummed block
    pub fn flush_block(&mut self) -> Result<(), TimeSyncError> {
        if self.block.is_empty() {
            return Ok(());
        }
        let Some(out) = self.out.as_mut() else {
            return Err(TimeSyncError::Closed);
        };

        let mut payload = BytesMut::with_capacity(4 + self.block.len() * self.header.pair_width());
        payload.put_u32_le(self.block.len() as u32);
        for &(time1, time2) in &self.block {
            put_value(&mut payload, self.header.time_dtypes[0], time1);
            put_value(&mut payload, self.header.time_dtypes[1], time2);
        }

        out.write_all(&[TAG_BLOCK])?;
        out.write_all(&payload)?;
        out.write_all(&CHECKSUM.checksum(&payload).to_le_bytes())?;
        out.flush()?;
        self.block.clear();
        Ok(())
    }

    /// Flush the last block, write the end block and sync the file. Idempotent.
    pub fn close(&mut self) -> Result<(), TimeSyncError> {
        if self.out.is_none() {
            return Ok(());
        }
        self.flush_block()?;

        if let Some(mut out) = self.out.take() {
            let total = self.total.to_le_bytes();
            out.write_all(&[TAG_END])?;
            out.write_all(&total)?;
            out.write_all(&CHECKSUM.checksum(&total).to_le_bytes())?;
            out.flush()?;
            out.get_ref().sync_all()?;
        }

        debug!(path = %self.path.display(), pairs = self.total, "TimeSyncFile closed");
        Ok(())
    }
}

impl Drop for TimeSyncFileWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(path = %self.path.display(), error = %e, "failed to close TimeSyncFile");
        }
    }
}

impl std::fmt::Debug for TimeSyncFileWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeSyncFileWriter")
            .field("path", &self.path)
            .field("pairs", &self.total)
            .field("closed", &self.is_closed())
            .finish()
    }
}
