//! Segment files: append-only runs of length-prefixed records.
//!
//! A segment file is a concatenation of `[u64 LE length][payload]` frames.
//! The highest-ID segment is the active (write) segment; all others are
//! sealed and immutable. File names are the zero-padded decimal segment ID
//! with an `.hh` extension.

use crate::error::{HandoffError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Extension of segment files.
const SEGMENT_EXT: &str = "hh";

/// Size of the length prefix on every record frame.
pub(crate) const FRAME_HEADER: u64 = 8;

/// File name for a segment ID, zero-padded so lexicographic order is ID order.
pub(crate) fn segment_file_name(id: u64) -> String {
    format!("{id:020}.{SEGMENT_EXT}")
}

/// Parse a directory entry name as a segment ID. Non-segment files yield None.
pub(crate) fn parse_segment_file_name(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(".hh")?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// A sealed, immutable segment.
#[derive(Debug, Clone)]
pub(crate) struct SealedSegment {
    /// Monotonically assigned segment ID.
    pub id: u64,
    /// Path of the segment file.
    pub path: PathBuf,
    /// Total byte size of the file.
    pub size: u64,
}

/// The segment currently accepting appends.
///
/// Held exclusively by one queue; the file carries an advisory lock so a
/// second process opening the same directory fails fast instead of
/// interleaving frames.
#[derive(Debug)]
pub(crate) struct ActiveSegment {
    /// Segment ID.
    pub id: u64,
    /// Path of the segment file.
    pub path: PathBuf,
    /// Bytes written so far (also the append offset).
    pub size: u64,
    file: BufWriter<File>,
}

impl ActiveSegment {
    /// Open or create the active segment for `id` inside `dir`.
    pub fn open(dir: &Path, id: u64) -> Result<Self> {
        let path = dir.join(segment_file_name(id));

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| HandoffError::QueueOpen {
                path: path.clone(),
                cause: format!("failed to open segment: {e}"),
            })?;

        file.try_lock_exclusive()
            .map_err(|e| HandoffError::QueueOpen {
                path: path.clone(),
                cause: format!("failed to lock segment: {e}"),
            })?;

        let size = file
            .metadata()
            .map_err(|e| HandoffError::QueueOpen {
                path: path.clone(),
                cause: format!("failed to stat segment: {e}"),
            })?
            .len();

        Ok(Self {
            id,
            path,
            size,
            file: BufWriter::new(file),
        })
    }

    /// Append one `[length][payload]` frame and make it durable.
    pub fn append_frame(&mut self, payload: &[u8]) -> Result<()> {
        let write_err = |e: std::io::Error| HandoffError::SegmentWrite {
            path: self.path.clone(),
            cause: e.to_string(),
        };

        self.file
            .write_u64::<LittleEndian>(payload.len() as u64)
            .map_err(write_err)?;
        self.file.write_all(payload).map_err(write_err)?;
        self.file.flush().map_err(write_err)?;
        self.file.get_ref().sync_data().map_err(write_err)?;

        self.size += FRAME_HEADER + payload.len() as u64;
        Ok(())
    }

    /// Seal this segment, releasing the write lock.
    ///
    /// Every append already flushed and synced, so the final flush is only a
    /// formality; a failure here is logged rather than propagated.
    pub fn seal(mut self) -> SealedSegment {
        if let Err(e) = self.file.flush() {
            tracing::warn!(path = %self.path.display(), error = %e, "flush on seal failed");
        }
        let _ = fs2::FileExt::unlock(self.file.get_ref());

        SealedSegment {
            id: self.id,
            path: self.path,
            size: self.size,
        }
    }

    /// Flush buffered bytes without sealing.
    pub fn flush(&mut self) -> Result<()> {
        self.file.flush().map_err(|e| HandoffError::SegmentWrite {
            path: self.path.clone(),
            cause: e.to_string(),
        })
    }

    /// Truncate the segment back to empty.
    ///
    /// Called once the consumer has replayed every frame, so the queue does
    /// not keep already-delivered bytes on disk.
    pub fn reset(&mut self) -> Result<()> {
        let write_err = |e: std::io::Error| HandoffError::SegmentWrite {
            path: self.path.clone(),
            cause: e.to_string(),
        };
        self.file.flush().map_err(write_err)?;
        self.file.get_ref().set_len(0).map_err(write_err)?;
        self.file.get_ref().sync_data().map_err(write_err)?;
        self.size = 0;
        Ok(())
    }
}

/// Read the record frame at `offset` in the segment at `path`.
///
/// `seg_size` bounds the read so a mangled length prefix cannot run past the
/// end of the segment.
pub(crate) fn read_frame(path: &Path, offset: u64, seg_size: u64) -> Result<Bytes> {
    let read_err = |e: std::io::Error| HandoffError::SegmentRead {
        path: path.to_path_buf(),
        cause: e.to_string(),
    };

    let remaining = seg_size.saturating_sub(offset);
    if remaining < FRAME_HEADER {
        return Err(HandoffError::CorruptSegment {
            path: path.to_path_buf(),
            offset,
            cause: format!("{remaining} bytes remain, too short for a length prefix"),
        });
    }

    let file = File::open(path).map_err(read_err)?;
    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(offset)).map_err(read_err)?;

    let len = reader.read_u64::<LittleEndian>().map_err(read_err)?;
    if len == 0 || len > remaining - FRAME_HEADER {
        return Err(HandoffError::CorruptSegment {
            path: path.to_path_buf(),
            offset,
            cause: format!("record length {len} out of bounds ({} bytes remain)", remaining - FRAME_HEADER),
        });
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).map_err(read_err)?;
    Ok(Bytes::from(buf))
}

/// Total size (header + payload) of the frame at `offset`.
pub(crate) fn frame_size(path: &Path, offset: u64, seg_size: u64) -> Result<u64> {
    let read_err = |e: std::io::Error| HandoffError::SegmentRead {
        path: path.to_path_buf(),
        cause: e.to_string(),
    };

    let remaining = seg_size.saturating_sub(offset);
    if remaining < FRAME_HEADER {
        return Err(HandoffError::CorruptSegment {
            path: path.to_path_buf(),
            offset,
            cause: format!("{remaining} bytes remain, too short for a length prefix"),
        });
    }

    let mut file = File::open(path).map_err(read_err)?;
    file.seek(SeekFrom::Start(offset)).map_err(read_err)?;
    let len = file.read_u64::<LittleEndian>().map_err(read_err)?;
    if len == 0 || len > remaining - FRAME_HEADER {
        return Err(HandoffError::CorruptSegment {
            path: path.to_path_buf(),
            offset,
            cause: format!("record length {len} out of bounds ({} bytes remain)", remaining - FRAME_HEADER),
        });
    }

    Ok(FRAME_HEADER + len)
}
