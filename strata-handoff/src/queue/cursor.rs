//! Head cursor sidecar.
//!
//! The cursor `(segment, offset)` marks the next record to replay. It is
//! rewritten via write-temp-then-rename on every advance so a crash leaves
//! either the old or the new cursor on disk, never a torn one. A missing or
//! corrupt sidecar resets replay to the start of the oldest segment, which
//! at worst re-delivers records (delivery is at-least-once).

use crate::error::{HandoffError, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::fs;
use std::io::Write;
use std::path::Path;

/// Sidecar file name inside the queue directory.
const CURSOR_FILE: &str = "cursor";
const CURSOR_TMP: &str = "cursor.tmp";

/// Encoded size: segment + offset + crc.
const CURSOR_SIZE: usize = 8 + 8 + 4;

/// Position of the next record to replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Cursor {
    /// Segment the cursor is in.
    pub segment: u64,
    /// Byte offset within that segment.
    pub offset: u64,
}

/// Read the persisted cursor, if any survives intact.
pub(crate) fn load(dir: &Path) -> Option<Cursor> {
    let bytes = fs::read(dir.join(CURSOR_FILE)).ok()?;
    if bytes.len() != CURSOR_SIZE {
        return None;
    }

    let stored_crc = LittleEndian::read_u32(&bytes[16..20]);
    if crc32fast::hash(&bytes[..16]) != stored_crc {
        return None;
    }

    Some(Cursor {
        segment: LittleEndian::read_u64(&bytes[0..8]),
        offset: LittleEndian::read_u64(&bytes[8..16]),
    })
}

/// Persist the cursor atomically.
pub(crate) fn store(dir: &Path, cursor: Cursor) -> Result<()> {
    let tmp = dir.join(CURSOR_TMP);
    let dst = dir.join(CURSOR_FILE);
    let persist_err = |e: std::io::Error| HandoffError::CursorPersist {
        path: dst.clone(),
        cause: e.to_string(),
    };

    let mut bytes = [0u8; CURSOR_SIZE];
    LittleEndian::write_u64(&mut bytes[0..8], cursor.segment);
    LittleEndian::write_u64(&mut bytes[8..16], cursor.offset);
    let crc = crc32fast::hash(&bytes[..16]);
    LittleEndian::write_u32(&mut bytes[16..20], crc);

    let mut file = fs::File::create(&tmp).map_err(persist_err)?;
    file.write_all(&bytes).map_err(persist_err)?;
    file.sync_all().map_err(persist_err)?;
    drop(file);

    fs::rename(&tmp, &dst).map_err(persist_err)?;
    Ok(())
}
