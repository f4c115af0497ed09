//! Shard-write record codec.
//!
//! A queued record is one shard write: the destination shard plus the points
//! that were headed there. The queue stores the encoded form as opaque bytes;
//! this module is the only place that knows the layout.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! [u32 crc] [u64 shard_id] [u32 point_count] ([u32 len] [len bytes])*
//! ```
//!
//! The CRC32 covers everything after the crc field. A record that fails CRC
//! or framing checks is poison: replay drops it rather than retrying forever.

use crate::types::{Point, ShardId};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Size of the fixed header: crc + shard ID + point count.
pub const RECORD_HEADER_SIZE: usize = 4 + 8 + 4;

/// One shard write queued for a remote destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardWrite {
    /// The shard the points belong to.
    pub shard_id: ShardId,
    /// The points to deliver.
    pub points: Vec<Point>,
}

impl ShardWrite {
    /// Create a shard write.
    pub fn new(shard_id: ShardId, points: Vec<Point>) -> Self {
        Self { shard_id, points }
    }

    /// Serialize the shard write to bytes.
    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut payload = Vec::with_capacity(self.serialized_size() - 4);

        payload.write_u64::<LittleEndian>(self.shard_id.as_u64())?;
        payload.write_u32::<LittleEndian>(self.points.len() as u32)?;
        for point in &self.points {
            payload.write_u32::<LittleEndian>(point.len() as u32)?;
            payload.write_all(point.as_bytes())?;
        }

        let crc = crc32fast::hash(&payload);

        let mut record = Vec::with_capacity(4 + payload.len());
        record.write_u32::<LittleEndian>(crc)?;
        record.write_all(&payload)?;

        Ok(record)
    }

    /// Deserialize a shard write from bytes.
    pub fn from_bytes(bytes: &[u8]) -> io::Result<Self> {
        if bytes.len() < RECORD_HEADER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "record too small",
            ));
        }

        let mut cursor = io::Cursor::new(bytes);
        let stored_crc = cursor.read_u32::<LittleEndian>()?;

        let payload = &bytes[4..];
        let computed_crc = crc32fast::hash(payload);
        if computed_crc != stored_crc {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("CRC mismatch: expected {stored_crc}, got {computed_crc}"),
            ));
        }

        let shard_id = ShardId::new(cursor.read_u64::<LittleEndian>()?);
        let count = cursor.read_u32::<LittleEndian>()? as usize;

        let mut points = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let len = cursor.read_u32::<LittleEndian>()? as usize;
            let remaining = bytes.len() as u64 - cursor.position();
            if len as u64 > remaining {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("point length {len} exceeds remaining {remaining} bytes"),
                ));
            }
            let mut buf = vec![0u8; len];
            cursor.read_exact(&mut buf)?;
            points.push(Point::from(buf));
        }

        Ok(Self { shard_id, points })
    }

    /// Total serialized size of this record in bytes.
    pub fn serialized_size(&self) -> usize {
        RECORD_HEADER_SIZE + self.points.iter().map(|p| 4 + p.len()).sum::<usize>()
    }
}
