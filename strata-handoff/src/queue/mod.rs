//! Segmented append-only queue.
//!
//! A durable FIFO of opaque byte records for one destination node. Records
//! are appended to the active segment, replayed from the head cursor, and
//! bounded on disk by evicting whole sealed segments oldest-first. One
//! producer (foreground appends, serialized upstream) and one consumer (the
//! replay loop) share the queue; all state lives behind a single mutex
//! because every operation also touches the filesystem.

mod cursor;
mod segment;

use crate::error::{HandoffError, Result};
use crate::metrics::HandoffMetrics;
use bytes::Bytes;
use cursor::Cursor;
use parking_lot::Mutex;
use segment::{ActiveSegment, SealedSegment, FRAME_HEADER};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

/// Durable FIFO over byte records with bounded disk usage.
pub struct Queue {
    dir: PathBuf,
    segment_size: u64,
    max_size: u64,
    metrics: Arc<HandoffMetrics>,
    inner: Mutex<QueueInner>,
}

struct QueueInner {
    /// Sealed segments in ID order. Invariant: the head cursor is in the
    /// front sealed segment or in the active one; fully consumed segments
    /// are unlinked as the cursor passes them.
    sealed: VecDeque<SealedSegment>,
    active: ActiveSegment,
    cursor: Cursor,
    closed: bool,
}

impl Queue {
    /// Open a queue directory, recovering any on-disk state.
    ///
    /// Segment files are scanned and sorted by ID; the highest becomes the
    /// active segment (or segment 1 is created for an empty directory). The
    /// cursor sidecar is validated against the surviving segments and reset
    /// to the start of the oldest segment when missing or inconsistent.
    pub fn open(
        dir: impl Into<PathBuf>,
        segment_size: u64,
        max_size: u64,
        metrics: Arc<HandoffMetrics>,
    ) -> Result<Self> {
        let dir = dir.into();

        fs::create_dir_all(&dir).map_err(|e| HandoffError::QueueOpen {
            path: dir.clone(),
            cause: format!("failed to create queue directory: {e}"),
        })?;

        let mut segments: Vec<(u64, PathBuf, u64)> = Vec::new();
        let entries = fs::read_dir(&dir).map_err(|e| HandoffError::QueueOpen {
            path: dir.clone(),
            cause: format!("failed to read queue directory: {e}"),
        })?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(id) = segment::parse_segment_file_name(name) else {
                continue;
            };
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            segments.push((id, entry.path(), size));
        }
        segments.sort_by_key(|(id, _, _)| *id);

        let active_id = segments.last().map(|(id, _, _)| *id).unwrap_or(1);
        let active = ActiveSegment::open(&dir, active_id)?;

        let mut sealed: VecDeque<SealedSegment> = segments
            .into_iter()
            .filter(|(id, _, _)| *id != active_id)
            .map(|(id, path, size)| SealedSegment { id, path, size })
            .collect();

        // Validate the persisted cursor against what actually survives.
        let lowest = sealed.front().map(|s| s.id).unwrap_or(active.id);
        let cursor = match cursor::load(&dir) {
            Some(c) if Self::cursor_is_consistent(&c, &sealed, &active) => c,
            Some(_) | None => {
                let reset = Cursor {
                    segment: lowest,
                    offset: 0,
                };
                cursor::store(&dir, reset)?;
                reset
            }
        };

        // Segments fully behind the cursor were consumed before a crash
        // that interrupted their unlink.
        while let Some(front) = sealed.front() {
            if front.id >= cursor.segment {
                break;
            }
            if let Err(e) = fs::remove_file(&front.path) {
                tracing::warn!(path = %front.path.display(), error = %e, "failed to remove consumed segment");
                break;
            }
            sealed.pop_front();
        }

        Ok(Self {
            dir,
            segment_size,
            max_size,
            metrics,
            inner: Mutex::new(QueueInner {
                sealed,
                active,
                cursor,
                closed: false,
            }),
        })
    }

    fn cursor_is_consistent(
        cursor: &Cursor,
        sealed: &VecDeque<SealedSegment>,
        active: &ActiveSegment,
    ) -> bool {
        if cursor.segment == active.id {
            return cursor.offset <= active.size;
        }
        sealed
            .iter()
            .any(|s| s.id == cursor.segment && cursor.offset <= s.size)
    }

    /// Append one record, rotating and evicting as needed.
    ///
    /// Fails with `DiskFull` when the record cannot fit within the disk
    /// budget even with every sealed segment evicted; nothing is written in
    /// that case.
    pub fn append(&self, record: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(HandoffError::QueueClosed);
        }

        let frame = FRAME_HEADER + record.len() as u64;
        let will_rotate = inner.active.size > 0 && inner.active.size + frame > self.segment_size;
        let projected_active = if will_rotate {
            frame
        } else {
            inner.active.size + frame
        };
        if projected_active > self.max_size {
            return Err(HandoffError::DiskFull {
                requested: frame,
                max_size: self.max_size,
            });
        }

        if will_rotate {
            self.rotate_locked(&mut inner)?;
        }

        inner.active.append_frame(record)?;
        self.enforce_budget_locked(&mut inner);
        Ok(())
    }

    /// Seal the active segment and start the next one.
    fn rotate_locked(&self, inner: &mut QueueInner) -> Result<()> {
        let next_id = inner.active.id + 1;
        let new_active = ActiveSegment::open(&self.dir, next_id)?;
        let old = std::mem::replace(&mut inner.active, new_active);

        tracing::debug!(segment = old.id, bytes = old.size, "sealed segment");
        inner.sealed.push_back(old.seal());
        Ok(())
    }

    /// Evict oldest sealed segments until the queue is back under budget.
    ///
    /// The head cursor always sits in the oldest unconsumed segment, so
    /// evicting the front can mean evicting unreplayed data; the cursor is
    /// then advanced to the start of the next segment and the loss counted.
    /// The active segment is never evicted.
    fn enforce_budget_locked(&self, inner: &mut QueueInner) {
        while Self::total_locked(inner) > self.max_size {
            let Some(front) = inner.sealed.front() else {
                break;
            };
            let (id, path, size) = (front.id, front.path.clone(), front.size);

            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to evict segment");
                break;
            }
            inner.sealed.pop_front();
            self.metrics.incr_evicted(1, size);
            tracing::warn!(
                segment = id,
                bytes = size,
                "evicted sealed segment over disk budget"
            );

            if inner.cursor.segment == id {
                let next = inner.sealed.front().map(|s| s.id).unwrap_or(inner.active.id);
                inner.cursor = Cursor {
                    segment: next,
                    offset: 0,
                };
                if let Err(e) = cursor::store(&self.dir, inner.cursor) {
                    tracing::warn!(error = %e, "failed to persist cursor after eviction");
                }
                tracing::warn!(segment = id, "replay cursor advanced past evicted segment");
            }
        }
    }

    /// Move the cursor past fully consumed sealed segments, unlinking them.
    fn normalize_locked(&self, inner: &mut QueueInner) -> Result<()> {
        loop {
            if inner.cursor.segment == inner.active.id {
                return Ok(());
            }

            let Some(front) = inner.sealed.front() else {
                // Cursor points at a segment that no longer exists.
                inner.cursor = Cursor {
                    segment: inner.active.id,
                    offset: 0,
                };
                cursor::store(&self.dir, inner.cursor)?;
                return Ok(());
            };
            let (front_id, front_path, front_size) = (front.id, front.path.clone(), front.size);

            if inner.cursor.segment < front_id {
                // Cursor's segment was evicted out from under it.
                inner.cursor = Cursor {
                    segment: front_id,
                    offset: 0,
                };
                cursor::store(&self.dir, inner.cursor)?;
                continue;
            }

            if inner.cursor.segment > front_id || inner.cursor.offset >= front_size {
                // Front segment fully consumed; retire it.
                if let Err(e) = fs::remove_file(&front_path) {
                    tracing::warn!(path = %front_path.display(), error = %e, "failed to remove consumed segment");
                }
                inner.sealed.pop_front();
                if inner.cursor.segment == front_id {
                    let next = inner.sealed.front().map(|s| s.id).unwrap_or(inner.active.id);
                    inner.cursor = Cursor {
                        segment: next,
                        offset: 0,
                    };
                    cursor::store(&self.dir, inner.cursor)?;
                }
                continue;
            }

            return Ok(());
        }
    }

    /// Peek the record at the head cursor without advancing.
    ///
    /// Returns `None` when the cursor has reached the end of the active
    /// segment.
    pub fn head(&self) -> Result<Option<Bytes>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(HandoffError::QueueClosed);
        }
        self.normalize_locked(&mut inner)?;

        if inner.cursor.segment == inner.active.id {
            if inner.cursor.offset >= inner.active.size {
                return Ok(None);
            }
            return segment::read_frame(&inner.active.path, inner.cursor.offset, inner.active.size)
                .map(Some);
        }

        let Some(front) = inner.sealed.front() else {
            return Ok(None);
        };
        segment::read_frame(&front.path, inner.cursor.offset, front.size).map(Some)
    }

    /// Advance the head cursor past the record last returned by [`head`].
    ///
    /// Unlinks a sealed segment once the cursor crosses its end. No-op on an
    /// empty queue. The new cursor is persisted before returning.
    ///
    /// [`head`]: Queue::head
    pub fn advance(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(HandoffError::QueueClosed);
        }
        self.normalize_locked(&mut inner)?;

        let (path, seg_size, in_active) = if inner.cursor.segment == inner.active.id {
            if inner.cursor.offset >= inner.active.size {
                return Ok(());
            }
            (inner.active.path.clone(), inner.active.size, true)
        } else {
            let Some(front) = inner.sealed.front() else {
                return Ok(());
            };
            (front.path.clone(), front.size, false)
        };

        let frame = segment::frame_size(&path, inner.cursor.offset, seg_size)?;
        inner.cursor.offset += frame;

        if in_active {
            // Fully drained: reclaim the active segment's disk space.
            if inner.cursor.offset >= inner.active.size {
                inner.active.reset()?;
                inner.cursor = Cursor {
                    segment: inner.active.id,
                    offset: 0,
                };
            }
        } else if inner.cursor.offset >= seg_size {
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove consumed segment");
            }
            inner.sealed.pop_front();
            let next = inner.sealed.front().map(|s| s.id).unwrap_or(inner.active.id);
            inner.cursor = Cursor {
                segment: next,
                offset: 0,
            };
        }

        cursor::store(&self.dir, inner.cursor)?;
        Ok(())
    }

    fn total_locked(inner: &QueueInner) -> u64 {
        inner.sealed.iter().map(|s| s.size).sum::<u64>() + inner.active.size
    }

    /// Current total on-disk bytes across all segments.
    pub fn total_size(&self) -> u64 {
        Self::total_locked(&self.inner.lock())
    }

    /// Whether every appended record has been replayed.
    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock();
        let sealed_consumed = inner.sealed.iter().all(|s| {
            inner.cursor.segment > s.id
                || (inner.cursor.segment == s.id && inner.cursor.offset >= s.size)
        });
        let active_consumed = if inner.cursor.segment == inner.active.id {
            inner.cursor.offset >= inner.active.size
        } else {
            inner.active.size == 0
        };
        sealed_consumed && active_consumed
    }

    /// Modification time of the earliest surviving segment.
    pub fn oldest_mod_time(&self) -> Result<SystemTime> {
        let inner = self.inner.lock();
        let path = inner
            .sealed
            .front()
            .map(|s| s.path.as_path())
            .unwrap_or(inner.active.path.as_path());
        Self::mod_time(path)
    }

    /// Most recent modification time across all surviving segments.
    pub fn last_mod_time(&self) -> Result<SystemTime> {
        let inner = self.inner.lock();
        let mut latest = Self::mod_time(&inner.active.path)?;
        for seg in &inner.sealed {
            let t = Self::mod_time(&seg.path)?;
            if t > latest {
                latest = t;
            }
        }
        Ok(latest)
    }

    fn mod_time(path: &Path) -> Result<SystemTime> {
        fs::metadata(path)
            .and_then(|m| m.modified())
            .map_err(|e| HandoffError::Io {
                path: path.to_path_buf(),
                cause: e.to_string(),
            })
    }

    /// The queue directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Close the queue. Further operations fail with `QueueClosed`.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        if let Err(e) = inner.active.flush() {
            tracing::warn!(error = %e, "flush on close failed");
        }
        inner.closed = true;
        Ok(())
    }

    /// Delete every segment and the queue directory. Terminal.
    pub fn purge(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        fs::remove_dir_all(&self.dir).map_err(|e| HandoffError::Io {
            path: self.dir.clone(),
            cause: format!("failed to purge queue directory: {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_queue(dir: &Path) -> Queue {
        Queue::open(dir, 1024, 64 * 1024, Arc::new(HandoffMetrics::new())).unwrap()
    }

    #[test]
    fn append_then_head_on_empty_queue() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open_queue(dir.path());

        assert!(queue.head().unwrap().is_none());
        queue.append(b"hello").unwrap();
        assert_eq!(&queue.head().unwrap().unwrap()[..], b"hello");
        // Peek does not advance
        assert_eq!(&queue.head().unwrap().unwrap()[..], b"hello");
    }

    #[test]
    fn fifo_order_within_segment() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open_queue(dir.path());

        queue.append(b"a").unwrap();
        queue.append(b"bb").unwrap();
        queue.append(b"ccc").unwrap();

        assert_eq!(&queue.head().unwrap().unwrap()[..], b"a");
        queue.advance().unwrap();
        assert_eq!(&queue.head().unwrap().unwrap()[..], b"bb");
        queue.advance().unwrap();
        assert_eq!(&queue.head().unwrap().unwrap()[..], b"ccc");
        queue.advance().unwrap();
        assert!(queue.head().unwrap().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn advance_on_empty_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open_queue(dir.path());
        queue.advance().unwrap();
        queue.advance().unwrap();
        assert!(queue.head().unwrap().is_none());
    }

    #[test]
    fn rotation_preserves_order_and_unlinks_consumed() {
        let dir = tempfile::tempdir().unwrap();
        // Tiny segments: every record rotates
        let queue = Queue::open(dir.path(), 16, 64 * 1024, Arc::new(HandoffMetrics::new())).unwrap();

        for i in 0..5u8 {
            queue.append(&[b'r', b'0' + i, b'x', b'y', b'z', b'w', b'v', b'u', b't']).unwrap();
        }

        for i in 0..5u8 {
            let head = queue.head().unwrap().unwrap();
            assert_eq!(head[1], b'0' + i);
            queue.advance().unwrap();
        }
        assert!(queue.head().unwrap().is_none());

        // Only the active segment file and the cursor sidecar remain
        let files: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".hh"))
            .collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn closed_queue_rejects_operations() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open_queue(dir.path());
        queue.close().unwrap();
        queue.close().unwrap();

        assert!(matches!(
            queue.append(b"x").unwrap_err(),
            HandoffError::QueueClosed
        ));
        assert!(matches!(queue.head().unwrap_err(), HandoffError::QueueClosed));
    }

    #[test]
    fn oversized_record_is_disk_full() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Queue::open(dir.path(), 64, 128, Arc::new(HandoffMetrics::new())).unwrap();

        let big = vec![0u8; 256];
        assert!(matches!(
            queue.append(&big).unwrap_err(),
            HandoffError::DiskFull { .. }
        ));
        // Nothing was written
        assert_eq!(queue.total_size(), 0);
    }

    #[test]
    fn purge_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let qdir = dir.path().join("q");
        let queue = open_queue(&qdir);
        queue.append(b"doomed").unwrap();

        queue.close().unwrap();
        queue.purge().unwrap();
        assert!(!qdir.exists());
    }
}
