//! Named shared-memory segments.
//!
//! A segment is a file mapped `MAP_SHARED` by both processes. On Linux the
//! default directory is `/dev/shm`, so the file never touches a disk.

use crate::backoff::Backoff;
use crate::layout::{
    ChannelHeader, ChannelLayout, CHANNEL_MAGIC, STATE_INITIALIZING, STATE_READY, STATE_UNINIT,
};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Errors raised while creating or attaching a segment.
#[derive(Debug, Error)]
pub enum SegmentError {
    /// The backing file could not be created, resized or mapped.
    #[error("segment {name}: {source}")]
    Io {
        /// Segment name.
        name: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// The existing mapping is smaller than the layout needs.
    #[error("segment {name} is {actual} bytes, need {required}")]
    TooSmall {
        /// Segment name.
        name: String,
        /// Mapped size.
        actual: usize,
        /// Size the layout requires.
        required: usize,
    },
    /// The peer initialized the segment with a different layout.
    #[error(
        "segment {name} layout mismatch: peer has {peer_commands}/{peer_data} slots, \
         expected {commands}/{data}"
    )]
    LayoutMismatch {
        /// Segment name.
        name: String,
        /// Command capacity found in the header.
        peer_commands: u64,
        /// Data capacity found in the header.
        peer_data: u64,
        /// Command capacity this process expects.
        commands: usize,
        /// Data capacity this process expects.
        data: usize,
    },
    /// The peer started initializing the header but never finished.
    #[error("segment {name}: peer did not finish initialization within {waited:?}")]
    AttachTimeout {
        /// Segment name.
        name: String,
        /// How long we waited.
        waited: Duration,
    },
}

/// A shared memory mapping, either file-backed (named) or anonymous.
pub struct SharedSegment {
    name: String,
    path: Option<PathBuf>,
    owner: bool,
    base: NonNull<u8>,
    len: usize,
    // Keeps `base` valid until drop.
    _map: MmapMut,
}

// SAFETY: the mapping lives as long as the segment; all cross-thread access to
// its contents goes through atomics or the single-writer ring protocol.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Creates `dir/name` or attaches to it if the peer created it first,
    /// growing the file to `size` bytes if it is shorter.
    pub fn open_or_create(dir: &Path, name: &str, size: usize) -> Result<Self, SegmentError> {
        let path = dir.join(name);
        let io_err = |source| SegmentError::Io {
            name: name.to_owned(),
            source,
        };

        let (file, owner) = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => (file, true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => (
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&path)
                    .map_err(io_err)?,
                false,
            ),
            Err(e) => return Err(io_err(e)),
        };

        grow(&file, size).map_err(io_err)?;

        // SAFETY: the file is only ever mapped by the two bridge processes,
        // which access it through the channel protocol.
        let mut map = unsafe { MmapOptions::new().len(size).map_mut(&file) }.map_err(io_err)?;
        let base = NonNull::new(map.as_mut_ptr()).ok_or_else(|| {
            io_err(io::Error::new(io::ErrorKind::Other, "null mapping"))
        })?;

        debug!(segment = name, owner, size, path = %path.display(), "attached shared segment");

        Ok(Self {
            name: name.to_owned(),
            path: Some(path),
            owner,
            base,
            len: size,
            _map: map,
        })
    }

    /// Creates an anonymous mapping visible only inside this process.
    pub fn anonymous(name: &str, size: usize) -> Result<Self, SegmentError> {
        let mut map = MmapMut::map_anon(size).map_err(|source| SegmentError::Io {
            name: name.to_owned(),
            source,
        })?;
        let base = NonNull::new(map.as_mut_ptr()).ok_or_else(|| SegmentError::Io {
            name: name.to_owned(),
            source: io::Error::new(io::ErrorKind::Other, "null mapping"),
        })?;
        Ok(Self {
            name: name.to_owned(),
            path: None,
            owner: true,
            base,
            len: size,
            _map: map,
        })
    }

    /// Segment name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mapped size in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` for a zero-length mapping.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns `true` if this process created the backing file.
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Pointer `offset` bytes into the mapping.
    pub(crate) fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset <= self.len, "offset {} beyond segment {}", offset, self.len);
        // SAFETY: offset is within the mapping.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
    }

    /// The channel header at offset 0.
    pub(crate) fn header(&self) -> &ChannelHeader {
        // SAFETY: callers only use this after checking the segment is at least
        // layout-sized; the mapping is page aligned and zero-filled on creation,
        // which is a valid bit pattern for every atomic in the header.
        unsafe { self.base.cast::<ChannelHeader>().as_ref() }
    }

    /// Initializes the channel header, or waits for the peer to do so, then
    /// validates that both processes agree on the layout.
    pub(crate) fn attach_channel(
        &self,
        layout: &ChannelLayout,
        attach_timeout: Duration,
    ) -> Result<(), SegmentError> {
        if self.len < layout.total_size() {
            return Err(SegmentError::TooSmall {
                name: self.name.clone(),
                actual: self.len,
                required: layout.total_size(),
            });
        }

        let header = self.header();
        if header
            .init_state
            .compare_exchange(
                STATE_UNINIT,
                STATE_INITIALIZING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            header.initialize(layout.command_capacity, layout.data_capacity);
            debug!(segment = %self.name, "initialized channel header");
            return Ok(());
        }

        let start = Instant::now();
        let mut backoff = Backoff::new();
        while header.init_state.load(Ordering::Acquire) != STATE_READY {
            if start.elapsed() >= attach_timeout {
                return Err(SegmentError::AttachTimeout {
                    name: self.name.clone(),
                    waited: start.elapsed(),
                });
            }
            backoff.wait(Duration::from_millis(1));
        }

        let peer_commands = header.command_capacity.load(Ordering::Relaxed);
        let peer_data = header.data_capacity.load(Ordering::Relaxed);
        if header.magic.load(Ordering::Relaxed) != CHANNEL_MAGIC
            || peer_commands != layout.command_capacity as u64
            || peer_data != layout.data_capacity as u64
        {
            return Err(SegmentError::LayoutMismatch {
                name: self.name.clone(),
                peer_commands,
                peer_data,
                commands: layout.command_capacity,
                data: layout.data_capacity,
            });
        }
        Ok(())
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        if let (true, Some(path)) = (self.owner, self.path.as_ref()) {
            if let Err(e) = fs::remove_file(path) {
                debug!(segment = %self.name, error = %e, "failed to unlink segment");
            }
        }
    }
}

impl std::fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSegment")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("owner", &self.owner)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

fn grow(file: &File, size: usize) -> io::Result<()> {
    let current = file.metadata()?.len();
    if current < size as u64 {
        file.set_len(size as u64)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_attacher_sees_same_memory() {
        let dir = tempfile::tempdir().unwrap();
        let a = SharedSegment::open_or_create(dir.path(), "seg", 4096).unwrap();
        let b = SharedSegment::open_or_create(dir.path(), "seg", 4096).unwrap();
        assert!(a.is_owner());
        assert!(!b.is_owner());

        // SAFETY: both pointers are within their 4096-byte mappings.
        unsafe {
            a.ptr_at(1000).as_ptr().write(0xAB);
            assert_eq!(b.ptr_at(1000).as_ptr().read(), 0xAB);
        }
    }

    #[test]
    fn test_owner_unlinks_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let seg = SharedSegment::open_or_create(dir.path(), "gone", 4096).unwrap();
        assert!(dir.path().join("gone").exists());
        drop(seg);
        assert!(!dir.path().join("gone").exists());
    }

    #[test]
    fn test_attach_validates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ChannelLayout::new(16, 64);
        let other = ChannelLayout::new(32, 64);
        let size = other.total_size();

        let a = SharedSegment::open_or_create(dir.path(), "ch", size).unwrap();
        a.attach_channel(&layout, Duration::from_millis(100)).unwrap();

        let b = SharedSegment::open_or_create(dir.path(), "ch", size).unwrap();
        b.attach_channel(&layout, Duration::from_millis(100)).unwrap();

        let c = SharedSegment::open_or_create(dir.path(), "ch", size).unwrap();
        let err = c
            .attach_channel(&other, Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, SegmentError::LayoutMismatch { peer_commands: 16, .. }));
    }

    #[test]
    fn test_attach_rejects_small_mapping() {
        let seg = SharedSegment::anonymous("tiny", 64).unwrap();
        let err = seg
            .attach_channel(&ChannelLayout::new(16, 64), Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, SegmentError::TooSmall { actual: 64, .. }));
    }

    #[test]
    fn test_attach_times_out_on_stuck_peer() {
        let layout = ChannelLayout::new(16, 64);
        let seg = SharedSegment::anonymous("stuck", layout.total_size()).unwrap();
        seg.header()
            .init_state
            .store(STATE_INITIALIZING, Ordering::Release);

        let err = seg
            .attach_channel(&layout, Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, SegmentError::AttachTimeout { .. }));
    }
}
