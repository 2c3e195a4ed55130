//! The `segment` module wraps one OS shared-memory object identified by an
//! unsigned 32-bit integer key.
//!
//! Segments are POSIX shared memory objects named after their key, created
//! with a fixed byte capacity and attached with `memmap2`. A segment never
//! grows in place; a parcel that outgrows its segment relocates into a
//! freshly created one. Deletion follows shared-memory reference counting:
//! [`Segment::mark_deleted`] unlinks the name, so the object disappears once
//! the last attached process detaches. Detaching itself happens on drop.

use std::fs::File;
use std::hash::Hasher;
use std::io;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::MmapMut;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use rand::Rng;
use thiserror::Error;
use wyhash::WyHash;

/// Smallest key handed out by the allocation policy.
pub(crate) const KEY_MIN: u32 = 0x10;
/// Largest key handed out by the allocation policy.
pub(crate) const KEY_MAX: u32 = 0xFFFF_FFFE;

/// `SegmentError` enumerates all possible errors returned by the low-level
/// shared-memory wrapper.
#[derive(Error, Debug)]
pub enum SegmentError {
    /// The segment could not be created, e.g. one already exists at the key.
    #[error("error creating segment {key:#010x}: {source}")]
    Create { key: u32, source: io::Error },
    /// The segment could not be attached.
    #[error("error opening segment {key:#010x}: {source}")]
    Open { key: u32, source: io::Error },
    /// A read or write fell outside the segment capacity.
    #[error("segment {key:#010x} i/o out of bounds: offset {offset} + len {len} > capacity {capacity}")]
    OutOfBounds {
        key: u32,
        offset: usize,
        len: usize,
        capacity: usize,
    },
    /// Unlinking the underlying object failed.
    #[error("segment {key:#010x} i/o error: {source}")]
    Io { key: u32, source: io::Error },
}

/// One OS shared-memory segment attached read/write into this process.
///
/// Each process owns its own attachment; attachments are not shared between
/// handles. Dropping the segment detaches it.
pub struct Segment {
    key: u32,
    mmap: MmapMut,
}

impl Segment {
    /// Create the segment for `key` with the given permission mask and byte
    /// capacity, failing if one already exists at `key`. Initial bytes are
    /// zero.
    pub fn create(key: u32, permissions: u16, capacity: usize) -> Result<Self, SegmentError> {
        let name = shm_name(key);
        let fd = shm_open(
            name.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::from_bits_truncate(permissions as libc::mode_t),
        )
        .map_err(|errno| SegmentError::Create {
            key,
            source: errno.into(),
        })?;

        // ftruncate zero-fills, so a fresh segment reads as all zeroes
        let mmap = ftruncate(&fd, capacity as libc::off_t)
            .map_err(io::Error::from)
            .and_then(|_| map_fd(fd))
            .map_err(|source| {
                // do not leak the name when initialization fails halfway
                let _ = shm_unlink(name.as_str());
                SegmentError::Create { key, source }
            })?;

        Ok(Segment { key, mmap })
    }

    /// Attach read/write to an existing segment.
    pub fn open(key: u32) -> Result<Self, SegmentError> {
        let name = shm_name(key);
        let fd = shm_open(name.as_str(), OFlag::O_RDWR, Mode::empty()).map_err(|errno| {
            SegmentError::Open {
                key,
                source: errno.into(),
            }
        })?;

        let mmap = map_fd(fd).map_err(|source| SegmentError::Open { key, source })?;

        Ok(Segment { key, mmap })
    }

    /// Key of this segment.
    #[inline]
    pub fn key(&self) -> u32 {
        self.key
    }

    /// Current OS-reported byte capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.mmap.len()
    }

    /// Read `len` bytes starting at `offset`.
    #[inline]
    pub fn read(&self, offset: usize, len: usize) -> Result<&[u8], SegmentError> {
        self.check_bounds(offset, len)?;
        Ok(&self.mmap[offset..offset + len])
    }

    /// Write `bytes` at `offset`. Writes past capacity fail.
    #[inline]
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<(), SegmentError> {
        self.check_bounds(offset, bytes.len())?;
        self.mmap[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Request deletion of the underlying object at last detach. The segment
    /// stays usable through currently attached handles until they drop.
    pub fn mark_deleted(&self) -> Result<(), SegmentError> {
        shm_unlink(shm_name(self.key).as_str()).map_err(|errno| SegmentError::Io {
            key: self.key,
            source: errno.into(),
        })
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<(), SegmentError> {
        let capacity = self.mmap.len();
        match offset.checked_add(len) {
            Some(end) if end <= capacity => Ok(()),
            _ => Err(SegmentError::OutOfBounds {
                key: self.key,
                offset,
                len,
                capacity,
            }),
        }
    }
}

/// Map the whole shared-memory object behind `fd` into this process.
fn map_fd(fd: std::os::fd::OwnedFd) -> io::Result<MmapMut> {
    let file = File::from(fd);
    unsafe { MmapMut::map_mut(&file) }
}

/// Shared-memory object name for a segment key.
fn shm_name(key: u32) -> String {
    format!("/parcel-{key:08x}")
}

/// Derive an initial key from the identity of a freshly constructed handle.
///
/// Two handles created independently hash to distinct keys with high
/// probability; a collision surfaces as a [`SegmentError::Create`] failure at
/// construction time and is the caller's problem.
pub(crate) fn initial_key() -> u32 {
    static HANDLE_SEQ: AtomicU64 = AtomicU64::new(0);

    let mut hasher = WyHash::default();
    hasher.write_u32(process::id());
    hasher.write_u64(HANDLE_SEQ.fetch_add(1, Ordering::Relaxed));
    clamp_key(hasher.finish())
}

/// Pick the key for a relocation target: the successor of the current key,
/// re-rolled into the allocatable range once the key space is exhausted.
pub(crate) fn next_key(key: u32) -> u32 {
    if key < u32::MAX {
        key + 1
    } else {
        rand::thread_rng().gen_range(KEY_MIN..=KEY_MAX)
    }
}

fn clamp_key(hash: u64) -> u32 {
    KEY_MIN + (hash % u64::from(KEY_MAX - KEY_MIN + 1)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_open_read_write() {
        let key = initial_key();
        let mut segment = Segment::create(key, 0o600, 64).unwrap();
        assert_eq!(segment.key(), key);
        assert_eq!(segment.capacity(), 64);

        // fresh bytes are zero
        assert_eq!(segment.read(0, 4).unwrap(), &[0, 0, 0, 0]);

        segment.write(3, b"abc").unwrap();

        // writes through one attachment are visible through another
        let mut view = Segment::open(key).unwrap();
        assert_eq!(view.read(3, 3).unwrap(), b"abc");
        view.write(10, &[0xFF]).unwrap();
        assert_eq!(segment.read(10, 1).unwrap(), &[0xFF]);

        segment.mark_deleted().unwrap();
    }

    #[test]
    fn test_create_existing_key_fails() {
        let key = initial_key();
        let segment = Segment::create(key, 0o600, 32).unwrap();
        assert!(matches!(
            Segment::create(key, 0o600, 32),
            Err(SegmentError::Create { .. })
        ));
        segment.mark_deleted().unwrap();
    }

    #[test]
    fn test_open_missing_key_fails() {
        let key = initial_key();
        assert!(matches!(
            Segment::open(key),
            Err(SegmentError::Open { .. })
        ));
    }

    #[test]
    fn test_out_of_bounds_io() {
        let key = initial_key();
        let mut segment = Segment::create(key, 0o600, 16).unwrap();

        assert!(matches!(
            segment.read(10, 7),
            Err(SegmentError::OutOfBounds { .. })
        ));
        assert!(matches!(
            segment.write(16, &[1]),
            Err(SegmentError::OutOfBounds { .. })
        ));
        assert!(matches!(
            segment.read(usize::MAX, 2),
            Err(SegmentError::OutOfBounds { .. })
        ));

        segment.mark_deleted().unwrap();
    }

    #[test]
    fn test_mark_deleted_keeps_attachments_alive() {
        let key = initial_key();
        let mut segment = Segment::create(key, 0o600, 32).unwrap();
        segment.write(0, b"still here").unwrap();
        segment.mark_deleted().unwrap();

        // the name is gone, but the existing attachment still works
        assert!(Segment::open(key).is_err());
        assert_eq!(segment.read(0, 10).unwrap(), b"still here");
    }

    #[test]
    fn test_key_policy() {
        assert_eq!(next_key(5), 6);
        assert_eq!(next_key(KEY_MAX), KEY_MAX + 1);

        let rolled = next_key(u32::MAX);
        assert!((KEY_MIN..=KEY_MAX).contains(&rolled));

        let first = initial_key();
        let second = initial_key();
        assert_ne!(first, second);
        assert!((KEY_MIN..=KEY_MAX).contains(&first));
    }
}
