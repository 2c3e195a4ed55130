//! The `parcel` module is the core component of the `shm-parcel` library,
//! providing a [`Parcel`] struct for sharing one logically-typed value
//! between processes.
//!
//! A parcel stores its payload in a keyed shared-memory segment behind a
//! 7-byte header carrying the segment state, the payload size (or successor
//! key), and the permission mask. The header is also the relocation channel:
//! when a wrapped value no longer fits, the writer creates a doubled segment,
//! advertises the new key in the old header, and retires the old segment. A
//! stale handle in another process discovers the move purely by inspecting
//! the old segment and chases the link on its next access.
//!
//! Read-modify-write cycles across processes are linearised by a named
//! semaphore through [`Parcel::synchronized`]. Plain [`Parcel::unwrap`] and
//! [`Parcel::wrap`] calls without the semaphore are permitted but may observe
//! torn state while another process is mid-relocation; any inconsistency
//! surfaces as [`ParcelError::Corrupt`], never as silently wrong data.

use std::marker::PhantomData;

use bytecheck::CheckBytes;
use rkyv::de::deserializers::SharedDeserializeMap;
use rkyv::ser::serializers::AllocSerializer;
use rkyv::validation::validators::DefaultValidator;
use rkyv::{AlignedVec, Archive, Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::header::{SegmentHeader, SegmentState, HEADER_LEN};
use crate::parcel::ParcelError::*;
use crate::segment::{self, Segment, SegmentError};
use crate::sem::{SemError, Semaphore};

/// Default payload capacity in bytes for newly constructed parcels.
pub const DEFAULT_CAPACITY: usize = 16384;

/// Default permission mask for newly constructed parcels.
pub const DEFAULT_PERMISSIONS: u16 = 0o600;

/// `ParcelError` enumerates all possible errors returned by this library.
/// Low-level segment and semaphore failures are wrapped at the parcel
/// boundary; callers should treat `Corrupt` and `Io` as fatal for the parcel
/// instance.
#[derive(Error, Debug)]
pub enum ParcelError {
    /// The initial segment could not be created or written.
    #[error("error initializing parcel segment: {0}")]
    InitSegment(#[source] SegmentError),
    /// The parcel's semaphore could not be created or opened.
    #[error("error initializing parcel semaphore: {0}")]
    InitSem(#[source] SemError),
    /// An operation was attempted on a freed parcel.
    #[error("parcel is freed")]
    Freed,
    /// Header state unrecognised, payload size invalid, or payload failed to
    /// (de)serialize.
    #[error("parcel corrupt: {0}")]
    Corrupt(&'static str),
    /// An underlying segment read, write, open or delete failed.
    #[error("parcel i/o: {0}")]
    Io(#[from] SegmentError),
    /// The cross-process semaphore failed.
    #[error("parcel semaphore: {0}")]
    Sem(#[from] SemError),
}

/// Serializable rendezvous for opening an existing parcel from another
/// process: the current segment key and the semaphore name.
///
/// A handle does not keep the parcel alive. It is the sender's job to keep
/// some live handle attached while a serialized handle is in transit; transit
/// is not atomic.
#[derive(Archive, Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[archive_attr(derive(CheckBytes))]
pub struct ParcelHandle {
    /// Key of the segment holding the payload as of serialization time.
    pub key: u32,
    /// Name of the cross-process semaphore guarding the parcel.
    pub sem: String,
}

/// `Parcel` is a shared-memory container that stores a single value of type
/// `T` so that cooperating processes can read and mutate it with mutual
/// exclusion.
///
/// The parcel is a passive object: critical sections run on whatever
/// execution vehicle the caller uses, and the only shared mutable resource is
/// the segment bytes. Each handle owns its own segment attachment; the
/// semaphore is shared across processes via its name.
///
/// Template parameters:
///   - `T` - payload type, serialized with rkyv
///   - `N` - serializer scratch space size
pub struct Parcel<T, const N: usize = 1024> {
    /// Key of the segment currently believed to hold the payload.
    key: u32,
    /// Attached segment; `None` once the parcel is freed.
    segment: Option<Segment>,
    /// Cross-process mutex linearising read-modify-write cycles.
    sem: Semaphore,
    _payload: PhantomData<T>,
}

impl<T, const N: usize> Parcel<T, N>
where
    T: Archive + Serialize<AllocSerializer<N>>,
    T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, SharedDeserializeMap>,
{
    /// Create a new parcel holding `value`, with default capacity and
    /// permissions.
    pub fn new(value: &T) -> Result<Self, ParcelError> {
        Self::with_params(value, DEFAULT_CAPACITY, DEFAULT_PERMISSIONS)
    }

    /// Create a new parcel holding `value` with an explicit payload
    /// `capacity` in bytes and permission mask.
    ///
    /// The segment key derives from the identity of this handle; a hash
    /// collision with an existing segment surfaces as
    /// [`ParcelError::InitSegment`], not a silent retry.
    pub fn with_params(value: &T, capacity: usize, permissions: u16) -> Result<Self, ParcelError> {
        let key = segment::initial_key();
        let mut seg =
            Segment::create(key, permissions, capacity + HEADER_LEN).map_err(InitSegment)?;
        seg.write(0, &SegmentHeader::allocated(0, permissions).encode())
            .map_err(InitSegment)?;

        let sem = match Semaphore::create(&sem_name(key), permissions) {
            Ok(sem) => sem,
            Err(err) => {
                // do not leak the segment when the semaphore name collides
                let _ = seg.mark_deleted();
                return Err(InitSem(err));
            }
        };

        let mut parcel = Parcel {
            key,
            segment: Some(seg),
            sem,
            _payload: PhantomData,
        };
        if let Err(err) = parcel.wrap(value) {
            // retire the half-built parcel rather than leaking the segment
            let _ = parcel.free();
            return Err(err);
        }
        Ok(parcel)
    }

    /// Open a parcel from a [`ParcelHandle`] produced in another process.
    ///
    /// The segment is attached, never created. A handle whose parcel has
    /// been freed fails to open here or, if the OS has recycled the key,
    /// reports [`ParcelError::Corrupt`] on the first read.
    pub fn from_handle(handle: &ParcelHandle) -> Result<Self, ParcelError> {
        let seg = Segment::open(handle.key)?;
        let sem = Semaphore::open(&handle.sem).map_err(InitSem)?;
        Ok(Parcel {
            key: handle.key,
            segment: Some(seg),
            sem,
            _payload: PhantomData,
        })
    }

    /// Serializable handle for the parcel in its current state.
    pub fn handle(&self) -> Result<ParcelHandle, ParcelError> {
        if self.segment.is_none() {
            return Err(Freed);
        }
        Ok(ParcelHandle {
            key: self.key,
            sem: self.sem.name().to_owned(),
        })
    }

    /// Whether the parcel has been freed, as observed through this handle.
    pub fn is_freed(&self) -> bool {
        self.segment.is_none()
    }

    /// Read the current value.
    ///
    /// Chases any pending relocations first, closing stale segments along the
    /// way. Callers either hold the parcel's mutex (see
    /// [`Parcel::synchronized`]) or accept that a concurrent writer can make
    /// the read fail with [`ParcelError::Corrupt`].
    pub fn unwrap(&mut self) -> Result<T, ParcelError> {
        let header = self.chase()?;
        if header.state != SegmentState::Allocated {
            return Err(Corrupt("segment is not allocated"));
        }

        let seg = self.segment.as_ref().ok_or(Freed)?;
        let size = header.size_or_key as usize;
        if size == 0 {
            return Err(Corrupt("allocated payload is empty"));
        }
        if size + HEADER_LEN > seg.capacity() {
            return Err(Corrupt("payload size exceeds segment capacity"));
        }

        // payload bytes start at offset 7 and are therefore unaligned in the
        // mapping; rkyv validation requires an aligned buffer
        let data = seg.read(HEADER_LEN, size)?;
        let mut aligned = AlignedVec::with_capacity(size);
        aligned.extend_from_slice(data);
        rkyv::from_bytes::<T>(&aligned).map_err(|_| Corrupt("payload failed to deserialize"))
    }

    /// Store `value` as the parcel's payload, relocating to a doubled
    /// segment when the serialized form no longer fits.
    ///
    /// A failure mid-relocation leaves the old segment retired and this
    /// handle freed; the caller must still release the mutex if it holds it,
    /// which the [`Parcel::synchronized`] guard does automatically.
    pub fn wrap(&mut self, value: &T) -> Result<(), ParcelError> {
        if self.segment.is_none() {
            return Err(Freed);
        }

        let bytes =
            rkyv::to_bytes::<T, N>(value).map_err(|_| Corrupt("value failed to serialize"))?;

        // the permission mask recorded at creation is carried across moves
        let header = self.chase()?;
        let permissions = header.permissions;

        let capacity = self.segment.as_ref().ok_or(Freed)?.capacity();
        if bytes.len() + HEADER_LEN <= capacity {
            let seg = self.segment.as_mut().ok_or(Freed)?;
            seg.write(
                0,
                &SegmentHeader::allocated(bytes.len() as u32, permissions).encode(),
            )?;
            seg.write(HEADER_LEN, &bytes)?;
        } else {
            self.relocate(&bytes, permissions)?;
        }
        Ok(())
    }

    /// Run `f` as a read-modify-write critical section under the parcel's
    /// cross-process mutex.
    ///
    /// `f` receives the current value and may either mutate it in place and
    /// return `None`, or return `Some(replacement)`. The resulting value is
    /// wrapped back and returned. There is no no-op signal distinct from
    /// returning the input unchanged.
    ///
    /// All effects of a `synchronized` invocation are totally ordered with
    /// respect to any other `synchronized` on the same parcel across all
    /// processes. The mutex is held until the write-back completes and is
    /// released on every exit path, including failure of the intermediate
    /// steps.
    pub fn synchronized<F>(&mut self, f: F) -> Result<T, ParcelError>
    where
        F: FnOnce(&mut T) -> Option<T>,
    {
        let _guard = self.sem.acquire()?;

        let mut value = self.unwrap()?;
        if let Some(replacement) = f(&mut value) {
            value = replacement;
        }
        self.wrap(&value)?;
        Ok(value)
    }

    /// Free the parcel: mark the segment freed, retire it, and remove the
    /// semaphore. Idempotent.
    ///
    /// Holders in other processes observe the freed state on their next
    /// access and fail with [`ParcelError::Freed`]. Freeing while another
    /// holder is inside [`Parcel::synchronized`] is a usage error.
    pub fn free(&mut self) -> Result<(), ParcelError> {
        let seg = match self.segment.as_mut() {
            Some(seg) => seg,
            None => return Ok(()),
        };

        seg.write(0, &SegmentHeader::freed().encode())?;
        seg.mark_deleted()?;
        self.segment = None;
        self.sem.unlink()?;

        debug!(key = self.key, "freed parcel");
        Ok(())
    }

    /// Clone the parcel into an independent container: the current value is
    /// copied into a fresh segment guarded by a fresh semaphore, so mutations
    /// of the clone never affect the original.
    pub fn try_clone(&mut self) -> Result<Self, ParcelError> {
        let value = self.unwrap()?;
        let header = self.read_header()?;
        let capacity = self.segment.as_ref().ok_or(Freed)?.capacity() - HEADER_LEN;
        Self::with_params(&value, capacity, header.permissions)
    }

    /// Follow `Moved` links until the attached segment is the live one,
    /// detaching each stale segment as soon as its successor opens. Bounded
    /// by the number of relocations since this handle's last access.
    fn chase(&mut self) -> Result<SegmentHeader, ParcelError> {
        let mut header = self.read_header()?;
        while header.state == SegmentState::Moved {
            let next = header.size_or_key;
            let seg = Segment::open(next)?;
            debug!(from = self.key, to = next, "chasing relocated segment");
            self.segment = Some(seg);
            self.key = next;
            header = self.read_header()?;
        }

        if header.state == SegmentState::Freed {
            self.segment = None;
            return Err(Freed);
        }
        Ok(header)
    }

    /// Relocation writes a `Moved` link into the old header, retires the old
    /// segment, and copies the payload into a doubled replacement. A failure
    /// partway leaves the old segment retired, so the handle degrades to
    /// freed rather than pointing into a half-built chain.
    fn relocate(&mut self, payload: &[u8], permissions: u16) -> Result<(), ParcelError> {
        match self.try_relocate(payload, permissions) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.segment = None;
                Err(err)
            }
        }
    }

    fn try_relocate(&mut self, payload: &[u8], permissions: u16) -> Result<(), ParcelError> {
        let new_key = segment::next_key(self.key);

        // advertise the move to other holders, then retire the old segment
        let old = self.segment.as_mut().ok_or(Freed)?;
        old.write(0, &SegmentHeader::moved(new_key).encode())?;
        old.mark_deleted()?;

        let mut seg = Segment::create(new_key, permissions, 2 * payload.len() + HEADER_LEN)?;
        seg.write(
            0,
            &SegmentHeader::allocated(payload.len() as u32, permissions).encode(),
        )?;
        seg.write(HEADER_LEN, payload)?;

        debug!(
            from = self.key,
            to = new_key,
            capacity = 2 * payload.len(),
            "relocated parcel"
        );
        self.segment = Some(seg);
        self.key = new_key;
        Ok(())
    }

    fn read_header(&self) -> Result<SegmentHeader, ParcelError> {
        let seg = self.segment.as_ref().ok_or(Freed)?;
        let bytes = seg.read(0, HEADER_LEN)?;
        let mut buf = [0u8; HEADER_LEN];
        buf.copy_from_slice(bytes);
        SegmentHeader::decode(&buf)
    }
}

/// Semaphore name for a parcel born at `key`. Relocations do not rename the
/// semaphore; handles carry the name explicitly.
fn sem_name(key: u32) -> String {
    format!("/parcel-{key:08x}")
}
