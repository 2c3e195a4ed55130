//! `shm-parcel` is a shared-memory container for a single logically-typed
//! value, shared between cooperating processes (typically a parent and its
//! worker children) with mutual exclusion.
//!
//! ## Features
//!
//! - **Keyed shared-memory segments**: each parcel lives in one POSIX shared
//!   memory object identified by a 32-bit integer key, attachable from any
//!   process that knows the key.
//!
//! - **In-band relocation protocol**: every segment starts with a 7-byte
//!   header that doubles as an out-of-band signalling channel. When a value
//!   outgrows its segment, the writer moves the payload to a doubled
//!   replacement segment and leaves the new key behind in the old header;
//!   stale handles in other processes chase the link on their next access.
//!
//! - **Cross-process mutual exclusion**: a named POSIX semaphore, encoded
//!   into the parcel's serializable handle, linearises read-modify-write
//!   cycles via [`parcel::Parcel::synchronized`].
//!
//! - **Typed payloads**: values are serialized with [rkyv](https://rkyv.org/).
//!   The templated type `T` for [`parcel::Parcel`] can be any Rust struct
//!   implementing specified `rkyv` traits, so no dynamic typing is involved
//!   at the storage layer.
//!
//! To get started with `shm-parcel`, please see [`parcel::Parcel`].
mod header;
pub mod parcel;
pub mod segment;
pub mod sem;
