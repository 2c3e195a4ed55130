//! The `sem` module provides cross-process mutual exclusion over a POSIX
//! named semaphore, utilizing RAII principles to control the critical
//! section lifecycle.
//!
//! The semaphore is a counting semaphore capped at 1 and initialised to 1,
//! addressable by name from any process after `fork`/`exec`. Acquisition
//! returns a [`SemGuard`] that posts the semaphore exactly once, on drop or
//! on explicit [`SemGuard::release`], on every exit path including failure.
//!
//! Fairness and reentrancy are not provided; a holder must not re-acquire.

use std::ffi::CString;
use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

use thiserror::Error;

/// `SemError` enumerates all possible errors returned by the named semaphore
/// wrapper.
#[derive(Error, Debug)]
pub enum SemError {
    /// The name contains an interior NUL byte.
    #[error("invalid semaphore name {name:?}")]
    InvalidName { name: String },
    /// The semaphore could not be created, e.g. the name is already taken.
    #[error("error creating semaphore {name}: {source}")]
    Create { name: String, source: io::Error },
    /// The semaphore could not be opened.
    #[error("error opening semaphore {name}: {source}")]
    Open { name: String, source: io::Error },
    /// Waiting on the semaphore failed.
    #[error("error acquiring semaphore {name}: {source}")]
    Acquire { name: String, source: io::Error },
    /// Removing the semaphore name failed.
    #[error("error removing semaphore {name}: {source}")]
    Unlink { name: String, source: io::Error },
}

struct SemInner {
    name: String,
    c_name: CString,
    sem: NonNull<libc::sem_t>,
}

// The sem_t lives in kernel-managed shared memory; sem_wait and sem_post are
// safe to call concurrently on the same descriptor.
unsafe impl Send for SemInner {}
unsafe impl Sync for SemInner {}

impl Drop for SemInner {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem.as_ptr());
        }
    }
}

/// A named counting semaphore with maximum value 1, shared across processes.
///
/// Clones share the underlying descriptor; a clone is the same mutex, not a
/// new one. The descriptor is closed when the last clone (and any outstanding
/// guard) drops. The name survives until [`Semaphore::unlink`].
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<SemInner>,
}

impl Semaphore {
    /// Create a new semaphore with initial value 1, failing if the name is
    /// already taken.
    pub fn create(name: &str, mode: u16) -> Result<Self, SemError> {
        let c_name = c_name(name)?;
        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                mode as libc::c_uint,
                1 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(SemError::Create {
                name: name.to_owned(),
                source: io::Error::last_os_error(),
            });
        }

        Ok(Self::from_raw(name, c_name, sem))
    }

    /// Open an existing semaphore by name.
    pub fn open(name: &str) -> Result<Self, SemError> {
        let c_name = c_name(name)?;
        let sem = unsafe { libc::sem_open(c_name.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(SemError::Open {
                name: name.to_owned(),
                source: io::Error::last_os_error(),
            });
        }

        Ok(Self::from_raw(name, c_name, sem))
    }

    fn from_raw(name: &str, c_name: CString, sem: *mut libc::sem_t) -> Self {
        // sem_open success never returns null; SEM_FAILED was checked above
        let sem = NonNull::new(sem).expect("sem_open returned null");
        Semaphore {
            inner: Arc::new(SemInner {
                name: name.to_owned(),
                c_name,
                sem,
            }),
        }
    }

    /// Name by which other processes can open this semaphore.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Block cooperatively until the semaphore is taken, returning a guard
    /// that releases it exactly once.
    pub fn acquire(&self) -> Result<SemGuard, SemError> {
        loop {
            let rc = unsafe { libc::sem_wait(self.inner.sem.as_ptr()) };
            if rc == 0 {
                return Ok(SemGuard {
                    inner: Arc::clone(&self.inner),
                    released: false,
                });
            }

            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(SemError::Acquire {
                    name: self.inner.name.clone(),
                    source: err,
                });
            }
            // interrupted by a signal, retry the wait
        }
    }

    /// Remove the underlying OS primitive. Existing holders keep their
    /// descriptors; the name becomes available for reuse. Safe to call when
    /// the name has already been removed.
    pub fn unlink(&self) -> Result<(), SemError> {
        let rc = unsafe { libc::sem_unlink(self.inner.c_name.as_ptr()) };
        if rc == 0 {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            return Ok(());
        }
        Err(SemError::Unlink {
            name: self.inner.name.clone(),
            source: err,
        })
    }
}

fn c_name(name: &str) -> Result<CString, SemError> {
    CString::new(name).map_err(|_| SemError::InvalidName {
        name: name.to_owned(),
    })
}

/// An RAII implementation of a "scoped lock" of the semaphore.
///
/// The guard keeps the semaphore descriptor alive and posts it when dropped,
/// so the release fires on every exit path of the section it protects.
pub struct SemGuard {
    inner: Arc<SemInner>,
    released: bool,
}

impl SemGuard {
    /// Release the semaphore now instead of at drop.
    pub fn release(mut self) {
        self.post();
    }

    fn post(&mut self) {
        if !self.released {
            self.released = true;
            // posting a semaphore acquired through this guard cannot overflow
            unsafe {
                libc::sem_post(self.inner.sem.as_ptr());
            }
        }
    }
}

impl Drop for SemGuard {
    /// Posts the semaphore when the guard goes out of scope.
    fn drop(&mut self) {
        self.post();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn test_name(tag: &str) -> String {
        format!("/parcel-sem-test-{}-{}", tag, std::process::id())
    }

    #[test]
    fn test_create_open_unlink() {
        let name = test_name("lifecycle");
        let sem = Semaphore::create(&name, 0o600).unwrap();
        assert_eq!(sem.name(), name);

        // the name is taken until unlinked
        assert!(matches!(
            Semaphore::create(&name, 0o600),
            Err(SemError::Create { .. })
        ));
        let other = Semaphore::open(&name).unwrap();
        drop(other);

        sem.unlink().unwrap();
        // unlink of an already-removed name is accepted
        sem.unlink().unwrap();
        assert!(matches!(
            Semaphore::open(&name),
            Err(SemError::Open { .. })
        ));
    }

    #[test]
    fn test_invalid_name_rejected() {
        assert!(matches!(
            Semaphore::create("/bad\0name", 0o600),
            Err(SemError::InvalidName { .. })
        ));
    }

    #[test]
    fn test_guard_releases_on_drop_and_on_release() {
        let name = test_name("guard");
        let sem = Semaphore::create(&name, 0o600).unwrap();

        // each acquire below would deadlock if the previous guard leaked
        drop(sem.acquire().unwrap());
        sem.acquire().unwrap().release();
        let guard = sem.acquire().unwrap();
        drop(guard);

        sem.unlink().unwrap();
    }

    #[test]
    fn test_mutual_exclusion() {
        let name = test_name("exclusion");
        let sem = Semaphore::create(&name, 0o600).unwrap();
        let in_section = Arc::new(AtomicU32::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let sem = sem.clone();
                let in_section = Arc::clone(&in_section);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let guard = sem.acquire().unwrap();
                        assert_eq!(in_section.fetch_add(1, Ordering::SeqCst), 0);
                        thread::sleep(Duration::from_micros(10));
                        in_section.fetch_sub(1, Ordering::SeqCst);
                        drop(guard);
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        sem.unlink().unwrap();
    }
}
