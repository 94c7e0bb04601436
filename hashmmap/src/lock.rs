use std::fs::File;
use std::io;
use std::sync::Arc;

use fs2::FileExt;

use crate::metrics::Metrics;

/// The exclusive lock guarding structural changes of one store.
///
/// An advisory `flock` on the header file. Locks belong to the open file description, so every
/// handle opens its own and excludes all others, in this process or another one.
pub(crate) struct StructuralLock {
    file: Arc<File>,
}

/// Holds the structural lock until dropped.
pub(crate) struct LockGuard {
    file: Arc<File>,
}

impl StructuralLock {
    pub(crate) fn new(file: &File) -> io::Result<Self> {
        Ok(StructuralLock {
            file: Arc::new(file.try_clone()?),
        })
    }

    /// Block until the lock is ours. There is no timeout.
    pub(crate) fn acquire(&self, metrics: &mut dyn Metrics) -> io::Result<LockGuard> {
        if let Some(guard) = self.try_acquire()? {
            return Ok(guard);
        }

        metrics.counter("lock_contended", 1);
        tracing::trace!("structural lock contended, waiting");
        self.file.lock_exclusive()?;

        Ok(LockGuard {
            file: self.file.clone(),
        })
    }

    /// Take the lock if no other handle holds it, `None` otherwise.
    pub(crate) fn try_acquire(&self) -> io::Result<Option<LockGuard>> {
        match self.file.try_lock_exclusive() {
            Ok(()) => Ok(Some(LockGuard {
                file: self.file.clone(),
            })),
            Err(err) if is_contended(&err) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&*self.file);
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[test]
fn try_acquire_does_not_wait() {
    let path = tempfile::NamedTempFile::new().unwrap();
    let a = StructuralLock::new(&File::open(path.path()).unwrap()).unwrap();
    let b = StructuralLock::new(&File::open(path.path()).unwrap()).unwrap();

    let held = a.try_acquire().unwrap().expect("nobody holds the lock");
    assert!(b.try_acquire().unwrap().is_none());

    drop(held);
    assert!(b.try_acquire().unwrap().is_some());
}
