//! Recycling store for job handles.
//!
//! Spawning jobs at a high rate allocates a fresh handle (buffers, state,
//! channel) per job. A [`HandlePool`] hands released handles back out
//! instead, and tags every handle it builds with a permanent identity.

use std::sync::Mutex;

use tracing::{debug, warn};

use super::job::JobHandle;

/// Identity base; the first handle a pool builds gets `base + 1`.
pub const POOL_BASE_IDENTITY: u64 = 1000;

struct PoolInner {
    /// Identity of the most recently built handle.
    last_identity: u64,
    available: Vec<JobHandle>,
    auto_reset: bool,
    /// Released handles beyond this many are dropped instead of kept.
    max_idle: Option<usize>,
}

/// A pool of reusable [`JobHandle`]s.
///
/// The pool does not schedule or throttle jobs; it only recycles handles.
///
/// # Example
///
/// ```rust
/// use jobexec::HandlePool;
///
/// let pool = HandlePool::new();
/// let first = pool.acquire();
/// let second = pool.acquire();
/// assert_eq!((first.identity(), second.identity()), (1001, 1002));
///
/// pool.release(first);
/// assert_eq!(pool.acquire().identity(), 1001);
/// assert_eq!(pool.count(), 2);
/// ```
pub struct HandlePool {
    inner: Mutex<PoolInner>,
}

impl Default for HandlePool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HandlePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("HandlePool")
            .field("count", &(inner.last_identity - POOL_BASE_IDENTITY))
            .field("available", &inner.available.len())
            .field("auto_reset", &inner.auto_reset)
            .field("max_idle", &inner.max_idle)
            .finish()
    }
}

impl HandlePool {
    /// Create a pool that hands out released handles as they were left.
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                last_identity: POOL_BASE_IDENTITY,
                available: Vec::new(),
                auto_reset: false,
                max_idle: None,
            }),
        }
    }

    /// Create a pool that resets every handle on acquire.
    pub fn with_auto_reset() -> Self {
        let pool = Self::new();
        pool.set_auto_reset(true);
        pool
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn set_auto_reset(&self, auto_reset: bool) {
        self.lock().auto_reset = auto_reset;
    }

    pub fn auto_reset(&self) -> bool {
        self.lock().auto_reset
    }

    /// Cap the number of idle handles kept for reuse; `None` keeps all.
    ///
    /// Lowering the cap drops surplus idle handles right away.
    pub fn set_max_idle(&self, max_idle: Option<usize>) {
        let mut inner = self.lock();
        inner.max_idle = max_idle;
        if let Some(max) = max_idle {
            inner.available.truncate(max);
        }
    }

    pub fn max_idle(&self) -> Option<usize> {
        self.lock().max_idle
    }

    /// Take a released handle, or build a new one with the next identity.
    pub fn acquire(&self) -> JobHandle {
        let (handle, auto_reset) = {
            let mut inner = self.lock();
            let handle = if let Some(handle) = inner.available.pop() {
                handle
            } else {
                inner.last_identity += 1;
                debug!(identity = inner.last_identity, "building new job handle");
                JobHandle::with_identity(inner.last_identity)
            };
            (handle, inner.auto_reset)
        };

        if auto_reset {
            handle.reset();
        }
        handle
    }

    /// Give a handle back for reuse. The handle is not reset here.
    ///
    /// The handle must not be running, and other clones of it must not be
    /// used after release. Releasing a handle that is already idle in the
    /// pool is ignored, so one handle is never handed out twice. Returns
    /// whether the handle was kept.
    pub fn release(&self, handle: JobHandle) -> bool {
        if handle.is_running() {
            warn!(
                identity = handle.identity(),
                "releasing a job handle that is still running"
            );
        }

        let mut inner = self.lock();
        if inner.available.iter().any(|idle| idle.ptr_eq(&handle)) {
            warn!(identity = handle.identity(), "job handle released twice");
            return false;
        }
        if inner.max_idle.is_some_and(|max| inner.available.len() >= max) {
            debug!(identity = handle.identity(), "pool full, dropping job handle");
            return false;
        }
        inner.available.push(handle);
        true
    }

    /// Number of handles this pool has ever built.
    pub fn count(&self) -> usize {
        let built = self.lock().last_identity - POOL_BASE_IDENTITY;
        usize::try_from(built).unwrap_or(usize::MAX)
    }

    /// Number of released handles waiting to be reused.
    pub fn available(&self) -> usize {
        self.lock().available.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_identity_sequence() {
        let pool = HandlePool::new();

        let e1 = pool.acquire();
        let e2 = pool.acquire();
        assert_eq!(e1.identity(), 1001);
        assert_eq!(e2.identity(), 1002);
        pool.release(e1);

        // Reuses the released handle.
        let e1 = pool.acquire();
        // e2 was never released, so this one is new.
        let e3 = pool.acquire();
        assert_eq!(e1.identity(), 1001);
        assert_eq!(e3.identity(), 1003);
        assert_eq!(pool.count(), 3);

        pool.release(e1);
        pool.release(e2);
        pool.release(e3);
        assert_eq!(pool.available(), 3);
        assert_eq!(pool.count(), 3);
    }

    #[test]
    fn test_without_auto_reset_keeps_state() {
        let pool = HandlePool::new();
        let job = pool.acquire();
        job.configure("/tmp", "echo", ["stale"]);
        job.write_stdin("leftover");
        pool.release(job);

        let job = pool.acquire();
        assert_eq!(job.command(), "echo");
        assert_eq!(job.stdin(), b"leftover");
    }

    #[test]
    fn test_auto_reset_on_acquire() {
        let pool = HandlePool::with_auto_reset();
        assert!(pool.auto_reset());

        let job = pool.acquire();
        job.configure("/tmp", "echo", ["stale"]);
        job.set_job_tag(Some(3));
        pool.release(job);

        let job = pool.acquire();
        assert_eq!(job.identity(), 1001);
        assert_eq!(job.command(), "");
        assert!(job.job_tag().is_none());
        assert!(job.working_dir().is_none());
    }

    #[test]
    fn test_release_does_not_reset() {
        let pool = HandlePool::with_auto_reset();
        let job = pool.acquire();
        let observer = job.clone();
        job.configure("", "echo", ["kept"]);
        pool.release(job);

        assert_eq!(observer.command(), "echo");
    }

    #[test]
    fn test_concurrent_acquire_distinct_identities() {
        let pool = Arc::new(HandlePool::new());

        let identities: Vec<u64> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    let pool = pool.clone();
                    scope.spawn(move || {
                        (0..50)
                            .map(|_| pool.acquire().identity())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            workers
                .into_iter()
                .flat_map(|worker| worker.join().unwrap())
                .collect()
        });

        let unique: HashSet<_> = identities.iter().copied().collect();
        assert_eq!(unique.len(), identities.len());
        assert_eq!(pool.count(), 400);
        assert!(unique.iter().all(|id| *id > POOL_BASE_IDENTITY));
    }

    #[test]
    fn test_identity_stable_across_cycles() {
        let pool = HandlePool::with_auto_reset();
        let first = pool.acquire();
        let identity = first.identity();
        pool.release(first);

        for _ in 0..10 {
            let job = pool.acquire();
            assert_eq!(job.identity(), identity);
            pool.release(job);
        }
        assert_eq!(pool.count(), 1);
    }

    #[test]
    fn test_double_release_is_ignored() {
        let pool = HandlePool::new();
        let job = pool.acquire();
        let copy = job.clone();

        assert!(pool.release(job));
        assert!(!pool.release(copy));
        assert_eq!(pool.available(), 1);

        let first = pool.acquire();
        let second = pool.acquire();
        assert!(!first.ptr_eq(&second));
        assert_eq!(first.identity(), 1001);
        assert_eq!(second.identity(), 1002);
    }

    #[test]
    fn test_max_idle_drops_surplus() {
        let pool = HandlePool::new();
        pool.set_max_idle(Some(2));
        assert_eq!(pool.max_idle(), Some(2));

        let jobs: Vec<_> = (0..3).map(|_| pool.acquire()).collect();
        let kept: Vec<bool> = jobs.into_iter().map(|job| pool.release(job)).collect();
        assert_eq!(kept, vec![true, true, false]);
        assert_eq!(pool.available(), 2);

        pool.set_max_idle(Some(1));
        assert_eq!(pool.available(), 1);

        // Counts every handle built, kept or not.
        assert_eq!(pool.count(), 3);
    }
}
