//! Process-shared robust mutexes.
//!
//! Wraps a `pthread_mutex_t` configured with `PTHREAD_PROCESS_SHARED` and
//! `PTHREAD_MUTEX_ROBUST` so the mutex can live inside a shared region and
//! survive a holder process dying mid-critical-section: the next locker
//! gets `EOWNERDEAD` instead of hanging forever, recovers the mutex with
//! `pthread_mutex_consistent`, and proceeds holding the lock.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;

use crate::error::{IpsmError, IpsmResult};

/// A process-shared, robust, non-recursive mutex.
///
/// Must be constructed in place inside shared memory via [`RobustMutex::init_at`];
/// a `RobustMutex` value on the stack or heap of a single process works too,
/// but gains nothing over `std::sync::Mutex`.
#[repr(transparent)]
pub struct RobustMutex {
    raw: UnsafeCell<libc::pthread_mutex_t>,
}

unsafe impl Send for RobustMutex {}
unsafe impl Sync for RobustMutex {}

impl RobustMutex {
    fn build_attr(kind: i32) -> IpsmResult<libc::pthread_mutexattr_t> {
        unsafe {
            let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
            check("pthread_mutexattr_init", libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;
            let mut attr = attr.assume_init();

            check(
                "pthread_mutexattr_settype",
                libc::pthread_mutexattr_settype(&mut attr, kind),
            )?;

            let ret = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
            if ret != 0 && ret != libc::ENOSYS {
                libc::pthread_mutexattr_destroy(&mut attr);
                return Err(IpsmError::System {
                    op: "pthread_mutexattr_setpshared",
                    errno: ret,
                });
            }

            check(
                "pthread_mutexattr_setrobust",
                libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST),
            )
            .map_err(|e| {
                libc::pthread_mutexattr_destroy(&mut attr);
                e
            })?;

            Ok(attr)
        }
    }

    /// Initializes a `RobustMutex` in place at `dst`.
    ///
    /// # Safety
    /// `dst` must be valid for writes of `Self` and remain at that address
    /// for the lifetime of the mutex (other processes will embed it at the
    /// same relative position within a shared mapping).
    pub unsafe fn init_at(dst: *mut Self, kind: i32) -> IpsmResult<()> {
        let mut attr = Self::build_attr(kind)?;
        let mut raw = MaybeUninit::<libc::pthread_mutex_t>::uninit();
        let ret = libc::pthread_mutex_init(raw.as_mut_ptr(), &attr);
        libc::pthread_mutexattr_destroy(&mut attr);
        if ret != 0 {
            return Err(IpsmError::System {
                op: "pthread_mutex_init",
                errno: ret,
            });
        }
        std::ptr::write(
            dst,
            Self {
                raw: UnsafeCell::new(raw.assume_init()),
            },
        );
        Ok(())
    }

    /// Constructs a fast (non-recursive) mutex for single-process use or
    /// tests. Production use always goes through [`RobustMutex::init_at`]
    /// inside a mapped region.
    pub fn new() -> IpsmResult<Self> {
        let mut attr = Self::build_attr(libc::PTHREAD_MUTEX_NORMAL)?;
        let mut raw = MaybeUninit::<libc::pthread_mutex_t>::uninit();
        let ret = unsafe { libc::pthread_mutex_init(raw.as_mut_ptr(), &attr) };
        unsafe { libc::pthread_mutexattr_destroy(&mut attr) };
        if ret != 0 {
            return Err(IpsmError::System {
                op: "pthread_mutex_init",
                errno: ret,
            });
        }
        Ok(Self {
            raw: UnsafeCell::new(unsafe { raw.assume_init() }),
        })
    }

    fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.raw.get()
    }

    /// Blocks until the lock is acquired. If the previous holder died while
    /// holding it, recovers the mutex via `pthread_mutex_consistent` and
    /// returns successfully holding the lock (the data it protects must be
    /// assumed to need repair by the caller).
    pub fn lock(&self) -> IpsmResult<()> {
        let ret = unsafe { libc::pthread_mutex_lock(self.raw()) };
        match ret {
            0 => Ok(()),
            libc::EOWNERDEAD => self.recover(false).map(|_| ()),
            _ => Err(IpsmError::System {
                op: "pthread_mutex_lock",
                errno: ret,
            }),
        }
    }

    /// Attempts to acquire the lock without blocking.
    pub fn try_lock(&self) -> IpsmResult<bool> {
        let ret = unsafe { libc::pthread_mutex_trylock(self.raw()) };
        match ret {
            0 => Ok(true),
            libc::EBUSY | libc::EDEADLK => Ok(false),
            libc::EOWNERDEAD => self.recover(true),
            _ => Err(IpsmError::System {
                op: "pthread_mutex_trylock",
                errno: ret,
            }),
        }
    }

    /// Marks a mutex consistent after observing `EOWNERDEAD`. `is_try`
    /// distinguishes `try_lock`'s caller from `lock`'s: on a subsequent
    /// `EINVAL` (the mutex was already destroyed or wasn't actually
    /// inconsistent), `lock` still reports the acquisition successful, but
    /// `try_lock` reports the attempt as failed, matching the reference
    /// `try_lock`'s `ans = false` in this exact case.
    fn recover(&self, is_try: bool) -> IpsmResult<bool> {
        let ret = unsafe { libc::pthread_mutex_consistent(self.raw()) };
        match ret {
            0 => Ok(true),
            libc::EINVAL => {
                tracing::warn!("pthread_mutex_consistent: EINVAL, mutex already destroyed or not inconsistent");
                Ok(!is_try)
            }
            _ => Err(IpsmError::System {
                op: "pthread_mutex_consistent",
                errno: ret,
            }),
        }
    }

    /// Releases the lock held by the calling thread.
    pub fn unlock(&self) {
        let ret = unsafe { libc::pthread_mutex_unlock(self.raw()) };
        if ret == libc::EPERM {
            tracing::warn!("pthread_mutex_unlock: caller is not the lock owner");
        } else if ret != 0 {
            tracing::error!(errno = ret, "pthread_mutex_unlock failed");
        }
    }

    pub(crate) fn raw_ptr(&self) -> *mut libc::pthread_mutex_t {
        self.raw()
    }

    /// Locks `self` and returns a guard that unlocks on drop.
    pub fn lock_guard(&self) -> IpsmResult<MutexGuard<'_>> {
        self.lock()?;
        Ok(MutexGuard { mutex: self })
    }
}

/// RAII guard returned by [`RobustMutex::lock_guard`].
pub struct MutexGuard<'a> {
    mutex: &'a RobustMutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

impl Drop for RobustMutex {
    fn drop(&mut self) {
        let ret = unsafe { libc::pthread_mutex_destroy(self.raw()) };
        if ret == libc::EBUSY {
            unsafe {
                libc::pthread_mutex_unlock(self.raw());
                libc::pthread_mutex_destroy(self.raw());
            }
        }
    }
}

/// A process-shared, robust, recursive mutex: the same thread may lock it
/// more than once, and must unlock it the same number of times.
#[repr(transparent)]
pub struct RecursiveRobustMutex {
    raw: UnsafeCell<libc::pthread_mutex_t>,
}

unsafe impl Send for RecursiveRobustMutex {}
unsafe impl Sync for RecursiveRobustMutex {}

impl RecursiveRobustMutex {
    /// # Safety
    /// Same contract as [`RobustMutex::init_at`].
    pub unsafe fn init_at(dst: *mut Self) -> IpsmResult<()> {
        let mut attr = RobustMutex::build_attr(libc::PTHREAD_MUTEX_RECURSIVE)?;
        let mut raw = MaybeUninit::<libc::pthread_mutex_t>::uninit();
        let ret = libc::pthread_mutex_init(raw.as_mut_ptr(), &attr);
        libc::pthread_mutexattr_destroy(&mut attr);
        if ret != 0 {
            return Err(IpsmError::System {
                op: "pthread_mutex_init",
                errno: ret,
            });
        }
        std::ptr::write(
            dst,
            Self {
                raw: UnsafeCell::new(raw.assume_init()),
            },
        );
        Ok(())
    }

    pub fn new() -> IpsmResult<Self> {
        let mut attr = RobustMutex::build_attr(libc::PTHREAD_MUTEX_RECURSIVE)?;
        let mut raw = MaybeUninit::<libc::pthread_mutex_t>::uninit();
        let ret = unsafe { libc::pthread_mutex_init(raw.as_mut_ptr(), &attr) };
        unsafe { libc::pthread_mutexattr_destroy(&mut attr) };
        if ret != 0 {
            return Err(IpsmError::System {
                op: "pthread_mutex_init",
                errno: ret,
            });
        }
        Ok(Self {
            raw: UnsafeCell::new(unsafe { raw.assume_init() }),
        })
    }

    fn as_robust(&self) -> &RobustMutex {
        unsafe { &*(self as *const Self as *const RobustMutex) }
    }

    pub fn lock(&self) -> IpsmResult<()> {
        self.as_robust().lock()
    }

    pub fn try_lock(&self) -> IpsmResult<bool> {
        self.as_robust().try_lock()
    }

    pub fn unlock(&self) {
        self.as_robust().unlock()
    }
}

impl Drop for RecursiveRobustMutex {
    fn drop(&mut self) {
        let ret = unsafe { libc::pthread_mutex_destroy(self.raw.get()) };
        if ret == libc::EBUSY {
            unsafe {
                libc::pthread_mutex_unlock(self.raw.get());
                libc::pthread_mutex_destroy(self.raw.get());
            }
        }
    }
}

fn check(op: &'static str, ret: i32) -> IpsmResult<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(IpsmError::System { op, errno: ret })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn lock_unlock_roundtrip() {
        let mtx = RobustMutex::new().unwrap();
        mtx.lock().unwrap();
        mtx.unlock();
    }

    #[test]
    fn try_lock_fails_while_held() {
        let mtx = Arc::new(RobustMutex::new().unwrap());
        mtx.lock().unwrap();
        let mtx2 = mtx.clone();
        let handle = thread::spawn(move || mtx2.try_lock().unwrap());
        assert!(!handle.join().unwrap());
        mtx.unlock();
    }

    #[test]
    fn recover_on_non_inconsistent_mutex_distinguishes_try_from_blocking_caller() {
        // pthread_mutex_consistent on a mutex that was never actually left
        // inconsistent reports EINVAL. `lock`'s caller should still be told
        // it holds the lock; `try_lock`'s caller should be told it failed.
        let mtx = RobustMutex::new().unwrap();
        assert!(mtx.recover(false).unwrap());
        assert!(!mtx.recover(true).unwrap());
    }

    #[test]
    fn recursive_mutex_allows_nested_lock() {
        let mtx = RecursiveRobustMutex::new().unwrap();
        mtx.lock().unwrap();
        mtx.lock().unwrap();
        mtx.unlock();
        mtx.unlock();
    }

    #[test]
    fn contended_lock_serializes_threads() {
        let mtx = Arc::new(RobustMutex::new().unwrap());
        let counter = Arc::new(UnsafeCell::new(0u64));
        struct SendCell(Arc<UnsafeCell<u64>>);
        unsafe impl Send for SendCell {}

        let mut handles = Vec::new();
        for _ in 0..8 {
            let mtx = mtx.clone();
            let cell = SendCell(counter.clone());
            handles.push(thread::spawn(move || {
                let cell = cell;
                for _ in 0..1000 {
                    mtx.lock().unwrap();
                    unsafe {
                        *cell.0.get() += 1;
                    }
                    mtx.unlock();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(unsafe { *counter.get() }, 8000);
    }
}
