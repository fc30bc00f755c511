//! Process-shared condition variable bound to a specific clock.
//!
//! Like [`crate::mutex::RobustMutex`], a `CondVar` is configured with
//! `PTHREAD_PROCESS_SHARED` so it can be waited on and signalled from any
//! process attached to the region it lives in. The wait clock is fixed at
//! construction time via `pthread_condattr_setclock`, since a condvar's
//! clock can't be changed afterward and the two sides of a wait/notify
//! pair must agree on it.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::time::Duration;

use crate::error::{IpsmError, IpsmResult};
use crate::mutex::RobustMutex;

/// Outcome of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CvStatus {
    NoTimeout,
    Timeout,
}

/// A process-shared condition variable.
#[repr(transparent)]
pub struct CondVar {
    raw: UnsafeCell<libc::pthread_cond_t>,
}

unsafe impl Send for CondVar {}
unsafe impl Sync for CondVar {}

impl CondVar {
    fn build(clock: libc::clockid_t) -> IpsmResult<libc::pthread_cond_t> {
        unsafe {
            let mut attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
            check(
                "pthread_condattr_init",
                libc::pthread_condattr_init(attr.as_mut_ptr()),
            )?;
            let mut attr = attr.assume_init();

            let ret = libc::pthread_condattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
            if ret != 0 {
                libc::pthread_condattr_destroy(&mut attr);
                return Err(IpsmError::System {
                    op: "pthread_condattr_setpshared",
                    errno: ret,
                });
            }

            let ret = libc::pthread_condattr_setclock(&mut attr, clock);
            if ret != 0 {
                libc::pthread_condattr_destroy(&mut attr);
                return Err(IpsmError::System {
                    op: "pthread_condattr_setclock",
                    errno: ret,
                });
            }

            let mut raw = MaybeUninit::<libc::pthread_cond_t>::uninit();
            let ret = libc::pthread_cond_init(raw.as_mut_ptr(), &attr);
            libc::pthread_condattr_destroy(&mut attr);
            if ret != 0 {
                return Err(IpsmError::System {
                    op: "pthread_cond_init",
                    errno: ret,
                });
            }
            Ok(raw.assume_init())
        }
    }

    /// Initializes a `CondVar` bound to `clock` (e.g. `libc::CLOCK_MONOTONIC`)
    /// in place at `dst`.
    ///
    /// # Safety
    /// `dst` must be valid for writes of `Self` and remain at that address
    /// for the lifetime of the condvar.
    pub unsafe fn init_at(dst: *mut Self, clock: libc::clockid_t) -> IpsmResult<()> {
        let raw = Self::build(clock)?;
        std::ptr::write(
            dst,
            Self {
                raw: UnsafeCell::new(raw),
            },
        );
        Ok(())
    }

    /// Constructs a `CondVar` bound to `clock` for single-process use or tests.
    pub fn new(clock: libc::clockid_t) -> IpsmResult<Self> {
        Ok(Self {
            raw: UnsafeCell::new(Self::build(clock)?),
        })
    }

    fn raw(&self) -> *mut libc::pthread_cond_t {
        self.raw.get()
    }

    pub fn notify_one(&self) {
        unsafe {
            libc::pthread_cond_signal(self.raw());
        }
    }

    pub fn notify_all(&self) {
        unsafe {
            libc::pthread_cond_broadcast(self.raw());
        }
    }

    /// Waits, atomically releasing `mutex` for the duration of the wait and
    /// reacquiring it before returning. The caller must hold `mutex` locked.
    /// Spurious wake-ups are possible; callers that need a condition to
    /// hold should use [`CondVar::wait_while`].
    pub fn wait(&self, mutex: &RobustMutex) -> IpsmResult<()> {
        let ret = unsafe { libc::pthread_cond_wait(self.raw(), mutex.raw_ptr()) };
        if ret == 0 {
            Ok(())
        } else {
            Err(IpsmError::System {
                op: "pthread_cond_wait",
                errno: ret,
            })
        }
    }

    /// Re-waits until `predicate` returns `true`, looping across spurious
    /// wake-ups.
    pub fn wait_while(&self, mutex: &RobustMutex, mut predicate: impl FnMut() -> bool) -> IpsmResult<()> {
        while !predicate() {
            self.wait(mutex)?;
        }
        Ok(())
    }

    /// Waits until either notified or the clock reaches `abs`, retrying
    /// internally across `EINTR`. `abs` must be expressed against this
    /// condvar's own clock.
    pub fn wait_until(&self, mutex: &RobustMutex, abs: libc::timespec) -> IpsmResult<CvStatus> {
        loop {
            let ret = unsafe { libc::pthread_cond_timedwait(self.raw(), mutex.raw_ptr(), &abs) };
            match ret {
                0 => return Ok(CvStatus::NoTimeout),
                libc::ETIMEDOUT => return Ok(CvStatus::Timeout),
                libc::EINTR => continue,
                _ => {
                    return Err(IpsmError::System {
                        op: "pthread_cond_timedwait",
                        errno: ret,
                    })
                }
            }
        }
    }

    /// Loop-wraps [`CondVar::wait_until`]: re-waits until `abs` is reached
    /// or `predicate` returns `true`.
    pub fn wait_until_while(
        &self,
        mutex: &RobustMutex,
        abs: libc::timespec,
        mut predicate: impl FnMut() -> bool,
    ) -> IpsmResult<CvStatus> {
        while !predicate() {
            if self.wait_until(mutex, abs)? == CvStatus::Timeout {
                return Ok(if predicate() { CvStatus::NoTimeout } else { CvStatus::Timeout });
            }
        }
        Ok(CvStatus::NoTimeout)
    }

    /// Waits until either notified or `timeout` elapses on this condvar's
    /// clock, retrying internally across `EINTR`. Only meaningful for a
    /// `CondVar` bound to a steady (monotonic) clock, as the spec requires;
    /// translates to [`CondVar::wait_until`] against `now + timeout`.
    pub fn wait_for(&self, mutex: &RobustMutex, timeout: Duration, clock: libc::clockid_t) -> IpsmResult<CvStatus> {
        let abs = Self::deadline(clock, timeout)?;
        self.wait_until(mutex, abs)
    }

    /// Loop-wraps [`CondVar::wait_for`]: re-waits until `timeout` elapses or
    /// `predicate` returns `true`.
    pub fn wait_for_while(
        &self,
        mutex: &RobustMutex,
        timeout: Duration,
        clock: libc::clockid_t,
        predicate: impl FnMut() -> bool,
    ) -> IpsmResult<CvStatus> {
        let abs = Self::deadline(clock, timeout)?;
        self.wait_until_while(mutex, abs, predicate)
    }

    fn deadline(clock: libc::clockid_t, timeout: Duration) -> IpsmResult<libc::timespec> {
        unsafe {
            let mut now = MaybeUninit::<libc::timespec>::uninit();
            if libc::clock_gettime(clock, now.as_mut_ptr()) != 0 {
                let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(-1);
                return Err(IpsmError::System {
                    op: "clock_gettime",
                    errno,
                });
            }
            Ok(add_duration(now.assume_init(), timeout))
        }
    }
}

fn add_duration(ts: libc::timespec, d: Duration) -> libc::timespec {
    let mut secs = ts.tv_sec + d.as_secs() as i64;
    let mut nanos = ts.tv_nsec + d.subsec_nanos() as i64;
    if nanos >= 1_000_000_000 {
        nanos -= 1_000_000_000;
        secs += 1;
    }
    libc::timespec {
        tv_sec: secs,
        tv_nsec: nanos,
    }
}

impl Drop for CondVar {
    fn drop(&mut self) {
        let ret = unsafe { libc::pthread_cond_destroy(self.raw()) };
        if ret == libc::EBUSY {
            tracing::error!("pthread_cond_destroy: EBUSY, other thread(s) still waiting");
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
