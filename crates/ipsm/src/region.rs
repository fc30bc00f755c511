//! Cooperatively-bootstrapped named shared-memory region.
//!
//! An unknown-order set of peer processes race to open or create a shared
//! memory object; whichever one wins the exclusive-create race runs a
//! one-shot primary initialiser, every other peer runs a secondary
//! attach callback, and the last peer to detach reclaims the backing
//! resources. The whole critical section - identity verification, shared
//! object creation, `reference_count` bookkeeping - runs under a
//! filesystem [`LockfileMutex`], matching `procshared_mem.cpp`'s
//! `setup_as_both`/`setup_as_primary`/`setup_as_secondary`.

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::time::Duration;

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;

use crate::config::RegionConfig;
use crate::error::{IpsmError, IpsmResult};
use crate::offset_ptr::OffsetPtr;

/// First bytes of the mapped region; everything after it is the
/// user-visible `shm_buff`.
#[repr(C)]
struct RegionHeader {
    /// Declared usable byte length. Written once at creation.
    length: usize,
    /// Number of peers currently attached to this generation.
    reference_count: AtomicI32,
    /// Identity file's inode at the time this generation was created;
    /// cleared to 0 on final detach.
    inode_value: AtomicU64,
    /// Handshake slot the primary initialiser may publish for secondaries.
    opt_info: OffsetPtr<u8>,
}

impl RegionHeader {
    const fn header_size() -> usize {
        std::mem::size_of::<Self>()
    }
}

fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

fn page_align_up(len: usize) -> usize {
    let page = page_size();
    len.div_ceil(page) * page
}

/// Rounds the requested usable length up to a page boundary, then adds the
/// header, matching `procshared_mem.cpp`'s `calc_total_neccesary_len()`.
fn total_map_len(usable: usize) -> usize {
    RegionHeader::header_size() + page_align_up(usable)
}

/// Reclaims the shared-memory object this peer just created exclusively,
/// after a later step in the same bootstrap attempt (sizing or mapping)
/// failed. Without this, a peer that won the primary race but then hit an
/// `ftruncate`/`mmap` error would leave the object behind forever.
fn unlink_leaked_primary(cfg: &RegionConfig) {
    if let Err(e) = shm_unlink(cfg.name.as_str()) {
        tracing::error!(error = %e, "failed to unlink shared-memory object after primary bootstrap failure");
    }
}

/// A whole-filesystem-object mutex used only during [`SharedRegion`]
/// bootstrap and detach. Grounded on `lockfile_mutex.cpp`.
struct LockfileMutex {
    path: PathBuf,
    cap_ms: u64,
    held: bool,
}

impl LockfileMutex {
    fn new(path: PathBuf, cap_ms: u64) -> Self {
        Self { path, cap_ms, held: false }
    }

    fn try_lock(&mut self) -> IpsmResult<bool> {
        match std::fs::OpenOptions::new().create_new(true).write(true).open(&self.path) {
            Ok(_file) => {
                self.held = true;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(IpsmError::Io(e)),
        }
    }

    fn lock(&mut self) -> IpsmResult<()> {
        let mut delay_ms = 1u64;
        loop {
            if self.try_lock()? {
                return Ok(());
            }
            if delay_ms >= self.cap_ms {
                tracing::warn!(path = %self.path.display(), "lockfile contention reached max retry delay");
            }
            std::thread::sleep(Duration::from_millis(delay_ms));
            delay_ms = (delay_ms * 2).min(self.cap_ms);
        }
    }

    fn unlock(&mut self) {
        if !self.held {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::error!(path = %self.path.display(), error = %e, "failed to unlink lockfile");
        }
        self.held = false;
    }
}

impl Drop for LockfileMutex {
    fn drop(&mut self) {
        self.unlock();
    }
}

#[derive(Clone, Copy)]
enum Role {
    Either,
    Primary,
    Secondary,
}

impl Role {
    fn label(self) -> &'static str {
        match self {
            Role::Either => "either",
            Role::Primary => "primary",
            Role::Secondary => "secondary",
        }
    }
}

enum BootstrapOutcome {
    Success(SharedRegion),
    RoleUnavailable,
    RetryIdentity,
}

fn open_or_create_identity(path: &Path, mode: u32) -> IpsmResult<u64> {
    let file = std::fs::OpenOptions::new().create(true).write(true).mode(mode).open(path)?;
    Ok(file.metadata()?.ino())
}

fn reread_identity_inode(path: &Path) -> IpsmResult<Option<u64>> {
    match std::fs::File::open(path) {
        Ok(file) => Ok(Some(file.metadata()?.ino())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(IpsmError::Io(e)),
    }
}

/// A named shared-memory region with cooperative primary/secondary
/// bootstrap. See the module docs for the protocol.
pub struct SharedRegion {
    name: String,
    identity_path: PathBuf,
    lock_path: PathBuf,
    lock_retry_cap_ms: u64,
    base: *mut u8,
    total_len: usize,
    usable_len: usize,
    inode: u64,
    teardown: Option<Box<dyn FnMut(bool, *mut u8, usize) + Send>>,
    detached: bool,
}

unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Opens the region if it already exists, or creates it, whichever
    /// race this peer happens to win.
    pub fn open_both(
        cfg: RegionConfig,
        primary_init: impl FnMut(*mut u8, usize) -> IpsmResult<*mut u8>,
        secondary_init: impl FnMut(*mut u8, usize) -> IpsmResult<()>,
    ) -> IpsmResult<Self> {
        Self::bootstrap(cfg, Role::Either, primary_init, secondary_init)
    }

    /// Fails with [`IpsmError::RoleUnavailable`] if the shared object
    /// already exists.
    pub fn create_primary(
        cfg: RegionConfig,
        primary_init: impl FnMut(*mut u8, usize) -> IpsmResult<*mut u8>,
    ) -> IpsmResult<Self> {
        Self::bootstrap(cfg, Role::Primary, primary_init, |_, _| Ok(()))
    }

    /// Fails with [`IpsmError::RoleUnavailable`] if the shared object does
    /// not already exist.
    pub fn attach_secondary(
        cfg: RegionConfig,
        secondary_init: impl FnMut(*mut u8, usize) -> IpsmResult<()>,
    ) -> IpsmResult<Self> {
        Self::bootstrap(cfg, Role::Secondary, |_, _| Ok(std::ptr::null_mut()), secondary_init)
    }

    fn bootstrap(
        cfg: RegionConfig,
        role: Role,
        mut primary_init: impl FnMut(*mut u8, usize) -> IpsmResult<*mut u8>,
        mut secondary_init: impl FnMut(*mut u8, usize) -> IpsmResult<()>,
    ) -> IpsmResult<Self> {
        cfg.validate()?;
        let mut attempts = 0u32;
        loop {
            match Self::try_bootstrap(&cfg, role, &mut primary_init, &mut secondary_init)? {
                BootstrapOutcome::Success(region) => return Ok(region),
                BootstrapOutcome::RoleUnavailable => {
                    return Err(IpsmError::RoleUnavailable {
                        role: role.label(),
                        name: cfg.name.clone(),
                    });
                }
                BootstrapOutcome::RetryIdentity => {
                    attempts += 1;
                    if attempts >= cfg.max_bootstrap_attempts {
                        return Err(IpsmError::BootstrapRetriesExhausted {
                            name: cfg.name.clone(),
                            attempts,
                        });
                    }
                    tracing::debug!(
                        name = %cfg.name,
                        attempts,
                        "shared region bootstrap observed a transient identity race, retrying"
                    );
                    std::thread::sleep(Duration::from_millis(cfg.bootstrap_retry_sleep_ms));
                }
            }
        }
    }

    fn try_bootstrap(
        cfg: &RegionConfig,
        role: Role,
        primary_init: &mut dyn FnMut(*mut u8, usize) -> IpsmResult<*mut u8>,
        secondary_init: &mut dyn FnMut(*mut u8, usize) -> IpsmResult<()>,
    ) -> IpsmResult<BootstrapOutcome> {
        let identity_path = cfg.identity_path();
        let captured_inode = open_or_create_identity(&identity_path, cfg.mode)?;

        let mut lockfile = LockfileMutex::new(cfg.lock_path(), cfg.lock_retry_cap_ms);
        lockfile.lock()?;

        let outcome = Self::try_bootstrap_locked(cfg, role, captured_inode, &identity_path, primary_init, secondary_init);

        lockfile.unlock();
        outcome
    }

    fn try_bootstrap_locked(
        cfg: &RegionConfig,
        role: Role,
        captured_inode: u64,
        identity_path: &Path,
        primary_init: &mut dyn FnMut(*mut u8, usize) -> IpsmResult<*mut u8>,
        secondary_init: &mut dyn FnMut(*mut u8, usize) -> IpsmResult<()>,
    ) -> IpsmResult<BootstrapOutcome> {
        match reread_identity_inode(identity_path)? {
            Some(ino) if ino == captured_inode => {}
            _ => return Ok(BootstrapOutcome::RetryIdentity),
        }

        let mode = Mode::from_bits_truncate(cfg.mode as nix::sys::stat::mode_t);
        let (shm_fd, is_primary) = match role {
            Role::Either => match shm_open(cfg.name.as_str(), OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR, mode) {
                Ok(fd) => (fd, true),
                Err(nix::Error::EEXIST) => match shm_open(cfg.name.as_str(), OFlag::O_RDWR, mode) {
                    Ok(fd) => (fd, false),
                    Err(e) => return Err(IpsmError::ShmFailure { op: "shm_open", source: e }),
                },
                Err(e) => return Err(IpsmError::ShmFailure { op: "shm_open", source: e }),
            },
            Role::Primary => match shm_open(cfg.name.as_str(), OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR, mode) {
                Ok(fd) => (fd, true),
                Err(nix::Error::EEXIST) => return Ok(BootstrapOutcome::RoleUnavailable),
                Err(e) => return Err(IpsmError::ShmFailure { op: "shm_open", source: e }),
            },
            Role::Secondary => match shm_open(cfg.name.as_str(), OFlag::O_RDWR, mode) {
                Ok(fd) => (fd, false),
                Err(nix::Error::ENOENT) => return Ok(BootstrapOutcome::RoleUnavailable),
                Err(e) => return Err(IpsmError::ShmFailure { op: "shm_open", source: e }),
            },
        };

        let total_len = total_map_len(cfg.length);
        let usable_len = total_len - RegionHeader::header_size();
        if is_primary {
            if let Err(e) = ftruncate(&shm_fd, total_len as i64) {
                unlink_leaked_primary(cfg);
                return Err(IpsmError::ShmFailure { op: "ftruncate", source: e });
            }
        }

        let map_len = NonZeroUsize::new(total_len).expect("validated non-zero region length");
        let map = unsafe {
            match mmap(
                None,
                map_len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                Some(&shm_fd),
                0,
            ) {
                Ok(m) => m,
                Err(e) => {
                    if is_primary {
                        unlink_leaked_primary(cfg);
                    }
                    return Err(IpsmError::ShmFailure { op: "mmap", source: e });
                }
            }
        };
        let base = map as *mut u8;
        let header = base as *mut RegionHeader;
        let buff = unsafe { base.add(RegionHeader::header_size()) };

        if is_primary {
            unsafe {
                std::ptr::write(
                    header,
                    RegionHeader {
                        length: usable_len,
                        reference_count: AtomicI32::new(0),
                        inode_value: AtomicU64::new(0),
                        opt_info: OffsetPtr::null(),
                    },
                );
            }
            match primary_init(buff, usable_len) {
                Ok(opt) => unsafe {
                    (*header).opt_info.set(if opt.is_null() { None } else { Some(opt) });
                    // Release-publish inode_value last: secondaries acquire-load
                    // it before trusting opt_info or anything the primary wrote.
                    (*header).inode_value.store(captured_inode, Ordering::Release);
                },
                Err(e) => {
                    unsafe {
                        let _ = munmap(map, total_len);
                    }
                    if let Err(unlink_err) = shm_unlink(cfg.name.as_str()) {
                        tracing::error!(
                            error = %unlink_err,
                            "failed to unlink shared-memory object after primary_init failure"
                        );
                    }
                    return Err(e);
                }
            }
        } else {
            let observed = unsafe { (*header).inode_value.load(Ordering::Acquire) };
            if observed == 0 || observed != captured_inode {
                unsafe {
                    let _ = munmap(map, total_len);
                }
                return Ok(BootstrapOutcome::RetryIdentity);
            }
            if let Err(e) = secondary_init(buff, usable_len) {
                unsafe {
                    let _ = munmap(map, total_len);
                }
                return Err(e);
            }
        }

        unsafe {
            (*header).reference_count.fetch_add(1, Ordering::AcqRel);
        }

        Ok(BootstrapOutcome::Success(SharedRegion {
            name: cfg.name.clone(),
            identity_path: identity_path.to_path_buf(),
            lock_path: cfg.lock_path(),
            lock_retry_cap_ms: cfg.lock_retry_cap_ms,
            base,
            total_len,
            usable_len,
            inode: captured_inode,
            teardown: None,
            detached: false,
        }))
    }

    fn header(&self) -> *mut RegionHeader {
        self.base as *mut RegionHeader
    }

    /// Usable byte length of `shm_buff` (not counting the region header).
    pub fn available_size(&self) -> usize {
        self.usable_len
    }

    /// Address of `shm_buff`, the user-visible area.
    pub fn get(&self) -> *mut u8 {
        unsafe { self.base.add(RegionHeader::header_size()) }
    }

    /// The handshake pointer the primary initialiser published, or null if
    /// it published nothing.
    pub fn opt_info(&self) -> *mut u8 {
        unsafe { (*self.header()).opt_info.get().unwrap_or(std::ptr::null_mut()) }
    }

    /// Registers a callback invoked once per detach, including the final
    /// one. Replaces any previously registered callback.
    pub fn set_teardown(&mut self, f: impl FnMut(bool, *mut u8, usize) + Send + 'static) {
        self.teardown = Some(Box::new(f));
    }

    /// Number of peers currently attached to this generation.
    pub fn bind_count(&self) -> i32 {
        unsafe { (*self.header()).reference_count.load(Ordering::Acquire) }
    }

    /// The inode number this process observed when it bootstrapped.
    pub fn debug_get_id_file_inode(&self) -> u64 {
        self.inode
    }

    /// True if the region's `inode_value` still matches the inode this
    /// process bootstrapped with, i.e. no concurrent teardown has started.
    pub fn debug_test_integrity(&self) -> bool {
        unsafe { (*self.header()).inode_value.load(Ordering::Acquire) == self.inode }
    }

    /// A human-readable dump of this handle's state, for diagnostics.
    pub fn debug_dump_string(&self) -> String {
        format!(
            "SharedRegion {{ name: {:?}, inode: {}, reference_count: {}, usable_len: {}, opt_info: {:?} }}",
            self.name,
            self.inode,
            self.bind_count(),
            self.usable_len,
            self.opt_info()
        )
    }

    /// Forcibly removes a region's backing resources (identity file,
    /// lockfile, shared-memory object) without going through a live
    /// handle. For recovering from a peer that crashed mid-bootstrap and
    /// left the generation unreachable. Missing resources are not an
    /// error.
    pub fn debug_force_cleanup(cfg: &RegionConfig) -> IpsmResult<()> {
        cfg.validate()?;
        if let Err(e) = std::fs::remove_file(cfg.identity_path()) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(error = %e, "debug_force_cleanup: failed to remove identity file");
            }
        }
        if let Err(e) = std::fs::remove_file(cfg.lock_path()) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(error = %e, "debug_force_cleanup: failed to remove lockfile");
            }
        }
        if let Err(e) = shm_unlink(cfg.name.as_str()) {
            if e != nix::Error::ENOENT {
                tracing::warn!(error = %e, "debug_force_cleanup: failed to unlink shared-memory object");
            }
        }
        Ok(())
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if self.detached || self.base.is_null() {
            return;
        }
        self.detached = true;

        let mut lockfile = LockfileMutex::new(self.lock_path.clone(), self.lock_retry_cap_ms);
        if let Err(e) = lockfile.lock() {
            tracing::error!(name = %self.name, error = %e, "detach: failed to acquire lockfile, proceeding without it");
        }

        let header = self.header();
        let new_count = unsafe { (*header).reference_count.fetch_sub(1, Ordering::AcqRel) - 1 };
        let buff = self.get();
        if let Some(teardown) = self.teardown.as_mut() {
            teardown(new_count <= 0, buff, self.usable_len);
        }

        if new_count <= 0 {
            unsafe {
                (*header).inode_value.store(0, Ordering::Release);
            }
            if let Err(e) = std::fs::remove_file(&self.identity_path) {
                tracing::warn!(error = %e, "detach: failed to unlink identity file");
            }
            if let Err(e) = shm_unlink(self.name.as_str()) {
                tracing::warn!(error = %e, "detach: failed to unlink shared-memory object");
            }
        }

        lockfile.unlock();

        if let Err(e) = unsafe { munmap(self.base as *mut c_void, self.total_len) } {
            tracing::error!(error = %e, "detach: munmap failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn unique_name(tag: &str) -> String {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        format!("/ipsm-region-test-{tag}-{}-{}", std::process::id(), COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    #[test]
    fn create_primary_then_attach_secondary() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RegionConfig::new(unique_name("primsec"), 8192).with_directory(dir.path());
        SharedRegion::debug_force_cleanup(&cfg).unwrap();

        let primary = SharedRegion::create_primary(cfg.clone(), |_buff, _len| Ok(std::ptr::null_mut())).unwrap();
        assert_eq!(primary.bind_count(), 1);
        assert!(primary.debug_test_integrity());

        let secondary = SharedRegion::attach_secondary(cfg.clone(), |_buff, _len| Ok(())).unwrap();
        assert_eq!(secondary.bind_count(), 2);
        assert_eq!(primary.debug_get_id_file_inode(), secondary.debug_get_id_file_inode());

        drop(secondary);
        assert_eq!(primary.bind_count(), 1);
        drop(primary);

        assert!(!cfg.identity_path().exists());
        assert!(!cfg.lock_path().exists());
    }

    #[test]
    fn available_size_is_rounded_up_to_a_page_and_consistent_across_peers() {
        let dir = tempfile::tempdir().unwrap();
        // A request that is not itself page-aligned.
        let requested = page_size() + 17;
        let cfg = RegionConfig::new(unique_name("pagerounding"), requested).with_directory(dir.path());
        SharedRegion::debug_force_cleanup(&cfg).unwrap();

        let primary = SharedRegion::create_primary(cfg.clone(), |_buff, _len| Ok(std::ptr::null_mut())).unwrap();
        assert!(primary.available_size() >= requested);
        assert_eq!(primary.available_size() % page_size(), 0);

        let secondary = SharedRegion::attach_secondary(cfg, |_, _| Ok(())).unwrap();
        assert_eq!(primary.available_size(), secondary.available_size());
    }

    #[test]
    fn create_primary_twice_fails_with_role_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RegionConfig::new(unique_name("dup"), 8192).with_directory(dir.path());
        SharedRegion::debug_force_cleanup(&cfg).unwrap();

        let _first = SharedRegion::create_primary(cfg.clone(), |_, _| Ok(std::ptr::null_mut())).unwrap();
        match SharedRegion::create_primary(cfg.clone(), |_, _| Ok(std::ptr::null_mut())) {
            Err(IpsmError::RoleUnavailable { .. }) => {}
            Err(e) => panic!("expected RoleUnavailable, got {e}"),
            Ok(_) => panic!("expected RoleUnavailable, got Ok"),
        }
    }

    #[test]
    fn attach_secondary_without_primary_fails_with_role_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RegionConfig::new(unique_name("nopeer"), 8192).with_directory(dir.path());
        SharedRegion::debug_force_cleanup(&cfg).unwrap();

        match SharedRegion::attach_secondary(cfg, |_, _| Ok(())) {
            Err(IpsmError::RoleUnavailable { .. }) => {}
            Err(e) => panic!("expected RoleUnavailable, got {e}"),
            Ok(_) => panic!("expected RoleUnavailable, got Ok"),
        }
    }

    #[test]
    fn opt_info_published_by_primary_is_visible_to_secondary() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RegionConfig::new(unique_name("optinfo"), 8192).with_directory(dir.path());
        SharedRegion::debug_force_cleanup(&cfg).unwrap();

        let primary = SharedRegion::create_primary(cfg.clone(), |buff, _len| Ok(buff)).unwrap();
        let secondary = SharedRegion::attach_secondary(cfg, |_, _| Ok(())).unwrap();
        // primary_init published its own `buff` (offset zero into shm_buff);
        // each handle maps the region at its own base address, so the
        // published pointer must decode relative to *that* handle, not to
        // the literal address the primary observed.
        assert_eq!(primary.opt_info(), primary.get());
        assert_eq!(secondary.opt_info(), secondary.get());
    }

    #[test]
    fn teardown_callback_sees_is_final_only_on_last_detach() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RegionConfig::new(unique_name("teardown"), 8192).with_directory(dir.path());
        SharedRegion::debug_force_cleanup(&cfg).unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let finals = Arc::new(AtomicUsize::new(0));

        let mut primary = SharedRegion::create_primary(cfg.clone(), |_, _| Ok(std::ptr::null_mut())).unwrap();
        {
            let seen = seen.clone();
            let finals = finals.clone();
            primary.set_teardown(move |is_final, _buff, _len| {
                seen.fetch_add(1, Ordering::SeqCst);
                if is_final {
                    finals.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        let secondary = SharedRegion::attach_secondary(cfg, |_, _| Ok(())).unwrap();

        drop(secondary);
        assert_eq!(seen.load(Ordering::SeqCst), 0, "secondary has no teardown callback registered");

        drop(primary);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(finals.load(Ordering::SeqCst), 1);
    }
}
