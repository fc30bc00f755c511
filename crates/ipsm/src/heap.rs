//! Composition of a [`SharedRegion`] and an in-region [`Allocator`]: a
//! byte-oriented heap plus a small fixed set of message-passing channels
//! used for handshake data between peers.
//!
//! The primary initialiser places the allocator at the front of
//! `shm_buff` and a [`MessageChannels`] block at a further offset,
//! publishing the latter's address via the region's `opt_info` slot;
//! secondaries recover the allocator by its well-known offset (0) and the
//! channel block from `opt_info`.

use crate::alloc::Allocator;
use crate::condvar::CondVar;
use crate::config::RegionConfig;
use crate::error::{IpsmError, IpsmResult};
use crate::mutex::RobustMutex;
use crate::offset_ptr::OffsetPtr;
use crate::region::SharedRegion;

/// Fixed number of message channels carved out of every heap region.
pub const CHANNEL_COUNT: usize = 2;
const CHANNEL_CAPACITY: usize = 64;

#[repr(C)]
struct ChannelRing {
    slots: [OffsetPtr<u8>; CHANNEL_CAPACITY],
    head: usize,
    len: usize,
}

impl ChannelRing {
    fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| OffsetPtr::null()),
            head: 0,
            len: 0,
        }
    }

    fn is_full(&self) -> bool {
        self.len == CHANNEL_CAPACITY
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn push(&mut self, value: *mut u8) {
        let idx = (self.head + self.len) % CHANNEL_CAPACITY;
        self.slots[idx].set(if value.is_null() { None } else { Some(value) });
        self.len += 1;
    }

    fn pop(&mut self) -> *mut u8 {
        let value = self.slots[self.head].get().unwrap_or(std::ptr::null_mut());
        self.slots[self.head].set(None);
        self.head = (self.head + 1) % CHANNEL_CAPACITY;
        self.len -= 1;
        value
    }
}

/// `CHANNEL_COUNT` bounded queues sharing one mutex and one condition
/// variable: a send on any channel wakes every waiter, which re-checks
/// only the channel it cares about (the channel-local semantics the spec
/// describes can't be had from one shared condvar without broadcasting).
#[repr(C)]
struct MessageChannels {
    mutex: RobustMutex,
    not_empty: CondVar,
    rings: [ChannelRing; CHANNEL_COUNT],
}

impl MessageChannels {
    /// # Safety
    /// `dst` must be valid for writes of `Self` and remain at that address.
    unsafe fn init_at(dst: *mut Self) -> IpsmResult<()> {
        let mutex = RobustMutex::new()?;
        let not_empty = CondVar::new(libc::CLOCK_MONOTONIC)?;
        std::ptr::write(
            dst,
            Self {
                mutex,
                not_empty,
                rings: std::array::from_fn(|_| ChannelRing::new()),
            },
        );
        Ok(())
    }

    const fn byte_size() -> usize {
        std::mem::size_of::<Self>()
    }
}

fn primary_init(buff: *mut u8, usable: usize) -> IpsmResult<*mut u8> {
    let channels_size = MessageChannels::byte_size();
    if usable <= channels_size {
        return Err(IpsmError::LengthTooSmall {
            requested: usable,
            minimum: channels_size + 256,
        });
    }
    let alloc_end = unsafe { buff.add(usable - channels_size) };
    unsafe {
        Allocator::placement_new(buff, alloc_end)?;
    }
    let channels_ptr = alloc_end as *mut MessageChannels;
    unsafe {
        MessageChannels::init_at(channels_ptr)?;
    }
    Ok(channels_ptr as *mut u8)
}

fn secondary_init(buff: *mut u8, _usable: usize) -> IpsmResult<()> {
    let ctrl = buff as *mut Allocator;
    unsafe {
        Allocator::bind(ctrl)?;
    }
    Ok(())
}

/// A shared heap: an allocator plus a small set of message channels,
/// layered over a [`SharedRegion`].
pub struct HeapRegion {
    region: SharedRegion,
    allocator: *mut Allocator,
    channels: *mut MessageChannels,
}

unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}

impl HeapRegion {
    pub fn open_both(cfg: RegionConfig) -> IpsmResult<Self> {
        let region = SharedRegion::open_both(cfg, primary_init, secondary_init)?;
        Self::from_region(region)
    }

    pub fn create_primary(cfg: RegionConfig) -> IpsmResult<Self> {
        let region = SharedRegion::create_primary(cfg, primary_init)?;
        Self::from_region(region)
    }

    pub fn attach_secondary(cfg: RegionConfig) -> IpsmResult<Self> {
        let region = SharedRegion::attach_secondary(cfg, secondary_init)?;
        Self::from_region(region)
    }

    fn from_region(region: SharedRegion) -> IpsmResult<Self> {
        let allocator = region.get() as *mut Allocator;
        let channels = region.opt_info().cast::<MessageChannels>();
        if channels.is_null() {
            return Err(IpsmError::Internal(
                "message channels were not published via opt_info".to_string(),
            ));
        }
        Ok(Self { region, allocator, channels })
    }

    pub fn available_size(&self) -> usize {
        self.region.available_size()
    }

    pub fn allocate(&self, bytes: usize, alignment: usize) -> IpsmResult<*mut u8> {
        unsafe { (*self.allocator).allocate(bytes, alignment) }
    }

    pub fn deallocate(&self, p: *mut u8, alignment: usize) -> IpsmResult<()> {
        unsafe { (*self.allocator).deallocate(p, alignment) }
    }

    pub fn channel_count(&self) -> usize {
        CHANNEL_COUNT
    }

    /// Pushes `value` onto channel `channel_index` and wakes waiters.
    pub fn send(&self, channel_index: usize, value: *mut u8) -> IpsmResult<()> {
        if channel_index >= CHANNEL_COUNT {
            tracing::warn!(channel_index, "send: channel index out of range");
            return Err(IpsmError::Internal(format!("channel index {channel_index} out of range")));
        }
        let channels = unsafe { &*self.channels };
        {
            let _guard = channels.mutex.lock_guard()?;
            let ring = unsafe { &mut *(std::ptr::addr_of!(channels.rings[channel_index]) as *mut ChannelRing) };
            if ring.is_full() {
                return Err(IpsmError::Internal(format!("channel {channel_index} is full")));
            }
            ring.push(value);
        }
        channels.not_empty.notify_all();
        Ok(())
    }

    /// Blocks until channel `channel_index` is non-empty, then pops and
    /// returns its head.
    pub fn receive(&self, channel_index: usize) -> IpsmResult<*mut u8> {
        if channel_index >= CHANNEL_COUNT {
            tracing::warn!(channel_index, "receive: channel index out of range");
            return Err(IpsmError::Internal(format!("channel index {channel_index} out of range")));
        }
        let channels = unsafe { &*self.channels };
        let _guard = channels.mutex.lock_guard()?;
        loop {
            let ring = unsafe { &mut *(std::ptr::addr_of!(channels.rings[channel_index]) as *mut ChannelRing) };
            if !ring.is_empty() {
                return Ok(ring.pop());
            }
            channels.not_empty.wait(&channels.mutex)?;
        }
    }

    pub fn set_teardown(&mut self, f: impl FnMut(bool, *mut u8, usize) + Send + 'static) {
        self.region.set_teardown(f);
    }

    pub fn bind_count(&self) -> i32 {
        self.region.bind_count()
    }

    pub fn debug_get_id_file_inode(&self) -> u64 {
        self.region.debug_get_id_file_inode()
    }

    pub fn debug_test_integrity(&self) -> bool {
        self.region.debug_test_integrity()
    }

    pub fn debug_dump_string(&self) -> String {
        self.region.debug_dump_string()
    }

    pub fn debug_force_cleanup(cfg: &RegionConfig) -> IpsmResult<()> {
        SharedRegion::debug_force_cleanup(cfg)
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        // Release this process's allocator handle while the mapping is
        // still alive; `self.region`'s own `Drop` (which may unmap) runs
        // after this body, in field-declaration-independent drop glue.
        if !self.allocator.is_null() {
            unsafe { Allocator::teardown(self.allocator) };
        }
    }
}
