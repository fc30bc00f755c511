//! K&R-style next-fit allocator for memory that outlives any single process.
//!
//! Modeled on the classic Ritchie/Kernighan malloc: a circular singly-linked
//! free list of blocks measured in units of one block header, with a
//! "rover" that remembers where the last search left off so consecutive
//! allocations don't re-scan the whole list. The allocator owns no memory
//! itself; [`Allocator::placement_new`] builds the control block plus the
//! first free block directly inside a caller-supplied byte range (normally
//! the tail of a [`crate::region::SharedRegion`]'s mapping), so every field
//! - including the free-list links - is expressed as an [`OffsetPtr`] and
//! stays correct no matter which address the region is mapped at in a
//! given process.
//!
//! The allocator also tracks a `bind_count`: how many in-process handles
//! are currently bound to this control block. This is distinct from (and
//! usually smaller-lived than) the region's own cross-process reference
//! count - see [`crate::heap::HeapRegion`].

use std::sync::atomic::{AtomicI32, Ordering};

use crate::error::{IpsmError, IpsmResult};
use crate::mutex::RobustMutex;
use crate::offset_ptr::OffsetPtr;

#[repr(C)]
struct BlockHeader {
    next: OffsetPtr<BlockHeader>,
    /// Number of header-sized units owned by this block's *body* (not
    /// counting this header itself).
    units: usize,
}

unsafe impl Send for BlockHeader {}
unsafe impl Sync for BlockHeader {}

impl BlockHeader {
    /// Writes a header in place at `dst`.
    ///
    /// # Safety
    /// `dst` must be valid for writes of `Self`.
    unsafe fn write_at(dst: *mut BlockHeader, next: *mut BlockHeader, units: usize) {
        let next_field = std::ptr::addr_of_mut!((*dst).next);
        OffsetPtr::emplace(next_field, next);
        (*dst).units = units;
    }

    /// Total header-unit slots occupied by this block, header included.
    unsafe fn total_slots(blk: *mut BlockHeader) -> usize {
        (*blk).units + 1
    }

    /// Address one past this block's last occupied byte - the address at
    /// which a memory-adjacent following block's header would start.
    unsafe fn end_addr(blk: *mut BlockHeader) -> usize {
        (blk as usize) + Self::total_slots(blk) * Allocator::UNIT
    }
}

/// Allocator control block. Lives at the front of the memory it manages.
#[repr(C)]
pub struct Allocator {
    addr_end: usize,
    mutex: RobustMutex,
    bind_count: AtomicI32,
    free_rover: OffsetPtr<BlockHeader>,
    base: BlockHeader,
}

unsafe impl Send for Allocator {}
unsafe impl Sync for Allocator {}

impl Allocator {
    const UNIT: usize = std::mem::size_of::<BlockHeader>();

    fn bytes2units(bytes: usize) -> usize {
        (bytes + Self::UNIT - 1) / Self::UNIT
    }

    fn align_up(addr: usize, align: usize) -> usize {
        (addr + align - 1) / align * align
    }

    /// Constructs an `Allocator` control block plus its first free block
    /// directly in `[begin, end)`, with `bind_count` starting at 1.
    ///
    /// # Safety
    /// `[begin, end)` must be valid for writes and unused by anything else
    /// for as long as the allocator is bound.
    pub unsafe fn placement_new(begin: *mut u8, end: *mut u8) -> IpsmResult<*mut Allocator> {
        if begin.is_null() || end.is_null() || begin >= end {
            return Err(IpsmError::AllocationFailed {
                reason: "begin/end pointers are invalid".to_string(),
            });
        }

        let ctrl_size = std::mem::size_of::<Allocator>();
        let ctrl_addr = begin as usize;
        if ctrl_addr + ctrl_size >= end as usize {
            return Err(IpsmError::LengthTooSmall {
                requested: end as usize - ctrl_addr,
                minimum: ctrl_size + 2 * Self::UNIT,
            });
        }

        let buf_start = Self::align_up(ctrl_addr + ctrl_size, Self::UNIT);
        let addr_end = end as usize;
        if addr_end <= buf_start {
            return Err(IpsmError::LengthTooSmall {
                requested: addr_end - ctrl_addr,
                minimum: ctrl_size + 2 * Self::UNIT,
            });
        }

        let num_units = (addr_end - buf_start) / Self::UNIT;
        if num_units < 2 {
            return Err(IpsmError::LengthTooSmall {
                requested: addr_end - ctrl_addr,
                minimum: ctrl_size + 2 * Self::UNIT,
            });
        }

        let mutex = RobustMutex::new()?;
        let ctrl = begin as *mut Allocator;
        std::ptr::write(
            ctrl,
            Allocator {
                addr_end,
                mutex,
                bind_count: AtomicI32::new(1),
                free_rover: OffsetPtr::null(),
                base: BlockHeader {
                    next: OffsetPtr::null(),
                    units: 0,
                },
            },
        );

        let first_blk = buf_start as *mut BlockHeader;
        let base_ptr = std::ptr::addr_of_mut!((*ctrl).base);
        BlockHeader::write_at(first_blk, base_ptr, num_units - 1);
        (*base_ptr).next.set(Some(first_blk));
        (*ctrl).free_rover.set(Some(base_ptr));

        Ok(ctrl)
    }

    /// Binds an additional in-process handle to an already-constructed
    /// control block at `p_mem`.
    ///
    /// # Safety
    /// `p_mem` must point at a live `Allocator` previously returned by
    /// `placement_new`.
    pub unsafe fn bind(p_mem: *mut Allocator) -> IpsmResult<*mut Allocator> {
        let prev = (*p_mem).bind_count.fetch_add(1, Ordering::AcqRel);
        if prev <= 0 {
            (*p_mem).bind_count.fetch_sub(1, Ordering::AcqRel);
            return Err(IpsmError::Disposed);
        }
        Ok(p_mem)
    }

    /// Releases one in-process handle. Runs the control block's destructor
    /// once the count reaches zero.
    ///
    /// # Safety
    /// `p_mem` must point at a live `Allocator`, and the caller must not
    /// use `p_mem` again if this call drops the count to zero.
    pub unsafe fn teardown(p_mem: *mut Allocator) {
        if p_mem.is_null() {
            return;
        }
        let prev = (*p_mem).bind_count.fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
            if c > 0 {
                Some(c - 1)
            } else {
                tracing::warn!("Allocator::teardown called past zero bind_count");
                None
            }
        });
        if prev == Ok(1) {
            std::ptr::drop_in_place(p_mem);
        }
    }

    pub fn bind_count(&self) -> i32 {
        self.bind_count.load(Ordering::Acquire)
    }

    /// True if `p` falls within the byte range this allocator manages.
    pub fn is_belong_to(&self, p: *const u8) -> bool {
        let addr = p as usize;
        let buf_start = self as *const Self as usize + std::mem::size_of::<Self>();
        addr >= buf_start && addr < self.addr_end
    }

    /// Allocates at least `req_bytes`, with the returned pointer aligned to
    /// `alignment` (a power of two; use `1` for no special requirement).
    pub fn allocate(&self, req_bytes: usize, alignment: usize) -> IpsmResult<*mut u8> {
        let align = if alignment == 0 { 1 } else { alignment };
        let slack_units = if align <= Self::UNIT {
            0
        } else {
            Self::bytes2units(align - Self::UNIT)
        };
        let need = Self::bytes2units(req_bytes) + slack_units + 1;

        let _guard = self.mutex.lock_guard()?;
        unsafe { self.allocate_locked(need, align) }
    }

    unsafe fn allocate_locked(&self, need: usize, align: usize) -> IpsmResult<*mut u8> {
        let free_rover = &self.free_rover as *const OffsetPtr<BlockHeader> as *mut OffsetPtr<BlockHeader>;
        let base_ptr = std::ptr::addr_of!(self.base) as *mut BlockHeader;
        let start = (*free_rover).get().unwrap_or(base_ptr);

        let mut prev = start;
        loop {
            let cur = (*prev).next.get().unwrap_or(base_ptr);
            if !std::ptr::eq(cur, base_ptr) {
                let total_slots = BlockHeader::total_slots(cur);
                if total_slots >= need {
                    let raw_new_start = (cur as usize) + (total_slots - need) * Self::UNIT;
                    let body_naive = raw_new_start + Self::UNIT;
                    let mut shift = 0usize;
                    while (body_naive + shift * Self::UNIT) % align != 0 {
                        shift += 1;
                        debug_assert!(shift <= total_slots, "alignment fold search did not converge");
                    }
                    let final_start = raw_new_start + shift * Self::UNIT;
                    let final_units = need - shift - 1;
                    let remaining = total_slots - need + shift;

                    if remaining == 0 {
                        let cur_next = (*cur).next.get().unwrap_or(base_ptr);
                        (*prev).next.set(Some(cur_next));
                    } else {
                        (*cur).units = remaining - 1;
                    }

                    BlockHeader::write_at(final_start as *mut BlockHeader, std::ptr::null_mut(), final_units);
                    (*free_rover).set(Some(prev));
                    return Ok((final_start + Self::UNIT) as *mut u8);
                }
            }
            if std::ptr::eq(cur, start) {
                return Err(IpsmError::AllocationFailed {
                    reason: "no free block large enough".to_string(),
                });
            }
            prev = cur;
        }
    }

    /// Returns `p` (previously returned by [`Allocator::allocate`]) to the
    /// free list, coalescing with address-adjacent free neighbors.
    pub fn deallocate(&self, p: *mut u8, _alignment: usize) -> IpsmResult<()> {
        let addr_p = p as usize;
        let buf_start = self as *const Self as usize + std::mem::size_of::<Self>();
        if addr_p < buf_start || addr_p >= self.addr_end {
            return Err(IpsmError::Internal(format!(
                "pointer {addr_p:#x} out of allocator range"
            )));
        }

        let target = (addr_p - Self::UNIT) as *mut BlockHeader;
        let _guard = self.mutex.lock_guard()?;
        unsafe { self.deallocate_locked(target) }
    }

    unsafe fn deallocate_locked(&self, target: *mut BlockHeader) -> IpsmResult<()> {
        let free_rover = &self.free_rover as *const OffsetPtr<BlockHeader> as *mut OffsetPtr<BlockHeader>;
        let base_ptr = std::ptr::addr_of!(self.base) as *mut BlockHeader;
        let start = (*free_rover).get().unwrap_or(base_ptr);

        let mut pre = start;
        let mut nxt = (*pre).next.get().unwrap_or(base_ptr);
        loop {
            let pre_addr = pre as usize;
            let nxt_addr = nxt as usize;
            let target_addr = target as usize;
            let in_order = pre_addr < target_addr && target_addr < nxt_addr;
            let wrapped = pre_addr >= nxt_addr && (target_addr > pre_addr || target_addr < nxt_addr);

            if in_order || wrapped {
                let joins_left = BlockHeader::end_addr(pre) == target_addr && !std::ptr::eq(pre, base_ptr);
                let joins_right = BlockHeader::end_addr(target) == nxt_addr && !std::ptr::eq(nxt, base_ptr);

                if joins_left && joins_right {
                    let nxt_next = (*nxt).next.get().unwrap_or(base_ptr);
                    (*pre).next.set(Some(nxt_next));
                    (*pre).units += 1 + (*target).units + 1 + (*nxt).units;
                } else if joins_left {
                    (*pre).units += 1 + (*target).units;
                } else if joins_right {
                    let nxt_next = (*nxt).next.get().unwrap_or(base_ptr);
                    BlockHeader::write_at(target, nxt_next, (*target).units + 1 + (*nxt).units);
                    (*pre).next.set(Some(target));
                } else {
                    BlockHeader::write_at(target, nxt, (*target).units);
                    (*pre).next.set(Some(target));
                }
                (*free_rover).set(Some(pre));
                return Ok(());
            }

            pre = nxt;
            nxt = (*pre).next.get().unwrap_or(base_ptr);
            if std::ptr::eq(pre, start) {
                break;
            }
        }

        if std::ptr::eq(pre, base_ptr) && std::ptr::eq(nxt, base_ptr) {
            // Free list is entirely empty: this is the only free block.
            BlockHeader::write_at(target, base_ptr, (*target).units);
            (*base_ptr).next.set(Some(target));
            (*free_rover).set(Some(base_ptr));
            return Ok(());
        }

        Err(IpsmError::Internal("fail to free: no bracketing free block found".to_string()))
    }
}
