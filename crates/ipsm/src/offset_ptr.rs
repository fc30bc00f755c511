//! Address-space-independent pointer.
//!
//! `OffsetPtr<T>` stores a displacement from its *own* storage address
//! rather than an absolute address, so a value holding one can be mapped
//! at a different base address in every process attached to the same
//! shared region and still decode to the right place. A zero displacement
//! is reserved for null, which is what lets processes exchange "no value"
//! across address spaces without agreeing on a shared null address.
//!
//! Rust has no copy/move constructor hook, unlike the C++ offset pointer
//! this is modeled on, so the "recompute from the current address" trick
//! is expressed through place references (`&self` / `&mut self`) instead
//! of `Clone`. Anything holding an `OffsetPtr` non-null must stay in place
//! once constructed, or be moved wholesale together with its target (the
//! normal case: the whole shared region is remapped at a new base in a
//! different process, and every offset inside it is still correct because
//! pointer and pointee shift by the same amount).

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

/// An offset-relative pointer to `T` living inside a shared region.
#[repr(transparent)]
pub struct OffsetPtr<T> {
    offset: usize,
    _marker: PhantomData<*mut T>,
}

impl<T> OffsetPtr<T> {
    /// A null offset pointer. Safe to move by value: a zero displacement
    /// decodes to null regardless of where it ends up.
    pub const fn null() -> Self {
        Self {
            offset: 0,
            _marker: PhantomData,
        }
    }

    pub fn is_null(&self) -> bool {
        self.offset == 0
    }

    fn calc_offset(base: *const Self, target: *mut T) -> usize {
        if target.is_null() {
            0
        } else {
            (target as usize).wrapping_sub(base as usize)
        }
    }

    fn calc_address(&self) -> *mut T {
        if self.offset == 0 {
            std::ptr::null_mut()
        } else {
            (self as *const Self as usize).wrapping_add(self.offset) as *mut T
        }
    }

    /// Constructs an `OffsetPtr` in place at `dst`, pointing at `target`.
    ///
    /// # Safety
    /// `dst` must be valid for writes of `Self` and not currently hold a
    /// live value that needs dropping (it doesn't; `OffsetPtr` has no drop
    /// glue, but the write is still a raw overwrite of `dst`'s bytes).
    pub unsafe fn emplace(dst: *mut Self, target: *mut T) {
        let offset = Self::calc_offset(dst, target);
        std::ptr::write(
            dst,
            Self {
                offset,
                _marker: PhantomData,
            },
        );
    }

    /// Returns the decoded target address, or `None` if null.
    pub fn get(&self) -> Option<*mut T> {
        let addr = self.calc_address();
        if addr.is_null() {
            None
        } else {
            Some(addr)
        }
    }

    /// Repoints `self` at `target`, recomputing the displacement from
    /// `self`'s current (true) address.
    pub fn set(&mut self, target: Option<*mut T>) {
        let target = target.unwrap_or(std::ptr::null_mut());
        self.offset = Self::calc_offset(self, target);
    }

    /// Repoints `self` at the same target as `orig`, recomputing the
    /// displacement relative to `self`'s own address. This is the Rust
    /// analogue of the C++ copy/move constructor's
    /// `calc_offset(this, orig.calc_address())`: since a freshly returned
    /// `Self` doesn't yet know where it will finally live, the
    /// recomputation has to go through a place reference that is already
    /// at its resting address, not through `Clone::clone`.
    pub fn rebind_from(&mut self, orig: &Self) {
        self.set(orig.get());
    }

    /// Swaps the targets of two offset pointers, each recomputed relative
    /// to its own address.
    pub fn swap(&mut self, other: &mut Self) {
        let mine = self.get();
        let theirs = other.get();
        self.set(theirs);
        other.set(mine);
    }

    /// Reinterprets the pointee type in place. Valid exactly when the
    /// corresponding raw pointer cast (`*mut T as *mut U`) would be: the
    /// displacement is relative to `self`'s own address, so the
    /// reinterpretation must stay at that same address rather than produce
    /// a relocated copy (a by-value copy would decode relative to its new,
    /// different storage address and silently target the wrong place).
    ///
    /// # Safety
    /// The caller must ensure `U` is a valid reinterpretation of the data
    /// at the decoded target address (the same contract as the raw
    /// pointer cast it replaces).
    pub unsafe fn cast<U>(&self) -> &OffsetPtr<U> {
        &*(self as *const Self as *const OffsetPtr<U>)
    }
}

impl<T> Default for OffsetPtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> PartialEq for OffsetPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.calc_address() == other.calc_address()
    }
}
impl<T> Eq for OffsetPtr<T> {}

impl<T> PartialOrd for OffsetPtr<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for OffsetPtr<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.calc_address().cmp(&other.calc_address())
    }
}

impl<T> OffsetPtr<T> {
    /// Advances the decoded target by `n` elements, recomputing the
    /// displacement the same way `set`/`rebind_from` do.
    pub fn add(&mut self, n: isize) {
        let addr = self.calc_address();
        let advanced = unsafe { addr.offset(n) };
        self.set(Some(advanced));
    }

    /// Retreats the decoded target by `n` elements.
    pub fn sub(&mut self, n: isize) {
        self.add(-n);
    }

    /// Element-count distance between two offset pointers' targets, as in
    /// raw pointer subtraction.
    pub fn offset_from(&self, other: &Self) -> isize {
        let mine = self.calc_address();
        let theirs = other.calc_address();
        unsafe { mine.offset_from(theirs) }
    }
}

impl<T> fmt::Debug for OffsetPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(p) => write!(f, "OffsetPtr({:p})", p),
            None => write!(f, "OffsetPtr(null)"),
        }
    }
}

// The displacement is address-relative data, not a borrow of anything;
// sending/sharing it between threads is exactly as sound as for `*mut T`
// itself, gated on `T` being `Send`/`Sync`.
unsafe impl<T: Send> Send for OffsetPtr<T> {}
unsafe impl<T: Sync> Sync for OffsetPtr<T> {}

/// Lock-free sibling of [`OffsetPtr`], for fields that must be read or
/// swung by multiple processes without holding a mutex (the allocator's
/// free-list rover and the message channel's head/tail use this).
#[repr(transparent)]
pub struct AtomicOffsetPtr<T> {
    offset: AtomicUsize,
    _marker: PhantomData<*mut T>,
}

impl<T> AtomicOffsetPtr<T> {
    pub const fn null() -> Self {
        Self {
            offset: AtomicUsize::new(0),
            _marker: PhantomData,
        }
    }

    fn self_addr(&self) -> usize {
        self as *const Self as usize
    }

    fn encode(&self, target: Option<*mut T>) -> usize {
        match target {
            Some(p) if !p.is_null() => (p as usize).wrapping_sub(self.self_addr()),
            _ => 0,
        }
    }

    fn decode(&self, offset: usize) -> Option<*mut T> {
        if offset == 0 {
            None
        } else {
            Some(self.self_addr().wrapping_add(offset) as *mut T)
        }
    }

    pub fn load(&self, order: Ordering) -> Option<*mut T> {
        self.decode(self.offset.load(order))
    }

    pub fn store(&self, target: Option<*mut T>, order: Ordering) {
        self.offset.store(self.encode(target), order);
    }

    pub fn swap(&self, target: Option<*mut T>, order: Ordering) -> Option<*mut T> {
        self.decode(self.offset.swap(self.encode(target), order))
    }

    pub fn compare_exchange(
        &self,
        current: Option<*mut T>,
        new: Option<*mut T>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Option<*mut T>, Option<*mut T>> {
        match self
            .offset
            .compare_exchange(self.encode(current), self.encode(new), success, failure)
        {
            Ok(off) => Ok(self.decode(off)),
            Err(off) => Err(self.decode(off)),
        }
    }

    pub fn compare_exchange_weak(
        &self,
        current: Option<*mut T>,
        new: Option<*mut T>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Option<*mut T>, Option<*mut T>> {
        match self
            .offset
            .compare_exchange_weak(self.encode(current), self.encode(new), success, failure)
        {
            Ok(off) => Ok(self.decode(off)),
            Err(off) => Err(self.decode(off)),
        }
    }

    /// Atomically advances the pointer by `n` elements (byte distance of
    /// `n * size_of::<T>()`) and returns the previous target.
    pub fn fetch_add(&self, n: usize, order: Ordering) -> Option<*mut T> {
        let step = n * std::mem::size_of::<T>();
        self.decode(self.offset.fetch_add(step, order))
    }

    /// Atomically retreats the pointer by `n` elements and returns the
    /// previous target.
    pub fn fetch_sub(&self, n: usize, order: Ordering) -> Option<*mut T> {
        let step = n * std::mem::size_of::<T>();
        self.decode(self.offset.fetch_sub(step, order))
    }
}

unsafe impl<T: Send> Send for AtomicOffsetPtr<T> {}
unsafe impl<T: Sync> Sync for AtomicOffsetPtr<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct Node {
        ptr: OffsetPtr<u32>,
        value: u32,
    }

    #[test]
    fn cast_preserves_decoded_address_across_pointee_types() {
        #[repr(align(8))]
        struct AlignedBuf([u8; 64]);
        let mut buf = AlignedBuf([0u8; 64]);
        let mut value: u32 = 7;
        unsafe {
            let slot = buf.0.as_mut_ptr().add(8) as *mut OffsetPtr<u32>;
            OffsetPtr::emplace(slot, &mut value as *mut u32);
            let recast: &OffsetPtr<i32> = (*slot).cast::<i32>();
            assert_eq!(recast.get(), Some(&mut value as *mut u32 as *mut i32));
        }
    }

    #[test]
    fn null_is_default_and_roundtrips() {
        let p: OffsetPtr<u32> = OffsetPtr::null();
        assert!(p.is_null());
        assert_eq!(p.get(), None);
    }

    #[test]
    fn emplace_and_get_roundtrip() {
        #[repr(align(8))]
        struct AlignedBuf([u8; 64]);
        let mut buf = AlignedBuf([0u8; 64]);
        let mut value: u32 = 42;
        unsafe {
            let slot = buf.0.as_mut_ptr().add(8) as *mut OffsetPtr<u32>;
            OffsetPtr::emplace(slot, &mut value as *mut u32);
            assert_eq!((*slot).get(), Some(&mut value as *mut u32));
        }
    }

    #[test]
    fn set_then_clear() {
        let mut value = 7u32;
        let mut p: OffsetPtr<u32> = OffsetPtr::null();
        p.set(Some(&mut value));
        assert_eq!(p.get(), Some(&mut value as *mut u32));
        p.set(None);
        assert!(p.is_null());
    }

    #[test]
    fn rebind_from_points_at_same_target_from_new_address() {
        let mut value = 9u32;
        let mut original: OffsetPtr<u32> = OffsetPtr::null();
        original.set(Some(&mut value));

        // `copy`, at a different address than `original`, should decode
        // to the exact same target once rebound - not to whatever lies at
        // `original`'s displacement from copy's own address.
        let mut copy: OffsetPtr<u32> = OffsetPtr::null();
        copy.rebind_from(&original);
        assert_eq!(copy.get(), Some(&mut value as *mut u32));
    }

    #[test]
    fn survives_uniform_relocation_of_pointer_and_target_together() {
        // Pointer and pointee both live inside one buffer; memmove-ing the
        // whole buffer must not invalidate the embedded offset pointer.
        let mut buf = vec![0u8; 128];
        unsafe {
            let node_ptr = buf.as_mut_ptr() as *mut Node;
            (*node_ptr).value = 123;
            let target = &mut (*node_ptr).value as *mut u32;
            OffsetPtr::emplace(&mut (*node_ptr).ptr as *mut OffsetPtr<u32>, target);
        }

        let mut relocated = vec![0u8; 128];
        relocated.copy_from_slice(&buf);
        drop(buf);

        unsafe {
            let node_ptr = relocated.as_mut_ptr() as *mut Node;
            let decoded = (*node_ptr).ptr.get().expect("non-null after relocation");
            assert_eq!(decoded, &mut (*node_ptr).value as *mut u32);
            assert_eq!(*decoded, 123);
        }
    }

    #[test]
    fn swap_exchanges_targets() {
        let mut a = 1u32;
        let mut b = 2u32;
        let mut pa: OffsetPtr<u32> = OffsetPtr::null();
        let mut pb: OffsetPtr<u32> = OffsetPtr::null();
        pa.set(Some(&mut a));
        pb.set(Some(&mut b));
        pa.swap(&mut pb);
        assert_eq!(pa.get(), Some(&mut b as *mut u32));
        assert_eq!(pb.get(), Some(&mut a as *mut u32));
    }

    #[test]
    fn atomic_store_load_and_cas() {
        let mut value = 5u32;
        let slot: AtomicOffsetPtr<u32> = AtomicOffsetPtr::null();
        slot.store(Some(&mut value), Ordering::SeqCst);
        assert_eq!(slot.load(Ordering::SeqCst), Some(&mut value as *mut u32));

        let mut other = 6u32;
        let result = slot.compare_exchange(
            Some(&mut value),
            Some(&mut other),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        assert_eq!(result, Ok(Some(&mut value as *mut u32)));
        assert_eq!(slot.load(Ordering::SeqCst), Some(&mut other as *mut u32));
    }

    #[test]
    fn arithmetic_advances_and_retreats_by_element_count() {
        let mut arr = [10u32, 20, 30, 40];
        let mut p: OffsetPtr<u32> = OffsetPtr::null();
        p.set(Some(&mut arr[0] as *mut u32));
        p.add(2);
        assert_eq!(p.get(), Some(&mut arr[2] as *mut u32));
        p.sub(1);
        assert_eq!(p.get(), Some(&mut arr[1] as *mut u32));
    }

    #[test]
    fn offset_from_reports_element_distance() {
        let mut arr = [0u32; 4];
        let mut lo: OffsetPtr<u32> = OffsetPtr::null();
        let mut hi: OffsetPtr<u32> = OffsetPtr::null();
        lo.set(Some(&mut arr[0] as *mut u32));
        hi.set(Some(&mut arr[3] as *mut u32));
        assert_eq!(hi.offset_from(&lo), 3);
        assert_eq!(lo.offset_from(&hi), -3);
    }

    #[test]
    fn ordering_delegates_to_decoded_address() {
        let mut arr = [0u32; 2];
        let mut lo: OffsetPtr<u32> = OffsetPtr::null();
        let mut hi: OffsetPtr<u32> = OffsetPtr::null();
        lo.set(Some(&mut arr[0] as *mut u32));
        hi.set(Some(&mut arr[1] as *mut u32));
        assert!(lo < hi);
        assert_eq!(lo, lo);
        assert_ne!(lo, hi);
    }

    #[test]
    fn atomic_fetch_add_and_sub_step_by_element_size() {
        let mut arr = [1u32, 2, 3, 4];
        let slot: AtomicOffsetPtr<u32> = AtomicOffsetPtr::null();
        slot.store(Some(&mut arr[0] as *mut u32), Ordering::SeqCst);
        let prev = slot.fetch_add(2, Ordering::SeqCst);
        assert_eq!(prev, Some(&mut arr[0] as *mut u32));
        assert_eq!(slot.load(Ordering::SeqCst), Some(&mut arr[2] as *mut u32));

        let prev = slot.fetch_sub(1, Ordering::SeqCst);
        assert_eq!(prev, Some(&mut arr[2] as *mut u32));
        assert_eq!(slot.load(Ordering::SeqCst), Some(&mut arr[1] as *mut u32));
    }
}
