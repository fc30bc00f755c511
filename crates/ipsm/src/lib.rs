//! Inter-process shared-memory (IPSM) primitives for POSIX systems.
//!
//! # Layers
//!
//! ```text
//! HeapRegion   (L4) - allocator + message channels over a SharedRegion
//! SharedRegion (L3) - cooperative primary/secondary bootstrap, identity file, lockfile
//! Allocator    (L2) - K&R next-fit free-list allocator living inside the region
//! RobustMutex / CondVar (L1) - process-shared, owner-death-tolerant sync primitives
//! OffsetPtr    (L0) - address-space-independent pointer
//! ```
//!
//! Creation enters at [`HeapRegion`]; everything below it is usable
//! standalone for callers that want bespoke layouts inside their own
//! [`SharedRegion`].

pub mod alloc;
pub mod condvar;
pub mod config;
pub mod error;
pub mod heap;
pub mod mutex;
pub mod offset_ptr;
pub mod region;

pub use alloc::Allocator;
pub use condvar::{CondVar, CvStatus};
pub use config::RegionConfig;
pub use error::{IpsmError, IpsmResult};
pub use heap::{HeapRegion, CHANNEL_COUNT};
pub use mutex::{MutexGuard, RecursiveRobustMutex, RobustMutex};
pub use offset_ptr::{AtomicOffsetPtr, OffsetPtr};
pub use region::SharedRegion;
