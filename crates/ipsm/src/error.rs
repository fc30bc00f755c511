//! Error types for the IPSM core engine
//!
//! All errors are defined as variants of `IpsmError`. Error codes follow
//! the three-kind taxonomy of the design: precondition violations (PRE-xxx),
//! unwinnable role races (ROLE-xxx), and system-level failures (SYS-xxx).

use thiserror::Error;

/// Result type alias for IPSM operations
pub type IpsmResult<T> = Result<T, IpsmError>;

/// Core error enum for the shared-memory subsystem
#[derive(Error, Debug)]
pub enum IpsmError {
    // === Precondition violations (PRE-0xx) ===
    /// PRE-001: region name is missing, not slash-prefixed, or too long
    #[error("PRE-001 InvalidName: {reason}")]
    InvalidName { reason: String },

    /// PRE-002: requested length cannot hold a header plus a usable allocator
    #[error("PRE-002 LengthTooSmall: requested {requested} bytes, minimum is {minimum}")]
    LengthTooSmall { requested: usize, minimum: usize },

    // === Bootstrap / role races (ROLE-0xx) ===
    /// ROLE-001: caller demanded an explicit role and lost the race for it
    #[error("ROLE-001 RoleUnavailable: cannot become {role} for region {name}")]
    RoleUnavailable { role: &'static str, name: String },

    /// ROLE-002: bootstrap exhausted its retry budget without converging
    #[error("ROLE-002 BootstrapRetriesExhausted: region {name} after {attempts} attempts")]
    BootstrapRetriesExhausted { name: String, attempts: u32 },

    // === Allocator errors (ALLOC-0xx) ===
    /// ALLOC-001: the requested region is too small to host an allocator
    #[error("ALLOC-001 AllocationFailed: {reason}")]
    AllocationFailed { reason: String },

    /// ALLOC-002: bind() observed an already-disposed control block
    #[error("ALLOC-002 Disposed: control block has bind_count 0")]
    Disposed,

    /// ALLOC-003: deallocate() could not re-insert a block into the free list
    #[error("ALLOC-003 Internal: {0}")]
    Internal(String),

    // === System-level failures (SYS-0xx) ===
    /// SYS-001: shm_open/mmap/ftruncate or similar failed
    #[error("SYS-001 ShmFailure: {op} failed: {source}")]
    ShmFailure {
        op: &'static str,
        #[source]
        source: nix::Error,
    },

    /// SYS-002: a pthread primitive (mutex/condvar) returned an unexpected errno
    #[error("SYS-002 System: {op} failed with errno {errno}")]
    System { op: &'static str, errno: i32 },

    /// SYS-003: filesystem I/O (identity file, lockfile) failed
    #[error("SYS-003 Io: {0}")]
    Io(#[from] std::io::Error),
}

impl IpsmError {
    /// Returns the error code string (e.g., "PRE-001")
    pub fn code(&self) -> &'static str {
        match self {
            IpsmError::InvalidName { .. } => "PRE-001",
            IpsmError::LengthTooSmall { .. } => "PRE-002",
            IpsmError::RoleUnavailable { .. } => "ROLE-001",
            IpsmError::BootstrapRetriesExhausted { .. } => "ROLE-002",
            IpsmError::AllocationFailed { .. } => "ALLOC-001",
            IpsmError::Disposed => "ALLOC-002",
            IpsmError::Internal(_) => "ALLOC-003",
            IpsmError::ShmFailure { .. } => "SYS-001",
            IpsmError::System { .. } => "SYS-002",
            IpsmError::Io(_) => "SYS-003",
        }
    }
}
