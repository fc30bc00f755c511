//! Construction options for a [`crate::region::SharedRegion`] /
//! [`crate::heap::HeapRegion`].
//!
//! Mirrors the "Recognised construction options" table of the design: a
//! region is named by a triple (name, directory, length) plus an access
//! mode, and the bootstrap/backoff constants the reference implementation
//! hardcodes (`maxdelay = 64`, a 2ms retry sleep) are exposed here as
//! overridable, serde-deserialisable fields instead.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{IpsmError, IpsmResult};

/// Matches the reference implementation's `maxdelay` constant for lockfile
/// backoff.
pub const DEFAULT_LOCK_RETRY_CAP_MS: u64 = 64;

/// Matches the reference implementation's bootstrap retry sleep.
pub const DEFAULT_BOOTSTRAP_RETRY_SLEEP_MS: u64 = 2;

/// The reference implementation retries bootstrap unboundedly; this crate
/// bounds it so a permanently unwinnable race surfaces as an error instead
/// of looping forever.
pub const DEFAULT_MAX_BOOTSTRAP_ATTEMPTS: u32 = 4096;

const DEFAULT_MODE: u32 = 0o600;

/// A generous floor below which no region can possibly hold a header plus
/// a usable allocator. The allocator and region header enforce the exact
/// minimum at construction time with a precise [`IpsmError::LengthTooSmall`].
const MIN_REGION_LENGTH: usize = 4096;

/// NAME_MAX minus the ".lock" suffix this crate appends, give or take.
const NAME_MAX_CHARS: usize = 250;

fn default_mode() -> u32 {
    DEFAULT_MODE
}

fn default_lock_retry_cap_ms() -> u64 {
    DEFAULT_LOCK_RETRY_CAP_MS
}

fn default_bootstrap_retry_sleep_ms() -> u64 {
    DEFAULT_BOOTSTRAP_RETRY_SLEEP_MS
}

fn default_max_bootstrap_attempts() -> u32 {
    DEFAULT_MAX_BOOTSTRAP_ATTEMPTS
}

fn default_directory() -> PathBuf {
    PathBuf::from("/tmp")
}

/// Construction options for a shared region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionConfig {
    /// POSIX-style region name; must begin with `/`.
    pub name: String,
    /// Directory hosting the identity file and lockfile.
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    /// Requested usable byte length (not counting the region header).
    pub length: usize,
    /// POSIX access mode bits applied to the shared-memory object and the
    /// identity file.
    #[serde(default = "default_mode")]
    pub mode: u32,
    /// Cap, in milliseconds, on the lockfile's exponential backoff.
    #[serde(default = "default_lock_retry_cap_ms")]
    pub lock_retry_cap_ms: u64,
    /// Sleep between bootstrap retries after a transient identity race.
    #[serde(default = "default_bootstrap_retry_sleep_ms")]
    pub bootstrap_retry_sleep_ms: u64,
    /// Bootstrap retry budget before giving up with
    /// [`IpsmError::BootstrapRetriesExhausted`].
    #[serde(default = "default_max_bootstrap_attempts")]
    pub max_bootstrap_attempts: u32,
}

impl RegionConfig {
    /// Starts a config with the reference implementation's defaults for
    /// everything but `name` and `length`.
    pub fn new(name: impl Into<String>, length: usize) -> Self {
        Self {
            name: name.into(),
            directory: default_directory(),
            length,
            mode: default_mode(),
            lock_retry_cap_ms: default_lock_retry_cap_ms(),
            bootstrap_retry_sleep_ms: default_bootstrap_retry_sleep_ms(),
            max_bootstrap_attempts: default_max_bootstrap_attempts(),
        }
    }

    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = directory.into();
        self
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_lock_retry_cap_ms(mut self, ms: u64) -> Self {
        self.lock_retry_cap_ms = ms;
        self
    }

    pub fn with_bootstrap_retry_sleep_ms(mut self, ms: u64) -> Self {
        self.bootstrap_retry_sleep_ms = ms;
        self
    }

    pub fn with_max_bootstrap_attempts(mut self, n: u32) -> Self {
        self.max_bootstrap_attempts = n;
        self
    }

    pub(crate) fn validate(&self) -> IpsmResult<()> {
        if !self.name.starts_with('/') || self.name.len() < 2 {
            return Err(IpsmError::InvalidName {
                reason: format!("region name {:?} must begin with '/' and have a body", self.name),
            });
        }
        if self.name.len() > NAME_MAX_CHARS {
            return Err(IpsmError::InvalidName {
                reason: format!("region name {:?} exceeds {NAME_MAX_CHARS} characters", self.name),
            });
        }
        if self.name[1..].contains('/') {
            return Err(IpsmError::InvalidName {
                reason: format!("region name {:?} must not contain '/' after the leading one", self.name),
            });
        }
        if self.length < MIN_REGION_LENGTH {
            return Err(IpsmError::LengthTooSmall {
                requested: self.length,
                minimum: MIN_REGION_LENGTH,
            });
        }
        Ok(())
    }

    /// Path of the identity file whose inode is this region's generation
    /// token.
    pub(crate) fn identity_path(&self) -> PathBuf {
        self.directory.join(self.name.trim_start_matches('/'))
    }

    /// Path of the bootstrap/detach lockfile.
    pub(crate) fn lock_path(&self) -> PathBuf {
        let mut os_string = self.identity_path().into_os_string();
        os_string.push(".lock");
        PathBuf::from(os_string)
    }
}
