use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

pub const DEFAULT_MAX_MOUNTS: usize = 1024;

/// Largest errno the kernel accepts in a reply.
pub const MAX_ERRNO: i32 = 4095;

/// What the dispatcher answers for an operation nobody registered a handler for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsupportedPolicy {
    /// Complete with `-ENOSYS`.
    #[default]
    NotImplemented,
    /// Complete with 0.
    Succeed,
    /// Complete with the given errno, negated. Must lie in `1..=4095`.
    Errno(i32),
}

impl UnsupportedPolicy {
    pub fn code(&self) -> i32 {
        match self {
            UnsupportedPolicy::NotImplemented => -libc::ENOSYS,
            UnsupportedPolicy::Succeed => 0,
            UnsupportedPolicy::Errno(e) => -(e.unsigned_abs().min(MAX_ERRNO as u32) as i32),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Upper bound on concurrently mounted filesystems.
    pub max_mounts: usize,
    pub unsupported: UnsupportedPolicy,
    /// Filesystem name reported to the kernel when the options don't set one.
    pub fsname: String,
    pub attr_ttl_ms: u64,
    pub entry_ttl_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            max_mounts: DEFAULT_MAX_MOUNTS,
            unsupported: UnsupportedPolicy::default(),
            fsname: "fusebridge".to_string(),
            attr_ttl_ms: 1000,
            entry_ttl_ms: 1000,
        }
    }
}

impl BridgeConfig {
    pub fn from_json(s: &str) -> Result<Self> {
        let config: BridgeConfig =
            serde_json::from_str(s).map_err(|e| BridgeError::InvalidArgument {
                msg: format!("config: {}", e),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_mounts == 0 {
            return Err(BridgeError::InvalidArgument {
                msg: "max_mounts must be at least 1".to_string(),
            });
        }
        if let UnsupportedPolicy::Errno(e) = self.unsupported {
            if !(1..=MAX_ERRNO).contains(&e) {
                return Err(BridgeError::InvalidArgument {
                    msg: format!("unsupported errno {} outside 1..={}", e, MAX_ERRNO),
                });
            }
        }
        Ok(())
    }

    pub fn with_max_mounts(mut self, max_mounts: usize) -> Self {
        self.max_mounts = max_mounts;
        self
    }

    pub fn with_unsupported(mut self, policy: UnsupportedPolicy) -> Self {
        self.unsupported = policy;
        self
    }
}
