//! SR configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Provisioning policy for VHD-backed LVs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provisioning {
    /// LVs track real VHD allocation and are inflated on demand
    #[default]
    Thin,
    /// LVs are allocated at full virtual size up front
    Thick,
}

/// Configuration for one SR instance
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SrConfig {
    /// SR uuid
    pub uuid: String,
    /// Name of the backing volume group
    pub vg_name: String,
    /// Provisioning policy
    pub provisioning: Provisioning,
    /// Directory holding the per-SR advisory lock files
    pub lock_dir: PathBuf,
    /// Base directory for persisted refcount files
    pub refcount_dir: PathBuf,
    /// SR-lock retry behavior
    pub lock_retry: LockRetryConfig,
}

impl SrConfig {
    /// Config with conventional runtime paths for the given SR uuid
    #[must_use]
    pub fn new(uuid: impl Into<String>, vg_name: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            vg_name: vg_name.into(),
            provisioning: Provisioning::default(),
            lock_dir: PathBuf::from("/var/lock/sm"),
            refcount_dir: PathBuf::from("/var/run/sm/refcount"),
            lock_retry: LockRetryConfig::default(),
        }
    }

    /// Refcount namespace owned by this SR's LVs
    #[must_use]
    pub fn lvm_namespace(&self) -> String {
        format!("lvm-{}", self.uuid)
    }
}

/// Bounded retry behavior for SR-lock acquisition
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockRetryConfig {
    /// Number of acquisition attempts before reporting busy
    pub attempts: u32,
    /// Pause between attempts, in milliseconds
    pub interval_ms: u64,
}

impl LockRetryConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for LockRetryConfig {
    fn default() -> Self {
        Self {
            attempts: 200,
            interval_ms: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_round_trip() {
        let cfg = SrConfig::new("9f3c", "VG_LVHD-9f3c");
        let json = serde_json::to_string(&cfg).unwrap();
        let back: SrConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.uuid, "9f3c");
        assert_eq!(back.provisioning, Provisioning::Thin);
    }

    #[test]
    fn test_lvm_namespace() {
        let cfg = SrConfig::new("abcd", "vg");
        assert_eq!(cfg.lvm_namespace(), "lvm-abcd");
    }
}
