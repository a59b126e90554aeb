//! VHD tool interface
//!
//! The copy-on-write format is owned by an external CLI tool; this crate
//! models it as the narrow [`VhdTool`] trait plus the geometry math needed
//! to size the backing LVs. The SR engines depend only on the trait.

pub mod cmd;
pub mod geometry;

pub use cmd::CmdVhdTool;
pub use geometry::{
    MAX_CHAIN_SIZE, MAX_VHD_SIZE, VHD_BLOCK_SIZE, VHD_FOOTER_SIZE, calc_overhead_bitmap,
    calc_overhead_empty,
};

use lvhd_common::Result;
use std::path::{Path, PathBuf};

/// Everything the engines need to know about one VHD node
#[derive(Clone, Debug)]
pub struct VhdInfo {
    /// Virtual size presented to the guest
    pub size_virt: u64,
    /// Physical size recorded in the VHD header; the LV must be at least
    /// this big
    pub size_phys: u64,
    /// Parent node path for differencing disks
    pub parent: Option<PathBuf>,
    /// VHD-level hidden flag
    pub hidden: bool,
}

/// Narrow interface over the external VHD tool
///
/// Every call maps to one synchronous tool invocation against a device
/// path; the invocation is treated as atomic.
pub trait VhdTool: Send + Sync {
    /// Format an empty VHD. With `reserve_full_bat` the block allocation
    /// table is preallocated for the maximum virtual size, so later online
    /// resizes never need to move metadata.
    fn create(&self, path: &Path, size_virt: u64, reserve_full_bat: bool) -> Result<()>;

    /// Create a differencing disk at `dst` whose parent is `src`
    fn snapshot(&self, dst: &Path, src: &Path) -> Result<()>;

    /// Integrity-check the node. `Ok(false)` means the node is structurally
    /// invalid; errors are reserved for failures to run the check at all.
    fn check(&self, path: &Path) -> Result<bool>;

    /// Length of the parent chain ending at this node
    fn get_depth(&self, path: &Path) -> Result<u32>;

    /// Parent pointer, `None` for a chain root
    fn get_parent(&self, path: &Path) -> Result<Option<PathBuf>>;

    /// VHD-level hidden flag
    fn get_hidden(&self, path: &Path) -> Result<bool>;
    fn set_hidden(&self, path: &Path, hidden: bool) -> Result<()>;

    /// Virtual size
    fn get_size_virt(&self, path: &Path) -> Result<u64>;
    fn set_size_virt(&self, path: &Path, size: u64) -> Result<()>;

    /// Physical size recorded in the header
    fn get_size_phys(&self, path: &Path) -> Result<u64>;
    fn set_size_phys(&self, path: &Path, size: u64) -> Result<()>;
}
