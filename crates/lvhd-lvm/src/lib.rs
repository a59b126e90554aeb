//! LVM volume-group layer
//!
//! Narrow interface over the LVM primitives the SR engines need:
//! create/remove/rename/resize, activation, read-only and hidden flags,
//! tags, and a bulk LV-info scan. Two implementations:
//! - [`CmdVolumeManager`] spawns the real LVM tools
//! - [`MemVolumeManager`] is an in-memory fake for tests
//!
//! The engines depend only on the [`VolumeManager`] trait.

pub mod cmd;
pub mod mem;
pub mod naming;
pub mod volume;

pub use cmd::CmdVolumeManager;
pub use mem::MemVolumeManager;
pub use naming::{LV_PREFIX_RAW, LV_PREFIX_VHD, MGT_LV_NAME, lv_name_of, parse_lv_name};
pub use volume::{LvInfo, VolumeManager};

use lvhd_common::MIB;

/// LVM allocates in multiples of this; every LV size is rounded up to it
pub const LVM_SIZE_INCREMENT: u64 = 4 * MIB;

/// Tag marking an LV as a hidden chain node
pub const TAG_HIDDEN: &str = "hidden";
