//! SR/VDI metadata persistence on the reserved management volume
//!
//! A database-free store: SR and VDI attributes live directly on a small
//! reserved LV as flat XML packed into fixed 512-byte sectors. The layout
//! is shared with pool members running other implementations and must be
//! preserved exactly:
//!
//! ```text
//! sector 0      header "<magic>:<total-length,10>:<major>:<minor>"
//! sector 1      SR uuid (+ legacy allocation tag in the older format)
//! sector 2      SR name_label
//! sector 3      SR name_description
//! sector 4..    one VDI record per 2 sectors:
//!               sector A  name_label + name_description
//!               sector B  remaining tags, closed by a literal </vdi>
//! ```
//!
//! All device access goes through an aligned-range helper: the underlying
//! channel requires direct I/O in multiples of the device's minimum block
//! size, so the store only ever reads or rewrites whole aligned ranges.

pub mod io;
pub mod store;
mod xml;

pub use io::{AlignedBuf, MetaFile};
pub use store::{
    MD_MAJOR, MD_MINOR, MetadataStore, MetadataUpdate, SECTOR_SIZE, VDI_RECORD_SIZE,
    get_block_aligned_range,
};
