//! LVHD common types and utilities
//!
//! Shared foundation for the LVHD storage-virtualization crates:
//! - Error taxonomy (`StorageError`) used across every operation boundary
//! - VDI/SR record types exchanged with the metadata store
//! - SR configuration
//! - Byte-size helpers

pub mod config;
pub mod error;
pub mod types;
pub mod units;

pub use config::{LockRetryConfig, Provisioning, SrConfig};
pub use error::{Result, StorageError};
pub use types::{SrMetadataRecord, VdiKind, VdiMetadataRecord, VdiType};
pub use units::{GIB, KIB, MIB, SECTOR_SIZE, roundup};
