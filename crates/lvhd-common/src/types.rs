//! Record types exchanged between the SR engines and the metadata store
//!
//! These are deliberately plain tagged structs: the flat-XML encoding lives
//! entirely at the metadata-store boundary, nothing here knows about sectors
//! or tags.

use std::fmt;

/// On-disk representation of a virtual disk
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VdiType {
    /// Raw LV, no copy-on-write format
    Raw,
    /// VHD-formatted LV with a parent-pointer chain
    Vhd,
}

impl VdiType {
    /// Tag value stored in metadata
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "aio",
            Self::Vhd => "vhd",
        }
    }

    /// Parse the metadata tag value
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "aio" => Some(Self::Raw),
            "vhd" => Some(Self::Vhd),
            _ => None,
        }
    }
}

impl fmt::Display for VdiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the VDI is used for
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VdiKind {
    /// Regular guest disk
    #[default]
    User,
    /// Hypervisor-owned disk (e.g. crash dump)
    System,
    /// Pool metadata disk
    Metadata,
}

impl VdiKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::System => "system",
            Self::Metadata => "metadata",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "system" => Some(Self::System),
            "metadata" => Some(Self::Metadata),
            _ => None,
        }
    }
}

/// SR-level attributes persisted on the management volume
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SrMetadataRecord {
    /// SR uuid
    pub uuid: String,
    /// Legacy allocation tag; only present in the older on-disk format
    pub allocation: Option<String>,
    /// Human-readable label
    pub name_label: String,
    /// Human-readable description
    pub name_description: String,
}

/// Per-VDI attributes persisted on the management volume
///
/// One record occupies exactly two metadata sectors; the store truncates
/// over-long labels rather than spilling into a third sector.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VdiMetadataRecord {
    pub uuid: String,
    pub name_label: String,
    pub name_description: String,
    pub is_a_snapshot: bool,
    /// uuid of the VDI this is a snapshot of, empty if not a snapshot
    pub snapshot_of: String,
    /// ISO-8601 timestamp, empty if not a snapshot
    pub snapshot_time: String,
    pub kind: VdiKind,
    pub vdi_type: VdiType,
    pub read_only: bool,
    pub managed: bool,
    /// Pool uuid if this VDI holds pool metadata, empty otherwise
    pub metadata_of_pool: String,
    /// Tombstone flag; the slot is reused before the file grows
    pub deleted: bool,
}

impl VdiMetadataRecord {
    /// A fresh, managed record for a newly created VDI
    #[must_use]
    pub fn new(uuid: impl Into<String>, vdi_type: VdiType) -> Self {
        Self {
            uuid: uuid.into(),
            vdi_type,
            managed: true,
            ..Self::default()
        }
    }

    /// Mark as hidden chain node: hidden VDIs are never managed
    pub fn hide(&mut self) {
        self.managed = false;
        self.read_only = true;
    }
}

impl Default for VdiType {
    fn default() -> Self {
        Self::Vhd
    }
}
