//! The metadata store proper: header, SR sectors, VDI records

use crate::io::{MetaFile, aligned_range};
use crate::xml;

use lvhd_common::{Result, StorageError, SrMetadataRecord, VdiKind, VdiMetadataRecord, VdiType};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Fixed sector size of the on-disk format (independent of the device's
/// minimum I/O block size, which only governs alignment)
pub const SECTOR_SIZE: u64 = lvhd_common::SECTOR_SIZE;

/// Format identity
pub const MD_MAGIC: &str = "LVMD";
pub const MD_MAJOR: u32 = 2;
pub const MD_MINOR: u32 = 0;

/// Sector 1 of the older format carries an allocation tag
const LEGACY_MAJOR: u32 = 1;

/// Sectors 0..4 hold the header and SR info; VDI records follow
const VDI_FIRST_SECTOR: u64 = 4;

/// Each VDI record spans two sectors
pub const VDI_RECORD_SIZE: u64 = 2 * SECTOR_SIZE;

const HEADER_LEN: u64 = VDI_FIRST_SECTOR * SECTOR_SIZE;

/// Partial-update dispatch, by object type
pub enum MetadataUpdate {
    Sr(SrMetadataRecord),
    Vdi(VdiMetadataRecord),
}

/// SR/VDI attribute store on the management volume
pub struct MetadataStore {
    file: MetaFile,
}

impl MetadataStore {
    #[must_use]
    pub fn new(file: MetaFile) -> Self {
        Self { file }
    }

    /// Re-expose the aligned-range helper for size math
    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.file.block_size()
    }

    /// Full rewrite: header, SR info, every record. Used when the SR (or
    /// its management volume) is first created.
    pub fn write_metadata(
        &self,
        sr_info: &SrMetadataRecord,
        vdi_info: &[VdiMetadataRecord],
    ) -> Result<()> {
        let total_len = HEADER_LEN + vdi_info.len() as u64 * VDI_RECORD_SIZE;

        let mut image = vec![0u8; total_len as usize];
        write_sector(&mut image, 0, format_header(total_len).as_bytes());
        write_sector(&mut image, 1, encode_sr_uuid_sector(sr_info).as_bytes());
        write_sector(
            &mut image,
            2,
            xml::one_tag_fitting("name_label", &sr_info.name_label, SECTOR_SIZE as usize)
                .as_bytes(),
        );
        write_sector(
            &mut image,
            3,
            xml::one_tag_fitting(
                "name_description",
                &sr_info.name_description,
                SECTOR_SIZE as usize,
            )
            .as_bytes(),
        );
        for (i, rec) in vdi_info.iter().enumerate() {
            let offset = HEADER_LEN as usize + i * VDI_RECORD_SIZE as usize;
            image[offset..offset + VDI_RECORD_SIZE as usize]
                .copy_from_slice(&encode_vdi_record(rec));
        }

        self.file.write_range(0, &image)?;
        info!(records = vdi_info.len(), total_len, "metadata written");
        Ok(())
    }

    /// Full parse: SR info plus every VDI record (tombstones included),
    /// keyed by byte offset
    pub fn get_metadata(&self) -> Result<(SrMetadataRecord, BTreeMap<u64, VdiMetadataRecord>)> {
        let (total_len, major) = self.read_header()?;
        let image = self.file.read_range(0, total_len)?;

        let sr_sector = sector_str(&image, 1);
        let mut sr_info = SrMetadataRecord {
            uuid: xml::require_tag(&sr_sector, "uuid")?,
            allocation: xml::find_tag(&sr_sector, "allocation")?,
            name_label: xml::find_tag(&sector_str(&image, 2), "name_label")?.unwrap_or_default(),
            name_description: xml::find_tag(&sector_str(&image, 3), "name_description")?
                .unwrap_or_default(),
        };
        if major != LEGACY_MAJOR {
            sr_info.allocation = None;
        }

        let mut vdis = BTreeMap::new();
        let mut offset = HEADER_LEN;
        while offset + VDI_RECORD_SIZE <= total_len {
            let bytes = &image[offset as usize..(offset + VDI_RECORD_SIZE) as usize];
            vdis.insert(offset, decode_vdi_record(bytes)?);
            offset += VDI_RECORD_SIZE;
        }
        Ok((sr_info, vdis))
    }

    /// Partial rewrite of SR- or VDI-level attributes; only the aligned
    /// byte ranges that actually changed are rewritten
    pub fn update_metadata(&self, update: &MetadataUpdate) -> Result<()> {
        match update {
            MetadataUpdate::Sr(sr_info) => self.update_sr(sr_info),
            MetadataUpdate::Vdi(rec) => self.update_vdi(rec),
        }
    }

    fn update_sr(&self, sr_info: &SrMetadataRecord) -> Result<()> {
        let label =
            xml::one_tag_fitting("name_label", &sr_info.name_label, SECTOR_SIZE as usize);
        self.rewrite_sector_if_changed(2, label.as_bytes())?;
        let desc = xml::one_tag_fitting(
            "name_description",
            &sr_info.name_description,
            SECTOR_SIZE as usize,
        );
        self.rewrite_sector_if_changed(3, desc.as_bytes())?;
        Ok(())
    }

    fn update_vdi(&self, rec: &VdiMetadataRecord) -> Result<()> {
        let (offset, _) = self
            .find_vdi(&rec.uuid)?
            .ok_or_else(|| StorageError::VdiNotFound(rec.uuid.clone()))?;
        let encoded = encode_vdi_record(rec);
        let current = self.file.read_range(offset, VDI_RECORD_SIZE)?;
        if current != encoded {
            self.file.write_range(offset, &encoded)?;
        }
        Ok(())
    }

    /// Introduce a record, reusing a tombstoned slot before growing the
    /// file. Returns the record's byte offset.
    pub fn add_vdi(&self, rec: &VdiMetadataRecord) -> Result<u64> {
        let (total_len, _) = self.read_header()?;
        let (_, vdis) = self.get_metadata()?;

        if let Some((&offset, _)) = vdis.iter().find(|(_, r)| r.deleted) {
            debug!(uuid = %rec.uuid, offset, "reusing tombstoned metadata slot");
            self.file.write_range(offset, &encode_vdi_record(rec))?;
            return Ok(offset);
        }

        let offset = total_len;
        self.file.write_range(offset, &encode_vdi_record(rec))?;
        self.write_header(total_len + VDI_RECORD_SIZE)?;
        Ok(offset)
    }

    /// Tombstone a record in place; the recorded length shrinks only when
    /// the record was the last one in the file
    pub fn delete_vdi(&self, uuid: &str) -> Result<()> {
        let (total_len, _) = self.read_header()?;
        let (offset, mut rec) = self
            .find_vdi(uuid)?
            .ok_or_else(|| StorageError::VdiNotFound(uuid.to_string()))?;

        rec.deleted = true;
        self.file.write_range(offset, &encode_vdi_record(&rec))?;

        if offset + VDI_RECORD_SIZE == total_len {
            self.write_header(total_len - VDI_RECORD_SIZE)?;
        }
        Ok(())
    }

    /// Prove `count` more records fit by actually adding dummies and
    /// deleting them again; any I/O failure is the space-exhaustion signal
    /// (there is no separate free-space query on the management volume)
    pub fn ensure_space_is_available_for_vdis(&self, count: usize) -> Result<()> {
        let mut dummies = Vec::with_capacity(count);
        for i in 0..count {
            let rec = VdiMetadataRecord::new(format!("space-probe-{i}"), VdiType::Vhd);
            self.add_vdi(&rec)?;
            dummies.push(rec.uuid);
        }
        // reverse order so appended probes are each last when deleted,
        // shrinking the file back to its original length
        for uuid in dummies.iter().rev() {
            self.delete_vdi(uuid)?;
        }
        Ok(())
    }

    /// Locate a live (non-tombstoned) record by uuid
    pub fn find_vdi(&self, uuid: &str) -> Result<Option<(u64, VdiMetadataRecord)>> {
        let (_, vdis) = self.get_metadata()?;
        Ok(vdis
            .into_iter()
            .find(|(_, r)| !r.deleted && r.uuid == uuid))
    }

    fn read_header(&self) -> Result<(u64, u32)> {
        let sector0 = self.file.read_range(0, SECTOR_SIZE)?;
        parse_header(&sector0)
    }

    fn write_header(&self, total_len: u64) -> Result<()> {
        let mut sector = vec![0u8; SECTOR_SIZE as usize];
        let header = format_header(total_len);
        sector[..header.len()].copy_from_slice(header.as_bytes());
        self.file.write_range(0, &sector)
    }

    fn rewrite_sector_if_changed(&self, sector: u64, content: &[u8]) -> Result<()> {
        let offset = sector * SECTOR_SIZE;
        let current = self.file.read_range(offset, SECTOR_SIZE)?;
        let mut padded = vec![0u8; SECTOR_SIZE as usize];
        padded[..content.len()].copy_from_slice(content);
        if current != padded {
            let (lower, upper) = aligned_range(self.file.block_size(), offset, SECTOR_SIZE);
            debug!(sector, lower, upper, "rewriting changed metadata range");
            self.file.write_range(offset, &padded)?;
        }
        Ok(())
    }
}

/// `"<magic>:<total-length, left-padded to 10 chars>:<major>:<minor>"`
fn format_header(total_len: u64) -> String {
    format!("{MD_MAGIC}:{total_len:010}:{MD_MAJOR}:{MD_MINOR}")
}

fn parse_header(sector0: &[u8]) -> Result<(u64, u32)> {
    let text = str_until_nul(sector0);
    let mut fields = text.split(':');
    let magic = fields.next().unwrap_or_default();
    if magic != MD_MAGIC {
        return Err(StorageError::metadata(format!(
            "bad metadata magic {magic:?}"
        )));
    }
    let total_len: u64 = fields
        .next()
        .and_then(|f| f.trim().parse().ok())
        .ok_or_else(|| StorageError::metadata("bad metadata length field"))?;
    let major: u32 = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| StorageError::metadata("bad metadata major version"))?;
    if major > MD_MAJOR {
        return Err(StorageError::metadata(format!(
            "metadata version {major} is newer than supported {MD_MAJOR}"
        )));
    }
    if total_len % SECTOR_SIZE != 0 || total_len < HEADER_LEN {
        return Err(StorageError::metadata(format!(
            "implausible metadata length {total_len}"
        )));
    }
    Ok((total_len, major))
}

fn encode_sr_uuid_sector(sr_info: &SrMetadataRecord) -> String {
    let mut out = xml::tag("uuid", &sr_info.uuid);
    if let Some(allocation) = &sr_info.allocation {
        out.push_str(&xml::tag("allocation", allocation));
    }
    out
}

fn encode_vdi_record(rec: &VdiMetadataRecord) -> Vec<u8> {
    let mut bytes = vec![0u8; VDI_RECORD_SIZE as usize];

    let label_sector = xml::two_tags_fitting(
        "name_label",
        &rec.name_label,
        "name_description",
        &rec.name_description,
        SECTOR_SIZE as usize,
    );
    bytes[..label_sector.len()].copy_from_slice(label_sector.as_bytes());

    let mut tail = String::new();
    tail.push_str(&xml::tag("uuid", &rec.uuid));
    tail.push_str(&xml::tag("is_a_snapshot", xml::bool_str(rec.is_a_snapshot)));
    tail.push_str(&xml::tag("snapshot_of", &rec.snapshot_of));
    tail.push_str(&xml::tag("snapshot_time", &rec.snapshot_time));
    tail.push_str(&xml::tag("type", rec.kind.as_str()));
    tail.push_str(&xml::tag("vdi_type", rec.vdi_type.as_str()));
    tail.push_str(&xml::tag("read_only", xml::bool_str(rec.read_only)));
    tail.push_str(&xml::tag("managed", xml::bool_str(rec.managed)));
    tail.push_str(&xml::tag("metadata_of_pool", &rec.metadata_of_pool));
    tail.push_str(&xml::tag("deleted", xml::bool_str(rec.deleted)));
    tail.push_str("</vdi>");
    debug_assert!(tail.len() <= SECTOR_SIZE as usize);

    let sector_b = SECTOR_SIZE as usize;
    bytes[sector_b..sector_b + tail.len()].copy_from_slice(tail.as_bytes());
    bytes
}

fn decode_vdi_record(bytes: &[u8]) -> Result<VdiMetadataRecord> {
    let label_sector = str_until_nul(&bytes[..SECTOR_SIZE as usize]);
    let tail = str_until_nul(&bytes[SECTOR_SIZE as usize..]);
    if !tail.trim_end().ends_with("</vdi>") {
        return Err(StorageError::metadata("VDI record missing </vdi> close"));
    }

    let vdi_type = xml::require_tag(&tail, "vdi_type")?;
    let kind = xml::require_tag(&tail, "type")?;
    Ok(VdiMetadataRecord {
        uuid: xml::require_tag(&tail, "uuid")?,
        name_label: xml::find_tag(&label_sector, "name_label")?.unwrap_or_default(),
        name_description: xml::find_tag(&label_sector, "name_description")?.unwrap_or_default(),
        is_a_snapshot: xml::parse_bool(&xml::require_tag(&tail, "is_a_snapshot")?),
        snapshot_of: xml::find_tag(&tail, "snapshot_of")?.unwrap_or_default(),
        snapshot_time: xml::find_tag(&tail, "snapshot_time")?.unwrap_or_default(),
        kind: VdiKind::parse(&kind)
            .ok_or_else(|| StorageError::metadata(format!("unknown VDI type {kind:?}")))?,
        vdi_type: VdiType::parse(&vdi_type)
            .ok_or_else(|| StorageError::metadata(format!("unknown vdi_type {vdi_type:?}")))?,
        read_only: xml::parse_bool(&xml::require_tag(&tail, "read_only")?),
        managed: xml::parse_bool(&xml::require_tag(&tail, "managed")?),
        metadata_of_pool: xml::find_tag(&tail, "metadata_of_pool")?.unwrap_or_default(),
        deleted: xml::parse_bool(&xml::find_tag(&tail, "deleted")?.unwrap_or_default()),
    })
}

fn write_sector(image: &mut [u8], sector: u64, content: &[u8]) {
    let offset = (sector * SECTOR_SIZE) as usize;
    image[offset..offset + content.len()].copy_from_slice(content);
}

fn sector_str(image: &[u8], sector: u64) -> String {
    let offset = (sector * SECTOR_SIZE) as usize;
    str_until_nul(&image[offset..offset + SECTOR_SIZE as usize])
}

fn str_until_nul(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// The `[lower, upper)` range that is block-aligned and covers the given
/// byte range; everything the store writes goes through this
#[must_use]
pub fn get_block_aligned_range(block_size: u64, offset: u64, length: u64) -> (u64, u64) {
    aligned_range(block_size, offset, length)
}
