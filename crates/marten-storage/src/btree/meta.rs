//! Index header page (page 1 of an index file).

use marten_common::page::{PageNo, PAGE_SIZE};
use marten_common::types::AttrType;
use marten_common::{MartenError, Result};

/// Metadata stored in the index header page.
///
/// Layout (32 bytes, then zero padding to the page size):
/// `[relation_name: 20][attr_byte_offset: 4][attr_type: 4][root_page_no: 4]`,
/// with the relation name NUL-terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMeta {
    /// Name of the indexed base relation (at most 19 bytes + NUL).
    pub relation_name: String,
    /// Byte offset of the indexed attribute inside a base-relation record.
    pub attr_byte_offset: u32,
    /// Type of the indexed attribute.
    pub attr_type: AttrType,
    /// Current root page; updated when the root splits.
    pub root_page_no: PageNo,
}

impl IndexMeta {
    /// Maximum stored relation-name length, including the NUL terminator.
    pub const RELATION_NAME_LEN: usize = 20;

    /// Offset of the `root_page_no` field within the header page.
    pub const ROOT_PAGE_NO_OFF: usize = 28;

    /// Writes the header into the page bytes.
    pub fn write_to(&self, data: &mut [u8; PAGE_SIZE]) {
        let mut name = [0u8; Self::RELATION_NAME_LEN];
        let n = self.relation_name.len().min(Self::RELATION_NAME_LEN - 1);
        name[..n].copy_from_slice(&self.relation_name.as_bytes()[..n]);

        data[0..20].copy_from_slice(&name);
        data[20..24].copy_from_slice(&self.attr_byte_offset.to_le_bytes());
        data[24..28].copy_from_slice(&(self.attr_type as u32).to_le_bytes());
        data[28..32].copy_from_slice(&self.root_page_no.to_le_bytes());
    }

    /// Reads the header from the page bytes.
    pub fn read_from(data: &[u8; PAGE_SIZE]) -> Result<Self> {
        let name_end = data[0..Self::RELATION_NAME_LEN]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(Self::RELATION_NAME_LEN);
        let relation_name = std::str::from_utf8(&data[0..name_end])
            .map_err(|_| MartenError::BadFileHeader("relation name is not UTF-8".to_string()))?
            .to_string();

        let attr_byte_offset = u32::from_le_bytes([data[20], data[21], data[22], data[23]]);
        let raw_type = u32::from_le_bytes([data[24], data[25], data[26], data[27]]);
        let attr_type = AttrType::from_u32(raw_type).ok_or_else(|| {
            MartenError::BadFileHeader(format!("unknown attribute type {}", raw_type))
        })?;
        let root_page_no = u32::from_le_bytes([data[28], data[29], data[30], data[31]]);

        Ok(Self {
            relation_name,
            attr_byte_offset,
            attr_type,
            root_page_no,
        })
    }
}
