use crate::hexstring::HexData;
use binrw::{BinRead, BinWrite};
use snafu::Snafu;

// HFS0 is __just__ like PFS0, except its entries carry a hash over the
// leading bytes of the file, so the two share the entry-resolution code.

#[derive(Snafu, Debug)]
pub enum PfsError {
    /// Failed to parse the partition header
    Parsing { source: binrw::Error },
    /// Partition name at string table offset {offset} is not NUL-terminated
    StringTable { offset: u32 },
}

pub const COMMON_HEADER_SIZE: usize = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    Pfs0,
    Hfs0,
}

impl PartitionKind {
    pub fn entry_size(self) -> u64 {
        match self {
            PartitionKind::Pfs0 => 0x18,
            PartitionKind::Hfs0 => 0x40,
        }
    }
}

/// The shared leading 0x10 bytes of both partition headers.
#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct PartitionFsMeta {
    pub magic: [u8; 4],
    pub num_files: u32,
    #[brw(pad_after = 4)] // some reserved field
    pub string_table_size: u32,
}

impl PartitionFsMeta {
    pub fn matches(&self, kind: PartitionKind) -> bool {
        match kind {
            PartitionKind::Pfs0 => &self.magic == b"PFS0",
            PartitionKind::Hfs0 => &self.magic == b"HFS0",
        }
    }

    /// Full header size including entry and string tables.
    pub fn header_size(&self, kind: PartitionKind) -> u64 {
        COMMON_HEADER_SIZE as u64
            + self.num_files as u64 * kind.entry_size()
            + self.string_table_size as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
pub struct PartitionFsEntry {
    pub offset: u64,
    pub size: u64,
    #[brw(pad_after = 4)] // some reserved field
    pub string_table_offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little, magic = b"PFS0")]
pub struct PartitionFsHeader {
    pub num_files: u32,
    pub string_table_size: u32,

    #[brw(pad_before = 4)] // some reserved field
    #[br(count = num_files)]
    pub file_entries: Vec<PartitionFsEntry>,

    #[br(count = string_table_size)]
    pub string_table: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
pub struct HashedFsEntry {
    pub offset: u64,
    pub size: u64,
    pub string_table_offset: u32,
    #[brw(pad_after = 8)] // two reserved fields
    pub hashed_region_size: u32,
    pub hash: HexData<0x20>,
}

#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little, magic = b"HFS0")]
pub struct HashedFsHeader {
    pub num_files: u32,
    pub string_table_size: u32,

    #[brw(pad_before = 4)] // some reserved field
    #[br(count = num_files)]
    pub file_entries: Vec<HashedFsEntry>,

    #[br(count = string_table_size)]
    pub string_table: Vec<u8>,
}

/// A resolved partition file: `offset` is relative to the partition's data
/// region (right after the header).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    pub name: String,
    pub offset: u64,
    pub size: u64,
}

pub fn get_string(string_table: &[u8], offset: u32) -> Result<String, PfsError> {
    let start = offset as usize;
    let end = string_table
        .get(start..)
        .and_then(|tail| tail.iter().position(|&c| c == 0))
        .ok_or(PfsError::StringTable { offset })?;

    std::str::from_utf8(&string_table[start..start + end])
        .map(str::to_string)
        .map_err(|_| PfsError::StringTable { offset })
}

impl PartitionFsHeader {
    /// Size of the header itself; the data region starts right after.
    pub fn header_size(&self) -> u64 {
        COMMON_HEADER_SIZE as u64
            + self.file_entries.len() as u64 * PartitionKind::Pfs0.entry_size()
            + self.string_table.len() as u64
    }

    pub fn entries(&self) -> Result<Vec<PartitionEntry>, PfsError> {
        self.file_entries
            .iter()
            .map(|e| {
                Ok(PartitionEntry {
                    name: get_string(&self.string_table, e.string_table_offset)?,
                    offset: e.offset,
                    size: e.size,
                })
            })
            .collect()
    }
}

impl HashedFsHeader {
    /// Size of the header itself; the data region starts right after.
    pub fn header_size(&self) -> u64 {
        COMMON_HEADER_SIZE as u64
            + self.file_entries.len() as u64 * PartitionKind::Hfs0.entry_size()
            + self.string_table.len() as u64
    }

    pub fn entries(&self) -> Result<Vec<PartitionEntry>, PfsError> {
        self.file_entries
            .iter()
            .map(|e| {
                Ok(PartitionEntry {
                    name: get_string(&self.string_table, e.string_table_offset)?,
                    offset: e.offset,
                    size: e.size,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binrw::BinReaderExt;
    use std::io::Cursor;

    fn sample_pfs0() -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(b"PFS0");
        data.extend_from_slice(&2u32.to_le_bytes());
        data.extend_from_slice(&12u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        // entry "a.nca" at 0, size 4
        data.extend_from_slice(&0u64.to_le_bytes());
        data.extend_from_slice(&4u64.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        // entry "b.tik" at 4, size 2
        data.extend_from_slice(&4u64.to_le_bytes());
        data.extend_from_slice(&2u64.to_le_bytes());
        data.extend_from_slice(&6u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(b"a.nca\0b.tik\0");
        data
    }

    #[test]
    fn parses_entries_and_names() {
        let header: PartitionFsHeader = Cursor::new(sample_pfs0()).read_le().unwrap();
        assert_eq!(header.header_size(), 0x10 + 2 * 0x18 + 12);

        let entries = header.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.nca");
        assert_eq!(entries[1].name, "b.tik");
        assert_eq!(entries[1].offset, 4);
    }

    #[test]
    fn rejects_wrong_magic() {
        let mut data = sample_pfs0();
        data[..4].copy_from_slice(b"HFS0");
        let result: Result<PartitionFsHeader, _> = Cursor::new(data).read_le();
        assert!(result.is_err());
    }

    #[test]
    fn rejects_unterminated_name() {
        let mut data = sample_pfs0();
        let len = data.len();
        data[len - 1] = b'x'; // clobber the trailing NUL
        let header: PartitionFsHeader = Cursor::new(data).read_le().unwrap();
        assert!(matches!(
            header.entries(),
            Err(PfsError::StringTable { offset: 6 })
        ));
    }
}
