use crate::hexstring::HexData;
use binrw::{BinRead, BinWrite};
use snafu::Snafu;

pub const SECTION_MAGIC: &[u8; 8] = b"NCZSECTN";
pub const BLOCK_MAGIC: &[u8; 8] = b"NCZBLOCK";

/// NCA offset the NCZ section table sits at (right after the fixed NCA
/// header area).
pub const SECTION_TABLE_OFFSET: u64 = 0x4000;

pub const SECTION_HEADER_SIZE: usize = 0x10;
pub const SECTION_SIZE: usize = 0x40;
pub const BLOCK_HEADER_SIZE: usize = 0x18;

const BLOCK_EXPONENT_MIN: u8 = 14;
const BLOCK_EXPONENT_MAX: u8 = 32;

#[derive(Snafu, Debug)]
pub enum NczError {
    /// Failed to parse the NCZ tables
    Parsing { source: binrw::Error },
    /// Unsupported NCZ block table version {version}
    InvalidBlockVersion { version: u8 },
    /// Invalid NCZ block size exponent: {exponent}, must be between {BLOCK_EXPONENT_MIN} and {BLOCK_EXPONENT_MAX}
    InvalidBlockSizeExponent { exponent: u8 },
}

#[derive(Debug, Clone, BinRead, BinWrite)]
#[brw(little, magic = b"NCZSECTN")]
pub struct SectionTableHeader {
    pub section_count: u64,
}

/// Describes one byte range of the reassembled NCA and the AES-CTR
/// parameters needed to re-encrypt it.
#[derive(Debug, Clone, BinRead, BinWrite)]
#[brw(little)]
pub struct NczSection {
    pub offset: u64,
    pub size: u64,
    #[brw(pad_after = 0x8)]
    pub crypto_type: u64,

    pub crypto_key: HexData<0x10>,
    pub crypto_counter: HexData<0x10>,
}

impl NczSection {
    pub fn in_range(&self, offset: i64) -> bool {
        let offset = offset as u64;
        offset >= self.offset && offset < self.offset + self.size
    }

    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// Section crypto at or above AES-CTR needs re-encryption; below it the
    /// plaintext is stored as-is.
    pub fn is_encrypted(&self) -> bool {
        const ENCRYPTION_TYPE_AES_CTR: u64 = 3;
        self.crypto_type >= ENCRYPTION_TYPE_AES_CTR
    }
}

#[derive(Debug, Clone, Default, BinRead, BinWrite)]
#[brw(little, magic = b"NCZBLOCK")]
pub struct NczBlockHeader {
    pub version: u8,
    pub ty: u8,
    #[brw(pad_before = 0x1)] // unused field
    pub block_size_exponent: u8,
    pub number_of_blocks: u32,
    pub total_decompressed_size: u64,
}

impl NczBlockHeader {
    pub fn validate(&self) -> Result<(), NczError> {
        if self.version != 0x2 {
            return Err(NczError::InvalidBlockVersion {
                version: self.version,
            });
        }
        if self.block_size_exponent < BLOCK_EXPONENT_MIN
            || self.block_size_exponent > BLOCK_EXPONENT_MAX
        {
            return Err(NczError::InvalidBlockSizeExponent {
                exponent: self.block_size_exponent,
            });
        }
        Ok(())
    }
}

/// One compressed block located within the source container. Offsets are in
/// source-byte space, in reading order.
#[derive(Debug, Clone, Copy)]
pub struct NczBlockInfo {
    pub offset: i64,
    pub size: i64,
}

impl NczBlockInfo {
    pub fn in_range(&self, offset: i64) -> bool {
        offset >= self.offset && offset < self.offset + self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binrw::BinReaderExt;
    use std::io::Cursor;

    #[test]
    fn section_layout_is_0x40_bytes() {
        let mut data = Vec::new();
        data.extend_from_slice(&0xc00u64.to_le_bytes());
        data.extend_from_slice(&0x1000u64.to_le_bytes());
        data.extend_from_slice(&3u64.to_le_bytes());
        data.extend_from_slice(&0u64.to_le_bytes());
        data.extend_from_slice(&[0xaa; 0x10]);
        data.extend_from_slice(&[0xbb; 0x10]);
        assert_eq!(data.len(), SECTION_SIZE);

        let section: NczSection = Cursor::new(data).read_le().unwrap();
        assert_eq!(section.offset, 0xc00);
        assert!(section.is_encrypted());
        assert!(section.in_range(0xc00));
        assert!(section.in_range(0x1bff));
        assert!(!section.in_range(0x1c00));
    }

    #[test]
    fn block_header_validation() {
        let header = NczBlockHeader {
            version: 2,
            ty: 1,
            block_size_exponent: 20,
            number_of_blocks: 4,
            total_decompressed_size: 0x200000,
        };
        header.validate().unwrap();

        assert!(matches!(
            NczBlockHeader {
                version: 1,
                ..header.clone()
            }
            .validate(),
            Err(NczError::InvalidBlockVersion { version: 1 })
        ));
        assert!(matches!(
            NczBlockHeader {
                block_size_exponent: 12,
                ..header
            }
            .validate(),
            Err(NczError::InvalidBlockSizeExponent { exponent: 12 })
        ));
    }
}
