use crate::formats::pfs::{
    HashedFsHeader, PartitionEntry, PartitionFsHeader, PartitionFsMeta, PartitionKind, PfsError,
    COMMON_HEADER_SIZE,
};
use crate::hexstring::HexData;
use crate::source::{ByteSource, ByteSourceExt, SourceError};
use binrw::BinRead;
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use std::io::Cursor;
use std::path::Path;
use tracing::debug;

/// One file of the outer package; `offset` is absolute within the byte
/// source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionEntry {
    pub name: String,
    pub offset: u64,
    pub size: u64,
}

pub type Collections = Vec<CollectionEntry>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Nsp,
    Xci,
}

impl ContainerKind {
    /// Picks the container layout from a file extension.
    pub fn from_path(path: &Path) -> Option<ContainerKind> {
        let ext = path.extension()?.to_str()?;
        if ext.eq_ignore_ascii_case("nsp") || ext.eq_ignore_ascii_case("nsz") {
            Some(ContainerKind::Nsp)
        } else if ext.eq_ignore_ascii_case("xci") || ext.eq_ignore_ascii_case("xcz") {
            Some(ContainerKind::Xci)
        } else {
            None
        }
    }
}

#[derive(Snafu, Debug)]
pub enum ContainerError {
    /// Failed to read the container
    Source { source: SourceError },
    /// Not a {expected} partition
    PartitionMagic { expected: &'static str },
    /// Partition header declares an implausible size of {size} bytes
    HeaderTooLarge { size: u64 },
    /// Failed to parse the partition
    Partition { source: PfsError },
    /// Failed to parse the XCI card header
    CardHeaderParsing { source: binrw::Error },
    /// XCI has no secure partition
    SecurePartitionNotFound,
}

const CARD_HEADER_OFFSET: u64 = 0x1100;
const PARTITION_HEADER_MAX: u64 = 0x100_0000;

#[derive(Debug, Clone, BinRead)]
#[br(little, magic = b"HEAD")]
struct CardHeader {
    _rom_area_start_page: u32,
    _backup_area_start_page: u32,
    _key_index: u8,
    _rom_size: u8,
    _version: u8,
    _flags: u8,
    _package_id: u64,
    _valid_data_end: u32,
    #[br(pad_before = 4)]
    _iv: HexData<0x10>,
    root_partition_offset: u64,
    _root_partition_header_size: u64,
    _root_partition_header_hash: HexData<0x20>,
}

fn read_vec(source: &dyn ByteSource, offset: u64, len: usize) -> Result<Vec<u8>, ContainerError> {
    let mut buf = vec![0; len];
    source.read_exact_at(offset, &mut buf).context(SourceSnafu)?;
    Ok(buf)
}

/// Parses the partition header at `base`, returning the resolved entries
/// and the absolute offset of the data region.
fn read_partition(
    source: &dyn ByteSource,
    base: u64,
    kind: PartitionKind,
) -> Result<(Vec<PartitionEntry>, u64), ContainerError> {
    let meta_bytes = read_vec(source, base, COMMON_HEADER_SIZE)?;
    let meta = PartitionFsMeta::read(&mut Cursor::new(&meta_bytes))
        .map_err(|source| PfsError::Parsing { source })
        .context(PartitionSnafu)?;

    let expected = match kind {
        PartitionKind::Pfs0 => "PFS0",
        PartitionKind::Hfs0 => "HFS0",
    };
    ensure!(meta.matches(kind), PartitionMagicSnafu { expected });

    let header_size = meta.header_size(kind);
    ensure!(
        header_size <= PARTITION_HEADER_MAX,
        HeaderTooLargeSnafu { size: header_size }
    );

    let header_bytes = read_vec(source, base, header_size as usize)?;
    let mut cursor = Cursor::new(&header_bytes);
    let entries = match kind {
        PartitionKind::Pfs0 => PartitionFsHeader::read(&mut cursor)
            .map_err(|source| PfsError::Parsing { source })
            .context(PartitionSnafu)?
            .entries(),
        PartitionKind::Hfs0 => HashedFsHeader::read(&mut cursor)
            .map_err(|source| PfsError::Parsing { source })
            .context(PartitionSnafu)?
            .entries(),
    }
    .context(PartitionSnafu)?;

    Ok((entries, base + header_size))
}

fn to_collection(entries: Vec<PartitionEntry>, data_base: u64) -> Collections {
    entries
        .into_iter()
        .map(|e| CollectionEntry {
            name: e.name,
            offset: data_base + e.offset,
            size: e.size,
        })
        .collect()
}

/// Builds the collection for a container: the ordered list of named byte
/// ranges the installer walks.
pub fn collections(
    kind: ContainerKind,
    source: &dyn ByteSource,
) -> Result<Collections, ContainerError> {
    match kind {
        ContainerKind::Nsp => {
            let (entries, data_base) = read_partition(source, 0, PartitionKind::Pfs0)?;
            debug!("NSP: {} entries", entries.len());
            Ok(to_collection(entries, data_base))
        }
        ContainerKind::Xci => {
            let header_bytes = read_vec(source, CARD_HEADER_OFFSET, 0x160)?;
            let card = CardHeader::read(&mut Cursor::new(&header_bytes))
                .context(CardHeaderParsingSnafu)?;

            let (root_entries, root_data) =
                read_partition(source, card.root_partition_offset, PartitionKind::Hfs0)?;
            let secure = root_entries
                .iter()
                .find(|e| e.name == "secure")
                .context(SecurePartitionNotFoundSnafu)?;
            debug!("XCI: secure partition at {:#x}", root_data + secure.offset);

            let (entries, data_base) =
                read_partition(source, root_data + secure.offset, PartitionKind::Hfs0)?;
            Ok(to_collection(entries, data_base))
        }
    }
}
