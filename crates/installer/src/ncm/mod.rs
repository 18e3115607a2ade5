use crate::hexstring::HexData;
use crate::ids::{ContentId, PlaceholderId, TitleId};
use crate::version::Version;
use binrw::{BinRead, BinReaderExt, BinWrite};
use bitflags::bitflags;
use snafu::Snafu;
use std::io::Cursor;
use std::path::PathBuf;

mod fs_store;
mod mem;

pub use fs_store::{FsContentStorage, FsMetaDb, FsTicketStore};
pub use mem::{MemApplicationRecords, MemTicketStore};

/// The two storages a title can be installed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum StorageId {
    BuiltInUser = 4,
    SdCard = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum ContentType {
    Meta = 0,
    Program = 1,
    Data = 2,
    Control = 3,
    HtmlDocument = 4,
    LegalInformation = 5,
    DeltaFragment = 6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum ContentMetaType {
    Unknown = 0,
    SystemProgram = 1,
    SystemData = 2,
    SystemUpdate = 3,
    BootImagePackage = 4,
    BootImagePackageSafe = 5,
    Application = 0x80,
    Patch = 0x81,
    AddOnContent = 0x82,
    Delta = 0x83,
    DataPatch = 0x84,
}

impl ContentMetaType {
    /// Only meta types with the top bit set can be installed by a user.
    pub fn is_installable(self) -> bool {
        (self as u8) & 0x80 != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum InstallType {
    Full = 0,
    FragmentOnly = 1,
}

/// Key a meta record is stored under in the meta database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, BinRead, BinWrite)]
#[brw(little)]
pub struct ContentMetaKey {
    pub id: TitleId,
    pub version: Version,
    pub ty: ContentMetaType,
    #[brw(pad_after = 2)]
    pub install_type: InstallType,
}

impl ContentMetaKey {
    pub fn application_id(&self) -> TitleId {
        self.id.application_id(self.ty)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ContentMetaAttributes: u8 {
        const INCLUDES_EXFAT_DRIVER = 0x01;
        const REBOOTLESS = 0x02;
        const COMPACTED = 0x04;
    }
}

/// The fixed 0x20-byte header a packaged content meta starts with; meta DB
/// blobs reuse the same shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct ContentMetaHeader {
    pub title_id: TitleId,
    pub version: Version,
    pub ty: ContentMetaType,
    pub field_d: u8,
    pub extended_header_size: u16,
    pub content_count: u16,
    pub content_meta_count: u16,
    pub attributes: u8,
    pub storage_id: u8,
    pub install_type: u8,
    #[brw(pad_before = 1)]
    pub required_download_system_version: u32,
    pub field_1c: u32,
}

impl ContentMetaHeader {
    pub fn attributes(&self) -> ContentMetaAttributes {
        ContentMetaAttributes::from_bits_truncate(self.attributes)
    }
}

pub const META_HEADER_SIZE: usize = 0x20;
pub const CONTENT_INFO_SIZE: usize = 0x38;

/// One content referenced by a meta record: its declared hash, id, 48-bit
/// size, type and id offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct ContentInfo {
    pub hash: HexData<0x20>,
    pub content_id: ContentId,
    #[br(parse_with = crate::brw_utils::read_u48)]
    #[bw(write_with = crate::brw_utils::write_u48)]
    pub size: u64,
    pub ty: ContentType,
    pub id_offset: u8,
}

/// A launcher-visible registration of one meta record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct ContentStorageRecord {
    pub key: ContentMetaKey,
    #[brw(pad_after = 7)]
    pub storage_id: StorageId,
}

#[derive(Snafu, Debug)]
pub enum StoreError {
    /// I/O error in the content store
    Io { source: std::io::Error },
    /// Placeholder {placeholder_id} does not exist
    PlaceholderNotFound { placeholder_id: PlaceholderId },
    /// Content {content_id} does not exist
    ContentNotFound { content_id: ContentId },
    /// Meta record for {key:?} does not exist
    MetaNotFound { key: ContentMetaKey },
}

#[derive(Snafu, Debug)]
pub enum MetaBlobError {
    /// Meta record blob is shorter than its fixed header
    TruncatedHeader,
    /// Meta record blob header does not parse
    HeaderParsing { source: binrw::Error },
    /// Meta record blob does not hold the {expected} content infos it declares
    TruncatedInfos { expected: usize },
    /// Meta record content info does not parse
    InfoParsing { source: binrw::Error },
}

/// Parses the fixed header out of a meta DB blob.
pub fn parse_meta_header(blob: &[u8]) -> Result<ContentMetaHeader, MetaBlobError> {
    if blob.len() < META_HEADER_SIZE {
        return Err(MetaBlobError::TruncatedHeader);
    }
    Cursor::new(&blob[..META_HEADER_SIZE])
        .read_le()
        .map_err(|source| MetaBlobError::HeaderParsing { source })
}

/// Parses the content info array out of a meta DB blob (everything after
/// the fixed header and the extended header).
pub fn parse_content_infos(blob: &[u8]) -> Result<Vec<ContentInfo>, MetaBlobError> {
    let header = parse_meta_header(blob)?;
    let infos_offset = META_HEADER_SIZE + header.extended_header_size as usize;
    let expected = header.content_count as usize;

    let infos_len = expected * CONTENT_INFO_SIZE;
    let data = blob
        .get(infos_offset..infos_offset + infos_len)
        .ok_or(MetaBlobError::TruncatedInfos { expected })?;

    let mut cursor = Cursor::new(data);
    (0..expected)
        .map(|_| {
            cursor
                .read_le()
                .map_err(|source| MetaBlobError::InfoParsing { source })
        })
        .collect()
}

/// The content store the installer writes into (libnx: `NcmContentStorage`).
pub trait ContentStorage: Send + Sync {
    fn generate_placeholder_id(&self) -> Result<PlaceholderId, StoreError>;
    fn create_placeholder(
        &self,
        content_id: ContentId,
        placeholder_id: PlaceholderId,
        size: u64,
    ) -> Result<(), StoreError>;
    fn set_placeholder_size(
        &self,
        placeholder_id: PlaceholderId,
        size: u64,
    ) -> Result<(), StoreError>;
    fn write_placeholder(
        &self,
        placeholder_id: PlaceholderId,
        offset: u64,
        buf: &[u8],
    ) -> Result<(), StoreError>;
    fn flush_placeholder(&self) -> Result<(), StoreError>;
    fn get_placeholder_path(&self, placeholder_id: PlaceholderId) -> Result<PathBuf, StoreError>;
    fn delete_placeholder(&self, placeholder_id: PlaceholderId) -> Result<(), StoreError>;
    /// Promotes a placeholder to a permanent content id.
    fn register(&self, content_id: ContentId, placeholder_id: PlaceholderId)
        -> Result<(), StoreError>;
    fn has(&self, content_id: ContentId) -> Result<bool, StoreError>;
    fn read_content(
        &self,
        content_id: ContentId,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, StoreError>;
    fn get_content_path(&self, content_id: ContentId) -> Result<PathBuf, StoreError>;
    fn delete(&self, content_id: ContentId) -> Result<(), StoreError>;
}

/// The meta database records point at installed contents (libnx
/// `NcmContentMetaDatabase`). Mutations become visible on `commit`.
pub trait ContentMetaDb: Send + Sync {
    /// Lists committed keys, filtered by meta type (`None` matches any),
    /// application id, title id range (inclusive) and install type.
    fn list(
        &self,
        ty: Option<ContentMetaType>,
        application_id: TitleId,
        id_range: (TitleId, TitleId),
        install_type: InstallType,
    ) -> Result<Vec<ContentMetaKey>, StoreError>;
    fn get(&self, key: ContentMetaKey) -> Result<Vec<u8>, StoreError>;
    fn has(&self, key: ContentMetaKey) -> Result<bool, StoreError>;
    fn set(&self, key: ContentMetaKey, blob: &[u8]) -> Result<(), StoreError>;
    fn remove(&self, key: ContentMetaKey) -> Result<(), StoreError>;
    fn commit(&self) -> Result<(), StoreError>;
}

/// System ticket store (libnx `es`).
pub trait TicketStore: Send + Sync {
    fn import_ticket(&self, ticket: &[u8], cert: &[u8]) -> Result<(), StoreError>;
}

/// Launcher application records (libnx `ns` + `avm`).
pub trait ApplicationRecords: Send + Sync {
    fn push_record(
        &self,
        application_id: TitleId,
        records: &[ContentStorageRecord],
    ) -> Result<(), StoreError>;
    fn push_launch_version(
        &self,
        application_id: TitleId,
        version: Version,
    ) -> Result<(), StoreError>;
    /// Host OS version; launch versions are only pushed on 6.0.0+.
    fn system_version(&self) -> (u32, u32, u32);
}
