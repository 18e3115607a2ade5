use crate::crypto::keyset::{KeyAreaKeyIndex, KeySet, MissingKeyError};
use crate::crypto::{ctr_counter, AesKey, EncryptedAesKey, PssVerifyError};
use crate::formats::pfs::{PartitionFsHeader, PfsError};
use crate::hexstring::HexData;
use crate::ids::{RightsId, TitleId};
use binrw::{BinRead, BinWrite};
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use std::fmt::Debug;
use std::io::Cursor;

pub const NCA_HEADER_SIZE: usize = 0x400;
pub const ALL_HEADERS_SIZE: usize = 0xc00;
pub const HEADER_SECTOR_SIZE: usize = 0x200;

#[derive(Snafu, Debug)]
pub enum NcaError {
    /// NCA: missing a crypto key
    MissingKey { source: MissingKeyError },
    /// NCA header magic is not NCA3
    InvalidMagic,
    /// Failed to parse the NCA header
    HeaderParsing { source: binrw::Error },
    /// Failed to parse the NCA FS header for section {index}
    FsHeaderParsing { index: usize, source: binrw::Error },
    /// NCA: FS header hash mismatch for section {index}
    FsHeaderHashMismatch { index: usize },
    /// The fixed-key signature over the header body does not verify
    FixedKeySignature { source: PssVerifyError },
    /// NCA requires a title key for rights id {rights_id} but none is available
    MissingTitleKey { rights_id: RightsId },
    /// NCA is truncated: expected at least {expected} bytes, got {actual}
    Truncated { expected: usize, actual: usize },
    /// NCA section {index} uses unsupported crypto for meta extraction
    UnsupportedSectionCrypto { index: usize },
    /// Failed to parse the PFS0 inside the meta NCA
    MetaPfs { source: PfsError },
    /// The meta NCA holds no .cnmt entry
    CnmtNotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum NcaContentType {
    Program,
    Meta,
    Control,
    Manual,
    Data,
    PublicData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum DistributionType {
    Download,
    GameCard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum NcaEncryptionType {
    Auto,
    None,
    Xts,
    AesCtr,
    AesCtrEx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum NcaHashType {
    Auto,
    None,
    Sha256,
    Ivfc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum NcaFormatType {
    Romfs,
    Pfs0,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct NcaSignature(pub HexData<0x100>);

#[derive(Debug, Clone, Copy, Eq, PartialEq, BinRead, BinWrite)]
pub enum NcaMagic {
    #[brw(magic = b"NCA0")]
    Nca0,
    #[brw(magic = b"NCA1")]
    Nca1,
    #[brw(magic = b"NCA2")]
    Nca2,
    #[brw(magic = b"NCA3")]
    Nca3,
}

#[derive(Clone, Copy, Eq, PartialEq, BinRead, BinWrite)]
pub struct SectionTableOffset(u32);

impl From<SectionTableOffset> for u64 {
    fn from(v: SectionTableOffset) -> Self {
        v.0 as u64 * 0x200
    }
}

impl From<u64> for SectionTableOffset {
    fn from(v: u64) -> Self {
        SectionTableOffset((v / 0x200).try_into().unwrap())
    }
}

impl Debug for SectionTableOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0 as u64 * 0x200)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, BinRead, BinWrite)]
pub struct SectionTableEntry {
    pub start: SectionTableOffset,
    pub end: SectionTableOffset,
    #[brw(pad_after = 0x7)]
    #[br(parse_with = crate::brw_utils::read_bool)]
    #[bw(write_with = crate::brw_utils::write_bool)]
    pub is_enabled: bool,
}

impl SectionTableEntry {
    pub fn size(&self) -> u64 {
        (self.end.0 - self.start.0) as u64 * 0x200
    }
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct Sha256Hash(pub HexData<0x20>);

impl Sha256Hash {
    pub fn verify(&self, data: &[u8]) -> Result<(), ()> {
        use digest::Digest;
        let mut hasher = sha2::Sha256::default();
        hasher.update(data);
        let hash = hasher.finalize();
        (hash.as_ref() == self.0 .0).then_some(()).ok_or(())
    }
}

/// The four wrapped key slots. They are only ever rewrapped whole-sale, so
/// the slots stay raw here (slot 2 is the AES-CTR content key).
#[derive(Debug, Clone, Copy, Eq, PartialEq, BinRead, BinWrite)]
pub struct NcaKeyArea {
    pub keys: [HexData<0x10>; 4],
    pub unused: HexData<0xc0>,
}

pub const KEY_AREA_CTR_SLOT: usize = 2;

/// NCA header, corresponding to the first 0x400 bytes of the decrypted NCA
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct NcaHeader {
    pub fixed_key_signature: NcaSignature,
    pub npdm_signature: NcaSignature,
    pub magic: NcaMagic,
    pub distribution_type: DistributionType,
    pub content_type: NcaContentType,
    pub key_generation_old: u8,
    pub key_area_key_index: KeyAreaKeyIndex,
    pub nca_size: u64,
    pub title_id: TitleId,
    pub content_index: u32,
    pub sdk_version: u32,
    pub key_generation_new: u8,
    // selects the fixed-key modulus used for the header signature
    #[brw(pad_after = 0xe)]
    pub signature_key_generation: u8,
    pub rights_id: RightsId,
    pub section_table: [SectionTableEntry; 4],
    pub fs_header_hashes: [Sha256Hash; 4],
    pub key_area: NcaKeyArea,
}

impl NcaHeader {
    /// Both generation bytes historically encode master key 0 as either 0
    /// or 1; everything above is shifted by one.
    pub fn key_generation(&self) -> u8 {
        std::cmp::max(self.key_generation_old, self.key_generation_new).saturating_sub(1)
    }

    pub fn has_rights_id(&self) -> bool {
        !self.rights_id.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct HashLevel {
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct Sha256IntegrityInfo {
    pub master_hash: HexData<0x20>,
    pub block_size: u32,
    pub level_count: u32,
    pub level_info: [HashLevel; 6],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[br(import(hash_type: NcaHashType))]
pub enum IntegrityInfo {
    #[br(pre_assert(matches!(hash_type, NcaHashType::Auto | NcaHashType::None)))]
    None,
    #[br(pre_assert(hash_type == NcaHashType::Sha256))]
    Sha256(Sha256IntegrityInfo),
    #[br(pre_assert(hash_type == NcaHashType::Ivfc))]
    Ivfc(HexData<0xf8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct NcaFsHeader {
    pub version: u16,
    pub format_type: NcaFormatType,
    pub hash_type: NcaHashType,
    pub encryption_type: NcaEncryptionType,

    #[brw(pad_before = 0x3)]
    #[br(args(hash_type))]
    #[brw(pad_size_to = 0xf8)]
    pub integrity_info: IntegrityInfo,

    pub patch_info: HexData<0x40>,

    #[brw(pad_after = 0xb8)]
    pub upper_counter: u64,
}

impl NcaFsHeader {
    /// Byte range of the actual filesystem image within the section (for
    /// Sha256-hashed sections the last level is the data level).
    fn data_region(&self, section_size: u64) -> Option<(u64, u64)> {
        match &self.integrity_info {
            IntegrityInfo::None => Some((0, section_size)),
            IntegrityInfo::Sha256(info) => {
                let levels = info.level_info.get(..info.level_count as usize)?;
                levels.last().map(|l| (l.offset, l.size))
            }
            IntegrityInfo::Ivfc(_) => None,
        }
    }
}

fn try_parse_header(plain: &[u8]) -> Result<NcaHeader, NcaError> {
    assert_eq!(plain.len(), NCA_HEADER_SIZE);
    let mut cur = Cursor::new(plain);

    let res = NcaHeader::read(&mut cur).context(HeaderParsingSnafu)?;
    assert_eq!(cur.position(), NCA_HEADER_SIZE as u64);
    Ok(res)
}

/// Decrypts and parses the 0x400-byte NCA header. Also returns the
/// decrypted bytes, which the fixed-key signature covers.
pub fn decrypt_header(
    keys: &KeySet,
    ciphertext: &[u8; NCA_HEADER_SIZE],
) -> Result<(NcaHeader, [u8; NCA_HEADER_SIZE]), NcaError> {
    let key = keys.header_key().context(MissingKeySnafu)?;

    let mut plain = *ciphertext;
    key.decrypt(&mut plain, 0, HEADER_SECTOR_SIZE);

    ensure!(&plain[0x200..0x204] == b"NCA3", InvalidMagicSnafu);

    let header = try_parse_header(&plain)?;
    Ok((header, plain))
}

/// Inverse of [`decrypt_header`]; invoked iff a header field was rewritten.
pub fn encrypt_header(
    keys: &KeySet,
    header: &NcaHeader,
) -> Result<[u8; NCA_HEADER_SIZE], NcaError> {
    let key = keys.header_key().context(MissingKeySnafu)?;

    let mut buf = Cursor::new(Vec::with_capacity(NCA_HEADER_SIZE));
    header.write(&mut buf).context(HeaderParsingSnafu)?;
    let buf = buf.into_inner();
    assert_eq!(buf.len(), NCA_HEADER_SIZE);

    let mut out = [0; NCA_HEADER_SIZE];
    out.copy_from_slice(&buf);
    key.encrypt(&mut out, 0, HEADER_SECTOR_SIZE);
    Ok(out)
}

/// Checks the fixed-key RSA-PSS signature over the header body
/// (bytes 0x200..0x400 of the decrypted header).
pub fn verify_fixed_key(
    keys: &KeySet,
    header: &NcaHeader,
    plain: &[u8; NCA_HEADER_SIZE],
) -> Result<(), NcaError> {
    let modulus = keys
        .fixed_key_modulus(header.signature_key_generation)
        .context(MissingKeySnafu)?;

    crate::crypto::verify_pss_sha256(&modulus, &plain[0x200..], &header.fixed_key_signature.0 .0)
        .context(FixedKeySignatureSnafu)
}

/// Unwraps the four key-area slots in place using the KEK chain at the
/// header's own generation.
pub fn decrypt_key_area(keys: &KeySet, header: &mut NcaHeader) -> Result<(), NcaError> {
    let kak = keys
        .key_area_key(header.key_generation(), header.key_area_key_index)
        .context(MissingKeySnafu)?;
    for slot in &mut header.key_area.keys {
        *slot = kak.decrypt_key(EncryptedAesKey(*slot)).0;
    }
    Ok(())
}

/// Rewraps the four key-area slots in place under the KEK chain at
/// `generation`, updating the header's generation bytes to match.
pub fn encrypt_key_area(
    keys: &KeySet,
    header: &mut NcaHeader,
    generation: u8,
) -> Result<(), NcaError> {
    let kak = keys
        .key_area_key(generation, header.key_area_key_index)
        .context(MissingKeySnafu)?;
    for slot in &mut header.key_area.keys {
        *slot = kak.encrypt_key(AesKey(*slot)).0;
    }

    let raw_generation = if generation == 0 { 0 } else { generation + 1 };
    header.key_generation_old = std::cmp::min(raw_generation, 2);
    header.key_generation_new = raw_generation;
    Ok(())
}

/// Pulls the `.cnmt` file out of an extracted meta NCA.
///
/// Meta NCAs carry a single PFS0 section, plaintext or AES-CTR encrypted
/// under either the key area or a title key.
pub fn extract_meta_cnmt(
    keys: &KeySet,
    nca: &[u8],
    title_key: Option<AesKey>,
) -> Result<Vec<u8>, NcaError> {
    ensure!(
        nca.len() >= ALL_HEADERS_SIZE,
        TruncatedSnafu {
            expected: ALL_HEADERS_SIZE,
            actual: nca.len()
        }
    );

    let header_bytes: [u8; NCA_HEADER_SIZE] = nca[..NCA_HEADER_SIZE].try_into().unwrap();
    let (header, _) = decrypt_header(keys, &header_bytes)?;

    // NCA3 encrypts the section fs headers with continuing sector numbers
    let header_key = keys.header_key().context(MissingKeySnafu)?;
    let mut fs_headers_data = nca[NCA_HEADER_SIZE..ALL_HEADERS_SIZE].to_vec();
    header_key.decrypt(&mut fs_headers_data, 2, HEADER_SECTOR_SIZE);

    let content_key = if header.has_rights_id() {
        title_key.context(MissingTitleKeySnafu {
            rights_id: header.rights_id,
        })?
    } else {
        let mut header = header;
        decrypt_key_area(keys, &mut header)?;
        AesKey(header.key_area.keys[KEY_AREA_CTR_SLOT])
    };

    for (index, entry) in header.section_table.iter().enumerate() {
        if !entry.is_enabled {
            continue;
        }

        let data = &fs_headers_data[index * HEADER_SECTOR_SIZE..(index + 1) * HEADER_SECTOR_SIZE];
        header.fs_header_hashes[index]
            .verify(data)
            .map_err(|_| NcaError::FsHeaderHashMismatch { index })?;

        let fs_header =
            NcaFsHeader::read(&mut Cursor::new(data)).context(FsHeaderParsingSnafu { index })?;
        if fs_header.format_type != NcaFormatType::Pfs0 {
            continue;
        }

        let section_offset = u64::from(entry.start);
        let section_size = entry.size();
        let section_end = (section_offset + section_size) as usize;
        ensure!(
            nca.len() >= section_end,
            TruncatedSnafu {
                expected: section_end,
                actual: nca.len()
            }
        );

        let mut section = nca[section_offset as usize..section_end].to_vec();
        match fs_header.encryption_type {
            NcaEncryptionType::None => {}
            NcaEncryptionType::AesCtr => {
                let counter =
                    ctr_counter(&fs_header.upper_counter.to_be_bytes(), section_offset);
                content_key.apply_ctr(&mut section, &counter);
            }
            _ => return Err(NcaError::UnsupportedSectionCrypto { index }),
        }

        let (pfs_offset, pfs_size) = fs_header
            .data_region(section_size)
            .ok_or(NcaError::UnsupportedSectionCrypto { index })?;
        let pfs_bytes = section
            .get(pfs_offset as usize..(pfs_offset + pfs_size) as usize)
            .context(TruncatedSnafu {
                expected: (pfs_offset + pfs_size) as usize,
                actual: section.len(),
            })?;

        let pfs = PartitionFsHeader::read(&mut Cursor::new(pfs_bytes))
            .map_err(|source| PfsError::Parsing { source })
            .context(MetaPfsSnafu)?;
        let data_offset = pfs.header_size();

        for file in pfs.entries().context(MetaPfsSnafu)? {
            if !file.name.ends_with(".cnmt") {
                continue;
            }
            let start = (data_offset + file.offset) as usize;
            let end = start + file.size as usize;
            let bytes = pfs_bytes.get(start..end).context(TruncatedSnafu {
                expected: end,
                actual: pfs_bytes.len(),
            })?;
            return Ok(bytes.to_vec());
        }
    }

    Err(NcaError::CnmtNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keys() -> KeySet {
        KeySet::from_file_contents(
            "\
header_key = b62cee4c3d2b1a9a23e2c98ab45ad36f45ad36fb62cee4c3d2b1a9a23e2c98ab
key_area_key_application_00 = 202122232425262728292a2b2c2d2e2f
key_area_key_application_03 = 303132333435363738393a3b3c3d3e3f
",
        )
        .unwrap()
    }

    pub(crate) fn blank_header() -> NcaHeader {
        NcaHeader {
            fixed_key_signature: NcaSignature(HexData([0; 0x100])),
            npdm_signature: NcaSignature(HexData([0; 0x100])),
            magic: NcaMagic::Nca3,
            distribution_type: DistributionType::Download,
            content_type: NcaContentType::Program,
            key_generation_old: 2,
            key_area_key_index: KeyAreaKeyIndex::Application,
            nca_size: 0x200000,
            title_id: TitleId(0x0100_0000_0000_a000),
            content_index: 0,
            sdk_version: 0,
            key_generation_new: 4,
            signature_key_generation: 0,
            rights_id: RightsId::default(),
            section_table: [SectionTableEntry {
                start: SectionTableOffset(0),
                end: SectionTableOffset(0),
                is_enabled: false,
            }; 4],
            fs_header_hashes: [Sha256Hash(HexData([0; 0x20])); 4],
            key_area: NcaKeyArea {
                keys: [HexData([0; 0x10]); 4],
                unused: HexData([0; 0xc0]),
            },
        }
    }

    #[test]
    fn key_generation_takes_the_biased_max() {
        let mut header = blank_header();
        assert_eq!(header.key_generation(), 3);

        header.key_generation_new = 0;
        header.key_generation_old = 0;
        assert_eq!(header.key_generation(), 0);

        header.key_generation_old = 1;
        assert_eq!(header.key_generation(), 0);
    }

    #[test]
    fn header_encrypt_decrypt_round_trip() {
        let keys = test_keys();
        let mut header = blank_header();
        header.distribution_type = DistributionType::GameCard;

        let ciphertext = encrypt_header(&keys, &header).unwrap();
        let (decrypted, plain) = decrypt_header(&keys, &ciphertext).unwrap();
        assert_eq!(decrypted, header);
        assert_eq!(&plain[0x200..0x204], b"NCA3");
    }

    #[test]
    fn garbage_header_is_invalid_magic() {
        let keys = test_keys();
        let result = decrypt_header(&keys, &[0x5a; NCA_HEADER_SIZE]);
        assert!(matches!(result, Err(NcaError::InvalidMagic)));
    }

    #[test]
    fn key_area_rewrap_round_trip() {
        let keys = test_keys();
        let mut header = blank_header();
        header.key_area.keys[KEY_AREA_CTR_SLOT] = HexData([0x42; 0x10]);
        let original = header.key_area.keys;

        // wrap at generation 3, unwrap at the same generation
        encrypt_key_area(&keys, &mut header, 3).unwrap();
        assert_eq!(header.key_generation_new, 4);
        assert_ne!(header.key_area.keys, original);
        decrypt_key_area(&keys, &mut header).unwrap();
        assert_eq!(header.key_area.keys, original);
    }
}
