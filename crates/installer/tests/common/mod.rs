//! Fixture builders: synthetic NCAs, NCZs, content metas and NSP
//! containers, plus a directory-backed service environment.

use nx_install::crypto::keyset::{KeyAreaKeyIndex, KeySet};
use nx_install::crypto::{ctr_counter, AesKey};
use nx_install::formats::nca::{
    self, DistributionType, IntegrityInfo, NcaContentType, NcaEncryptionType, NcaFormatType,
    NcaFsHeader, NcaHashType, NcaHeader, NcaKeyArea, NcaMagic, NcaSignature, Sha256Hash,
    Sha256IntegrityInfo, SectionTableEntry,
};
use nx_install::formats::ticket::{LicenseType, Signature, Ticket, TitleKeyType};
use nx_install::ids::{ContentId, RightsId, TitleId};
use nx_install::install::Services;
use nx_install::ncm::{
    ContentInfo, ContentMetaHeader, ContentMetaType, ContentType, FsContentStorage, FsMetaDb,
    MemApplicationRecords, MemTicketStore,
};
use nx_install::version::Version;
use nx_install::HexData;
use binrw::{BinWrite, BinWriterExt, NullString};
use sha2::{Digest, Sha256};
use std::io::Cursor;
use std::path::PathBuf;

pub const TEST_KEYS: &str = "\
header_key = b62cee4c3d2b1a9a23e2c98ab45ad36f45ad36fb62cee4c3d2b1a9a23e2c98ab
titlekek_00 = 000102030405060708090a0b0c0d0e0f
titlekek_03 = 101112131415161718191a1b1c1d1e1f
key_area_key_application_00 = 202122232425262728292a2b2c2d2e2f
key_area_key_application_03 = 303132333435363738393a3b3c3d3e3f
";

pub fn test_keys() -> KeySet {
    KeySet::from_file_contents(TEST_KEYS).unwrap()
}

pub fn tempdir(tag: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!("nx-install-test-{}-{tag}", std::process::id()));
    if root.exists() {
        std::fs::remove_dir_all(&root).unwrap();
    }
    std::fs::create_dir_all(&root).unwrap();
    root
}

/// A full service environment rooted in a per-test temp directory.
pub struct TestEnv {
    pub root: PathBuf,
    pub user_cs: FsContentStorage,
    pub sd_cs: FsContentStorage,
    pub user_db: FsMetaDb,
    pub sd_db: FsMetaDb,
    pub tickets: MemTicketStore,
    pub records: MemApplicationRecords,
}

impl TestEnv {
    pub fn new(tag: &str) -> Self {
        let root = tempdir(tag);
        Self {
            user_cs: FsContentStorage::open(root.join("user")).unwrap(),
            sd_cs: FsContentStorage::open(root.join("sd")).unwrap(),
            user_db: FsMetaDb::open(root.join("user-db")).unwrap(),
            sd_db: FsMetaDb::open(root.join("sd-db")).unwrap(),
            tickets: MemTicketStore::new(),
            records: MemApplicationRecords::new(),
            root,
        }
    }

    pub fn services(&self) -> Services<'_> {
        Services {
            content_storages: [&self.user_cs, &self.sd_cs],
            meta_dbs: [&self.user_db, &self.sd_db],
            ticket_store: &self.tickets,
            application_records: &self.records,
        }
    }

    pub fn placeholder_count(&self) -> usize {
        ["user", "sd"]
            .iter()
            .map(|store| {
                std::fs::read_dir(self.root.join(store).join("placeholder"))
                    .map(|dir| dir.count())
                    .unwrap_or(0)
            })
            .sum()
    }

    pub fn registered_bytes(&self, content_id: ContentId) -> Vec<u8> {
        std::fs::read(
            self.root
                .join("user")
                .join("registered")
                .join(format!("{content_id}.nca")),
        )
        .unwrap()
    }
}

/// Compressible deterministic filler.
pub fn fill_pattern(buf: &mut [u8], seed: u8) {
    for (i, b) in buf.iter_mut().enumerate() {
        *b = seed ^ ((i / 64) as u8);
    }
}

pub fn content_id_of(bytes: &[u8]) -> ContentId {
    let hash: [u8; 0x20] = Sha256::digest(bytes).into();
    ContentId::from_hash(&hash)
}

pub fn build_pfs0(files: &[(String, Vec<u8>)]) -> Vec<u8> {
    let mut string_table = Vec::new();
    let mut entries = Vec::new();
    let mut data = Vec::new();
    for (name, content) in files {
        entries.push((
            data.len() as u64,
            content.len() as u64,
            string_table.len() as u32,
        ));
        string_table.extend_from_slice(name.as_bytes());
        string_table.push(0);
        data.extend_from_slice(content);
    }

    let mut out = Vec::new();
    out.extend_from_slice(b"PFS0");
    out.extend_from_slice(&(files.len() as u32).to_le_bytes());
    out.extend_from_slice(&(string_table.len() as u32).to_le_bytes());
    out.extend_from_slice(&[0; 4]);
    for (offset, size, name_offset) in entries {
        out.extend_from_slice(&offset.to_le_bytes());
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&name_offset.to_le_bytes());
        out.extend_from_slice(&[0; 4]);
    }
    out.extend_from_slice(&string_table);
    out.extend_from_slice(&data);
    out
}

pub fn base_header(title_id: u64, nca_size: u64) -> NcaHeader {
    NcaHeader {
        fixed_key_signature: NcaSignature(HexData([0; 0x100])),
        npdm_signature: NcaSignature(HexData([0; 0x100])),
        magic: NcaMagic::Nca3,
        distribution_type: DistributionType::Download,
        content_type: NcaContentType::Data,
        key_generation_old: 0,
        key_area_key_index: KeyAreaKeyIndex::Application,
        nca_size,
        title_id: TitleId(title_id),
        content_index: 0,
        sdk_version: 0,
        key_generation_new: 0,
        signature_key_generation: 0,
        rights_id: RightsId::default(),
        section_table: [SectionTableEntry {
            start: 0u64.into(),
            end: 0u64.into(),
            is_enabled: false,
        }; 4],
        fs_header_hashes: [Sha256Hash(HexData([0; 0x20])); 4],
        key_area: NcaKeyArea {
            keys: [HexData([0; 0x10]); 4],
            unused: HexData([0; 0xc0]),
        },
    }
}

/// A headered blob with an arbitrary body; good enough for any content the
/// installer never looks inside.
pub fn build_plain_nca(
    keys: &KeySet,
    title_id: u64,
    total_size: usize,
    mutate: impl FnOnce(&mut NcaHeader),
) -> (Vec<u8>, ContentId) {
    assert!(total_size >= 0xc00);
    let mut header = base_header(title_id, total_size as u64);
    mutate(&mut header);

    let mut bytes = vec![0u8; total_size];
    fill_pattern(&mut bytes[0x400..], 0x5a);
    bytes[..0x400].copy_from_slice(&nca::encrypt_header(keys, &header).unwrap());

    let content_id = content_id_of(&bytes);
    (bytes, content_id)
}

/// A meta NCA: one AES-CTR encrypted PFS0 section holding the given
/// packaged cnmt.
pub fn build_meta_nca(keys: &KeySet, title_id: u64, cnmt: Vec<u8>) -> (Vec<u8>, ContentId) {
    let pfs = build_pfs0(&[(format!("{title_id:016x}.cnmt"), cnmt)]);
    let pfs_len = pfs.len() as u64;

    let mut section_data = pfs;
    let section_size = (section_data.len() as u64 + 0x1ff) & !0x1ff;
    section_data.resize(section_size as usize, 0);

    let upper_counter = 0x1234u64;
    let mut levels = [nca::HashLevel { offset: 0, size: 0 }; 6];
    levels[1] = nca::HashLevel {
        offset: 0,
        size: pfs_len,
    };
    let fs_header = NcaFsHeader {
        version: 2,
        format_type: NcaFormatType::Pfs0,
        hash_type: NcaHashType::Sha256,
        encryption_type: NcaEncryptionType::AesCtr,
        integrity_info: IntegrityInfo::Sha256(Sha256IntegrityInfo {
            master_hash: HexData([0; 0x20]),
            block_size: 0x1000,
            level_count: 2,
            level_info: levels,
        }),
        patch_info: HexData([0; 0x40]),
        upper_counter,
    };

    let mut fs_header_bytes = Cursor::new(Vec::new());
    fs_header.write(&mut fs_header_bytes).unwrap();
    let fs_header_bytes = fs_header_bytes.into_inner();
    assert_eq!(fs_header_bytes.len(), 0x200);
    let fs_header_hash: [u8; 0x20] = Sha256::digest(&fs_header_bytes).into();

    let section_offset = 0xc00u64;
    let total_size = section_offset + section_size;

    let mut header = base_header(title_id, total_size);
    header.content_type = NcaContentType::Meta;
    header.section_table[0] = SectionTableEntry {
        start: section_offset.into(),
        end: total_size.into(),
        is_enabled: true,
    };
    header.fs_header_hashes[0] = Sha256Hash(HexData(fs_header_hash));

    // wrap a fresh content key into slot 2
    let kaek = keys
        .key_area_key(0, KeyAreaKeyIndex::Application)
        .unwrap();
    let content_key: AesKey = "404142434445464748494a4b4c4d4e4f".parse().unwrap();
    for slot in &mut header.key_area.keys {
        *slot = kaek.encrypt_key(AesKey(*slot)).0;
    }
    header.key_area.keys[nca::KEY_AREA_CTR_SLOT] = kaek.encrypt_key(content_key).0;

    // encrypt the section under the key and its counter
    content_key.apply_ctr(
        &mut section_data,
        &ctr_counter(&upper_counter.to_be_bytes(), section_offset),
    );

    // fs header sectors continue the header's XTS numbering
    let mut fs_headers_area = vec![0u8; 0x800];
    fs_headers_area[..0x200].copy_from_slice(&fs_header_bytes);
    keys.header_key().unwrap().encrypt(&mut fs_headers_area, 2, 0x200);

    let mut bytes = Vec::with_capacity(total_size as usize);
    bytes.extend_from_slice(&nca::encrypt_header(keys, &header).unwrap());
    bytes.extend_from_slice(&fs_headers_area);
    bytes.extend_from_slice(&section_data);

    let content_id = content_id_of(&bytes);
    (bytes, content_id)
}

pub fn content_info(content_id: ContentId, size: u64, ty: ContentType) -> ContentInfo {
    ContentInfo {
        hash: HexData([0; 0x20]),
        content_id,
        size,
        ty,
        id_offset: 0,
    }
}

/// Packaged cnmt bytes with a 0x10-byte extended header carrying
/// `required_system_version` at +0x8.
pub fn build_cnmt(
    ty: ContentMetaType,
    title_id: u64,
    version: u32,
    infos: &[ContentInfo],
) -> Vec<u8> {
    let header = ContentMetaHeader {
        title_id: TitleId(title_id),
        version: Version(version),
        ty,
        field_d: 0,
        extended_header_size: 0x10,
        content_count: infos.len() as u16,
        content_meta_count: 0,
        attributes: 0,
        storage_id: 0,
        install_type: 0,
        required_download_system_version: 0,
        field_1c: 0,
    };

    let mut out = Cursor::new(Vec::new());
    out.write_le(&header).unwrap();
    out.write_le(&0u64).unwrap(); // companion title id
    out.write_le(&0x0009_0000u32).unwrap(); // required_system_version
    out.write_le(&0u32).unwrap();
    for info in infos {
        out.write_le(info).unwrap();
    }
    out.into_inner()
}

pub struct AppFixture {
    pub nsp: Vec<u8>,
    pub title_id: u64,
    pub version: u32,
    pub meta_id: ContentId,
    pub program_id: ContentId,
    pub program_bytes: Vec<u8>,
}

/// One application: a meta NCA and a single referenced content, packed as
/// an NSP. Extra files land after the NCAs.
pub fn build_app_nsp(
    keys: &KeySet,
    ty: ContentMetaType,
    title_id: u64,
    version: u32,
    program_size: usize,
    mutate_program: impl FnOnce(&mut NcaHeader),
    extra_files: Vec<(String, Vec<u8>)>,
) -> AppFixture {
    let (program_bytes, program_id) =
        build_plain_nca(keys, title_id, program_size, mutate_program);

    let infos = [content_info(
        program_id,
        program_bytes.len() as u64,
        ContentType::Program,
    )];
    let cnmt = build_cnmt(ty, title_id, version, &infos);
    let (meta_bytes, meta_id) = build_meta_nca(keys, title_id, cnmt);

    let mut files = vec![
        (format!("{meta_id}.cnmt.nca"), meta_bytes),
        (format!("{program_id}.nca"), program_bytes.clone()),
    ];
    files.extend(extra_files);

    AppFixture {
        nsp: build_pfs0(&files),
        title_id,
        version,
        meta_id,
        program_id,
        program_bytes,
    }
}

pub struct NczFixture {
    pub file: Vec<u8>,
    pub content_id: ContentId,
    pub final_bytes: Vec<u8>,
}

/// An NCZ whose reassembly is checkable: two sections (one plain, one
/// AES-CTR) and, optionally, an independent-block table whose last block is
/// stored rather than compressed.
pub fn build_ncz(keys: &KeySet, title_id: u64, total_size: usize, with_blocks: bool) -> NczFixture {
    assert!(total_size > 0x5000);
    let header = base_header(title_id, total_size as u64);

    let mut plain = vec![0u8; total_size];
    fill_pattern(&mut plain[0x400..], 0x33);
    plain[..0x400].copy_from_slice(&nca::encrypt_header(keys, &header).unwrap());

    let section_key: AesKey = "505152535455565758595a5b5c5d5e5f".parse().unwrap();
    let nonce = [0x77u8; 8];
    let mut counter_field = [0u8; 0x10];
    counter_field[..8].copy_from_slice(&nonce);

    // final on-disk image: section two re-encrypted, the rest verbatim
    let mut final_bytes = plain.clone();
    section_key.apply_ctr(&mut final_bytes[0xc00..], &ctr_counter(&nonce, 0xc00));
    let content_id = content_id_of(&final_bytes);

    let mut file = final_bytes[..0x4000].to_vec();
    file.extend_from_slice(b"NCZSECTN");
    file.extend_from_slice(&2u64.to_le_bytes());

    let write_section = |file: &mut Vec<u8>, offset: u64, size: u64, crypto: u64, key: [u8; 0x10]| {
        file.extend_from_slice(&offset.to_le_bytes());
        file.extend_from_slice(&size.to_le_bytes());
        file.extend_from_slice(&crypto.to_le_bytes());
        file.extend_from_slice(&0u64.to_le_bytes());
        file.extend_from_slice(&key);
        file.extend_from_slice(&counter_field);
    };
    write_section(&mut file, 0, 0xc00, 1, [0; 0x10]);
    write_section(
        &mut file,
        0xc00,
        total_size as u64 - 0xc00,
        3,
        section_key.0 .0,
    );

    let region = &plain[0x4000..];

    if with_blocks {
        let exponent = 19u8;
        let block_size = 1usize << exponent;
        let chunks: Vec<&[u8]> = region.chunks(block_size).collect();

        let mut blocks: Vec<Vec<u8>> = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            if i == chunks.len() - 1 {
                // stored: compressed size equals the decompressed remainder
                blocks.push(chunk.to_vec());
            } else {
                let compressed = zstd::encode_all(*chunk, 3).unwrap();
                assert!(compressed.len() < chunk.len());
                blocks.push(compressed);
            }
        }

        file.extend_from_slice(b"NCZBLOCK");
        file.push(2); // version
        file.push(1); // type
        file.push(0);
        file.push(exponent);
        file.extend_from_slice(&(blocks.len() as u32).to_le_bytes());
        file.extend_from_slice(&(region.len() as u64).to_le_bytes());
        for block in &blocks {
            file.extend_from_slice(&(block.len() as u32).to_le_bytes());
        }
        for block in &blocks {
            file.extend_from_slice(block);
        }
    } else {
        file.extend_from_slice(&zstd::encode_all(region, 3).unwrap());
    }

    NczFixture {
        file,
        content_id,
        final_bytes,
    }
}

/// A common ticket whose title key is wrapped under `titlekek` at
/// `key_generation`.
pub fn build_ticket(keys: &KeySet, rights_id: RightsId, key_generation: u8) -> Vec<u8> {
    let plain: AesKey = "deadbeefdeadbeefdeadbeefdeadbeef".parse().unwrap();
    let wrapped = keys
        .title_kek(key_generation)
        .unwrap()
        .encrypt_key(plain);

    let mut title_key_block = [0u8; 0x100];
    title_key_block[..0x10].copy_from_slice(&wrapped.0 .0);

    Ticket {
        signature: Signature::Rsa2048Sha256(HexData([0x11; 0x100])),
        issuer: NullString::from("Root-CA00000003-XS00000020"),
        title_key_block: HexData(title_key_block),
        format_version: 2,
        title_key_type: TitleKeyType::Common,
        ticket_version: 0,
        license_type: LicenseType::Permanent,
        crypto_type: key_generation,
        property_flags: 0,
        ticket_id: 0,
        device_id: 0,
        rights_id,
        account_id: 0,
        sect_total_size: 0,
        sect_header_offset: 0x2c0,
        sect_num: 0,
        sect_entry_size: 0,
    }
    .to_bytes()
}

/// Fake cert blob; the installer treats certs as opaque bytes.
pub fn build_cert() -> Vec<u8> {
    vec![0xcc; 0x700]
}
