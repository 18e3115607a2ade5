use crate::ncm::{ContentInfo, ContentMetaHeader, ContentMetaType};
use binrw::BinRead;
use snafu::{ResultExt, Snafu};
use std::io::Cursor;

#[derive(Snafu, Debug)]
pub enum CnmtError {
    /// Failed to parse the packaged content meta
    Parsing { source: binrw::Error },
}

/// A packaged content meta, as found in the `.cnmt` file of a Meta NCA.
///
/// The extended header shape varies by meta type; the installer only ever
/// rewrites `required_system_version` inside it and otherwise re-emits the
/// bytes verbatim, so it stays raw here:
///
/// - Application: patch_id u64, required_system_version u32, required_application_version u32
/// - Patch: application_id u64, required_system_version u32, extended_data_size u32
/// - AddOnContent: application_id u64, required_application_version u32, ...
#[derive(Debug, Clone, PartialEq, Eq, BinRead)]
#[br(little)]
pub struct PackagedContentMeta {
    pub header: ContentMetaHeader,
    #[br(count = header.extended_header_size)]
    pub extended_header: Vec<u8>,
    #[br(count = header.content_count)]
    pub content_infos: Vec<ContentInfo>,
}

impl PackagedContentMeta {
    pub fn parse(bytes: &[u8]) -> Result<Self, CnmtError> {
        Self::read(&mut Cursor::new(bytes)).context(ParsingSnafu)
    }
}

const REQUIRED_SYSTEM_VERSION_OFFSET: usize = 0x8;

/// Zeroes `required_system_version` in an Application or Patch extended
/// header. Other meta types don't carry the field and are left alone.
pub fn lower_required_system_version(ty: ContentMetaType, extended_header: &mut [u8]) -> bool {
    if !matches!(ty, ContentMetaType::Application | ContentMetaType::Patch) {
        return false;
    }
    let Some(field) = extended_header
        .get_mut(REQUIRED_SYSTEM_VERSION_OFFSET..REQUIRED_SYSTEM_VERSION_OFFSET + 4)
    else {
        return false;
    };
    field.fill(0);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hexstring::HexData;
    use crate::ids::{ContentId, TitleId};
    use crate::ncm::{ContentType, CONTENT_INFO_SIZE, META_HEADER_SIZE};
    use crate::version::Version;
    use binrw::BinWriterExt;

    fn sample_cnmt() -> Vec<u8> {
        let header = ContentMetaHeader {
            title_id: TitleId(0x0100_0000_0000_a000),
            version: Version(0x20000),
            ty: ContentMetaType::Application,
            field_d: 0,
            extended_header_size: 0x10,
            content_count: 1,
            content_meta_count: 0,
            attributes: 0,
            storage_id: 0,
            install_type: 0,
            required_download_system_version: 0,
            field_1c: 0,
        };
        let info = ContentInfo {
            hash: HexData([3; 0x20]),
            content_id: ContentId([3; 0x10]),
            size: 0x1000,
            ty: ContentType::Control,
            id_offset: 0,
        };

        let mut out = Cursor::new(Vec::new());
        out.write_le(&header).unwrap();
        // patch_id, then required_system_version = 0x00090000
        out.write_le(&0u64).unwrap();
        out.write_le(&0x0009_0000u32).unwrap();
        out.write_le(&0u32).unwrap();
        out.write_le(&info).unwrap();
        out.into_inner()
    }

    #[test]
    fn parses_header_extended_and_infos() {
        let bytes = sample_cnmt();
        assert_eq!(bytes.len(), META_HEADER_SIZE + 0x10 + CONTENT_INFO_SIZE);

        let cnmt = PackagedContentMeta::parse(&bytes).unwrap();
        assert_eq!(cnmt.header.ty, ContentMetaType::Application);
        assert_eq!(cnmt.extended_header.len(), 0x10);
        assert_eq!(cnmt.content_infos.len(), 1);
        assert_eq!(cnmt.content_infos[0].size, 0x1000);
    }

    #[test]
    fn lowers_required_system_version() {
        let mut cnmt = PackagedContentMeta::parse(&sample_cnmt()).unwrap();
        assert_eq!(&cnmt.extended_header[0x8..0xc], &0x0009_0000u32.to_le_bytes());

        assert!(lower_required_system_version(
            cnmt.header.ty,
            &mut cnmt.extended_header
        ));
        assert_eq!(&cnmt.extended_header[0x8..0xc], &[0; 4]);

        // add-on extended headers have no such field
        let mut ext = vec![0xff; 0x18];
        assert!(!lower_required_system_version(
            ContentMetaType::AddOnContent,
            &mut ext
        ));
        assert!(ext.iter().all(|&b| b == 0xff));
    }
}
