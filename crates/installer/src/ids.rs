use crate::hexstring::HexData;
use binrw::{BinRead, BinWrite};
use hex::FromHexError;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::fmt::{Debug, Display};
use std::str::FromStr;

#[derive(Snafu, Debug)]
pub enum IdParseError {
    InvalidLength { expected: usize, actual: usize },
    InvalidChar { char: char, index: usize },
}

fn parse_id(s: &str, result: &mut [u8]) -> Result<(), IdParseError> {
    hex::decode_to_slice(s, result).map_err(|e| match e {
        FromHexError::InvalidHexCharacter { c, index } => {
            IdParseError::InvalidChar { char: c, index }
        }
        FromHexError::OddLength | FromHexError::InvalidStringLength => {
            IdParseError::InvalidLength {
                expected: result.len() * 2,
                actual: s.len(),
            }
        }
    })?;
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BinRead, BinWrite)]
pub struct TitleId(pub u64);

impl TitleId {
    /// Base application id this title belongs to.
    ///
    /// Patches live at `base + 0x800`, add-on contents and data patches at
    /// `base + 0x1000 + index`, so masking the low bits (and stepping one
    /// 0x1000 page down for aoc) recovers the application id.
    pub fn application_id(self, ty: crate::ncm::ContentMetaType) -> TitleId {
        use crate::ncm::ContentMetaType;
        match ty {
            ContentMetaType::Application => self,
            ContentMetaType::Patch => TitleId(self.0 & !0xfff),
            ContentMetaType::AddOnContent | ContentMetaType::DataPatch => {
                TitleId((self.0 & !0xfff).wrapping_sub(0x1000))
            }
            _ => self,
        }
    }
}

impl Debug for TitleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}
impl Display for TitleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Identifies a content archive in the content store.
///
/// Equal to the first half of the SHA-256 of the archive's bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, BinRead, BinWrite)]
pub struct ContentId(pub [u8; 0x10]);

// wanna lowercase, hence the manual impl
impl Debug for ContentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}
impl Display for ContentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

impl FromStr for ContentId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut result = [0; 0x10];
        parse_id(s, &mut result).map(|_| ContentId(result))
    }
}

impl ContentId {
    /// Extracts the id from a collection entry name like
    /// `<32 hex chars>.nca` / `.cnmt.nca` / `.ncz`.
    pub fn from_entry_name(name: &str) -> Result<Self, IdParseError> {
        let hex_len = name
            .bytes()
            .take(0x20)
            .take_while(|b| b.is_ascii_hexdigit())
            .count();
        name[..hex_len].parse()
    }

    pub fn from_hash(hash: &[u8; 0x20]) -> Self {
        let mut id = [0; 0x10];
        id.copy_from_slice(&hash[..0x10]);
        ContentId(id)
    }
}

/// Temporary id a content accumulates under before registration.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, BinRead, BinWrite)]
pub struct PlaceholderId(pub [u8; 0x10]);

impl Debug for PlaceholderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}
impl Display for PlaceholderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Ties a ticket to the content archives that need its title key.
#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Hash,
    Ord,
    PartialOrd,
    Default,
    Serialize,
    Deserialize,
    BinRead,
    BinWrite,
)]
pub struct RightsId(pub HexData<0x10>);

impl RightsId {
    pub fn is_empty(&self) -> bool {
        self.0 .0.iter().all(|&x| x == 0)
    }

    /// The rights id ends with the key generation the title key was minted
    /// under.
    pub fn key_generation(&self) -> u8 {
        self.0 .0[0xf]
    }

    pub fn from_entry_name(name: &str) -> Result<Self, IdParseError> {
        let hex_len = name
            .bytes()
            .take(0x20)
            .take_while(|b| b.is_ascii_hexdigit())
            .count();
        name[..hex_len].parse()
    }
}

impl Display for RightsId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RightsId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut result = [0; 0x10];
        parse_id(s, &mut result).map(|_| RightsId(HexData(result)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_id_from_entry_name() {
        let id = ContentId::from_entry_name("d02b3e5e458e6ec6a6bd966ebaccee9a.cnmt.nca").unwrap();
        assert_eq!(format!("{id}"), "d02b3e5e458e6ec6a6bd966ebaccee9a");

        assert!(ContentId::from_entry_name("garbage.nca").is_err());
    }

    #[test]
    fn rights_id_key_generation() {
        let id: RightsId = "0100000000000abc000000000000000b".parse().unwrap();
        assert!(!id.is_empty());
        assert_eq!(id.key_generation(), 0xb);
        assert!(RightsId::default().is_empty());
    }
}
