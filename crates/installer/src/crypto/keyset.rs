use crate::crypto::{AesKey, AesXtsKey, KeyParseError, RsaModulus};
use binrw::{BinRead, BinWrite};
use ini::Properties;
use snafu::{ResultExt, Snafu};
use std::fmt::{Debug, Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// How many master key generations the chains are sized for.
pub const KEY_GENERATION_LIMIT: usize = 0x20;

/// The device key material the installer needs: the header XTS key, the
/// titlekek and key-area-key chains, and the fixed-key signature moduli.
#[derive(Clone)]
pub struct KeySet {
    header_key: Option<AesXtsKey>,
    title_kek: [Option<AesKey>; KEY_GENERATION_LIMIT],
    key_area_key_application: [Option<AesKey>; KEY_GENERATION_LIMIT],
    key_area_key_ocean: [Option<AesKey>; KEY_GENERATION_LIMIT],
    key_area_key_system: [Option<AesKey>; KEY_GENERATION_LIMIT],
    nca_hdr_fixed_key_modulus: [Option<RsaModulus>; 2],
}

pub struct KeyName {
    pub key_name: &'static str,
    pub index: Option<u8>,
}

impl Debug for KeyName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(index) = self.index {
            write!(f, "{}_{:02x}", self.key_name, index)
        } else {
            write!(f, "{}", self.key_name)
        }
    }
}

impl Display for KeyName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

#[derive(Snafu, Debug)]
pub struct MissingKeyError {
    pub key_name: KeyName,
}

#[derive(Snafu, Debug)]
pub enum KeySetParseError {
    #[snafu(display("Could not parse keyset file at line {} column {}: {}", line, col, msg))]
    KeysFileParse {
        line: usize,
        col: usize,
        msg: String,
    },

    #[snafu(display("Could not parse key {}: {}", key_name, source))]
    KeyParse {
        key_name: KeyName,
        source: KeyParseError,
    },
}

#[derive(Snafu, Debug)]
pub enum SystemKeysetError {
    Parse { source: KeySetParseError },
    NotFound { tried: Vec<PathBuf> },
    Io { source: std::io::Error },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum KeyAreaKeyIndex {
    Application = 0,
    Ocean = 1,
    System = 2,
}

impl KeySet {
    /// Loads a keyset from a file. The file format is the same as the one used by Hactool.
    /// By default the file is searched in the ".switch" dir in
    ///     the user's home directory and in "switch" in user's config directory (according to `dirs-next` crate).
    ///
    /// One can also provide a path to a custom keyset file, then the system directories are ignored.
    pub fn from_system(keys_dir: Option<&Path>) -> Result<Self, SystemKeysetError> {
        let paths = if let Some(key_path) = keys_dir {
            vec![Some(key_path.into())]
        } else {
            vec![
                dirs_next::config_dir().map(|v| v.join("switch")),
                dirs_next::home_dir().map(|v| v.join(".switch")),
            ]
        }
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();

        let prod_keys_path = paths
            .iter()
            .map(|p| p.join("prod.keys"))
            .find(|p| p.exists())
            .ok_or_else(|| SystemKeysetError::NotFound {
                tried: paths.iter().map(|p| p.join("prod.keys")).collect(),
            })?;

        let prod_keys = std::fs::read_to_string(prod_keys_path).context(IoSnafu)?;

        Self::from_file_contents(&prod_keys).context(ParseSnafu {})
    }

    pub fn from_file_contents(keys: &str) -> Result<Self, KeySetParseError> {
        let keys =
            ini::Ini::load_from_str_noescape(keys).map_err(|e| KeySetParseError::KeysFileParse {
                line: e.line,
                col: e.col,
                msg: e.msg,
            })?;
        let keys = keys.general_section();

        fn parse_key<K: FromStr<Err = KeyParseError>>(
            props: &Properties,
            name: &'static str,
        ) -> Result<Option<K>, KeySetParseError> {
            props
                .get(name)
                .map(|s| s.parse())
                .transpose()
                .map_err(|source| KeySetParseError::KeyParse {
                    key_name: KeyName {
                        key_name: name,
                        index: None,
                    },
                    source,
                })
        }

        fn parse_keys<K: FromStr<Err = KeyParseError> + Copy, const N: usize>(
            props: &Properties,
            name: &'static str,
        ) -> Result<[Option<K>; N], KeySetParseError> {
            let mut result = [None; N];
            for (i, result) in result.iter_mut().enumerate() {
                let key_name = KeyName {
                    key_name: name,
                    index: Some(i as u8),
                };
                let key = props
                    .get(&key_name.to_string())
                    .map(|s| s.parse())
                    .transpose()
                    .map_err(|source| KeySetParseError::KeyParse { key_name, source })?;
                *result = key;
            }
            Ok(result)
        }

        // hactool-style keysets carry the modulus either indexed or bare
        // (bare meaning signature key generation 0)
        let mut nca_hdr_fixed_key_modulus: [Option<RsaModulus>; 2] =
            parse_keys(keys, "nca_hdr_fixed_key_modulus")?;
        if nca_hdr_fixed_key_modulus[0].is_none() {
            nca_hdr_fixed_key_modulus[0] = parse_key(keys, "nca_hdr_fixed_key_modulus")?;
        }

        Ok(Self {
            header_key: parse_key(keys, "header_key")?,
            title_kek: parse_keys(keys, "titlekek")?,
            key_area_key_application: parse_keys(keys, "key_area_key_application")?,
            key_area_key_ocean: parse_keys(keys, "key_area_key_ocean")?,
            key_area_key_system: parse_keys(keys, "key_area_key_system")?,
            nca_hdr_fixed_key_modulus,
        })
    }
}

impl KeySet {
    pub fn header_key(&self) -> Result<AesXtsKey, MissingKeyError> {
        self.header_key.ok_or(MissingKeyError {
            key_name: KeyName {
                key_name: "header_key",
                index: None,
            },
        })
    }

    pub fn title_kek(&self, key_generation: u8) -> Result<AesKey, MissingKeyError> {
        self.title_kek[key_generation as usize].ok_or(MissingKeyError {
            key_name: KeyName {
                key_name: "titlekek",
                index: Some(key_generation),
            },
        })
    }

    pub fn key_area_key(
        &self,
        key_generation: u8,
        key_area_key_index: KeyAreaKeyIndex,
    ) -> Result<AesKey, MissingKeyError> {
        let (kek_array, name) = match key_area_key_index {
            KeyAreaKeyIndex::Application => {
                (&self.key_area_key_application, "key_area_key_application")
            }
            KeyAreaKeyIndex::Ocean => (&self.key_area_key_ocean, "key_area_key_ocean"),
            KeyAreaKeyIndex::System => (&self.key_area_key_system, "key_area_key_system"),
        };
        kek_array[key_generation as usize].ok_or(MissingKeyError {
            key_name: KeyName {
                key_name: name,
                index: Some(key_generation),
            },
        })
    }

    pub fn fixed_key_modulus(&self, signature_key_generation: u8) -> Result<RsaModulus, MissingKeyError> {
        let index = std::cmp::min(signature_key_generation, 1);
        self.nca_hdr_fixed_key_modulus[index as usize].ok_or(MissingKeyError {
            key_name: KeyName {
                key_name: "nca_hdr_fixed_key_modulus",
                index: Some(index),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_indexed_chains() {
        let keys = "\
header_key = b62cee4c3d2b1a9a23e2c98ab45ad36f45ad36fb62cee4c3d2b1a9a23e2c98ab
titlekek_00 = 000102030405060708090a0b0c0d0e0f
titlekek_02 = 101112131415161718191a1b1c1d1e1f
key_area_key_application_00 = 202122232425262728292a2b2c2d2e2f
";
        let keyset = KeySet::from_file_contents(keys).unwrap();

        keyset.header_key().unwrap();
        keyset.title_kek(0).unwrap();
        keyset.title_kek(2).unwrap();
        assert!(keyset.title_kek(1).is_err());
        keyset
            .key_area_key(0, KeyAreaKeyIndex::Application)
            .unwrap();
        assert!(keyset.key_area_key(0, KeyAreaKeyIndex::Ocean).is_err());
        assert!(keyset.fixed_key_modulus(0).is_err());
    }

    #[test]
    fn rejects_bad_key_material() {
        let keys = "header_key = nothex\n";
        assert!(matches!(
            KeySet::from_file_contents(keys),
            Err(KeySetParseError::KeyParse { .. })
        ));
    }
}
