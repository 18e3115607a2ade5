use crate::hexstring::HexData;
use aes::Aes128;
use binrw::{BinRead, BinWrite};
use cipher::generic_array::GenericArray;
use ctr::Ctr128BE;
use hex::FromHexError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snafu::Snafu;
use std::str::FromStr;
use xts_mode::Xts128;

pub mod keyset;

#[derive(Snafu, Debug)]
pub enum KeyParseError {
    InvalidLength { expected: usize, actual: usize },
    InvalidChar { char: char, index: usize },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize, BinRead, BinWrite)]
pub struct EncryptedAesKey(pub HexData<0x10>);

/// An encrypted AES-128 title key, as carried in a ticket.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct TitleKey(pub HexData<0x10>);
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct AesKey(pub HexData<0x10>);
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct AesXtsKey(pub HexData<0x20>);

/// RSA-2048 public modulus for fixed-key signature checks.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RsaModulus(pub HexData<0x100>);

fn parse_key(s: &str, result: &mut [u8]) -> Result<(), KeyParseError> {
    hex::decode_to_slice(s, result).map_err(|e| match e {
        FromHexError::InvalidHexCharacter { c, index } => {
            KeyParseError::InvalidChar { char: c, index }
        }
        FromHexError::OddLength | FromHexError::InvalidStringLength => {
            KeyParseError::InvalidLength {
                expected: result.len() * 2,
                actual: s.len(),
            }
        }
    })?;
    Ok(())
}

macro_rules! impl_key_from_str {
    ($ty:ident, $size:expr) => {
        impl FromStr for $ty {
            type Err = KeyParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let mut result = [0; $size];
                parse_key(s, &mut result).map(|_| $ty(HexData(result)))
            }
        }
    };
}

impl_key_from_str!(AesKey, 0x10);
impl_key_from_str!(TitleKey, 0x10);
impl_key_from_str!(AesXtsKey, 0x20);
impl_key_from_str!(RsaModulus, 0x100);

impl From<[u8; 0x10]> for TitleKey {
    fn from(data: [u8; 0x10]) -> Self {
        TitleKey(HexData(data))
    }
}

impl TitleKey {
    pub fn decrypt(&self, title_kek: AesKey) -> AesKey {
        title_kek.decrypt_key(EncryptedAesKey(self.0))
    }

    pub fn encrypt(plain: AesKey, title_kek: AesKey) -> TitleKey {
        TitleKey(title_kek.wrap_key(&plain.0 .0).0)
    }
}

impl AesKey {
    fn derive_key(&self, source: &[u8; 0x10]) -> AesKey {
        use cipher::{BlockDecrypt, KeyInit};
        let mut newkey = *source;

        let crypter = Aes128::new(GenericArray::from_slice(&self.0 .0));
        crypter.decrypt_block(GenericArray::from_mut_slice(&mut newkey));

        AesKey(HexData(newkey))
    }

    fn wrap_key(&self, source: &[u8; 0x10]) -> EncryptedAesKey {
        use cipher::{BlockEncrypt, KeyInit};
        let mut newkey = *source;

        let crypter = Aes128::new(GenericArray::from_slice(&self.0 .0));
        crypter.encrypt_block(GenericArray::from_mut_slice(&mut newkey));

        EncryptedAesKey(HexData(newkey))
    }

    pub fn decrypt_key(&self, source: EncryptedAesKey) -> AesKey {
        self.derive_key(&source.0 .0)
    }

    pub fn encrypt_key(&self, source: AesKey) -> EncryptedAesKey {
        self.wrap_key(&source.0 .0)
    }

    /// AES-CTR cipher seeded with an explicit 16-byte counter.
    ///
    /// The returned cipher is stateful; keystream position carries across
    /// `apply_keystream` calls.
    pub fn ctr_cipher(&self, counter: &[u8; 0x10]) -> Ctr128BE<Aes128> {
        use cipher::KeyIvInit;

        let key = GenericArray::from_slice(&self.0 .0);
        let iv = GenericArray::from_slice(counter);
        Ctr128BE::<Aes128>::new(key, iv)
    }

    /// One-shot CTR pass over `buf` (encrypt and decrypt are the same
    /// operation).
    pub fn apply_ctr(&self, buf: &mut [u8], counter: &[u8; 0x10]) {
        use cipher::StreamCipher;

        let mut crypter = self.ctr_cipher(counter);
        crypter.apply_keystream(buf);
    }
}

/// Counter for a section at `byte_offset`: the section nonce in the upper
/// half, big-endian AES block index in the lower half.
pub fn ctr_counter(nonce: &[u8; 8], byte_offset: u64) -> [u8; 0x10] {
    let mut counter = [0; 0x10];
    counter[..8].copy_from_slice(nonce);
    counter[8..].copy_from_slice(&(byte_offset / 0x10).to_be_bytes());
    counter
}

fn get_tweak(mut sector: usize) -> [u8; 0x10] {
    let mut tweak = [0; 0x10];
    for tweak in tweak.iter_mut().rev() {
        /* Nintendo LE custom tweak... */
        *tweak = (sector & 0xFF) as u8;
        sector >>= 8;
    }
    tweak
}

impl AesXtsKey {
    #[inline]
    fn to_crypter(&self) -> Xts128<Aes128> {
        use cipher::KeyInit;

        let key1 = Aes128::new(GenericArray::from_slice(&self.0 .0[0x00..0x10]));
        let key2 = Aes128::new(GenericArray::from_slice(&self.0 .0[0x10..0x20]));
        Xts128::<Aes128>::new(key1, key2)
    }

    pub fn decrypt(&self, data: &mut [u8], mut sector: usize, sector_size: usize) {
        if data.len() % sector_size != 0 {
            panic!("Length must be multiple of sectors!")
        }

        let crypter = self.to_crypter();

        for i in (0..data.len()).step_by(sector_size) {
            let tweak = get_tweak(sector);

            crypter.decrypt_sector(&mut data[i..i + sector_size], tweak);
            sector += 1;
        }
    }

    pub fn encrypt(&self, data: &mut [u8], mut sector: usize, sector_size: usize) {
        if data.len() % sector_size != 0 {
            panic!("Length must be multiple of sectors!")
        }

        let crypter = self.to_crypter();

        for i in (0..data.len()).step_by(sector_size) {
            let tweak = get_tweak(sector);

            crypter.encrypt_sector(&mut data[i..i + sector_size], tweak);
            sector += 1;
        }
    }
}

#[derive(Snafu, Debug)]
pub enum PssVerifyError {
    /// The modulus does not form a valid RSA-2048 public key
    InvalidModulus { source: rsa::Error },
    /// The signature does not match the signed data
    SignatureMismatch { source: rsa::Error },
}

/// Verifies an RSA-2048-PSS SHA-256 signature under the fixed public
/// exponent 0x10001.
pub fn verify_pss_sha256(
    modulus: &RsaModulus,
    message: &[u8],
    signature: &[u8; 0x100],
) -> Result<(), PssVerifyError> {
    use rsa::{BigUint, Pss, RsaPublicKey};
    use snafu::ResultExt;

    let key = RsaPublicKey::new(
        BigUint::from_bytes_be(&modulus.0 .0),
        BigUint::from(0x10001u32),
    )
    .context(InvalidModulusSnafu)?;

    let digest = Sha256::digest(message);
    key.verify(Pss::new::<Sha256>(), &digest, signature)
        .context(SignatureMismatchSnafu)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xts_round_trip_with_sector_numbering() {
        let key: AesXtsKey = "b62cee4c3d2b1a9a23e2c98ab45ad36f45ad36fb62cee4c3d2b1a9a23e2c98ab"
            .parse()
            .unwrap();

        let mut data = vec![0u8; 0x400];
        for (i, b) in data.iter_mut().enumerate() {
            *b = i as u8;
        }
        let original = data.clone();

        key.encrypt(&mut data, 0, 0x200);
        assert_ne!(data, original);
        key.decrypt(&mut data, 0, 0x200);
        assert_eq!(data, original);

        // decrypting with the wrong starting sector must not round-trip
        key.encrypt(&mut data, 0, 0x200);
        key.decrypt(&mut data, 1, 0x200);
        assert_ne!(data, original);
    }

    #[test]
    fn key_wrap_round_trip() {
        let kek: AesKey = "000102030405060708090a0b0c0d0e0f".parse().unwrap();
        let plain: AesKey = "ffeeddccbbaa99887766554433221100".parse().unwrap();

        let wrapped = kek.encrypt_key(plain);
        assert_ne!(wrapped.0, plain.0);
        assert_eq!(kek.decrypt_key(wrapped), plain);
    }

    #[test]
    fn ctr_counter_layout() {
        let counter = ctr_counter(&[1, 2, 3, 4, 5, 6, 7, 8], 0x40);
        assert_eq!(&counter[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&counter[8..], &[0, 0, 0, 0, 0, 0, 0, 4]);
    }

    #[test]
    fn ctr_streaming_matches_one_shot() {
        use cipher::StreamCipher;

        let key: AesKey = "2b7e151628aed2a6abf7158809cf4f3c".parse().unwrap();
        let counter = ctr_counter(&[0; 8], 0);

        let mut whole = vec![7u8; 0x100];
        key.apply_ctr(&mut whole, &counter);

        let mut split = vec![7u8; 0x100];
        let mut cipher = key.ctr_cipher(&counter);
        cipher.apply_keystream(&mut split[..0x30]);
        cipher.apply_keystream(&mut split[0x30..]);

        assert_eq!(whole, split);
    }
}
