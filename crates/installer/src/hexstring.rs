use binrw::{BinRead, BinWrite};
use hex::FromHexError;
use std::str::FromStr;

/// Fixed-size byte blob that formats as a hexstring.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, BinRead, BinWrite)]
pub struct HexData<const N: usize>(pub [u8; N]);

impl<const N: usize> core::fmt::Debug for HexData<N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl<const N: usize> core::fmt::Display for HexData<N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(self, f)
    }
}

impl<const N: usize> Default for HexData<N> {
    fn default() -> Self {
        HexData([0; N])
    }
}

impl<const N: usize> FromStr for HexData<N> {
    type Err = FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut result = [0; N];
        hex::decode_to_slice(s, &mut result)?;
        Ok(HexData(result))
    }
}

impl<const N: usize> serde::Serialize for HexData<N> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de, const N: usize> serde::Deserialize<'de> for HexData<N> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = <&str>::deserialize(deserializer)?;
        s.parse()
            .map_err(|_| serde::de::Error::invalid_value(serde::de::Unexpected::Str(s), &"a hexstring"))
    }
}

impl<const N: usize> AsRef<[u8]> for HexData<N> {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl<const N: usize> AsMut<[u8]> for HexData<N> {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl<const N: usize> From<[u8; N]> for HexData<N> {
    fn from(value: [u8; N]) -> Self {
        Self(value)
    }
}

impl<const N: usize> From<HexData<N>> for [u8; N] {
    fn from(value: HexData<N>) -> Self {
        value.0
    }
}
