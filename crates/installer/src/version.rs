use binrw::{BinRead, BinWrite};
use std::fmt;

/// A title version as stored in content meta records.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BinRead, BinWrite)]
pub struct Version(pub u32);

impl Version {
    pub fn into_parts(self) -> (u8, u8, u8, u16) {
        (
            (self.0 >> 26) as u8,
            ((self.0 >> 20) & 0x3f) as u8,
            ((self.0 >> 16) & 0xf) as u8,
            self.0 as u16,
        )
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (major, minor, micro, bugfix) = self.into_parts();

        write!(f, "v{} ({}.{}.{}.{})", self.0, major, minor, micro, bugfix)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl From<u32> for Version {
    fn from(v: u32) -> Self {
        Self(v)
    }
}
impl From<Version> for u32 {
    fn from(v: Version) -> Self {
        v.0
    }
}
