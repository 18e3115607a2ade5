use binrw::BinResult;
use std::io::{Read, Write};

// NCM content sizes are 48-bit little-endian on disk.

#[binrw::parser(reader)]
pub fn read_u48() -> BinResult<u64> {
    let mut buf = [0u8; 6];
    reader.read_exact(&mut buf)?;
    let mut full = [0u8; 8];
    full[..6].copy_from_slice(&buf);
    Ok(u64::from_le_bytes(full))
}

#[binrw::writer(writer)]
pub fn write_u48(value: &u64) -> BinResult<()> {
    writer.write_all(&value.to_le_bytes()[..6])?;
    Ok(())
}

#[binrw::parser(reader)]
pub fn read_bool() -> BinResult<bool> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0] != 0)
}

#[binrw::writer(writer)]
pub fn write_bool(value: &bool) -> BinResult<()> {
    writer.write_all(&[u8::from(*value)])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use binrw::{BinReaderExt, BinWriterExt};
    use std::io::Cursor;

    #[derive(Debug, PartialEq, Eq, binrw::BinRead, binrw::BinWrite)]
    #[brw(little)]
    struct U48 {
        #[br(parse_with = super::read_u48)]
        #[bw(write_with = super::write_u48)]
        value: u64,
    }

    #[test]
    fn u48_round_trip() {
        let data = [0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc];
        let parsed: U48 = Cursor::new(data).read_le().unwrap();
        assert_eq!(parsed.value, 0xbc9a_7856_3412);

        let mut out = Cursor::new(Vec::new());
        out.write_le(&parsed).unwrap();
        assert_eq!(out.into_inner(), data);
    }
}
