use crate::crypto::keyset::{KeySet, MissingKeyError};
use crate::crypto::{AesKey, TitleKey};
use crate::hexstring::HexData;
use crate::ids::RightsId;
use binrw::{BinRead, BinWrite, NullString};
use bitflags::bitflags;
use snafu::{ResultExt, Snafu};
use std::io::Cursor;

#[derive(Snafu, Debug)]
pub enum TicketError {
    /// Failed to parse the ticket
    Parsing { source: binrw::Error },
    /// Ticket is missing a crypto key
    MissingKey { source: MissingKeyError },
    /// Personalized title keys are not supported
    PersonalizedTitleKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[repr(u32)]
pub enum Signature {
    #[brw(magic = 0x10000u32)]
    Rsa4096Sha1(#[brw(pad_after = 0x3c)] HexData<0x200>),
    #[brw(magic = 0x10001u32)]
    Rsa2048Sha1(#[brw(pad_after = 0x3c)] HexData<0x100>),
    #[brw(magic = 0x10002u32)]
    EcdsaSha1(#[brw(pad_after = 0x40)] HexData<0x3c>),
    #[brw(magic = 0x10003u32)]
    Rsa4096Sha256(#[brw(pad_after = 0x3c)] HexData<0x200>),
    #[brw(magic = 0x10004u32)]
    Rsa2048Sha256(#[brw(pad_after = 0x3c)] HexData<0x100>),
    #[brw(magic = 0x10005u32)]
    EcdsaSha256(#[brw(pad_after = 0x40)] HexData<0x3c>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum TitleKeyType {
    Common,
    Personalized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum LicenseType {
    Permanent,
    Demo,
    Trial,
    Rental,
    Subscription,
    Service,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PropertyFlags: u32 {
        const PRE_INSTALL = 1 << 0;
        const SHARED_TITLE = 1 << 1;
        const ALLOW_ALL_CONTENT = 1 << 2;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct Ticket {
    pub signature: Signature,
    #[brw(pad_size_to = 0x40)]
    pub issuer: NullString,
    pub title_key_block: HexData<0x100>,
    pub format_version: u8,
    pub title_key_type: TitleKeyType,
    pub ticket_version: u16,
    pub license_type: LicenseType,
    /// Master key revision the title key is wrapped under.
    pub crypto_type: u8,
    pub property_flags: u32,
    #[brw(pad_before = 0x6)]
    pub ticket_id: u64,
    pub device_id: u64,
    pub rights_id: RightsId,
    pub account_id: u32,
    pub sect_total_size: u32,
    pub sect_header_offset: u32,
    pub sect_num: u16,
    pub sect_entry_size: u16,
}

impl Ticket {
    pub fn parse(bytes: &[u8]) -> Result<Self, TicketError> {
        Self::read(&mut Cursor::new(bytes)).context(ParsingSnafu)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        self.write(&mut out)
            .expect("BUG: ticket must serialize back");
        out.into_inner()
    }

    pub fn property_flags(&self) -> PropertyFlags {
        PropertyFlags::from_bits_truncate(self.property_flags)
    }

    /// The wrapped title key (first 0x10 bytes of the key block for common
    /// tickets).
    pub fn title_key(&self) -> Result<TitleKey, TicketError> {
        match self.title_key_type {
            TitleKeyType::Common => {
                let mut title_key = [0; 0x10];
                title_key.copy_from_slice(&self.title_key_block.0[..0x10]);
                Ok(TitleKey::from(title_key))
            }
            TitleKeyType::Personalized => Err(TicketError::PersonalizedTitleKey),
        }
    }

    /// Unwraps the title key using the titlekek chain at `key_generation`
    /// (the generation of the content that references this ticket).
    pub fn title_key_decrypted(
        &self,
        keys: &KeySet,
        key_generation: u8,
    ) -> Result<AesKey, TicketError> {
        let title_kek = keys.title_kek(key_generation).context(MissingKeySnafu)?;
        Ok(self.title_key()?.decrypt(title_kek))
    }
}

/// Normalizes a ticket for import: rewraps the title key under the kek
/// chain at `key_generation`, fixes the key generation byte, and optionally
/// strips the personalized identifiers to make the ticket common.
///
/// Patching is idempotent; a ticket already at `key_generation` with no
/// conversion requested comes back byte-identical.
pub fn patch_ticket(
    ticket_bytes: &mut Vec<u8>,
    keys: &KeySet,
    key_generation: u8,
    convert_to_common: bool,
) -> Result<(), TicketError> {
    let mut ticket = Ticket::parse(ticket_bytes)?;

    if ticket.crypto_type != key_generation {
        let old_kek = keys.title_kek(ticket.crypto_type).context(MissingKeySnafu)?;
        let new_kek = keys.title_kek(key_generation).context(MissingKeySnafu)?;

        let plain = ticket.title_key()?.decrypt(old_kek);
        let rewrapped = new_kek.encrypt_key(plain);
        ticket.title_key_block.0[..0x10].copy_from_slice(&rewrapped.0 .0);
        ticket.crypto_type = key_generation;
    }

    if convert_to_common {
        ticket.title_key_type = TitleKeyType::Common;
        ticket.ticket_id = 0;
        ticket.device_id = 0;
        ticket.account_id = 0;
        ticket.property_flags = 0;
    }

    *ticket_bytes = ticket.to_bytes();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ticket(rights_id: RightsId, key_generation: u8) -> Ticket {
        Ticket {
            signature: Signature::Rsa2048Sha256(HexData([0x11; 0x100])),
            issuer: NullString::from("Root-CA00000003-XS00000020"),
            title_key_block: HexData([0; 0x100]),
            format_version: 2,
            title_key_type: TitleKeyType::Common,
            ticket_version: 0,
            license_type: LicenseType::Permanent,
            crypto_type: key_generation,
            property_flags: 0,
            ticket_id: 0xdead,
            device_id: 0xbeef,
            rights_id,
            account_id: 7,
            sect_total_size: 0,
            sect_header_offset: 0x2c0,
            sect_num: 0,
            sect_entry_size: 0,
        }
    }

    fn test_keys() -> KeySet {
        KeySet::from_file_contents(
            "\
titlekek_00 = 000102030405060708090a0b0c0d0e0f
titlekek_03 = 101112131415161718191a1b1c1d1e1f
",
        )
        .unwrap()
    }

    #[test]
    fn round_trips_through_bytes() {
        let rights_id: RightsId = "0100000000000abc0000000000000003".parse().unwrap();
        let ticket = sample_ticket(rights_id, 3);
        let bytes = ticket.to_bytes();
        assert_eq!(bytes.len(), 0x2c0);

        let parsed = Ticket::parse(&bytes).unwrap();
        assert_eq!(parsed, ticket);
    }

    #[test]
    fn patch_rewraps_across_generations() {
        let keys = test_keys();
        let rights_id: RightsId = "0100000000000abc0000000000000000".parse().unwrap();

        let mut ticket = sample_ticket(rights_id, 0);
        let plain: AesKey = "deadbeefdeadbeefdeadbeefdeadbeef".parse().unwrap();
        let wrapped = keys.title_kek(0).unwrap().encrypt_key(plain);
        ticket.title_key_block.0[..0x10].copy_from_slice(&wrapped.0 .0);

        let mut bytes = ticket.to_bytes();
        patch_ticket(&mut bytes, &keys, 3, false).unwrap();

        let patched = Ticket::parse(&bytes).unwrap();
        assert_eq!(patched.crypto_type, 3);
        assert_eq!(patched.title_key_decrypted(&keys, 3).unwrap(), plain);

        // a second pass at the same generation changes nothing
        let before = bytes.clone();
        patch_ticket(&mut bytes, &keys, 3, false).unwrap();
        assert_eq!(bytes, before);
    }

    #[test]
    fn common_conversion_strips_personal_fields() {
        let keys = test_keys();
        let rights_id: RightsId = "0100000000000abc0000000000000000".parse().unwrap();
        let mut bytes = sample_ticket(rights_id, 0).to_bytes();

        patch_ticket(&mut bytes, &keys, 0, true).unwrap();
        let patched = Ticket::parse(&bytes).unwrap();
        assert_eq!(patched.ticket_id, 0);
        assert_eq!(patched.device_id, 0);
        assert_eq!(patched.account_id, 0);
        assert_eq!(patched.rights_id, rights_id);
    }
}
