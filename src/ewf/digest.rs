use std::io::{self, Write};

use super::section::{push_checksummed, split_checksummed, SectionError, SectionHeader, SectionType};

pub const MD5_LEN: usize = 16;
pub const SHA1_LEN: usize = 20;
pub const DIGEST_BODY_SIZE: usize = 80;
pub const HASH_BODY_SIZE: usize = 36;

/// `digest` section: MD5 and SHA-1 of the acquired media.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestSection {
    pub md5:  [u8; MD5_LEN],
    pub sha1: [u8; SHA1_LEN],
}

impl DigestSection {
    pub fn body_bytes(&self) -> io::Result<Vec<u8>> {
        let mut fields = Vec::with_capacity(DIGEST_BODY_SIZE - 4);
        fields.extend_from_slice(&self.md5);
        fields.extend_from_slice(&self.sha1);
        fields.extend_from_slice(&[0u8; 40]);
        let mut body = Vec::with_capacity(DIGEST_BODY_SIZE);
        push_checksummed(&mut body, &fields)?;
        Ok(body)
    }

    pub fn write<W: Write>(&self, mut writer: W, offset: u64) -> io::Result<u64> {
        let header = SectionHeader::with_body(SectionType::Digest, offset, DIGEST_BODY_SIZE as u64);
        header.write(&mut writer)?;
        writer.write_all(&self.body_bytes()?)?;
        Ok(header.next_offset)
    }

    pub fn parse(body: &[u8]) -> Result<Self, SectionError> {
        let fields = split_checksummed(fixed(body, DIGEST_BODY_SIZE, "digest")?, "digest")?;
        let mut section = Self::default();
        section.md5.copy_from_slice(&fields[..MD5_LEN]);
        section.sha1.copy_from_slice(&fields[MD5_LEN..MD5_LEN + SHA1_LEN]);
        Ok(section)
    }
}

/// `hash` section: MD5 only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HashSection {
    pub md5: [u8; MD5_LEN],
}

impl HashSection {
    pub fn body_bytes(&self) -> io::Result<Vec<u8>> {
        let mut fields = Vec::with_capacity(HASH_BODY_SIZE - 4);
        fields.extend_from_slice(&self.md5);
        fields.extend_from_slice(&[0u8; 16]);
        let mut body = Vec::with_capacity(HASH_BODY_SIZE);
        push_checksummed(&mut body, &fields)?;
        Ok(body)
    }

    pub fn write<W: Write>(&self, mut writer: W, offset: u64) -> io::Result<u64> {
        let header = SectionHeader::with_body(SectionType::Hash, offset, HASH_BODY_SIZE as u64);
        header.write(&mut writer)?;
        writer.write_all(&self.body_bytes()?)?;
        Ok(header.next_offset)
    }

    pub fn parse(body: &[u8]) -> Result<Self, SectionError> {
        let fields = split_checksummed(fixed(body, HASH_BODY_SIZE, "hash")?, "hash")?;
        let mut section = Self::default();
        section.md5.copy_from_slice(&fields[..MD5_LEN]);
        Ok(section)
    }
}

fn fixed<'a>(body: &'a [u8], len: usize, what: &str) -> Result<&'a [u8], SectionError> {
    body.get(..len).ok_or_else(|| SectionError::Malformed {
        what:   what.to_owned(),
        reason: format!("{} bytes, expected {len}", body.len()),
    })
}
