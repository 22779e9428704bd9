//! Minimal CAR v1 reader and CID handling.
//!
//! Commit events carry their record blocks as a CAR v1 archive:
//!
//! ```text
//! [varint header_len][DAG-CBOR header {version: 1, roots: [..]}]
//! [varint section_len][CID][block bytes]
//! [varint section_len][CID][block bytes]
//! ...
//! ```
//!
//! Only CIDv1 is supported: `[varint version=1][varint codec][varint hash code]
//! [varint digest len][digest]`. Hashes are not verified; the blocks are only
//! used to recover post bodies.

use crate::error::{Error, Result};
use data_encoding::BASE32_NOPAD;
use std::collections::HashMap;
use std::fmt;

/// Multibase prefix for lowercase base32 without padding.
const MULTIBASE_BASE32: char = 'b';

/// Multibase "identity" prefix used when CIDs are embedded in DAG-CBOR.
const MULTIBASE_IDENTITY: u8 = 0x00;

/// A content identifier in its binary form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cid(Vec<u8>);

impl Cid {
    /// Parse a binary CIDv1 from the start of `bytes`.
    ///
    /// Returns the CID and the number of bytes it occupied.
    pub fn read(bytes: &[u8]) -> Result<(Self, usize)> {
        let mut pos = 0;
        let version = read_varint(bytes, &mut pos)?;
        if version != 1 {
            return Err(Error::Decode(format!("unsupported CID version {}", version)));
        }
        let _codec = read_varint(bytes, &mut pos)?;
        let _hash_code = read_varint(bytes, &mut pos)?;
        let digest_len = read_varint(bytes, &mut pos)? as usize;

        let end = pos
            .checked_add(digest_len)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| Error::Decode("CID digest runs past end of input".to_string()))?;

        Ok((Self(bytes[..end].to_vec()), end))
    }

    /// Parse the payload of a DAG-CBOR tag 42 (identity prefix + binary CID).
    pub fn from_tag_bytes(bytes: &[u8]) -> Result<Self> {
        match bytes.split_first() {
            Some((&MULTIBASE_IDENTITY, rest)) => {
                let (cid, used) = Self::read(rest)?;
                if used != rest.len() {
                    return Err(Error::Decode("trailing bytes after CID".to_string()));
                }
                Ok(cid)
            }
            _ => Err(Error::Decode(
                "CID link missing identity multibase prefix".to_string(),
            )),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Cid {
    /// Base32 multibase, the canonical string form on the network.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}",
            MULTIBASE_BASE32,
            BASE32_NOPAD.encode(&self.0).to_ascii_lowercase()
        )
    }
}

/// Blocks of a CAR archive, keyed by CID.
#[derive(Debug, Default)]
pub struct CarBlocks {
    blocks: HashMap<Cid, Vec<u8>>,
}

impl CarBlocks {
    /// Parse a CAR v1 archive.
    pub fn read(bytes: &[u8]) -> Result<Self> {
        let mut pos = 0;

        let header_len = read_varint(bytes, &mut pos)? as usize;
        pos = advance(bytes, pos, header_len, "CAR header")?;

        let mut blocks = HashMap::new();
        while pos < bytes.len() {
            let section_len = read_varint(bytes, &mut pos)? as usize;
            let start = pos;
            pos = advance(bytes, pos, section_len, "CAR section")?;

            let section = &bytes[start..pos];
            let (cid, cid_len) = Cid::read(section)?;
            blocks.insert(cid, section[cid_len..].to_vec());
        }

        Ok(Self { blocks })
    }

    pub fn get(&self, cid: &Cid) -> Option<&[u8]> {
        self.blocks.get(cid).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

fn advance(bytes: &[u8], pos: usize, len: usize, what: &str) -> Result<usize> {
    pos.checked_add(len)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| Error::Decode(format!("{} runs past end of input", what)))
}

/// Read an unsigned LEB128 varint at `*pos`, advancing `pos`.
pub(crate) fn read_varint(bytes: &[u8], pos: &mut usize) -> Result<u64> {
    let mut result: u64 = 0;
    let mut shift = 0;

    loop {
        let byte = *bytes
            .get(*pos)
            .ok_or_else(|| Error::Decode("truncated varint".to_string()))?;
        *pos += 1;

        result |= u64::from(byte & 0x7F) << shift;

        if byte & 0x80 == 0 {
            return Ok(result);
        }

        shift += 7;
        if shift >= 64 {
            return Err(Error::Decode("varint too long".to_string()));
        }
    }
}
