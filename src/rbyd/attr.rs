// Copyright (c) 2026-present, flashfs contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Builder types for the edits one `Rbyd::append` call applies (spec §4.2
//! "Append"): structural rid operations (create/delete/grow a slot) plus
//! per-rid tag upserts/removals. Modelled as typed values that know how to
//! describe themselves, rather than the corpus's macro-generated
//! lazily-encoded attribute structs, per the design notes.

use crate::data::Data;
use crate::tag::{MaskWidth, Mode, Tag};

/// A structural change to the rid space, applied before any [`Rattr`]s in
/// the same batch.
#[derive(Clone, Debug)]
pub enum RidOp {
    /// Inserts a brand new rid at index `at`, shifting every existing rid
    /// `>= at` up by one, with initial `weight`.
    Create { at: u32, weight: u32 },
    /// Removes the rid at index `at` entirely, shifting every rid `> at`
    /// down by one.
    Delete { at: u32 },
    /// Removes `count` contiguous rids starting at `at` in one structural
    /// op, rather than one `Delete` at a time: the balanced rebuild a
    /// commit performs over whatever rids remain doesn't care how the gap
    /// was described, but batching it avoids re-deriving the same split
    /// points `count` times over.
    DeleteRange { at: u32, count: u32 },
    /// Adjusts the weight of the rid at index `at` by `delta` (may be
    /// negative, e.g. truncating a file's tail bptr).
    Grow { at: u32, delta: i32 },
}

/// A single tag upsert or removal against an existing rid.
#[derive(Clone, Debug)]
pub struct Rattr {
    pub rid: u32,
    pub tag: Tag,
    /// `None` removes this tag from the rid; `Some` sets/replaces it.
    pub data: Option<Data>,
}

impl Rattr {
    #[must_use]
    pub fn set(rid: u32, tag: Tag, data: Data) -> Self {
        Self {
            rid,
            tag,
            data: Some(data),
        }
    }

    #[must_use]
    pub fn remove(rid: u32, tag: Tag) -> Self {
        Self {
            rid,
            tag,
            data: None,
        }
    }

    /// Removes every tag of `target`'s mode on `rid` whose subtype shares
    /// `anchor`'s high bits at `width` (spec §3/§4.2 "MASK0/2/8/12"), in
    /// one record instead of one `remove` per matching tag. `anchor`
    /// carries the subtype group being wildcarded; it rides along as this
    /// attr's payload since [`Tag::Rm`] itself has no room left to encode
    /// it (its 11-bit subtype space is entirely consumed by the sentinel
    /// and width code, see `tag.rs`).
    #[must_use]
    pub fn remove_masked(rid: u32, target: Mode, width: MaskWidth, anchor: u16) -> Self {
        let mut payload = Vec::with_capacity(2);
        crate::coding::write_be16(&mut payload, anchor).expect("vec write cannot fail");
        Self {
            rid,
            tag: Tag::Rm { target, width },
            data: Some(Data::from_buf(payload)),
        }
    }
}

/// A batch of structural ops and tag edits applied atomically by one
/// `Rbyd::append` call.
#[derive(Clone, Debug, Default)]
pub struct Edit {
    pub ops: Vec<RidOp>,
    pub attrs: Vec<Rattr>,
}

impl Edit {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, at: u32, weight: u32) -> &mut Self {
        self.ops.push(RidOp::Create { at, weight });
        self
    }

    pub fn delete(&mut self, at: u32) -> &mut Self {
        self.ops.push(RidOp::Delete { at });
        self
    }

    pub fn delete_range(&mut self, at: u32, count: u32) -> &mut Self {
        self.ops.push(RidOp::DeleteRange { at, count });
        self
    }

    pub fn grow(&mut self, at: u32, delta: i32) -> &mut Self {
        self.ops.push(RidOp::Grow { at, delta });
        self
    }

    pub fn set(&mut self, rid: u32, tag: Tag, data: Data) -> &mut Self {
        self.attrs.push(Rattr::set(rid, tag, data));
        self
    }

    pub fn unset(&mut self, rid: u32, tag: Tag) -> &mut Self {
        self.attrs.push(Rattr::remove(rid, tag));
        self
    }

    pub fn unset_masked(&mut self, rid: u32, target: Mode, width: MaskWidth, anchor: u16) -> &mut Self {
        self.attrs.push(Rattr::remove_masked(rid, target, width, anchor));
        self
    }
}

/// Encodes a `(did, name)` pair as the payload shared by NAME/BNAME/
/// BOOKMARK/STICKYNOTE/REG/DIR tags: `leb128 did | bytes name`.
#[must_use]
pub fn encode_name(did: u32, name: &[u8]) -> Vec<u8> {
    let mut buf = vec![];
    crate::coding::write_leb128_u32(&mut buf, did).expect("vec write cannot fail");
    buf.extend_from_slice(name);
    buf
}

/// Decodes a `(did, name)` payload written by [`encode_name`].
pub fn decode_name(buf: &[u8]) -> crate::Result<(u32, Vec<u8>)> {
    let mut cursor = buf;
    let did = crate::coding::read_leb128_u32(&mut cursor)?;
    let consumed = buf.len() - cursor.len();
    Ok((did, buf[consumed..].to_vec()))
}

/// Encodes a bptr payload: `leb128 size | leb128 block | leb128 off |
/// leb128 cksize | le32 cksum`.
#[must_use]
pub fn encode_bptr(size: u32, block: u32, off: u32, cksize: u32, cksum: u32) -> Vec<u8> {
    let mut buf = vec![];
    let w = &mut buf;
    crate::coding::write_leb128_u32(w, size).unwrap();
    crate::coding::write_leb128_u32(w, block).unwrap();
    crate::coding::write_leb128_u32(w, off).unwrap();
    crate::coding::write_leb128_u32(w, cksize).unwrap();
    crate::coding::write_le32(w, cksum).unwrap();
    buf
}

/// Decodes a bptr payload written by [`encode_bptr`].
pub fn decode_bptr(buf: &[u8]) -> crate::Result<(u32, u32, u32, u32, u32)> {
    let mut cursor = buf;
    let size = crate::coding::read_leb128_u32(&mut cursor)?;
    let block = crate::coding::read_leb128_u32(&mut cursor)?;
    let off = crate::coding::read_leb128_u32(&mut cursor)?;
    let cksize = crate::coding::read_leb128_u32(&mut cursor)?;
    let cksum = crate::coding::read_le32(&mut cursor)?;
    Ok((size, block, off, cksize, cksum))
}

/// Encodes a BRANCH/BTREE/MTREE payload: `leb128 weight | leb128 block |
/// leb128 trunk | le32 cksum`.
#[must_use]
pub fn encode_branch(weight: u32, block: u32, trunk: u32, cksum: u32) -> Vec<u8> {
    let mut buf = vec![];
    let w = &mut buf;
    crate::coding::write_leb128_u32(w, weight).unwrap();
    crate::coding::write_leb128_u32(w, block).unwrap();
    crate::coding::write_leb128_u32(w, trunk).unwrap();
    crate::coding::write_le32(w, cksum).unwrap();
    buf
}

/// Decodes a BRANCH/BTREE/MTREE payload written by [`encode_branch`].
pub fn decode_branch(buf: &[u8]) -> crate::Result<(u32, u32, u32, u32)> {
    let mut cursor = buf;
    let weight = crate::coding::read_leb128_u32(&mut cursor)?;
    let block = crate::coding::read_leb128_u32(&mut cursor)?;
    let trunk = crate::coding::read_leb128_u32(&mut cursor)?;
    let cksum = crate::coding::read_le32(&mut cursor)?;
    Ok((weight, block, trunk, cksum))
}

/// Encodes a SHRUB payload: `leb128 weight | leb128 trunk` (the containing
/// block is implicit).
#[must_use]
pub fn encode_shrub(weight: u32, trunk: u32) -> Vec<u8> {
    let mut buf = vec![];
    let w = &mut buf;
    crate::coding::write_leb128_u32(w, weight).unwrap();
    crate::coding::write_leb128_u32(w, trunk).unwrap();
    buf
}

/// Decodes a SHRUB payload written by [`encode_shrub`].
pub fn decode_shrub(buf: &[u8]) -> crate::Result<(u32, u32)> {
    let mut cursor = buf;
    let weight = crate::coding::read_leb128_u32(&mut cursor)?;
    let trunk = crate::coding::read_leb128_u32(&mut cursor)?;
    Ok((weight, trunk))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_roundtrip() {
        let encoded = encode_name(7, b"hello.txt");
        let (did, name) = decode_name(&encoded).unwrap();
        assert_eq!(did, 7);
        assert_eq!(name, b"hello.txt");
    }

    #[test]
    fn bptr_roundtrip() {
        let encoded = encode_bptr(4096, 12, 0, 4096, 0xdead_beef);
        assert_eq!(decode_bptr(&encoded).unwrap(), (4096, 12, 0, 4096, 0xdead_beef));
    }

    #[test]
    fn branch_roundtrip() {
        let encoded = encode_branch(42, 3, 128, 0x1234_5678);
        assert_eq!(decode_branch(&encoded).unwrap(), (42, 3, 128, 0x1234_5678));
    }
}
