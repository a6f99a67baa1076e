// Copyright (c) 2026-present, flashfs contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The 16-bit tag taxonomy (spec §3 "Tag").
//!
//! On disk a tag is a plain `u16`. The high bit doubles as the commit's
//! "valid bit" (spec §6): it is not part of the logical tag value and is
//! stripped/reinserted by the rbyd layer, never stored in [`RawTag`]. The
//! remaining 15 bits split into a 4-bit `mode`, and an 11-bit
//! `suptype:subtype` pair whose exact split depends on the mode. Modelled
//! as a sum type per the design notes rather than bit-twiddled everywhere
//! a tag is inspected.

/// The `mode` nibble (top 4 bits of the 15-bit logical tag).
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Mode {
    Config = 0x0,
    GDelta = 0x1,
    Name = 0x2,
    Struct = 0x3,
    Attr = 0x4,
    Shrub = 0x5,
    Alt = 0xe,
    Cksum = 0xf,
}

impl Mode {
    fn from_nibble(n: u8) -> Option<Self> {
        Some(match n {
            0x0 => Self::Config,
            0x1 => Self::GDelta,
            0x2 => Self::Name,
            0x3 => Self::Struct,
            0x4 => Self::Attr,
            0x5 => Self::Shrub,
            0xe => Self::Alt,
            0xf => Self::Cksum,
            _ => return None,
        })
    }
}

/// Direction of an alt-pointer's threshold comparison.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AltDir {
    /// Follow when the search key is lexicographically `<=` the threshold.
    Le,
    /// Follow when the search key is `>` the threshold.
    Gt,
}

/// Colour of an alt-pointer in the red-black-yellow balance scheme.
/// "Yellow" (two reds in a row) is a transient state during append, never
/// committed, so only `Black`/`Red` are represented on disk.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AltColor {
    Black,
    Red,
}

/// Width of a wide-tag-mask delete (spec §3/§4.2 "MASK0/2/8/12"): the
/// number of low subtype bits a single `Rm` record wildcards, letting one
/// logical delete cover up to `2^bits()` tags of the same mode in one rid
/// without a separate record per tag.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MaskWidth {
    Mask0,
    Mask2,
    Mask8,
    Mask12,
}

impl MaskWidth {
    #[must_use]
    pub fn bits(self) -> u32 {
        match self {
            Self::Mask0 => 0,
            Self::Mask2 => 2,
            Self::Mask8 => 8,
            Self::Mask12 => 12,
        }
    }

    /// Whether `subtype` falls inside the wildcarded group anchored at
    /// `group`, i.e. the two agree on every bit above this mask's width.
    #[must_use]
    pub fn covers(self, group: u16, subtype: u16) -> bool {
        let shift = self.bits();
        if shift >= 16 {
            return true;
        }
        (group >> shift) == (subtype >> shift)
    }
}

/// Reserves the top 4 sub-values of every mode's 11-bit subtype space
/// (no real subtag in this taxonomy uses a value anywhere near this high)
/// to mark a record as a wide-tag-mask delete rather than an ordinary tag.
const RM_SENTINEL_BASE: u16 = 0x7fc;

/// A fully decoded logical tag (everything except the payload).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Tag {
    // --- config mode ---
    Magic,
    Version,
    RCompat,
    WCompat,
    OCompat,
    Geometry,
    NameLimit,
    FileLimit,

    // --- gdelta mode ---
    GrmDelta,
    GCksumDelta,

    // --- name mode ---
    MName,
    Did,
    Name,
    BName,
    Bookmark,
    Stickynote,
    Reg,
    Dir,

    // --- struct mode ---
    MDir,
    MTree,
    MRoot,
    Branch,
    BShrub,
    BTree,
    Block,
    Data,

    // --- attr mode: user-defined, 0-255 ---
    Attr(u8),

    // --- shrub mode: an inline secondary trunk tag living in an mdir ---
    ShrubCommit,

    // --- alt mode ---
    Alt {
        dir: AltDir,
        color: AltColor,
    },

    // --- cksum mode ---
    ECksum,
    Cksum,

    /// Wide-tag-mask delete (spec §3/§4.2): removes every tag of `target`'s
    /// mode whose subtype shares `target`'s high bits above `width`.
    Rm { target: Mode, width: MaskWidth },
}

impl Tag {
    /// Returns this tag's on-disk mode nibble.
    #[must_use]
    pub fn mode(self) -> Mode {
        match self {
            Self::Magic
            | Self::Version
            | Self::RCompat
            | Self::WCompat
            | Self::OCompat
            | Self::Geometry
            | Self::NameLimit
            | Self::FileLimit => Mode::Config,

            Self::GrmDelta | Self::GCksumDelta => Mode::GDelta,

            Self::MName
            | Self::Did
            | Self::Name
            | Self::BName
            | Self::Bookmark
            | Self::Stickynote
            | Self::Reg
            | Self::Dir => Mode::Name,

            Self::MDir
            | Self::MTree
            | Self::MRoot
            | Self::Branch
            | Self::BShrub
            | Self::BTree
            | Self::Block
            | Self::Data => Mode::Struct,

            Self::Attr(_) => Mode::Attr,
            Self::ShrubCommit => Mode::Shrub,
            Self::Alt { .. } => Mode::Alt,
            Self::ECksum | Self::Cksum => Mode::Cksum,
            Self::Rm { target, .. } => target,
        }
    }

    /// Whether this tag is an inner alt-pointer (vs a leaf record).
    #[must_use]
    pub fn is_alt(self) -> bool {
        matches!(self, Self::Alt { .. })
    }

    /// Packs this tag into its 15-bit logical value (valid bit excluded).
    #[must_use]
    pub fn encode(self) -> u16 {
        let (mode, sub): (u8, u16) = match self {
            Self::Magic => (0x0, 0x001),
            Self::Version => (0x0, 0x002),
            Self::RCompat => (0x0, 0x003),
            Self::WCompat => (0x0, 0x004),
            Self::OCompat => (0x0, 0x005),
            Self::Geometry => (0x0, 0x006),
            Self::NameLimit => (0x0, 0x007),
            Self::FileLimit => (0x0, 0x008),

            Self::GrmDelta => (0x1, 0x001),
            Self::GCksumDelta => (0x1, 0x002),

            Self::MName => (0x2, 0x000),
            Self::Did => (0x2, 0x001),
            Self::Name => (0x2, 0x002),
            Self::BName => (0x2, 0x003),
            Self::Bookmark => (0x2, 0x004),
            Self::Stickynote => (0x2, 0x005),
            Self::Reg => (0x2, 0x006),
            Self::Dir => (0x2, 0x007),

            Self::MDir => (0x3, 0x001),
            Self::MTree => (0x3, 0x002),
            Self::MRoot => (0x3, 0x003),
            Self::Branch => (0x3, 0x004),
            Self::BShrub => (0x3, 0x005),
            Self::BTree => (0x3, 0x006),
            Self::Block => (0x3, 0x007),
            Self::Data => (0x3, 0x008),

            Self::Attr(kind) => (0x4, u16::from(kind)),
            Self::ShrubCommit => (0x5, 0x000),

            Self::Alt { dir, color } => {
                let mut bits: u16 = 0;
                if dir == AltDir::Gt {
                    bits |= 0b01;
                }
                if color == AltColor::Red {
                    bits |= 0b10;
                }
                (0xe, bits)
            }

            Self::ECksum => (0xf, 0x001),
            Self::Cksum => (0xf, 0x002),

            Self::Rm { target, width } => {
                let mode = match target {
                    Mode::Config => 0x0,
                    Mode::GDelta => 0x1,
                    Mode::Name => 0x2,
                    Mode::Struct => 0x3,
                    Mode::Attr => 0x4,
                    Mode::Shrub => 0x5,
                    Mode::Alt => 0xe,
                    Mode::Cksum => 0xf,
                };
                let code: u16 = match width {
                    MaskWidth::Mask0 => 0,
                    MaskWidth::Mask2 => 1,
                    MaskWidth::Mask8 => 2,
                    MaskWidth::Mask12 => 3,
                };
                (mode, RM_SENTINEL_BASE | code)
            }
        };
        (u16::from(mode) << 11) | (sub & 0x7ff)
    }

    /// Unpacks a 15-bit logical value back into a [`Tag`].
    pub fn decode(value: u16) -> crate::Result<Self> {
        let mode_nibble = (value >> 11) as u8 & 0xf;
        let sub = value & 0x7ff;
        let mode = Mode::from_nibble(mode_nibble).ok_or(crate::Error::Corrupt)?;

        if (sub & !0b11) == RM_SENTINEL_BASE {
            let width = match sub & 0b11 {
                0 => MaskWidth::Mask0,
                1 => MaskWidth::Mask2,
                2 => MaskWidth::Mask8,
                _ => MaskWidth::Mask12,
            };
            return Ok(Self::Rm { target: mode, width });
        }

        Ok(match mode {
            Mode::Config => match sub {
                0x001 => Self::Magic,
                0x002 => Self::Version,
                0x003 => Self::RCompat,
                0x004 => Self::WCompat,
                0x005 => Self::OCompat,
                0x006 => Self::Geometry,
                0x007 => Self::NameLimit,
                0x008 => Self::FileLimit,
                _ => return Err(crate::Error::Corrupt),
            },
            Mode::GDelta => match sub {
                0x001 => Self::GrmDelta,
                0x002 => Self::GCksumDelta,
                _ => return Err(crate::Error::Corrupt),
            },
            Mode::Name => match sub {
                0x000 => Self::MName,
                0x001 => Self::Did,
                0x002 => Self::Name,
                0x003 => Self::BName,
                0x004 => Self::Bookmark,
                0x005 => Self::Stickynote,
                0x006 => Self::Reg,
                0x007 => Self::Dir,
                _ => return Err(crate::Error::Corrupt),
            },
            Mode::Struct => match sub {
                0x001 => Self::MDir,
                0x002 => Self::MTree,
                0x003 => Self::MRoot,
                0x004 => Self::Branch,
                0x005 => Self::BShrub,
                0x006 => Self::BTree,
                0x007 => Self::Block,
                0x008 => Self::Data,
                _ => return Err(crate::Error::Corrupt),
            },
            Mode::Attr => {
                if sub > 0xff {
                    return Err(crate::Error::Corrupt);
                }
                Self::Attr(sub as u8)
            }
            Mode::Shrub => Self::ShrubCommit,
            Mode::Alt => Self::Alt {
                dir: if sub & 0b01 != 0 { AltDir::Gt } else { AltDir::Le },
                color: if sub & 0b10 != 0 { AltColor::Red } else { AltColor::Black },
            },
            Mode::Cksum => match sub {
                0x001 => Self::ECksum,
                0x002 => Self::Cksum,
                _ => return Err(crate::Error::Corrupt),
            },
        })
    }
}

/// The "key" half of an rbyd's `(rid, tag_key)` ordering: two tags with
/// the same rid are ordered by this value, lowest first, so structural
/// tags (NAME, STRUCT, ATTR, ...) have a stable relative order within one
/// rid's record run.
#[must_use]
pub fn sort_key(tag: Tag) -> u16 {
    tag.encode()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_every_fixed_tag() {
        let tags = [
            Tag::Magic,
            Tag::Version,
            Tag::RCompat,
            Tag::WCompat,
            Tag::OCompat,
            Tag::Geometry,
            Tag::NameLimit,
            Tag::FileLimit,
            Tag::GrmDelta,
            Tag::GCksumDelta,
            Tag::MName,
            Tag::Did,
            Tag::Name,
            Tag::BName,
            Tag::Bookmark,
            Tag::Stickynote,
            Tag::Reg,
            Tag::Dir,
            Tag::MDir,
            Tag::MTree,
            Tag::MRoot,
            Tag::Branch,
            Tag::BShrub,
            Tag::BTree,
            Tag::Block,
            Tag::Data,
            Tag::ShrubCommit,
            Tag::ECksum,
            Tag::Cksum,
            Tag::Attr(0),
            Tag::Attr(255),
        ];
        for tag in tags {
            let encoded = tag.encode();
            assert_eq!(Tag::decode(encoded).unwrap(), tag);
        }
    }

    #[test]
    fn roundtrips_every_alt_variant() {
        for dir in [AltDir::Le, AltDir::Gt] {
            for color in [AltColor::Black, AltColor::Red] {
                let tag = Tag::Alt { dir, color };
                assert_eq!(Tag::decode(tag.encode()).unwrap(), tag);
            }
        }
    }

    #[test]
    fn unknown_mode_is_corrupt() {
        // mode nibble 0xd is unused.
        let value = (0xd_u16 << 11) | 0x001;
        assert!(Tag::decode(value).is_err());
    }

    #[test]
    fn roundtrips_every_rm_variant() {
        let targets = [Mode::Config, Mode::Name, Mode::Struct, Mode::Attr];
        let widths = [MaskWidth::Mask0, MaskWidth::Mask2, MaskWidth::Mask8, MaskWidth::Mask12];
        for target in targets {
            for width in widths {
                let tag = Tag::Rm { target, width };
                assert_eq!(Tag::decode(tag.encode()).unwrap(), tag);
            }
        }
    }

    #[test]
    fn mask_width_covers_aligned_groups() {
        assert!(MaskWidth::Mask2.covers(0b1100, 0b1111));
        assert!(!MaskWidth::Mask2.covers(0b1100, 0b1000_0000));
        assert!(MaskWidth::Mask0.covers(5, 5));
        assert!(!MaskWidth::Mask0.covers(5, 6));
    }
}
