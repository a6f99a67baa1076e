// Copyright (c) 2026-present, flashfs contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Path parsing, directory-id allocation, and the bookmark/stickynote
//! tags that back directory creation and pending file creates (spec
//! §4 path/name resolution, §3 "Lifecycles").
//!
//! Names are scoped to a directory by `did` rather than a full path, so
//! resolving `"a/b/c"` is one did-scoped lookup per component. `.` stays
//! on the current did; `..` needs the parent did, which the walker
//! tracks as it descends — the tree itself carries no back-pointers.

use crate::data::Data;
use crate::rbyd::attr;
use crate::tag::Tag;

/// The root directory's did is fixed; every other did is allocated.
pub const ROOT_DID: u32 = 0;

/// Hands out fresh directory ids. Root is reserved; ids climb from 1.
#[derive(Clone, Debug, Default)]
pub struct DidAllocator {
    next: u32,
}

impl DidAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Resumes allocation after a mount-time scan found `highest` as the
    /// greatest did already in use (`0` if only the root exists).
    #[must_use]
    pub fn from_high_watermark(highest: u32) -> Self {
        Self { next: highest + 1 }
    }

    pub fn alloc(&mut self) -> u32 {
        let did = self.next;
        self.next += 1;
        did
    }
}

/// One parsed path component.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Component<'a> {
    CurDir,
    ParentDir,
    Named(&'a [u8]),
}

/// Splits `path` on `/`, dropping empty segments (so `"a//b/"` parses the
/// same as `"a/b"`), classifying `.` and `..`.
#[must_use]
pub fn split(path: &str) -> Vec<Component<'_>> {
    path.split('/')
        .filter(|seg| !seg.is_empty())
        .map(|seg| match seg {
            "." => Component::CurDir,
            ".." => Component::ParentDir,
            name => Component::Named(name.as_bytes()),
        })
        .collect()
}

/// Tracks the did stack while walking a path, so `..` can climb back to
/// a parent without a second lookup.
#[derive(Clone, Debug)]
pub struct Walker {
    stack: Vec<u32>,
}

impl Walker {
    #[must_use]
    pub fn new(start_did: u32) -> Self {
        Self { stack: vec![start_did] }
    }

    #[must_use]
    pub fn current(&self) -> u32 {
        *self.stack.last().expect("always has a current did")
    }

    pub fn enter(&mut self, did: u32) {
        self.stack.push(did);
    }

    /// Climbs to the parent did, if any (`..` at the root is a no-op,
    /// same as a shell's).
    pub fn leave(&mut self) {
        if self.stack.len() > 1 {
            self.stack.pop();
        }
    }
}

/// Walks `components` starting from `start_did`, resolving every
/// intermediate `Named` component to its did via `lookup_did`. Returns
/// the did the final component should be looked up in, plus that final
/// component's name (`None` if the path is empty or ends in `.`/`..`,
/// meaning it names the directory itself).
pub fn resolve<'a>(
    start_did: u32,
    components: &[Component<'a>],
    mut lookup_did: impl FnMut(u32, &[u8]) -> crate::Result<u32>,
) -> crate::Result<(u32, Option<&'a [u8]>)> {
    let mut walker = Walker::new(start_did);
    for (i, component) in components.iter().enumerate() {
        let is_last = i + 1 == components.len();
        match component {
            Component::CurDir => {}
            Component::ParentDir => walker.leave(),
            Component::Named(name) => {
                if is_last {
                    return Ok((walker.current(), Some(name)));
                }
                let did = lookup_did(walker.current(), name)?;
                walker.enter(did);
            }
        }
    }
    Ok((walker.current(), None))
}

/// The tag a brand new file carries before its first sync: a reserved
/// mid, not yet a real entry.
#[must_use]
pub fn stickynote_tag(did: u32, name: &[u8]) -> (Tag, Data) {
    (Tag::Stickynote, Data::from_buf(attr::encode_name(did, name)))
}

/// The tag a stickynote becomes on its first successful sync — same
/// payload, different tag, so the rewrite is a single atomic `set`.
#[must_use]
pub fn promote_stickynote_tag(did: u32, name: &[u8]) -> (Tag, Data) {
    (Tag::Reg, Data::from_buf(attr::encode_name(did, name)))
}

/// The tag a freshly created directory's bookmark entry carries,
/// anchoring its did in the parent's namespace even after every real
/// entry inside the directory is removed.
#[must_use]
pub fn bookmark_tag(did: u32, name: &[u8]) -> (Tag, Data) {
    (Tag::Bookmark, Data::from_buf(attr::encode_name(did, name)))
}

/// The tag a directory entry itself carries (`DIR` + did).
#[must_use]
pub fn dir_tag(did: u32, name: &[u8]) -> (Tag, Data) {
    (Tag::Dir, Data::from_buf(attr::encode_name(did, name)))
}

pub fn decode_name_tag(data: &Data) -> crate::Result<(u32, Vec<u8>)> {
    let Data::Buf(b) = data else { return Err(crate::Error::Corrupt) };
    attr::decode_name(b.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_drops_empty_segments_and_classifies_dots() {
        let parsed = split("/a//./b/../c/");
        assert_eq!(
            parsed,
            vec![
                Component::Named(b"a"),
                Component::CurDir,
                Component::Named(b"b"),
                Component::ParentDir,
                Component::Named(b"c"),
            ]
        );
    }

    #[test]
    fn resolve_walks_intermediate_dids_and_stops_at_the_leaf() {
        let components = split("sub/file.txt");
        let (did, leaf) = resolve(ROOT_DID, &components, |did, name| {
            assert_eq!(did, ROOT_DID);
            assert_eq!(name, b"sub");
            Ok(7)
        })
        .unwrap();
        assert_eq!(did, 7);
        assert_eq!(leaf, Some(&b"file.txt"[..]));
    }

    #[test]
    fn resolve_parent_dir_climbs_the_walker_stack() {
        let components = split("sub/../other");
        let mut seen = Vec::new();
        let (did, leaf) = resolve(ROOT_DID, &components, |did, name| {
            seen.push((did, name.to_vec()));
            Ok(42)
        })
        .unwrap();
        // "sub" resolves from root to did 42, then ".." pops back to
        // root, so "other" (the leaf) is looked up relative to root.
        assert_eq!(did, ROOT_DID);
        assert_eq!(leaf, Some(&b"other"[..]));
        assert_eq!(seen, vec![(ROOT_DID, b"sub".to_vec())]);
    }

    #[test]
    fn resolve_propagates_lookup_errors() {
        let components = split("missing/leaf");
        let err = resolve(ROOT_DID, &components, |_, _| Err(crate::Error::NoEnt));
        assert!(matches!(err, Err(crate::Error::NoEnt)));
    }

    #[test]
    fn did_allocator_climbs_from_one() {
        let mut dids = DidAllocator::new();
        assert_eq!(dids.alloc(), 1);
        assert_eq!(dids.alloc(), 2);
    }

    #[test]
    fn stickynote_promotes_to_reg_with_the_same_name() {
        let (tag, data) = stickynote_tag(3, b"draft");
        assert_eq!(tag, Tag::Stickynote);
        let (did, name) = decode_name_tag(&data).unwrap();
        assert_eq!((did, name.as_slice()), (3, b"draft".as_slice()));

        let (tag, data) = promote_stickynote_tag(3, b"draft");
        assert_eq!(tag, Tag::Reg);
        let (did, name) = decode_name_tag(&data).unwrap();
        assert_eq!((did, name.as_slice()), (3, b"draft".as_slice()));
    }
}
