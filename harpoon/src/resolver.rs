// Copyright (c) Harpoon developers, 2024, licensed under the EUPL-1.2-or-later.
//
// See LICENSE at the root of this repository (or a legal translation in LICENSE-translations).

use std::cmp::Ordering;

use goblin::elf::program_header::{ProgramHeader, PF_X, PT_LOAD};

/// The executable, loadable segments of an ELF file.
///
/// Uprobes are attached at file offsets, so symbol addresses have to be
/// translated through the segment that maps them.
#[derive(Debug, Default)]
pub struct SegmentMap {
    entries: Vec<SegmentMapEntry>,
}

impl SegmentMap {
    pub fn new(mut entries: Vec<SegmentMapEntry>) -> Self {
        entries.sort_by_key(SegmentMapEntry::address);
        Self { entries }
    }

    pub fn entries(&self) -> &[SegmentMapEntry] {
        &self.entries
    }

    fn entry_for(&self, addr: u64) -> Option<&SegmentMapEntry> {
        let Ok(entry) = self
            .entries()
            .binary_search_by(|entry| match entry.address().cmp(&addr) {
                Ordering::Less | Ordering::Equal => match entry.address_end().cmp(&addr) {
                    Ordering::Greater => Ordering::Equal,
                    Ordering::Less | Ordering::Equal => Ordering::Less,
                },
                Ordering::Greater => Ordering::Greater,
            })
        else {
            return None;
        };
        Some(&self.entries[entry])
    }
}

impl From<&[ProgramHeader]> for SegmentMap {
    fn from(headers: &[ProgramHeader]) -> Self {
        Self::new(
            headers
                .iter()
                .filter(|ph| ph.p_type == PT_LOAD && ph.p_flags & PF_X != 0)
                .map(|ph| SegmentMapEntry {
                    address: ph.p_vaddr,
                    address_end: ph.p_vaddr.saturating_add(ph.p_memsz),
                    offset: ph.p_offset,
                })
                .collect(),
        )
    }
}

/// A mapped range `[address, address_end)` backed by the file from `offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentMapEntry {
    address: u64,
    address_end: u64,
    offset: u64,
}

impl SegmentMapEntry {
    pub fn new(address: u64, address_end: u64, offset: u64) -> Self {
        Self {
            address,
            address_end,
            offset,
        }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn address_end(&self) -> u64 {
        self.address_end
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}

pub struct FileOffsetResolver<'a> {
    segments: &'a SegmentMap,
}

impl<'a> FileOffsetResolver<'a> {
    pub fn resolve_file_offset(&self, addr: u64) -> Option<u64> {
        let entry = self.segments.entry_for(addr)?;
        // offset into the range we found
        let offset_in_range = addr.checked_sub(entry.address())?;
        // offset into the file
        entry.offset().checked_add(offset_in_range)
    }
}

impl<'a> From<&'a SegmentMap> for FileOffsetResolver<'a> {
    fn from(segments: &'a SegmentMap) -> Self {
        Self { segments }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn map() -> SegmentMap {
        SegmentMap::new(vec![
            SegmentMapEntry::new(0x40_1000, 0x40_3000, 0x1000),
            SegmentMapEntry::new(0x20_0000, 0x20_0800, 0x0),
        ])
    }

    #[test]
    fn translates_inside_segment() {
        let map = map();
        let resolver = FileOffsetResolver::from(&map);
        assert_eq!(resolver.resolve_file_offset(0x40_1000), Some(0x1000));
        assert_eq!(resolver.resolve_file_offset(0x40_2abc), Some(0x2abc));
        assert_eq!(resolver.resolve_file_offset(0x20_0010), Some(0x10));
    }

    #[test]
    fn end_is_exclusive() {
        let map = map();
        let resolver = FileOffsetResolver::from(&map);
        assert_eq!(resolver.resolve_file_offset(0x40_3000), None);
        assert_eq!(resolver.resolve_file_offset(0x30_0000), None);
        assert_eq!(resolver.resolve_file_offset(0), None);
    }

    #[test]
    fn only_executable_load_segments_are_kept() {
        let mut text = ProgramHeader::default();
        text.p_type = PT_LOAD;
        text.p_flags = PF_X;
        text.p_vaddr = 0x1000;
        text.p_memsz = 0x100;
        text.p_offset = 0x800;

        let mut data = text.clone();
        data.p_flags = 0;
        data.p_vaddr = 0x4000;

        let map = SegmentMap::from([text, data].as_slice());
        assert_eq!(map.entries(), &[SegmentMapEntry::new(0x1000, 0x1100, 0x800)]);
    }
}
