// Copyright (c) Harpoon developers, 2024, licensed under the EUPL-1.2-or-later.
//
// See LICENSE at the root of this repository (or a legal translation in LICENSE-translations).

//! Reading function bodies out of compiled binaries.

use std::path::{Path, PathBuf};
use std::{fs, io};

use goblin::elf::section_header::{SHN_LORESERVE, SHN_UNDEF, SHT_NOBITS};
use goblin::elf::sym::Sym;
use goblin::elf::Elf;
use goblin::strtab::Strtab;
use log::debug;
use thiserror::Error;

use crate::decoder::{Arch, DecodeError};
use crate::resolver::{FileOffsetResolver, SegmentMap};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("could not read binary {}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not parse {} as ELF", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: goblin::error::Error,
    },

    #[error("symbol `{symbol}` not found in {}", path.display())]
    SymbolNotFound { symbol: String, path: PathBuf },

    #[error("symbol `{symbol}` (0x{address:x}+{size}) lies outside section {section}")]
    SymbolOutOfBounds {
        symbol: String,
        address: u64,
        size: u64,
        section: usize,
    },

    #[error("no return instructions found in `{symbol}`")]
    NoReturnSites { symbol: String },

    #[error("could not decode `{symbol}`")]
    Decode {
        symbol: String,
        #[source]
        source: DecodeError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolEntry {
    pub name: String,
    pub section: usize,
    pub address: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionEntry {
    pub address: u64,
    pub offset: u64,
    pub size: u64,
    pub nobits: bool,
}

/// An executable read from disk, reduced to the tables needed to find code.
///
/// The file is read once by [`TargetBinary::open`] and not touched again.
#[derive(Debug)]
pub struct TargetBinary {
    path: PathBuf,
    machine: u16,
    symbols: Vec<SymbolEntry>,
    sections: Vec<SectionEntry>,
    segments: SegmentMap,
    data: Vec<u8>,
}

/// The machine code of one function, and where it lives.
#[derive(Debug, Clone, Copy)]
pub struct FunctionCode<'a> {
    pub symbol: &'a SymbolEntry,
    pub bytes: &'a [u8],
    /// Offset of the first instruction in the file, when an executable
    /// segment maps it.
    pub file_offset: Option<u64>,
}

impl FunctionCode<'_> {
    /// The address probes are attached relative to: the file offset when
    /// known, the virtual address otherwise.
    pub fn probe_base(&self) -> u64 {
        self.file_offset.unwrap_or(self.symbol.address)
    }
}

fn defined_symbols<'a>(
    syms: impl Iterator<Item = Sym> + 'a,
    strtab: &'a Strtab<'a>,
) -> impl Iterator<Item = SymbolEntry> + 'a {
    syms.filter(|sym| sym.st_shndx != SHN_UNDEF as usize && sym.st_shndx < SHN_LORESERVE as usize)
        .filter_map(move |sym| {
            let name = strtab.get_at(sym.st_name)?;
            (!name.is_empty()).then(|| SymbolEntry {
                name: name.to_owned(),
                section: sym.st_shndx,
                address: sym.st_value,
                size: sym.st_size,
            })
        })
}

impl TargetBinary {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ResolveError> {
        let path = path.as_ref().to_path_buf();
        let data = fs::read(&path).map_err(|source| ResolveError::Open {
            path: path.clone(),
            source,
        })?;

        let (machine, symbols, sections, segments) = {
            let elf = Elf::parse(&data).map_err(|source| ResolveError::Parse {
                path: path.clone(),
                source,
            })?;

            // static table first, then the dynamic one
            let symbols = defined_symbols(elf.syms.iter(), &elf.strtab)
                .chain(defined_symbols(elf.dynsyms.iter(), &elf.dynstrtab))
                .collect::<Vec<_>>();
            let sections = elf
                .section_headers
                .iter()
                .map(|sh| SectionEntry {
                    address: sh.sh_addr,
                    offset: sh.sh_offset,
                    size: sh.sh_size,
                    nobits: sh.sh_type == SHT_NOBITS,
                })
                .collect::<Vec<_>>();
            let segments = SegmentMap::from(elf.program_headers.as_slice());

            (elf.header.e_machine, symbols, sections, segments)
        };

        debug!(
            "read {}: {} symbols, {} sections, {} executable segments",
            path.display(),
            symbols.len(),
            sections.len(),
            segments.entries().len()
        );

        Ok(Self {
            path,
            machine,
            symbols,
            sections,
            segments,
            data,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn arch(&self) -> Result<Arch, DecodeError> {
        Arch::from_elf_machine(self.machine)
    }

    pub fn symbol(&self, name: &str) -> Result<&SymbolEntry, ResolveError> {
        self.symbols
            .iter()
            .find(|sym| sym.name == name)
            .ok_or_else(|| ResolveError::SymbolNotFound {
                symbol: name.to_owned(),
                path: self.path.clone(),
            })
    }

    /// Maps a virtual address to its file offset through the executable
    /// segment containing it.
    pub fn file_offset(&self, address: u64) -> Option<u64> {
        FileOffsetResolver::from(&self.segments).resolve_file_offset(address)
    }

    pub fn function(&self, name: &str) -> Result<FunctionCode<'_>, ResolveError> {
        let symbol = self.symbol(name)?;
        let out_of_bounds = || ResolveError::SymbolOutOfBounds {
            symbol: symbol.name.clone(),
            address: symbol.address,
            size: symbol.size,
            section: symbol.section,
        };

        let section = self
            .sections
            .get(symbol.section)
            .filter(|section| !section.nobits)
            .ok_or_else(out_of_bounds)?;

        let start = symbol
            .address
            .checked_sub(section.address)
            .ok_or_else(out_of_bounds)?;
        let end = start.checked_add(symbol.size).ok_or_else(out_of_bounds)?;
        if end > section.size {
            return Err(out_of_bounds());
        }

        let file_start = usize::try_from(section.offset + start).map_err(|_| out_of_bounds())?;
        let file_end = usize::try_from(section.offset + end).map_err(|_| out_of_bounds())?;
        let bytes = self.data.get(file_start..file_end).ok_or_else(out_of_bounds)?;

        Ok(FunctionCode {
            symbol,
            bytes,
            file_offset: self.file_offset(symbol.address),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use object::write::{Object, StandardSection, Symbol, SymbolSection};
    use object::{
        Architecture, BinaryFormat, Endianness, SymbolFlags, SymbolKind, SymbolScope,
    };
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn relocatable(functions: &[(&str, &[u8])]) -> NamedTempFile {
        let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
        let text = obj.section_id(StandardSection::Text);
        for (name, code) in functions {
            let value = obj.append_section_data(text, code, 16);
            obj.add_symbol(Symbol {
                name: name.as_bytes().to_vec(),
                value,
                size: code.len() as u64,
                kind: SymbolKind::Text,
                scope: SymbolScope::Linkage,
                weak: false,
                section: SymbolSection::Section(text),
                flags: SymbolFlags::None,
            });
        }
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&obj.write().unwrap()).unwrap();
        file
    }

    #[test]
    fn extracts_function_bytes() {
        let file = relocatable(&[("first", &[0x90, 0xc3]), ("second", &[0x55, 0x5d, 0xc3])]);
        let binary = TargetBinary::open(file.path()).unwrap();
        assert_eq!(binary.arch().unwrap(), Arch::X86_64);

        let second = binary.function("second").unwrap();
        assert_eq!(second.bytes, &[0x55, 0x5d, 0xc3]);
        assert_eq!(second.symbol.address, 16);
        // relocatable objects have no segments to translate through
        assert_eq!(second.file_offset, None);
        assert_eq!(second.probe_base(), 16);
    }

    #[test]
    fn missing_symbol() {
        let file = relocatable(&[("present", &[0xc3])]);
        let binary = TargetBinary::open(file.path()).unwrap();
        match binary.function("absent") {
            Err(ResolveError::SymbolNotFound { symbol, .. }) => assert_eq!(symbol, "absent"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn name_match_is_exact() {
        let file = relocatable(&[("main.run", &[0xc3])]);
        let binary = TargetBinary::open(file.path()).unwrap();
        assert!(binary.symbol("main.ru").is_err());
        assert!(binary.symbol("main.run").is_ok());
    }

    #[test]
    fn missing_file() {
        assert!(matches!(
            TargetBinary::open("/nonexistent/harpoon/binary"),
            Err(ResolveError::Open { .. })
        ));
    }

    #[test]
    fn not_an_elf() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"#!/bin/sh\nexit 0\n").unwrap();
        assert!(matches!(
            TargetBinary::open(file.path()),
            Err(ResolveError::Parse { .. })
        ));
    }
}
