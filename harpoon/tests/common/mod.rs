// Copyright (c) Harpoon developers, 2024, licensed under the EUPL-1.2-or-later.
//
// See LICENSE at the root of this repository (or a legal translation in LICENSE-translations).

#![allow(dead_code)]

use std::io::Write;
use std::sync::{Arc, Mutex};

use aya::maps::MapError;
use aya::programs::ProgramError;
use harpoon::probes::{ProbeSite, TargetComm};
use harpoon::{EventStream, ProbeBackend, ProbeError};
use object::elf;
use object::write::elf::{FileHeader, ProgramHeader, SectionHeader, Sym, Writer};
use object::write::{Object, StandardSection, Symbol, SymbolSection};
use object::{Architecture, BinaryFormat, Endianness, SymbolFlags, SymbolKind, SymbolScope};
use tempfile::NamedTempFile;

/// nop; ret; nop dword [rax]; ret
pub const X86_TWO_RETURNS: &[u8] = &[0x90, 0xc3, 0x0f, 0x1f, 0x00, 0xc3];
/// push rbp; pop rbp; nop
pub const X86_NO_RETURN: &[u8] = &[0x55, 0x5d, 0x90];

/// Writes a relocatable ELF object with one text symbol per function.
pub fn elf_object(arch: Architecture, functions: &[(&str, &[u8])]) -> NamedTempFile {
    let mut obj = Object::new(BinaryFormat::Elf, arch, Endianness::Little);
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
    file.flush().unwrap();
    file
}

pub fn x86_object(functions: &[(&str, &[u8])]) -> NamedTempFile {
    elf_object(Architecture::X86_64, functions)
}

/// Writes a stripped x86-64 shared object exporting `name` through its
/// dynamic symbol table only. One executable segment maps the whole file at
/// address zero, so addresses and file offsets coincide.
pub fn shared_object(name: &str, code: &[u8]) -> NamedTempFile {
    const DYNAMIC_ENTRIES: usize = 6;

    let mut data = Vec::new();
    {
        let mut writer = Writer::new(Endianness::Little, true, &mut data);

        writer.reserve_file_header();
        writer.reserve_program_headers(2);
        let text_name = writer.add_section_name(b".text");
        let text_index = writer.reserve_section_index();
        let text_offset = writer.reserve(code.len(), 16);

        let symbol_name = writer.add_dynamic_string(name.as_bytes());
        writer.reserve_dynamic_symbol_index();
        writer.reserve_dynsym_section_index();
        writer.reserve_dynstr_section_index();
        writer.reserve_hash_section_index();
        writer.reserve_dynamic_section_index();
        writer.reserve_shstrtab_section_index();

        let dynsym_offset = writer.reserve_dynsym() as u64;
        let dynstr_offset = writer.reserve_dynstr() as u64;
        let hash_offset = writer.reserve_hash(1, 2) as u64;
        let dynamic_offset = writer.reserve_dynamic(DYNAMIC_ENTRIES) as u64;
        writer.reserve_shstrtab();
        writer.reserve_section_headers();
        let len = writer.reserved_len() as u64;
        let dynamic_len = (DYNAMIC_ENTRIES * 16) as u64;

        writer
            .write_file_header(&FileHeader {
                os_abi: elf::ELFOSABI_NONE,
                abi_version: 0,
                e_type: elf::ET_DYN,
                e_machine: elf::EM_X86_64,
                e_entry: 0,
                e_flags: 0,
            })
            .unwrap();
        writer.write_align_program_headers();
        writer.write_program_header(&ProgramHeader {
            p_type: elf::PT_LOAD,
            p_flags: elf::PF_R | elf::PF_X,
            p_offset: 0,
            p_vaddr: 0,
            p_paddr: 0,
            p_filesz: len,
            p_memsz: len,
            p_align: 0x1000,
        });
        writer.write_program_header(&ProgramHeader {
            p_type: elf::PT_DYNAMIC,
            p_flags: elf::PF_R,
            p_offset: dynamic_offset,
            p_vaddr: dynamic_offset,
            p_paddr: dynamic_offset,
            p_filesz: dynamic_len,
            p_memsz: dynamic_len,
            p_align: 8,
        });

        writer.write_align(16);
        writer.write(code);

        writer.write_null_dynamic_symbol();
        writer.write_dynamic_symbol(&Sym {
            name: Some(symbol_name),
            section: Some(text_index),
            st_info: (elf::STB_GLOBAL << 4) | elf::STT_FUNC,
            st_other: elf::STV_DEFAULT,
            st_shndx: 0,
            st_value: text_offset as u64,
            st_size: code.len() as u64,
        });
        let dynstr_len = writer.dynstr_len() as u64;
        writer.write_dynstr();
        writer.write_hash(1, 2, |index| (index == 1).then_some(0));

        writer.write_align_dynamic();
        writer.write_dynamic(elf::DT_HASH, hash_offset);
        writer.write_dynamic(elf::DT_STRTAB, dynstr_offset);
        writer.write_dynamic(elf::DT_SYMTAB, dynsym_offset);
        writer.write_dynamic(elf::DT_STRSZ, dynstr_len);
        writer.write_dynamic(elf::DT_SYMENT, 24);
        writer.write_dynamic(elf::DT_NULL, 0);

        writer.write_shstrtab();

        writer.write_null_section_header();
        writer.write_section_header(&SectionHeader {
            name: Some(text_name),
            sh_type: elf::SHT_PROGBITS,
            sh_flags: (elf::SHF_ALLOC | elf::SHF_EXECINSTR).into(),
            sh_addr: text_offset as u64,
            sh_offset: text_offset as u64,
            sh_size: code.len() as u64,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 16,
            sh_entsize: 0,
        });
        writer.write_dynsym_section_header(dynsym_offset, 1);
        writer.write_dynstr_section_header(dynstr_offset);
        writer.write_hash_section_header(hash_offset);
        writer.write_dynamic_section_header(dynamic_offset);
        writer.write_shstrtab_section_header();
    }

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&data).unwrap();
    file.flush().unwrap();
    file
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    AttachEntry(String, u64),
    AttachExit(String, u64),
    AttachTrace,
    WriteTarget(Vec<u8>),
    OpenEvents,
    Detach(usize),
    Unload,
}

/// Shared record of everything a [`RecordingBackend`] was asked to do.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<Call>>>);

impl Journal {
    fn push(&self, call: Call) {
        self.0.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().clone()
    }

    pub fn attached(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| {
                matches!(
                    call,
                    Call::AttachEntry(..) | Call::AttachExit(..) | Call::AttachTrace
                )
            })
            .count()
    }

    pub fn detached(&self) -> Vec<usize> {
        self.calls()
            .iter()
            .filter_map(|call| match call {
                Call::Detach(link) => Some(*link),
                _ => None,
            })
            .collect()
    }

    pub fn unloads(&self) -> usize {
        self.calls().iter().filter(|call| **call == Call::Unload).count()
    }

    /// Every link handed out was detached exactly once, before the unload.
    pub fn assert_released(&self) {
        let mut detached = self.detached();
        detached.sort_unstable();
        assert_eq!(detached, (0..self.attached()).collect::<Vec<_>>());
        assert_eq!(self.unloads(), 1);
        assert_eq!(self.calls().last(), Some(&Call::Unload));
    }
}

/// An in-memory stand-in for the kernel-side object.
pub struct RecordingBackend {
    journal: Journal,
    next_link: usize,
    fail_exit: Option<usize>,
    fail_config: bool,
    events: Option<EventStream>,
}

impl RecordingBackend {
    pub fn new(journal: Journal, events: EventStream) -> Self {
        Self {
            journal,
            next_link: 0,
            fail_exit: None,
            fail_config: false,
            events: Some(events),
        }
    }

    /// Fails the `n`th exit probe attachment (0-based).
    pub fn failing_exit(mut self, n: usize) -> Self {
        self.fail_exit = Some(n);
        self
    }

    pub fn failing_config(mut self) -> Self {
        self.fail_config = true;
        self
    }

    fn link(&mut self) -> usize {
        let link = self.next_link;
        self.next_link += 1;
        link
    }
}

impl ProbeBackend for RecordingBackend {
    type Link = usize;

    fn attach_entry(&mut self, site: &ProbeSite) -> Result<usize, ProbeError> {
        self.journal
            .push(Call::AttachEntry(site.symbol.clone(), site.offset));
        Ok(self.link())
    }

    fn attach_exit(&mut self, site: &ProbeSite) -> Result<usize, ProbeError> {
        if let Some(n) = self.fail_exit {
            if n == 0 {
                return Err(ProbeError::Attach {
                    target: site.symbol.clone(),
                    address: site.offset,
                    source: ProgramError::NotLoaded,
                });
            }
            self.fail_exit = Some(n - 1);
        }
        self.journal
            .push(Call::AttachExit(site.symbol.clone(), site.offset));
        Ok(self.link())
    }

    fn attach_syscall_trace(&mut self) -> Result<usize, ProbeError> {
        self.journal.push(Call::AttachTrace);
        Ok(self.link())
    }

    fn write_target(&mut self, target: &TargetComm) -> Result<(), ProbeError> {
        if self.fail_config {
            return Err(ProbeError::ConfigWrite {
                target: *target,
                source: MapError::KeyNotFound,
            });
        }
        self.journal.push(Call::WriteTarget(target.as_bytes().to_vec()));
        Ok(())
    }

    fn open_events(&mut self) -> Result<EventStream, ProbeError> {
        self.journal.push(Call::OpenEvents);
        self.events.take().ok_or(ProbeError::MissingMap("EVENTS"))
    }

    fn detach(&mut self, link: usize) -> Result<(), ProbeError> {
        self.journal.push(Call::Detach(link));
        Ok(())
    }

    fn unload(self) {
        self.journal.push(Call::Unload);
    }
}
