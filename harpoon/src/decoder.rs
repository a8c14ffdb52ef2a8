// Copyright (c) Harpoon developers, 2024, licensed under the EUPL-1.2-or-later.
//
// See LICENSE at the root of this repository (or a legal translation in LICENSE-translations).

//! Locating return instructions in raw machine code.

use goblin::elf::header::{EM_AARCH64, EM_X86_64};
use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic};
use thiserror::Error;

const AARCH64_INSN_LEN: usize = 4;

// RET {Xn}; Rn lives in bits 5..10
const AARCH64_RET_MASK: u32 = 0xffff_fc1f;
const AARCH64_RET: u32 = 0xd65f_0000;
const AARCH64_RETAA: u32 = 0xd65f_0bff;
const AARCH64_RETAB: u32 = 0xd65f_0fff;

// op0, bits 25..29, picks the top-level encoding group
const AARCH64_OP0_SHIFT: u32 = 25;
const AARCH64_OP0_MASK: u32 = 0xf;
const AARCH64_OP0_UNALLOCATED: [u32; 2] = [0b0001, 0b0011];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Bytes at `offset` are neither a valid instruction nor trailing padding.
    #[error("undecodable instruction at offset 0x{offset:x}")]
    Undecodable { offset: u64 },

    #[error("unsupported architecture (ELF machine {0})")]
    UnsupportedArchitecture(u16),
}

/// Instruction sets we know how to scan for returns.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Aarch64,
}

impl Arch {
    pub fn from_elf_machine(machine: u16) -> Result<Self, DecodeError> {
        match machine {
            EM_X86_64 => Ok(Arch::X86_64),
            EM_AARCH64 => Ok(Arch::Aarch64),
            other => Err(DecodeError::UnsupportedArchitecture(other)),
        }
    }

    /// Offsets into `code` at which a return-from-subroutine instruction begins.
    pub fn return_offsets(self, code: &[u8]) -> Result<Vec<u64>, DecodeError> {
        match self {
            Arch::X86_64 => x86_64_return_offsets(code),
            Arch::Aarch64 => aarch64_return_offsets(code),
        }
    }
}

fn is_padding(rest: &[u8]) -> bool {
    rest.iter().all(|&b| b == 0)
}

fn x86_64_return_offsets(code: &[u8]) -> Result<Vec<u64>, DecodeError> {
    let mut offsets = Vec::new();
    let mut decoder = Decoder::with_ip(64, code, 0, DecoderOptions::NONE);
    let mut instruction = Instruction::default();

    // instructions vary in length, so every boundary comes from the previous decode
    while decoder.can_decode() {
        let position = decoder.position();
        decoder.decode_out(&mut instruction);
        if instruction.is_invalid() {
            if is_padding(&code[position..]) {
                break;
            }
            return Err(DecodeError::Undecodable {
                offset: position as u64,
            });
        }
        if instruction.mnemonic() == Mnemonic::Ret {
            offsets.push(position as u64);
        }
    }

    Ok(offsets)
}

fn aarch64_return_offsets(code: &[u8]) -> Result<Vec<u64>, DecodeError> {
    let mut offsets = Vec::new();

    for (i, word) in code.chunks(AARCH64_INSN_LEN).enumerate() {
        let offset = i * AARCH64_INSN_LEN;
        let insn = match <[u8; AARCH64_INSN_LEN]>::try_from(word) {
            Ok(raw) => u32::from_le_bytes(raw),
            Err(_) if is_padding(word) => break,
            Err(_) => {
                return Err(DecodeError::Undecodable {
                    offset: offset as u64,
                })
            }
        };

        // UDF #imm16 occupies the all-zero top half of the encoding space
        if insn >> 16 == 0 {
            if is_padding(&code[offset..]) {
                break;
            }
            return Err(DecodeError::Undecodable {
                offset: offset as u64,
            });
        }
        let op0 = (insn >> AARCH64_OP0_SHIFT) & AARCH64_OP0_MASK;
        if AARCH64_OP0_UNALLOCATED.contains(&op0) {
            return Err(DecodeError::Undecodable {
                offset: offset as u64,
            });
        }

        if insn & AARCH64_RET_MASK == AARCH64_RET || insn == AARCH64_RETAA || insn == AARCH64_RETAB
        {
            offsets.push(offset as u64);
        }
    }

    Ok(offsets)
}
