// Copyright (c) Harpoon developers, 2024, licensed under the EUPL-1.2-or-later.
//
// See LICENSE at the root of this repository (or a legal translation in LICENSE-translations).

#![cfg_attr(not(feature = "user"), no_std)]

/// Length of a task's comm, including the trailing NUL.
pub const COMM_LEN: usize = 16;

/// Key of the target process basename in [`CONFIG_MAP`].
pub const CONFIG_KEY_TARGET: u32 = 0;

pub const CONFIG_MAP: &str = "CONFIG";
pub const EVENTS_MAP: &str = "EVENTS";

pub const ENTER_PROGRAM: &str = "enter_function";
pub const EXIT_PROGRAM: &str = "exit_function";
pub const TRACE_PROGRAM: &str = "trace_syscall";

pub const TRACEPOINT_CATEGORY: &str = "raw_syscalls";
pub const TRACEPOINT_NAME: &str = "sys_enter";

/// A single syscall observed while a traced function was running.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct SyscallEvent {
    pub syscall_id: u32,
}

impl SyscallEvent {
    pub const SIZE: usize = core::mem::size_of::<SyscallEvent>();

    /// Decodes the little-endian wire layout. Anything shorter than a full
    /// record is rejected; trailing bytes are perf sample padding.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let raw: [u8; Self::SIZE] = buf.get(..Self::SIZE)?.try_into().ok()?;
        Some(Self {
            syscall_id: u32::from_le_bytes(raw),
        })
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for SyscallEvent {}

/// Builds the NUL-terminated config value for a process basename, truncated
/// the same way the kernel truncates comm.
pub fn comm_value(basename: &[u8]) -> [u8; COMM_LEN] {
    let mut value = [0u8; COMM_LEN];
    let len = basename.len().min(COMM_LEN - 1);
    value[..len].copy_from_slice(&basename[..len]);
    value
}
