// Copyright (c) Harpoon developers, 2024, licensed under the EUPL-1.2-or-later.
//
// See LICENSE at the root of this repository (or a legal translation in LICENSE-translations).

#![no_std]
#![no_main]

#[link_section = "license"]
#[no_mangle]
pub static LICENSE: [u8; 4] = *b"GPL\0";

mod function;
mod syscall;

use aya_ebpf::maps::{HashMap, PerfEventArray};
use aya_ebpf::macros::map;
use aya_ebpf::EbpfContext;
use aya_log_ebpf::error;
use core::hint::unreachable_unchecked;

use harpoon_common::{SyscallEvent, COMM_LEN};

/// Basename of the process under test, written once by user space.
#[map]
pub(crate) static CONFIG: HashMap<u32, [u8; COMM_LEN]> = HashMap::with_max_entries(1, 0);

/// Processes currently executing a traced function, keyed by tgid.
#[map]
pub(crate) static TRACING: HashMap<u32, u8> = HashMap::with_max_entries(1 << 10, 0);

#[map]
pub(crate) static EVENTS: PerfEventArray<SyscallEvent> = PerfEventArray::new(0);

pub(crate) enum HarpoonError {
    MissingConfig,
    CouldntGetComm(i64),
    CouldntReadTracepoint(i64),
    OutOfSpace(&'static str),
}

#[inline(always)]
pub(crate) fn emit_error<C: EbpfContext>(ctx: &C, e: HarpoonError, name: &str) -> u32 {
    match e {
        HarpoonError::MissingConfig => {
            error!(ctx, "no target process configured while handling {}", name);
        }
        HarpoonError::CouldntGetComm(code) => {
            error!(ctx, "couldn't get comm ({}) while handling {}", code, name);
        }
        HarpoonError::CouldntReadTracepoint(code) => {
            error!(
                ctx,
                "couldn't read tracepoint args ({}) while handling {}", code, name
            );
        }
        HarpoonError::OutOfSpace(op) => {
            error!(ctx, "{}: ran out of space while handling {}", op, name);
        }
    }
    1
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { unreachable_unchecked() }
}
