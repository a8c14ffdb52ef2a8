// Copyright (c) Harpoon developers, 2024, licensed under the EUPL-1.2-or-later.
//
// See LICENSE at the root of this repository (or a legal translation in LICENSE-translations).

use aya_ebpf::helpers::{bpf_get_current_comm, bpf_get_current_pid_tgid};
use aya_ebpf::macros::tracepoint;
use aya_ebpf::programs::TracePointContext;

use harpoon_common::{SyscallEvent, CONFIG_KEY_TARGET};

use crate::HarpoonError::{CouldntGetComm, CouldntReadTracepoint, MissingConfig};
use crate::{HarpoonError, CONFIG, EVENTS, TRACING};

// raw_syscalls:sys_enter, after the common tracepoint header
const SYSCALL_ID_OFFSET: usize = 8;

#[tracepoint]
fn trace_syscall(probe: TracePointContext) -> u32 {
    match unsafe { try_trace_syscall(&probe) } {
        Ok(res) => res,
        Err(e) => crate::emit_error(&probe, e, "trace_syscall"),
    }
}

#[inline(always)]
unsafe fn try_trace_syscall(probe: &TracePointContext) -> Result<u32, HarpoonError> {
    let tgid = (bpf_get_current_pid_tgid() >> 32) as u32;
    if TRACING.get(&tgid).is_none() {
        return Ok(0);
    }

    let target = CONFIG.get(&CONFIG_KEY_TARGET).ok_or(MissingConfig)?;
    let comm = bpf_get_current_comm().map_err(CouldntGetComm)?;
    for (&a, &b) in comm.iter().zip(target.iter()) {
        if a != b {
            return Ok(0);
        }
        if a == 0 {
            break;
        }
    }

    let id: i64 = probe
        .read_at(SYSCALL_ID_OFFSET)
        .map_err(CouldntReadTracepoint)?;
    let event = SyscallEvent {
        syscall_id: id as u32,
    };
    EVENTS.output(probe, &event, 0);

    Ok(0)
}
