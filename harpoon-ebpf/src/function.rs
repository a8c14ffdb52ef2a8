// Copyright (c) Harpoon developers, 2024, licensed under the EUPL-1.2-or-later.
//
// See LICENSE at the root of this repository (or a legal translation in LICENSE-translations).

use aya_ebpf::helpers::bpf_get_current_pid_tgid;
use aya_ebpf::macros::uprobe;
use aya_ebpf::programs::ProbeContext;

use crate::HarpoonError::OutOfSpace;
use crate::{HarpoonError, TRACING};

#[uprobe]
fn enter_function(probe: ProbeContext) -> u32 {
    match try_enter_function() {
        Ok(res) => res,
        Err(e) => crate::emit_error(&probe, e, "enter_function"),
    }
}

#[inline(always)]
fn try_enter_function() -> Result<u32, HarpoonError> {
    let tgid = (bpf_get_current_pid_tgid() >> 32) as u32;
    TRACING
        .insert(&tgid, &1, 0)
        .map_err(|_| OutOfSpace("tracing map"))?;
    Ok(0)
}

// attached once per return instruction; uretprobes misbehave on some runtimes
#[uprobe]
fn exit_function(_probe: ProbeContext) -> u32 {
    let tgid = (bpf_get_current_pid_tgid() >> 32) as u32;
    let _ = TRACING.remove(&tgid); // absent when entry fired before attach
    0
}
