// Copyright (c) Harpoon developers, 2024, licensed under the EUPL-1.2-or-later.
//
// See LICENSE at the root of this repository (or a legal translation in LICENSE-translations).

//! Derive seccomp allow-lists from the syscalls individual functions make.
//!
//! A capture resolves where a function starts and returns inside a binary,
//! attaches uprobes there plus a syscall-entry tracepoint, and collects the
//! syscall ids observed while the function runs. Captured lists are later
//! merged into a default-deny seccomp profile.

pub mod decoder;
pub mod elf;
pub mod executor;
pub mod pipeline;
pub mod probes;
pub mod profile;
pub mod report;
pub mod resolver;
pub mod retsites;
pub mod syscalls;

pub use elf::{ResolveError, TargetBinary};
pub use pipeline::{Capture, CaptureError, CaptureOptions, EventStream};
pub use probes::{AyaBackend, CaptureSession, ProbeBackend, ProbeError, ProbePlan, SessionState};
pub use profile::{ProfileError, SeccompProfile};
pub use retsites::{return_sites, return_sites_in, ReturnSites};
pub use syscalls::{aggregate, AggregateOptions, Baseline, SyscallError, SyscallNameSet};
