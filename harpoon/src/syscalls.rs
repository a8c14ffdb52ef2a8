// Copyright (c) Harpoon developers, 2024, licensed under the EUPL-1.2-or-later.
//
// See LICENSE at the root of this repository (or a legal translation in LICENSE-translations).

//! Turning captured syscall ids into a set of names for the host table.

use std::collections::{BTreeSet, HashSet};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use log::debug;
use syscalls::Sysno;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyscallError {
    #[error("syscall id {id} is not known on this architecture")]
    UnknownSyscall { id: u32 },

    #[error("syscall `{name}` is not known on this architecture")]
    UnknownName { name: String },

    #[error("unknown syscall set `{0}` (expected one of: dynamic, static, docker)")]
    UnknownBaseline(String),
}

/// Syscalls sharing one operation across ABI revisions.
const VARIANT_GROUPS: &[(&str, &[&str])] = &[
    ("accept", &["accept", "accept4"]),
    ("clone", &["clone", "clone2", "clone3"]),
    ("dup", &["dup", "dup2", "dup3"]),
    ("epoll_create", &["epoll_create", "epoll_create1"]),
    ("epoll_pwait", &["epoll_pwait", "epoll_pwait2"]),
    ("eventfd", &["eventfd", "eventfd2"]),
    ("faccessat", &["faccessat", "faccessat2"]),
    ("inotify_init", &["inotify_init", "inotify_init1"]),
    ("mlock", &["mlock", "mlock2"]),
    ("mmap", &["mmap", "mmap2"]),
    ("openat", &["openat", "openat2"]),
    ("pipe", &["pipe", "pipe2"]),
    ("preadv", &["preadv", "preadv2"]),
    ("pwritev", &["pwritev", "pwritev2"]),
    ("renameat", &["renameat", "renameat2"]),
    ("signalfd", &["signalfd", "signalfd4"]),
    ("sync_file_range", &["sync_file_range", "sync_file_range2"]),
    ("umount", &["umount", "umount2"]),
];

/// The group `name` belongs to, looked up with any revision suffix removed.
pub fn variant_group(name: &str) -> Option<&'static [&'static str]> {
    let seed = name.trim_end_matches(|c: char| c.is_ascii_digit());
    VARIANT_GROUPS
        .iter()
        .find(|(group, _)| *group == seed)
        .map(|(_, members)| *members)
}

/// Every name `name` expands to. Always contains `name` itself; a name
/// outside any group expands to exactly itself.
pub fn variants(name: &str) -> Vec<&str> {
    let mut expanded = vec![name];
    if let Some(members) = variant_group(name) {
        expanded.extend(members.iter().copied().filter(|member| *member != name));
    }
    expanded
}

// Minimal start/stop syscalls of a dynamically linked Go binary, as seen by strace.
const DYNAMIC_GO: &[&str] = &[
    "access",
    "arch_prctl",
    "brk",
    "clone3",
    "close",
    "execve",
    "exit_group",
    "fcntl",
    "fstat",
    "futex",
    "getrandom",
    "getrlimit",
    "gettid",
    "madvise",
    "mmap",
    "mprotect",
    "munmap",
    "openat",
    "pread64",
    "prlimit64",
    "read",
    "rseq",
    "rt_sigaction",
    "rt_sigprocmask",
    "rt_sigreturn",
    "sched_getaffinity",
    "setrlimit",
    "set_robust_list",
    "set_tid_address",
    "sigaltstack",
];

// Same for a statically linked (CGO_ENABLED=0) Go binary.
const STATIC_GO: &[&str] = &[
    "arch_prctl",
    "clone",
    "close",
    "execve",
    "exit_group",
    "fcntl",
    "futex",
    "getrlimit",
    "gettid",
    "madvise",
    "mmap",
    "openat",
    "read",
    "rt_sigaction",
    "rt_sigprocmask",
    "rt_sigreturn",
    "sched_getaffinity",
    "setrlimit",
    "sigaltstack",
];

// The container runtime applies the profile before it is done starting the
// workload, so its own calls have to be allowed too.
const DOCKER: &[&str] = &[
    "capget",
    "capset",
    "chdir",
    "epoll_pwait",
    "eventfd",
    "eventfd2",
    "fchown",
    "futex",
    "fstatfs",
    "getcwd",
    "getdents64",
    "geteuid",
    "getpgrp",
    "getpid",
    "getppid",
    "ioctl",
    "lstat",
    "lseek",
    "newfstatat",
    "openat",
    "prctl",
    "setgid",
    "setgroups",
    "setsid",
    "setuid",
    "stat",
];

/// Fixed syscall sets a profile needs regardless of what was captured.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Baseline {
    DynamicGo,
    StaticGo,
    Docker,
}

impl Baseline {
    pub const ALL: [Baseline; 3] = [Baseline::DynamicGo, Baseline::StaticGo, Baseline::Docker];

    pub fn names(self) -> &'static [&'static str] {
        match self {
            Baseline::DynamicGo => DYNAMIC_GO,
            Baseline::StaticGo => STATIC_GO,
            Baseline::Docker => DOCKER,
        }
    }
}

impl Display for Baseline {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Baseline::DynamicGo => "dynamic",
            Baseline::StaticGo => "static",
            Baseline::Docker => "docker",
        })
    }
}

impl FromStr for Baseline {
    type Err = SyscallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dynamic" => Ok(Baseline::DynamicGo),
            "static" => Ok(Baseline::StaticGo),
            "docker" => Ok(Baseline::Docker),
            other => Err(SyscallError::UnknownBaseline(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateOptions {
    /// Expand every captured name to its whole variant group.
    pub variants: bool,
    pub baselines: Vec<Baseline>,
}

/// Canonical name of a syscall id in the host table.
pub fn name_of(id: u32) -> Result<&'static str, SyscallError> {
    Sysno::new(id as usize)
        .map(|sysno| sysno.name())
        .ok_or(SyscallError::UnknownSyscall { id })
}

fn lookup(name: &str) -> Option<Sysno> {
    name.parse::<Sysno>().ok()
}

/// A set of syscalls known to the host table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyscallNameSet {
    syscalls: HashSet<Sysno>,
}

impl SyscallNameSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.syscalls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.syscalls.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        lookup(name).is_some_and(|sysno| self.syscalls.contains(&sysno))
    }

    pub fn insert_id(&mut self, id: u32, expand: bool) -> Result<(), SyscallError> {
        let name = name_of(id)?;
        self.insert_name(name, expand)
    }

    /// Adds `name`, and with `expand` every sibling the host table knows.
    pub fn insert_name(&mut self, name: &str, expand: bool) -> Result<(), SyscallError> {
        let sysno = lookup(name).ok_or_else(|| SyscallError::UnknownName {
            name: name.to_owned(),
        })?;
        self.syscalls.insert(sysno);

        if expand {
            for sibling in variants(name).into_iter().skip(1) {
                match lookup(sibling) {
                    Some(sysno) => {
                        self.syscalls.insert(sysno);
                    }
                    None => debug!("variant {sibling} of {name} is not known here, skipping"),
                }
            }
        }
        Ok(())
    }

    pub fn extend_baseline(&mut self, baseline: Baseline) {
        for name in baseline.names() {
            match lookup(name) {
                Some(sysno) => {
                    self.syscalls.insert(sysno);
                }
                None => debug!("{baseline} baseline: {name} is not known here, skipping"),
            }
        }
    }

    /// Names in ascending byte order.
    pub fn sorted_names(&self) -> Vec<&'static str> {
        let mut names = self
            .syscalls
            .iter()
            .map(|sysno| sysno.name())
            .collect::<Vec<_>>();
        names.sort_unstable();
        names
    }
}

/// Deduplicates `ids` and names them, together with the requested
/// baselines. Any id missing from the host table fails the whole set.
pub fn aggregate(ids: &[u32], options: &AggregateOptions) -> Result<SyscallNameSet, SyscallError> {
    let mut set = SyscallNameSet::new();
    for id in ids.iter().copied().collect::<BTreeSet<_>>() {
        set.insert_id(id, options.variants)?;
    }
    for &baseline in &options.baselines {
        set.extend_baseline(baseline);
    }
    Ok(set)
}

/// Like [`aggregate`], for names read back from saved capture lists.
pub fn aggregate_names<I, S>(names: I, options: &AggregateOptions) -> Result<SyscallNameSet, SyscallError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut set = SyscallNameSet::new();
    for name in names {
        set.insert_name(name.as_ref(), options.variants)?;
    }
    for &baseline in &options.baselines {
        set.extend_baseline(baseline);
    }
    Ok(set)
}
