// Copyright (c) Harpoon developers, 2024, licensed under the EUPL-1.2-or-later.
//
// See LICENSE at the root of this repository (or a legal translation in LICENSE-translations).

//! Rendering allow-lists as container seccomp profiles.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::syscalls::SyscallNameSet;

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("could not render seccomp profile")]
    Render(#[source] serde_json::Error),

    #[error("could not parse seccomp profile")]
    Parse(#[source] serde_json::Error),
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub enum Action {
    #[serde(rename = "SCMP_ACT_ERRNO")]
    Errno,
    #[serde(rename = "SCMP_ACT_ALLOW")]
    Allow,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SyscallRule {
    pub names: Vec<String>,
    pub action: Action,
}

/// A default-deny profile with one allow rule per syscall.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SeccompProfile {
    pub default_action: Action,
    pub architectures: Vec<String>,
    pub syscalls: Vec<SyscallRule>,
}

#[cfg(target_arch = "x86_64")]
const HOST_ARCHITECTURES: &[&str] = &["SCMP_ARCH_X86_64", "SCMP_ARCH_X86", "SCMP_ARCH_X32"];
#[cfg(target_arch = "aarch64")]
const HOST_ARCHITECTURES: &[&str] = &["SCMP_ARCH_AARCH64", "SCMP_ARCH_ARM"];
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
const HOST_ARCHITECTURES: &[&str] = &[];

impl SeccompProfile {
    /// Builds the profile for an already sorted, duplicate-free list of names.
    pub fn from_sorted_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            default_action: Action::Errno,
            architectures: HOST_ARCHITECTURES.iter().map(|&arch| arch.into()).collect(),
            syscalls: names
                .into_iter()
                .map(|name| SyscallRule {
                    names: vec![name.into()],
                    action: Action::Allow,
                })
                .collect(),
        }
    }

    pub fn synthesize(names: &SyscallNameSet) -> Self {
        Self::from_sorted_names(names.sorted_names())
    }

    pub fn render(&self) -> Result<String, ProfileError> {
        serde_json::to_string_pretty(self).map_err(ProfileError::Render)
    }

    pub fn parse(document: &str) -> Result<Self, ProfileError> {
        serde_json::from_str(document).map_err(ProfileError::Parse)
    }

    /// Every name the profile allows, in document order.
    pub fn allowed(&self) -> Vec<&str> {
        self.syscalls
            .iter()
            .filter(|rule| rule.action == Action::Allow)
            .flat_map(|rule| rule.names.iter().map(String::as_str))
            .collect()
    }
}

/// Sorts `names` and renders the profile allowing exactly them.
pub fn synthesize(names: &SyscallNameSet) -> Result<String, ProfileError> {
    SeccompProfile::synthesize(names).render()
}
