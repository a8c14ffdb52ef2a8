// Copyright (c) Harpoon developers, 2024, licensed under the EUPL-1.2-or-later.
//
// See LICENSE at the root of this repository (or a legal translation in LICENSE-translations).

use std::path::Path;

use log::debug;

use crate::elf::{ResolveError, TargetBinary};

/// Where a function begins and every place it hands control back.
///
/// `entry` is the probe base of the function (a file offset when a segment
/// maps it); `offsets` are relative to it, ascending and never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnSites {
    symbol: String,
    entry: u64,
    size: u64,
    offsets: Vec<u64>,
}

impl ReturnSites {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn entry(&self) -> u64 {
        self.entry
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    /// Absolute probe addresses, `entry + offset` for each return.
    pub fn addresses(&self) -> impl Iterator<Item = u64> + '_ {
        self.offsets.iter().map(move |offset| self.entry + offset)
    }
}

/// Finds the return sites of `symbol` in an already opened binary.
pub fn return_sites(binary: &TargetBinary, symbol: &str) -> Result<ReturnSites, ResolveError> {
    let function = binary.function(symbol)?;
    let arch = binary.arch().map_err(|source| ResolveError::Decode {
        symbol: symbol.to_owned(),
        source,
    })?;

    let mut offsets = arch
        .return_offsets(function.bytes)
        .map_err(|source| ResolveError::Decode {
            symbol: symbol.to_owned(),
            source,
        })?;
    offsets.dedup();

    if offsets.is_empty() {
        return Err(ResolveError::NoReturnSites {
            symbol: symbol.to_owned(),
        });
    }

    let sites = ReturnSites {
        symbol: symbol.to_owned(),
        entry: function.probe_base(),
        size: function.symbol.size,
        offsets,
    };
    debug!(
        "{} in {}: entry 0x{:x}, {} return site(s) at {:x?}",
        sites.symbol,
        binary.path().display(),
        sites.entry,
        sites.offsets.len(),
        sites.offsets
    );
    Ok(sites)
}

/// Opens `path` and resolves the return sites of `symbol` in it.
pub fn return_sites_in<P: AsRef<Path>>(
    path: P,
    symbol: &str,
) -> Result<ReturnSites, ResolveError> {
    let binary = TargetBinary::open(path)?;
    return_sites(&binary, symbol)
}
