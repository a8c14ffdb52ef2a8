// Copyright (c) Harpoon developers, 2024, licensed under the EUPL-1.2-or-later.
//
// See LICENSE at the root of this repository (or a legal translation in LICENSE-translations).

use std::{path::PathBuf, process::Command};

use anyhow::{bail, Context};
use clap::Parser;

#[derive(Debug, Copy, Clone)]
pub enum Architecture {
    BpfEl,
    BpfEb,
}

impl std::str::FromStr for Architecture {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "bpfel-unknown-none" => Architecture::BpfEl,
            "bpfeb-unknown-none" => Architecture::BpfEb,
            _ => return Err("invalid target".to_owned()),
        })
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Architecture::BpfEl => "bpfel-unknown-none",
            Architecture::BpfEb => "bpfeb-unknown-none",
        })
    }
}

#[derive(Debug, Parser)]
pub struct Options {
    /// Set the endianness of the BPF target
    #[clap(default_value = "bpfel-unknown-none", long)]
    pub target: Architecture,
    /// Build the release target
    #[clap(long)]
    pub release: bool,
}

pub fn build_ebpf(opts: Options) -> Result<(), anyhow::Error> {
    let dir = PathBuf::from("harpoon-ebpf");
    let target = format!("--target={}", opts.target);
    // lands next to the user-space build so harpoon/build.rs can find it
    let mut args = vec![
        "build",
        target.as_str(),
        "-Z",
        "build-std=core",
        "--target-dir",
        "../target",
    ];
    if opts.release {
        args.push("--release");
    }

    // RUSTUP_TOOLCHAIN is removed so the rust-toolchain.toml file in the -ebpf folder is honored.
    let status = Command::new("cargo")
        .current_dir(&dir)
        .env_remove("RUSTUP_TOOLCHAIN")
        .args(&args)
        .status()
        .context("failed to run cargo for the bpf program")?;
    if !status.success() {
        bail!("building {} failed: {status}", dir.display());
    }
    Ok(())
}
